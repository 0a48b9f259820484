//! Device liveness and latency telemetry.
//!
//! Default: 2 consecutive failures demote a device to Degraded, 4 to
//! Unavailable. A success clears the counter and restores a Degraded device;
//! Unavailable is sticky until [`HealthTracker::recover`].
//!
//! All fields are atomics: these counters are the only state shared between
//! concurrently running sessions.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use split_types::config::HealthConfig;
use split_types::DeviceHealth;

/// A health change caused by one recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: DeviceHealth,
    pub to: DeviceHealth,
}

pub struct HealthTracker {
    health: AtomicU8,
    consecutive_failures: AtomicU32,
    degrade_after: u32,
    unavailable_after: u32,
    submissions: AtomicU64,
    total_latency_us: AtomicU64,
    last_latency_us: AtomicU64,
}

impl HealthTracker {
    pub fn new(config: &HealthConfig, initial: DeviceHealth) -> Self {
        Self {
            health: AtomicU8::new(initial as u8),
            consecutive_failures: AtomicU32::new(0),
            degrade_after: config.degrade_after,
            unavailable_after: config.unavailable_after,
            submissions: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            last_latency_us: AtomicU64::new(0),
        }
    }

    pub fn health(&self) -> DeviceHealth {
        DeviceHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Record a completed submission and its device wall-clock time.
    pub fn record_success(&self, latency: Duration) -> Option<Transition> {
        let us = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        self.submissions.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(us, Ordering::Relaxed);
        self.last_latency_us.store(us, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Release);

        self.health
            .compare_exchange(
                DeviceHealth::Degraded as u8,
                DeviceHealth::Healthy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| Transition { from: DeviceHealth::Degraded, to: DeviceHealth::Healthy })
    }

    /// Record a failed or timed-out submission. Health only moves down here.
    pub fn record_failure(&self) -> Option<Transition> {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let target = if failures >= self.unavailable_after {
            DeviceHealth::Unavailable
        } else if failures >= self.degrade_after {
            DeviceHealth::Degraded
        } else {
            DeviceHealth::Healthy
        };
        self.demote_to(target)
    }

    /// Force the device out of rotation, e.g. after a failed probe.
    pub fn mark_unavailable(&self) -> Option<Transition> {
        self.demote_to(DeviceHealth::Unavailable)
    }

    /// Explicit operator recovery: back to Healthy with a clean counter.
    pub fn recover(&self) -> Option<Transition> {
        self.consecutive_failures.store(0, Ordering::Release);
        let prev = DeviceHealth::from_u8(
            self.health.swap(DeviceHealth::Healthy as u8, Ordering::AcqRel),
        );
        (prev != DeviceHealth::Healthy)
            .then_some(Transition { from: prev, to: DeviceHealth::Healthy })
    }

    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        let n = self.submissions();
        if n == 0 {
            return None;
        }
        Some(Duration::from_micros(self.total_latency_us.load(Ordering::Relaxed) / n))
    }

    pub fn last_latency(&self) -> Duration {
        Duration::from_micros(self.last_latency_us.load(Ordering::Relaxed))
    }

    fn demote_to(&self, target: DeviceHealth) -> Option<Transition> {
        let prev = self
            .health
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (target as u8 > cur).then_some(target as u8)
            })
            .ok()?;
        Some(Transition { from: DeviceHealth::from_u8(prev), to: target })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(&HealthConfig { degrade_after: 2, unavailable_after: 3 }, DeviceHealth::Healthy)
    }

    #[test]
    fn demotes_through_degraded_to_unavailable() {
        let t = tracker();
        assert_eq!(t.record_failure(), None);
        assert_eq!(
            t.record_failure(),
            Some(Transition { from: DeviceHealth::Healthy, to: DeviceHealth::Degraded })
        );
        assert_eq!(
            t.record_failure(),
            Some(Transition { from: DeviceHealth::Degraded, to: DeviceHealth::Unavailable })
        );
        assert_eq!(t.health(), DeviceHealth::Unavailable);
    }

    #[test]
    fn success_restores_degraded_but_not_unavailable() {
        let t = tracker();
        t.record_failure();
        t.record_failure();
        assert_eq!(t.health(), DeviceHealth::Degraded);
        assert!(t.record_success(Duration::from_micros(10)).is_some());
        assert_eq!(t.health(), DeviceHealth::Healthy);
        assert_eq!(t.consecutive_failures(), 0);

        t.mark_unavailable();
        assert!(t.record_success(Duration::from_micros(10)).is_none());
        assert_eq!(t.health(), DeviceHealth::Unavailable);
    }

    #[test]
    fn recover_resets() {
        let t = tracker();
        for _ in 0..3 {
            t.record_failure();
        }
        let tr = t.recover().unwrap();
        assert_eq!(tr.from, DeviceHealth::Unavailable);
        assert_eq!(t.health(), DeviceHealth::Healthy);
        assert!(t.recover().is_none());
    }

    #[test]
    fn latency_telemetry() {
        let t = tracker();
        assert!(t.mean_latency().is_none());
        t.record_success(Duration::from_micros(100));
        t.record_success(Duration::from_micros(300));
        assert_eq!(t.mean_latency(), Some(Duration::from_micros(200)));
        assert_eq!(t.last_latency(), Duration::from_micros(300));
        assert_eq!(t.submissions(), 2);
    }
}
