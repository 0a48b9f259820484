//! Device registry and per-device executors.
//!
//! The registry probes every configured device once at startup, in
//! preference order, and owns the resulting [`DeviceExecutor`]s for the
//! lifetime of the process. Each executor runs compute on the blocking pool
//! behind a semaphore sized to the device's concurrency limit, so a slow
//! device never stalls dispatch to another one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use split_types::config::{BackpressureMode, DeviceConfig, SchedulerConfig};
use split_types::{DeviceHealth, DeviceId, DeviceKind, DeviceStatus, ErrorKind, TensorDtype, TensorPayload};

use crate::backend::{BackendError, BackendProvider, ComputeBackend, LayerCall, LayerOutput};
use crate::error::{Result, SchedulerError};
use crate::health::{HealthTracker, Transition};

// ── Work Item ────────────────────────────────────────────────────────────────

/// One dispatchable unit. Moved into exactly one executor.
#[derive(Debug)]
pub struct WorkItem {
    pub id: Uuid,
    pub session_id: String,
    pub layer: u32,
    pub experts: Vec<u32>,
    pub hidden: TensorPayload,
    pub state: Option<Vec<u8>>,
    pub deadline: Instant,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionFailure {
    #[error("device busy")]
    Busy,

    #[error("device unavailable")]
    Unavailable,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ExecutionFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Busy => ErrorKind::DeviceBusy,
            Self::Unavailable => ErrorKind::NoDeviceAvailable,
            Self::Backend(_) => ErrorKind::DeviceExecutionError,
        }
    }
}

#[derive(Debug)]
pub struct ExecutionResult {
    pub work_id: Uuid,
    pub outcome: std::result::Result<LayerOutput, ExecutionFailure>,
    pub device: DeviceId,
    pub duration: Duration,
}

// ── Device Executor ──────────────────────────────────────────────────────────

/// A probed device: identity, capability flags, health and its executor.
pub struct DeviceExecutor {
    id: DeviceId,
    kind: DeviceKind,
    precisions: Vec<TensorDtype>,
    max_concurrent: u32,
    backpressure: BackpressureMode,
    queue_depth: u32,
    backend: Option<Arc<dyn ComputeBackend>>,
    slots: Arc<Semaphore>,
    waiting: AtomicU32,
    in_flight: Arc<AtomicU32>,
    health: HealthTracker,
    is_fallback: bool,
}

impl DeviceExecutor {
    fn new(
        config: &DeviceConfig,
        backend: Option<Arc<dyn ComputeBackend>>,
        health: HealthTracker,
        is_fallback: bool,
    ) -> Self {
        Self {
            id: config.id(),
            kind: config.kind,
            precisions: config.precisions.clone(),
            max_concurrent: config.max_concurrent,
            backpressure: config.backpressure,
            queue_depth: config.queue_depth,
            backend,
            slots: Arc::new(Semaphore::new(config.max_concurrent as usize)),
            waiting: AtomicU32::new(0),
            in_flight: Arc::new(AtomicU32::new(0)),
            health,
            is_fallback,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn health(&self) -> DeviceHealth {
        self.health.health()
    }

    pub fn tracker(&self) -> &HealthTracker {
        &self.health
    }

    pub fn is_usable(&self) -> bool {
        self.backend.is_some() && self.health().is_usable()
    }

    pub fn supports(&self, dtype: TensorDtype) -> bool {
        self.precisions.contains(&dtype)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            id: self.id.clone(),
            kind: self.kind,
            health: self.health(),
            precisions: self.precisions.clone(),
            max_concurrent: self.max_concurrent,
            in_flight: self.in_flight(),
            consecutive_failures: self.health.consecutive_failures(),
            submissions: self.health.submissions(),
            mean_latency_us: self
                .health
                .mean_latency()
                .map(|d| d.as_micros() as u64)
                .unwrap_or(0),
            is_fallback: self.is_fallback,
        }
    }

    // ── Execution ────────────────────────────────────────────────────────

    /// Run one work item to completion on this device.
    ///
    /// Dropping the returned future abandons the item: the compute already
    /// handed to the blocking pool keeps its slot until it finishes and its
    /// output is discarded.
    pub async fn submit(&self, item: WorkItem) -> ExecutionResult {
        let work_id = item.id;
        let fail = |failure: ExecutionFailure| ExecutionResult {
            work_id,
            outcome: Err(failure),
            device: self.id.clone(),
            duration: Duration::ZERO,
        };

        let backend = match (&self.backend, self.health().is_usable()) {
            (Some(b), true) => Arc::clone(b),
            _ => return fail(ExecutionFailure::Unavailable),
        };

        let permit = match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => match self.backpressure {
                BackpressureMode::Reject => return fail(ExecutionFailure::Busy),
                BackpressureMode::Queue => {
                    if self.waiting.fetch_add(1, Ordering::AcqRel) >= self.queue_depth {
                        self.waiting.fetch_sub(1, Ordering::AcqRel);
                        return fail(ExecutionFailure::Busy);
                    }
                    let _queued = QueueSlot(&self.waiting);
                    match Arc::clone(&self.slots).acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return fail(ExecutionFailure::Unavailable),
                    }
                }
            },
        };

        let call = LayerCall {
            layer: item.layer,
            experts: item.experts,
            hidden: item.hidden,
            state: item.state,
        };
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);

        let joined = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let out = backend.execute(call);
            let elapsed = started.elapsed();
            in_flight.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
            (out, elapsed)
        })
        .await;

        let (outcome, duration) = match joined {
            Ok((out, elapsed)) => (out.map_err(ExecutionFailure::from), elapsed),
            Err(e) => (
                Err(ExecutionFailure::Backend(BackendError::Transient(format!(
                    "compute task aborted: {e}"
                )))),
                Duration::ZERO,
            ),
        };

        match &outcome {
            Ok(_) => {
                debug!(
                    device = %self.id,
                    session_id = %item.session_id,
                    layer = item.layer,
                    latency_us = duration.as_micros() as u64,
                    "work item completed"
                );
                self.report(self.health.record_success(duration));
            }
            Err(ExecutionFailure::Backend(BackendError::Transient(detail))) => {
                warn!(device = %self.id, layer = item.layer, %detail, "work item failed");
                self.report(self.health.record_failure());
            }
            Err(e) => {
                debug!(device = %self.id, layer = item.layer, error = %e, "work item rejected");
            }
        }

        ExecutionResult { work_id, outcome, device: self.id.clone(), duration }
    }

    /// Count an abandoned (deadline-expired) item against the device.
    pub fn record_timeout(&self) {
        warn!(device = %self.id, "work item deadline expired");
        self.report(self.health.record_failure());
    }

    fn report(&self, transition: Option<Transition>) {
        if let Some(t) = transition {
            match t.to {
                DeviceHealth::Healthy => info!(device = %self.id, from = %t.from, "device recovered"),
                _ => warn!(device = %self.id, from = %t.from, to = %t.to, "device demoted"),
            }
        }
    }
}

/// Releases a queue position when the waiter is granted a slot or dropped.
struct QueueSlot<'a>(&'a AtomicU32);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Owns every device handle. Exactly one per scheduler.
pub struct DeviceRegistry {
    devices: Vec<Arc<DeviceExecutor>>,
    fallback: DeviceId,
}

impl DeviceRegistry {
    /// Initialise each configured device in preference order.
    ///
    /// A device whose backend fails to initialise is registered as
    /// Unavailable. Fails with `NoDeviceAvailable` when the fallback device
    /// itself cannot be initialised.
    pub fn probe(config: &SchedulerConfig, provider: &dyn BackendProvider) -> Result<Self> {
        let fallback = config.fallback_device();
        let mut devices = Vec::with_capacity(config.devices.len());

        for dev in &config.devices {
            let is_fallback = dev.id() == fallback;
            let (backend, initial) = match provider.probe(dev) {
                Ok(b) => {
                    info!(
                        device = %dev.name,
                        kind = %dev.kind,
                        max_concurrent = dev.max_concurrent,
                        is_fallback,
                        "device initialised"
                    );
                    (Some(b), DeviceHealth::Healthy)
                }
                Err(reason) => {
                    warn!(device = %dev.name, kind = %dev.kind, %reason, "device unavailable");
                    (None, DeviceHealth::Unavailable)
                }
            };
            let tracker = HealthTracker::new(&config.health, initial);
            devices.push(Arc::new(DeviceExecutor::new(dev, backend, tracker, is_fallback)));
        }

        let registry = Self { devices, fallback };
        if !registry.fallback().is_usable() {
            return Err(SchedulerError::NoDeviceAvailable(format!(
                "fallback device '{}' failed to initialise",
                registry.fallback
            )));
        }
        Ok(registry)
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Arc<DeviceExecutor>> {
        self.devices.iter().find(|d| d.id() == id)
    }

    /// The designated fallback device (normally the CPU).
    pub fn fallback(&self) -> &Arc<DeviceExecutor> {
        // `probe` only constructs a registry whose fallback is a member.
        self.get(&self.fallback)
            .unwrap_or_else(|| &self.devices[0])
    }

    pub fn fallback_id(&self) -> &DeviceId {
        &self.fallback
    }

    pub fn devices(&self) -> &[Arc<DeviceExecutor>] {
        &self.devices
    }

    pub fn is_usable(&self, id: &DeviceId) -> bool {
        self.get(id).map(|d| d.is_usable()).unwrap_or(false)
    }

    /// Devices currently out of rotation.
    pub fn unavailable(&self) -> HashSet<DeviceId> {
        self.devices
            .iter()
            .filter(|d| !d.is_usable())
            .map(|d| d.id().clone())
            .collect()
    }

    /// Bring an Unavailable device back into rotation.
    pub fn recover(&self, id: &DeviceId) -> Result<()> {
        let dev = self
            .get(id)
            .ok_or_else(|| SchedulerError::NoDeviceAvailable(format!("unknown device '{id}'")))?;
        if dev.backend.is_none() {
            return Err(SchedulerError::NoDeviceAvailable(format!(
                "device '{id}' never initialised"
            )));
        }
        if let Some(t) = dev.health.recover() {
            info!(device = %id, from = %t.from, "device recovered by operator");
        }
        Ok(())
    }

    pub fn status(&self) -> Vec<DeviceStatus> {
        self.devices.iter().map(|d| d.status()).collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::backend::ReferenceBackend;

    /// Provider that fails the named devices and hands out the given
    /// backend (or a reference backend) to the rest.
    pub struct ScriptedProvider {
        pub fail: Vec<String>,
        pub backend: Option<Arc<dyn ComputeBackend>>,
    }

    impl BackendProvider for ScriptedProvider {
        fn probe(&self, device: &DeviceConfig) -> std::result::Result<Arc<dyn ComputeBackend>, String> {
            if self.fail.contains(&device.name) {
                return Err("driver missing".into());
            }
            Ok(self
                .backend
                .clone()
                .unwrap_or_else(|| Arc::new(ReferenceBackend::new(device.kind))))
        }
    }

    /// Backend that blocks until released, then echoes its input.
    pub struct GateBackend {
        pub gate: Arc<(Mutex<bool>, std::sync::Condvar)>,
    }

    impl GateBackend {
        pub fn new() -> Self {
            Self { gate: Arc::new((Mutex::new(false), std::sync::Condvar::new())) }
        }

        pub fn open(&self) {
            let (lock, cv) = &*self.gate;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
    }

    impl ComputeBackend for GateBackend {
        fn execute(&self, call: LayerCall) -> std::result::Result<LayerOutput, BackendError> {
            let (lock, cv) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cv.wait(open).unwrap();
            }
            Ok(LayerOutput { hidden: call.hidden, state: None })
        }
    }

    pub fn two_device_config(igpu_backpressure: BackpressureMode) -> SchedulerConfig {
        let mut cfg = SchedulerConfig::for_model(8, 4);
        cfg.devices = vec![
            DeviceConfig {
                name: "igpu".into(),
                kind: DeviceKind::IntegratedGpu,
                max_concurrent: 1,
                queue_depth: 1,
                backpressure: igpu_backpressure,
                precisions: vec![TensorDtype::F32, TensorDtype::F16],
                render_node: None,
            },
            DeviceConfig {
                name: "cpu".into(),
                kind: DeviceKind::Cpu,
                max_concurrent: 4,
                queue_depth: 8,
                backpressure: BackpressureMode::Queue,
                precisions: vec![TensorDtype::F32],
                render_node: None,
            },
        ];
        cfg.validate().unwrap();
        cfg
    }

    pub fn work(layer: u32) -> WorkItem {
        WorkItem {
            id: Uuid::new_v4(),
            session_id: "sess-test".into(),
            layer,
            experts: vec![],
            hidden: TensorPayload::from_f32(vec![1, 2], &[0.5, 1.5]),
            state: None,
            deadline: Instant::now() + Duration::from_secs(5),
        }
    }

    #[test]
    fn probe_marks_failed_device_unavailable() {
        let cfg = two_device_config(BackpressureMode::Queue);
        let provider = ScriptedProvider { fail: vec!["igpu".into()], backend: None };
        let reg = DeviceRegistry::probe(&cfg, &provider).unwrap();
        assert!(!reg.is_usable(&DeviceId::new("igpu")));
        assert!(reg.is_usable(&DeviceId::new("cpu")));
        assert_eq!(reg.fallback_id(), &DeviceId::new("cpu"));
        assert!(reg.unavailable().contains(&DeviceId::new("igpu")));
        assert!(reg.recover(&DeviceId::new("igpu")).is_err());
    }

    #[test]
    fn probe_fails_without_fallback() {
        let cfg = two_device_config(BackpressureMode::Queue);
        let provider = ScriptedProvider { fail: vec!["cpu".into()], backend: None };
        let err = DeviceRegistry::probe(&cfg, &provider).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NoDeviceAvailable);
    }

    #[tokio::test]
    async fn submit_runs_backend() {
        let cfg = two_device_config(BackpressureMode::Queue);
        let reg = DeviceRegistry::probe(&cfg, &ScriptedProvider { fail: vec![], backend: None }).unwrap();
        let res = reg.fallback().submit(work(0)).await;
        let out = res.outcome.unwrap();
        let values = out.hidden.to_f32().unwrap();
        assert!((values[0] - 0.501).abs() < 1e-6);
        assert_eq!(res.device, DeviceId::new("cpu"));
        assert_eq!(reg.fallback().tracker().submissions(), 1);
    }

    #[tokio::test]
    async fn unavailable_device_receives_nothing() {
        let cfg = two_device_config(BackpressureMode::Queue);
        let reg = DeviceRegistry::probe(&cfg, &ScriptedProvider { fail: vec![], backend: None }).unwrap();
        let igpu = reg.get(&DeviceId::new("igpu")).unwrap();
        igpu.tracker().mark_unavailable();

        let res = igpu.submit(work(0)).await;
        assert!(matches!(res.outcome, Err(ExecutionFailure::Unavailable)));
        assert_eq!(igpu.tracker().submissions(), 0);

        reg.recover(&DeviceId::new("igpu")).unwrap();
        assert!(igpu.submit(work(0)).await.outcome.is_ok());
    }

    #[tokio::test]
    async fn reject_mode_reports_busy() {
        let gate = Arc::new(GateBackend::new());
        let cfg = two_device_config(BackpressureMode::Reject);
        let provider = ScriptedProvider { fail: vec![], backend: Some(gate.clone()) };
        let reg = Arc::new(DeviceRegistry::probe(&cfg, &provider).unwrap());
        let igpu = Arc::clone(reg.get(&DeviceId::new("igpu")).unwrap());

        let busy_dev = Arc::clone(&igpu);
        let first = tokio::spawn(async move { busy_dev.submit(work(0)).await });
        while igpu.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let second = igpu.submit(work(1)).await;
        assert!(matches!(second.outcome, Err(ExecutionFailure::Busy)));

        gate.open();
        assert!(first.await.unwrap().outcome.is_ok());
    }

    #[tokio::test]
    async fn queue_mode_bounds_waiters() {
        let gate = Arc::new(GateBackend::new());
        let cfg = two_device_config(BackpressureMode::Queue);
        let provider = ScriptedProvider { fail: vec![], backend: Some(gate.clone()) };
        let reg = Arc::new(DeviceRegistry::probe(&cfg, &provider).unwrap());
        let igpu = Arc::clone(reg.get(&DeviceId::new("igpu")).unwrap());

        let running = {
            let d = Arc::clone(&igpu);
            tokio::spawn(async move { d.submit(work(0)).await })
        };
        while igpu.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        let queued = {
            let d = Arc::clone(&igpu);
            tokio::spawn(async move { d.submit(work(1)).await })
        };
        while igpu.waiting.load(Ordering::Acquire) == 0 {
            tokio::task::yield_now().await;
        }

        // queue_depth = 1: a second waiter is turned away.
        let rejected = igpu.submit(work(2)).await;
        assert!(matches!(rejected.outcome, Err(ExecutionFailure::Busy)));

        gate.open();
        assert!(running.await.unwrap().outcome.is_ok());
        assert!(queued.await.unwrap().outcome.is_ok());
    }
}
