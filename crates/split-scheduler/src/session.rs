use std::collections::VecDeque;
use std::time::Instant;

use split_types::wire::{SessionSummary, StepResult};
use split_types::{DeviceId, SessionPhase, TensorPayload};

use crate::error::{Result, SchedulerError};
use crate::metrics::PhaseClock;
use crate::placement::RoutingSnapshot;
use crate::usage::UsageCounters;

// ── Step admission ───────────────────────────────────────────────────────────

/// What to do with an incoming step.
#[derive(Debug)]
pub enum StepAdmission {
    /// Already acknowledged: send the cached result again.
    Replay(StepResult),
    /// Next in sequence: dispatch it.
    Execute,
}

// ── Session ──────────────────────────────────────────────────────────────────

/// One in-flight generation. Owned by the scheduler; mutated only while the
/// per-session lock is held, so at most one work item is ever in flight.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub num_layers: u32,
    pub max_passes: u32,
    pub phase: SessionPhase,
    /// Layer expected by the next step.
    pub cursor: u32,
    /// Successful steps so far. Only increases.
    pub steps: u64,
    /// Completed layer passes (prefill counts as the first).
    pub passes: u32,
    pub last_acked: u64,
    pub failure_reason: Option<String>,
    pub fallbacks: u64,
    pub last_activity: Instant,
    pub created_at: chrono::DateTime<chrono::Utc>,
    routing: RoutingSnapshot,
    layer_state: Vec<Option<Vec<u8>>>,
    replay: VecDeque<(u64, StepResult)>,
    replay_window: usize,
    clock: PhaseClock,
    usage: UsageCounters,
    trace: Vec<u32>,
}

impl Session {
    pub fn new(
        session_id: String,
        num_layers: u32,
        max_passes: u32,
        routing: RoutingSnapshot,
        replay_window: u32,
    ) -> Self {
        Self {
            session_id,
            num_layers,
            max_passes,
            phase: SessionPhase::Created,
            cursor: 0,
            steps: 0,
            passes: 0,
            last_acked: 0,
            failure_reason: None,
            fallbacks: 0,
            last_activity: Instant::now(),
            created_at: chrono::Utc::now(),
            routing,
            layer_state: vec![None; num_layers as usize],
            replay: VecDeque::with_capacity(replay_window as usize),
            replay_window: replay_window.max(1) as usize,
            clock: PhaseClock::start(),
            usage: UsageCounters::new(),
            trace: Vec::new(),
        }
    }

    pub fn routing(&self) -> &RoutingSnapshot {
        &self.routing
    }

    pub fn usage(&self) -> &UsageCounters {
        &self.usage
    }

    /// Layer indices of every committed step, in order.
    pub fn layer_trace(&self) -> &[u32] {
        &self.trace
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Sequence and pipeline-order check for an incoming step.
    ///
    /// Replays win over everything else so a retried final step still gets
    /// its answer after the session completed. Out-of-order sequence
    /// numbers and layers other than the cursor fail the session.
    pub fn admit(&mut self, seq: u64, layer: u32) -> Result<StepAdmission> {
        if seq <= self.last_acked && seq > 0 {
            return match self.replay.iter().find(|(s, _)| *s == seq) {
                Some((_, cached)) => Ok(StepAdmission::Replay(cached.clone())),
                None => Err(SchedulerError::ProtocolViolation(format!(
                    "seq {seq} already acknowledged and outside the replay window"
                ))),
            };
        }

        if self.phase.is_terminal() {
            return Err(SchedulerError::SessionClosed {
                session_id: self.session_id.clone(),
                phase: self.phase.to_string(),
            });
        }

        let expected = self.last_acked + 1;
        if seq != expected {
            let reason = format!("expected seq {expected}, got {seq}");
            self.fail(&reason);
            return Err(SchedulerError::ProtocolViolation(reason));
        }
        if layer != self.cursor {
            let reason = format!("expected layer {}, got {layer}", self.cursor);
            self.fail(&reason);
            return Err(SchedulerError::ProtocolViolation(reason));
        }

        Ok(StepAdmission::Execute)
    }

    /// `Created → Prefill` on the first step.
    pub fn begin_step(&mut self, hidden: &TensorPayload) {
        if self.phase == SessionPhase::Created {
            self.phase = SessionPhase::Prefill;
            self.clock.mark_prefill(hidden.seq_len());
        }
        self.touch();
    }

    /// Opaque state the backend left for `layer` on the previous pass.
    pub fn layer_state(&self, layer: u32) -> Option<Vec<u8>> {
        self.layer_state.get(layer as usize).cloned().flatten()
    }

    /// Advance the cursor after a successful result and cache the reply.
    #[allow(clippy::too_many_arguments)]
    pub fn commit(
        &mut self,
        seq: u64,
        experts: &[u32],
        hidden: TensorPayload,
        state: Option<Vec<u8>>,
        device: DeviceId,
        duration_us: u64,
        via_fallback: bool,
    ) -> StepResult {
        let layer = self.cursor;
        if let Some(slot) = self.layer_state.get_mut(layer as usize) {
            *slot = state;
        }
        self.usage.record(layer, experts);
        self.trace.push(layer);
        self.steps += 1;
        if via_fallback {
            self.fallbacks += 1;
        }
        self.clock.mark_step();

        self.cursor += 1;
        if self.cursor == self.num_layers {
            self.cursor = 0;
            self.passes += 1;
            if self.phase == SessionPhase::Prefill {
                self.phase = SessionPhase::Decoding;
                self.clock.mark_first_token();
            }
            if self.passes >= self.max_passes {
                self.phase = SessionPhase::Completed;
            }
        }

        self.last_acked = seq;
        let result = StepResult {
            layer,
            device,
            duration_us,
            step: self.steps,
            phase: self.phase,
            hidden,
        };
        if self.replay.len() == self.replay_window {
            self.replay.pop_front();
        }
        self.replay.push_back((seq, result.clone()));
        self.touch();
        result
    }

    pub fn complete(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = SessionPhase::Completed;
        }
    }

    pub fn fail(&mut self, reason: &str) {
        if !self.phase.is_terminal() {
            self.phase = SessionPhase::Failed;
            self.failure_reason = Some(reason.to_string());
        }
    }

    pub fn time_out(&mut self, reason: &str) {
        if !self.phase.is_terminal() {
            self.phase = SessionPhase::TimedOut;
            self.failure_reason = Some(reason.to_string());
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let mut summary = SessionSummary {
            session_id: self.session_id.clone(),
            final_phase: Some(self.phase),
            failure_reason: self.failure_reason.clone(),
            created_at: self.created_at.to_rfc3339(),
            steps: self.steps,
            fallbacks: self.fallbacks,
            ..SessionSummary::default()
        };
        self.clock.fill(&mut summary, self.passes, self.usage.per_expert());
        summary
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::tests::{two_device_config, ScriptedProvider};
    use crate::device::DeviceRegistry;
    use crate::placement::PlacementTable;
    use split_types::config::BackpressureMode;

    fn session(num_layers: u32, max_passes: u32, window: u32) -> Session {
        let cfg = two_device_config(BackpressureMode::Queue);
        let reg = DeviceRegistry::probe(&cfg, &ScriptedProvider { fail: vec![], backend: None }).unwrap();
        let snap = RoutingSnapshot::new(Arc::new(PlacementTable::from_config(&cfg)), &reg);
        Session::new("sess-1".into(), num_layers, max_passes, snap, window)
    }

    fn hidden() -> TensorPayload {
        TensorPayload::from_f32(vec![3, 1], &[0.0, 0.0, 0.0])
    }

    fn run_step(s: &mut Session, seq: u64, layer: u32) -> StepResult {
        assert!(matches!(s.admit(seq, layer).unwrap(), StepAdmission::Execute));
        s.begin_step(&hidden());
        s.commit(seq, &[], hidden(), None, DeviceId::new("cpu"), 10, false)
    }

    #[test]
    fn phases_follow_passes() {
        let mut s = session(2, 3, 4);
        assert_eq!(s.phase, SessionPhase::Created);

        let r = run_step(&mut s, 1, 0);
        assert_eq!(r.phase, SessionPhase::Prefill);
        let r = run_step(&mut s, 2, 1);
        assert_eq!(r.phase, SessionPhase::Decoding);
        run_step(&mut s, 3, 0);
        run_step(&mut s, 4, 1);
        run_step(&mut s, 5, 0);
        let r = run_step(&mut s, 6, 1);
        assert_eq!(r.phase, SessionPhase::Completed);
        assert_eq!(s.passes, 3);
        assert_eq!(s.steps, 6);
        assert_eq!(s.layer_trace(), &[0, 1, 0, 1, 0, 1]);

        let summary = s.summary();
        assert_eq!(summary.prompt_tokens, 3);
        assert_eq!(summary.generated_tokens, 3);
        assert_eq!(summary.final_phase, Some(SessionPhase::Completed));
    }

    #[test]
    fn replay_returns_cached_result() {
        let mut s = session(4, 10, 2);
        let first = run_step(&mut s, 1, 0);
        match s.admit(1, 0).unwrap() {
            StepAdmission::Replay(cached) => assert_eq!(cached, first),
            other => panic!("expected replay, got {other:?}"),
        }
        assert_eq!(s.steps, 1);
    }

    #[test]
    fn replay_window_is_bounded() {
        let mut s = session(4, 10, 2);
        run_step(&mut s, 1, 0);
        run_step(&mut s, 2, 1);
        run_step(&mut s, 3, 2);
        let err = s.admit(1, 0).unwrap_err();
        assert!(matches!(err, SchedulerError::ProtocolViolation(_)));
        // Not fatal.
        assert_eq!(s.phase, SessionPhase::Prefill);
    }

    #[test]
    fn skipped_seq_fails_session() {
        let mut s = session(4, 10, 2);
        run_step(&mut s, 1, 0);
        let err = s.admit(3, 1).unwrap_err();
        assert!(matches!(err, SchedulerError::ProtocolViolation(_)));
        assert_eq!(s.phase, SessionPhase::Failed);
        assert!(matches!(s.admit(2, 1), Err(SchedulerError::SessionClosed { .. })));
    }

    #[test]
    fn wrong_layer_fails_session() {
        let mut s = session(4, 10, 2);
        run_step(&mut s, 1, 0);
        assert!(s.admit(2, 2).is_err());
        assert_eq!(s.phase, SessionPhase::Failed);
        assert!(s.failure_reason.as_deref().unwrap().contains("expected layer 1"));
    }

    #[test]
    fn replay_survives_completion() {
        let mut s = session(1, 1, 4);
        let last = run_step(&mut s, 1, 0);
        assert_eq!(s.phase, SessionPhase::Completed);
        match s.admit(1, 0).unwrap() {
            StepAdmission::Replay(cached) => assert_eq!(cached, last),
            other => panic!("expected replay, got {other:?}"),
        }
        assert!(matches!(s.admit(2, 0), Err(SchedulerError::SessionClosed { .. })));
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut s = session(2, 2, 2);
        s.time_out("layer 0 deadline");
        s.fail("later");
        s.complete();
        assert_eq!(s.phase, SessionPhase::TimedOut);
        assert_eq!(s.failure_reason.as_deref(), Some("layer 0 deadline"));
    }

    #[test]
    fn layer_state_is_kept_per_layer() {
        let mut s = session(2, 4, 2);
        s.admit(1, 0).unwrap();
        s.begin_step(&hidden());
        s.commit(1, &[2], hidden(), Some(vec![7]), DeviceId::new("cpu"), 1, true);
        assert_eq!(s.layer_state(0), Some(vec![7]));
        assert_eq!(s.layer_state(1), None);
        assert_eq!(s.fallbacks, 1);
        assert_eq!(s.summary().expert_selections[&2], 1);
    }
}
