//! Session scheduler.
//!
//! Owns the session table and turns each incoming step into exactly one
//! dispatched work item (two when the primary device fails and the step is
//! retried on the fallback). Steps of one session are serialized by a
//! per-session lock; steps of different sessions never wait on each other.
//!
//! Step handling:
//! 1. Admit: replay an acknowledged seq, reject gaps and out-of-order layers.
//! 2. Resolve the device through the session's routing snapshot.
//! 3. Dispatch under the step deadline, racing the session's cancel signal.
//! 4. On `DeviceBusy` or an execution error, retry once on the fallback.
//! 5. Commit: advance the cursor, cache the result for replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use split_types::config::SchedulerConfig;
use split_types::wire::{
    ErrorReply, SessionAccepted, SessionStart, SessionSummary, StatusReport, StepRequest, StepResult,
};
use split_types::{DeviceId, Envelope, MessageBody, PlacementKey, PlacementMode, SessionPhase};

use crate::device::{DeviceExecutor, DeviceRegistry, ExecutionFailure, ExecutionResult, WorkItem};
use crate::error::{Result, SchedulerError};
use crate::placement::PlacementPolicy;
use crate::session::{Session, StepAdmission};
use crate::usage::UsageCounters;

// ── Session Slot ─────────────────────────────────────────────────────────────

struct SessionSlot {
    session: tokio::sync::Mutex<Session>,
    /// Flipped to `true` when the session is ended or reaped.
    cancel: watch::Sender<bool>,
    num_layers: u32,
    max_passes: u32,
}

/// How a session left the table.
enum Closing<'a> {
    Ended(Option<&'a str>),
    Abandoned(&'a str),
    Idle,
}

enum Dispatch {
    Finished(ExecutionResult),
    Expired,
    Cancelled,
}

// ── Scheduler ────────────────────────────────────────────────────────────────

pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<DeviceRegistry>,
    policy: PlacementPolicy,
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
    usage: Mutex<UsageCounters>,
    completed: AtomicU32,
    total_sessions: AtomicU64,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, registry: Arc<DeviceRegistry>, policy: PlacementPolicy) -> Self {
        info!(
            devices = registry.devices().len(),
            fallback = %registry.fallback_id(),
            mode = %policy.mode(),
            max_sessions = config.limits.max_sessions,
            "scheduler ready"
        );
        Self {
            config,
            registry,
            policy,
            sessions: Mutex::new(HashMap::new()),
            usage: Mutex::new(UsageCounters::new()),
            completed: AtomicU32::new(0),
            total_sessions: AtomicU64::new(0),
            started_at: chrono::Utc::now(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &PlacementPolicy {
        &self.policy
    }

    pub fn active_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }

    // ── Envelope entry point ─────────────────────────────────────────────

    /// Handle one request and build its reply. Never fails: errors become
    /// `Error` replies carrying the request's `(session_id, seq)`.
    pub async fn handle(&self, request: Envelope) -> Envelope {
        let Envelope { session_id, seq, body } = request;
        let outcome = match body {
            MessageBody::SessionStart(start) => {
                self.start_session(&session_id, start).map(MessageBody::SessionAccepted)
            }
            MessageBody::Step(step) => self.step(&session_id, seq, step).await.map(MessageBody::StepResult),
            MessageBody::SessionEnd { reason } => self
                .end_session(&session_id, reason.as_deref())
                .await
                .map(MessageBody::SessionClosed),
            MessageBody::StatusQuery => Ok(MessageBody::Status(self.status())),
            other => Err(SchedulerError::ProtocolViolation(format!(
                "unexpected {} from client",
                other.kind_name()
            ))),
        };

        let body = match outcome {
            Ok(body) => body,
            Err(e) => {
                debug!(session_id = %session_id, seq, kind = %e.kind(), error = %e, "request rejected");
                MessageBody::Error(ErrorReply { kind: e.kind(), message: e.to_string() })
            }
        };
        Envelope::new(session_id, seq, body)
    }

    // ── Session lifecycle ────────────────────────────────────────────────

    /// Register a session and capture its routing snapshot.
    ///
    /// Repeating a start for a live session with the same shape is accepted
    /// again without creating anything.
    pub fn start_session(&self, session_id: &str, start: SessionStart) -> Result<SessionAccepted> {
        if session_id.is_empty() {
            return Err(SchedulerError::ProtocolViolation("empty session id".into()));
        }
        let num_layers = self.config.model.num_layers;
        if start.num_layers != num_layers {
            return Err(SchedulerError::ProtocolViolation(format!(
                "session expects {} layers, model has {num_layers}",
                start.num_layers
            )));
        }
        if start.max_passes == 0 {
            return Err(SchedulerError::ProtocolViolation("max_passes must be at least 1".into()));
        }

        let accepted = SessionAccepted {
            num_layers,
            placement_mode: self.policy.mode(),
            step_deadline_ms: self.config.limits.step_deadline_ms,
        };

        let mut sessions = lock(&self.sessions);
        if let Some(existing) = sessions.get(session_id) {
            if existing.num_layers == start.num_layers && existing.max_passes == start.max_passes {
                debug!(session_id, "duplicate session start accepted");
                return Ok(accepted);
            }
            return Err(SchedulerError::ProtocolViolation(format!(
                "session id {session_id} already in use"
            )));
        }

        let limit = self.config.limits.max_sessions;
        if sessions.len() >= limit as usize {
            warn!(session_id, limit, "session rejected: capacity reached");
            return Err(SchedulerError::CapacityExceeded(limit));
        }

        let routing = self.policy.snapshot(&self.registry);
        let mode = routing.mode();
        let session = Session::new(
            session_id.to_string(),
            num_layers,
            start.max_passes,
            routing,
            self.config.limits.replay_window,
        );
        let (cancel, _) = watch::channel(false);
        sessions.insert(
            session_id.to_string(),
            Arc::new(SessionSlot {
                session: tokio::sync::Mutex::new(session),
                cancel,
                num_layers,
                max_passes: start.max_passes,
            }),
        );
        self.total_sessions.fetch_add(1, Ordering::Relaxed);

        info!(
            session_id,
            num_layers,
            max_passes = start.max_passes,
            mode = %mode,
            active = sessions.len(),
            "session started"
        );
        Ok(accepted)
    }

    /// Run one layer step for a session.
    pub async fn step(&self, session_id: &str, seq: u64, request: StepRequest) -> Result<StepResult> {
        let slot = self.slot(session_id)?;
        let mut cancel = slot.cancel.subscribe();
        let mut session = slot.session.lock().await;

        let StepRequest { layer, experts, hidden, deadline_ms } = request;

        if let StepAdmission::Replay(cached) = session.admit(seq, layer)? {
            debug!(session_id, seq, layer, "replaying acknowledged step");
            return Ok(cached);
        }

        hidden.validate().map_err(SchedulerError::ProtocolViolation)?;
        let num_experts = self.config.model.num_experts;
        if let Some(bad) = experts.iter().find(|&&e| e >= num_experts) {
            return Err(SchedulerError::ProtocolViolation(format!(
                "expert {bad} out of range (model has {num_experts})"
            )));
        }

        let limit = self.config.limits.step_deadline();
        let budget = deadline_ms.map_or(limit, |ms| Duration::from_millis(ms).min(limit));
        let deadline = Instant::now() + budget;

        let key = PlacementKey::for_step(layer, &experts);
        let resolution = match session.routing().resolve(&key, &self.registry) {
            Ok(r) => r,
            Err(e) => {
                warn!(session_id, layer, error = %e, "no device for step");
                session.fail(&e.to_string());
                return Err(e);
            }
        };

        let mut device = resolution.device;
        if !device.supports(hidden.dtype) {
            let fallback = self.registry.fallback();
            if !fallback.supports(hidden.dtype) {
                return Err(SchedulerError::NoDeviceAvailable(format!(
                    "{key}: no device accepts {} payloads",
                    hidden.dtype
                )));
            }
            debug!(session_id, layer, device = %device.id(), dtype = %hidden.dtype, "dtype unsupported, using fallback");
            device = Arc::clone(fallback);
        } else if resolution.rerouted {
            debug!(session_id, %key, preferred = %resolution.preferred, device = %device.id(), "rerouted to fallback");
        }

        session.begin_step(&hidden);
        let state = session.layer_state(layer);
        let mut retried = false;

        let (output, ran_on, duration) = loop {
            let item = WorkItem {
                id: Uuid::new_v4(),
                session_id: session_id.to_string(),
                layer,
                experts: experts.clone(),
                hidden: hidden.clone(),
                state: state.clone(),
                deadline,
            };

            match dispatch(&device, item, &mut cancel).await {
                Dispatch::Finished(ExecutionResult { outcome: Ok(out), device: ran_on, duration, .. }) => {
                    break (out, ran_on, duration);
                }
                Dispatch::Finished(ExecutionResult { outcome: Err(failure), device: failed_on, .. }) => {
                    if retried {
                        let err = match failure {
                            ExecutionFailure::Busy => SchedulerError::DeviceBusy(failed_on),
                            ExecutionFailure::Unavailable => SchedulerError::NoDeviceAvailable(format!(
                                "fallback device '{failed_on}' is unavailable"
                            )),
                            other => SchedulerError::Execution { device: failed_on, detail: other.to_string() },
                        };
                        warn!(session_id, layer, error = %err, "step failed on fallback");
                        session.fail(&err.to_string());
                        return Err(err);
                    }
                    warn!(
                        session_id,
                        layer,
                        device = %failed_on,
                        kind = %failure.kind(),
                        error = %failure,
                        "step failed, retrying on fallback"
                    );
                    retried = true;
                    device = Arc::clone(self.registry.fallback());
                }
                Dispatch::Expired => {
                    device.record_timeout();
                    let reason = format!(
                        "layer {layer} on {} exceeded its {}ms deadline",
                        device.id(),
                        budget.as_millis()
                    );
                    warn!(session_id, layer, device = %device.id(), "step deadline expired");
                    session.time_out(&reason);
                    return Err(SchedulerError::TimedOut { session_id: session_id.to_string(), layer });
                }
                Dispatch::Cancelled => {
                    debug!(session_id, layer, "in-flight step abandoned by session end");
                    session.complete();
                    return Err(SchedulerError::SessionClosed {
                        session_id: session_id.to_string(),
                        phase: session.phase.to_string(),
                    });
                }
            }
        };

        let result = session.commit(
            seq,
            &experts,
            output.hidden,
            output.state,
            ran_on,
            duration.as_micros() as u64,
            retried,
        );
        debug!(
            session_id,
            seq,
            layer,
            device = %result.device,
            duration_us = result.duration_us,
            phase = %result.phase,
            "step committed"
        );
        if result.phase == SessionPhase::Completed {
            info!(session_id, passes = session.passes, steps = session.steps, "session reached max passes");
        }
        Ok(result)
    }

    /// Close a session: stop any in-flight dispatch, mark it Completed if it
    /// is still running, and return its summary.
    pub async fn end_session(&self, session_id: &str, reason: Option<&str>) -> Result<SessionSummary> {
        let slot = lock(&self.sessions)
            .remove(session_id)
            .ok_or_else(|| SchedulerError::SessionNotFound(session_id.to_string()))?;
        Ok(self.close(slot, Closing::Ended(reason)).await)
    }

    /// Drop sessions whose client went away.
    pub async fn abandon(&self, session_ids: &[String], reason: &str) {
        for id in session_ids {
            let slot = lock(&self.sessions).remove(id);
            if let Some(slot) = slot {
                self.close(slot, Closing::Abandoned(reason)).await;
            }
        }
    }

    /// Remove every session with no activity since `now - idle_timeout`.
    /// Sessions with a step in flight are never idle.
    pub fn reap_idle(&self, now: Instant) -> Vec<String> {
        let timeout = self.config.limits.session_idle_timeout();
        let candidates: Vec<(String, Arc<SessionSlot>)> = lock(&self.sessions)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut reaped = Vec::new();
        for (id, slot) in candidates {
            // Held through removal so no step can slip in between.
            let Ok(mut session) = slot.session.try_lock() else {
                continue;
            };
            if now.saturating_duration_since(session.last_activity) <= timeout {
                continue;
            }
            let removed = {
                let mut sessions = lock(&self.sessions);
                match sessions.get(&id) {
                    Some(current) if Arc::ptr_eq(current, &slot) => sessions.remove(&id).is_some(),
                    _ => false,
                }
            };
            if !removed {
                continue;
            }
            let _ = slot.cancel.send(true);
            session.time_out("idle timeout");
            self.retire(&session, Closing::Idle);
            reaped.push(id);
        }
        reaped
    }

    /// Background task running [`reap_idle`](Self::reap_idle) every `interval`.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = scheduler.reap_idle(Instant::now());
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "reaped idle sessions");
                }
            }
        })
    }

    // ── Operations ───────────────────────────────────────────────────────

    pub fn status(&self) -> StatusReport {
        StatusReport {
            started_at: self.started_at.to_rfc3339(),
            placement_mode: self.policy.mode(),
            devices: self.registry.status(),
            active_sessions: self.active_sessions() as u32,
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
        }
    }

    /// Return an Unavailable device to rotation. Only new sessions see it.
    pub fn recover_device(&self, id: &DeviceId) -> Result<()> {
        self.registry.recover(id)
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>> {
        lock(&self.sessions)
            .get(session_id)
            .cloned()
            .ok_or_else(|| SchedulerError::SessionNotFound(session_id.to_string()))
    }

    async fn close(&self, slot: Arc<SessionSlot>, closing: Closing<'_>) -> SessionSummary {
        let _ = slot.cancel.send(true);
        let mut session = slot.session.lock().await;
        match closing {
            Closing::Ended(_) => session.complete(),
            Closing::Abandoned(reason) => session.fail(reason),
            Closing::Idle => session.time_out("idle timeout"),
        }
        self.retire(&session, closing)
    }

    /// Log the summary and fold the session's usage into the global counters.
    fn retire(&self, session: &Session, closing: Closing<'_>) -> SessionSummary {
        let summary = session.summary();
        let cause = match closing {
            Closing::Ended(reason) => reason.unwrap_or("client"),
            Closing::Abandoned(reason) => reason,
            Closing::Idle => "idle",
        };
        info!(
            session_id = %summary.session_id,
            phase = %session.phase,
            cause,
            steps = summary.steps,
            generated_tokens = summary.generated_tokens,
            fallbacks = summary.fallbacks,
            ttft_s = summary.time_to_first_token_s,
            tokens_per_second = summary.tokens_per_second,
            "session closed"
        );

        let usage = {
            let mut global = lock(&self.usage);
            global.merge(session.usage());
            global.clone()
        };

        if session.phase == SessionPhase::Completed && self.policy.mode() == PlacementMode::ProfileGuided {
            let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
            if done % self.config.placement.replan_every == 0 {
                self.policy.replan(&usage, &self.registry);
            }
        }
        summary
    }
}

/// Submit `item` to `device`, giving up at its deadline or on cancellation.
/// Giving up drops the submission; a late result is discarded.
async fn dispatch(device: &DeviceExecutor, item: WorkItem, cancel: &mut watch::Receiver<bool>) -> Dispatch {
    let deadline = tokio::time::Instant::from_std(item.deadline);
    tokio::select! {
        finished = tokio::time::timeout_at(deadline, device.submit(item)) => match finished {
            Ok(result) => Dispatch::Finished(result),
            Err(_) => Dispatch::Expired,
        },
        _ = cancel.wait_for(|cancelled| *cancelled) => Dispatch::Cancelled,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
