// Orchestrator ⇄ scheduler wire messages.
//
// Every frame carries one `Envelope`. Replies echo the request's
// `(session_id, seq)` pair so a single connection can multiplex many
// sessions. Shared by split-scheduler, split-net and split-orchestrator.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, DeviceStatus};
use crate::error::ErrorKind;
use crate::placement::PlacementMode;
use crate::tensor::TensorPayload;

// ── Session Phase ────────────────────────────────────────────────────────────

/// Created → Prefill → Decoding → Completed | Failed | TimedOut
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Registered, placement snapshot captured, no step yet.
    Created,
    /// Running the layer pipeline over the prompt.
    Prefill,
    /// One layer pass per generated token.
    Decoding,
    Completed,
    Failed,
    TimedOut,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created   => write!(f, "Created"),
            Self::Prefill   => write!(f, "Prefill"),
            Self::Decoding  => write!(f, "Decoding"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed    => write!(f, "Failed"),
            Self::TimedOut  => write!(f, "TimedOut"),
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────────────────

/// Opens a session. Always sent with `seq = 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStart {
    /// Layer count the orchestrator's model expects; must match the
    /// scheduler's model.
    pub num_layers: u32,
    /// Maximum layer passes (prefill + decode tokens) before the scheduler
    /// completes the session on its own.
    pub max_passes: u32,
}

/// One layer of the forward pass for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRequest {
    pub layer: u32,
    /// Selected experts for MoE layers; empty for dense/attention work.
    pub experts: Vec<u32>,
    pub hidden: TensorPayload,
    /// Per-step deadline override, capped by the scheduler's limit.
    pub deadline_ms: Option<u64>,
}

// ── Replies ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAccepted {
    pub num_layers: u32,
    pub placement_mode: PlacementMode,
    pub step_deadline_ms: u64,
}

/// Output of one layer step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub layer: u32,
    /// Device that actually produced the output (after any fallback).
    pub device: DeviceId,
    /// Device wall-clock time for the step.
    pub duration_us: u64,
    /// Session step counter after this step.
    pub step: u64,
    pub phase: SessionPhase,
    pub hidden: TensorPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Per-generation metrics with real phase boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub final_phase: Option<SessionPhase>,
    pub failure_reason: Option<String>,
    pub created_at: String,

    pub prompt_tokens: u32,
    /// Completed layer passes; each pass yields one token.
    pub generated_tokens: u32,
    pub steps: u64,
    /// Steps that completed on the fallback device after a primary failure.
    pub fallbacks: u64,

    pub prefill_time_s: f64,
    pub decode_time_s: f64,
    pub total_time_s: f64,
    pub time_to_first_token_s: f64,

    pub tokens_per_second: f64,
    pub prefill_tokens_per_second: f64,
    pub decode_tokens_per_second: f64,

    /// Expert id → number of steps that selected it.
    pub expert_selections: BTreeMap<u32, u64>,
}

/// Operational health surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub started_at: String,
    pub placement_mode: PlacementMode,
    pub devices: Vec<DeviceStatus>,
    pub active_sessions: u32,
    pub total_sessions: u64,
}

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    SessionStart(SessionStart),
    SessionAccepted(SessionAccepted),
    Step(StepRequest),
    StepResult(StepResult),
    SessionEnd { reason: Option<String> },
    SessionClosed(SessionSummary),
    Error(ErrorReply),
    StatusQuery,
    Status(StatusReport),
}

impl MessageBody {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::SessionStart(_)    => "SessionStart",
            Self::SessionAccepted(_) => "SessionAccepted",
            Self::Step(_)            => "Step",
            Self::StepResult(_)      => "StepResult",
            Self::SessionEnd { .. }  => "SessionEnd",
            Self::SessionClosed(_)   => "SessionClosed",
            Self::Error(_)           => "Error",
            Self::StatusQuery        => "StatusQuery",
            Self::Status(_)          => "Status",
        }
    }
}

/// Self-describing frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Empty for connection-level messages such as status queries.
    pub session_id: String,
    /// Per-session sequence number; SessionStart is 0, steps count up.
    pub seq: u64,
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(session_id: impl Into<String>, seq: u64, body: MessageBody) -> Self {
        Self { session_id: session_id.into(), seq, body }
    }

    /// Build the reply for this request, keeping its `(session_id, seq)`.
    pub fn reply(&self, body: MessageBody) -> Self {
        Self { session_id: self.session_id.clone(), seq: self.seq, body }
    }

    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.reply(MessageBody::Error(ErrorReply { kind, message: message.into() }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
