//! Token generation loop.
//!
//! 1. Open a session (`SessionStart`, seq 0).
//! 2. Prefill: embed the prompt and step it through layers `0..N-1`.
//! 3. Sample a token; stop on the stop token or the token budget.
//! 4. Decode: embed the new token and run the next pass.
//! 5. Close the session (`SessionEnd`) and collect its summary.
//!
//! A step whose reply times out is re-sent with the same seq; the scheduler
//! answers a repeated seq from its replay cache, so nothing runs twice.

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use split_net::{FrameCodec, NetError, SchedulerClient};
use split_types::config::OrchestratorConfig;
use split_types::wire::{ErrorReply, SessionStart, SessionSummary, StatusReport, StepRequest, StepResult};
use split_types::{Envelope, ErrorKind, MessageBody};

use crate::error::{OrchestratorError, Result};
use crate::head::ModelHead;

// ── Options & results ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_new_tokens: u32,
    /// Sampling this token ends generation; it is not returned.
    pub stop_token: Option<u32>,
    /// Per-step deadline requested from the scheduler.
    pub step_deadline_ms: Option<u64>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self { max_new_tokens: 100, stop_token: None, step_deadline_ms: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// `max_new_tokens` reached.
    Length,
    /// The stop token was sampled.
    Stop,
    /// The stream consumer went away.
    Cancelled,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length    => write!(f, "length"),
            Self::Stop      => write!(f, "stop"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub session_id: String,
    pub tokens: Vec<u32>,
    pub finish: FinishReason,
    /// Scheduler-side metrics; `None` if the session could not be closed.
    pub summary: Option<SessionSummary>,
}

/// Streamed to [`Orchestrator::generate_streaming`] consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    Token { index: u32, token: u32 },
    Finished { finish: FinishReason, generated: u32 },
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

pub struct Orchestrator {
    client: SchedulerClient,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub async fn connect(config: OrchestratorConfig) -> Result<Self> {
        let codec = FrameCodec::new(config.max_frame_bytes);
        let client = SchedulerClient::connect(&config.endpoint, config.connect_timeout(), codec).await?;
        info!(endpoint = %config.endpoint, "connected to scheduler");
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn status(&self) -> Result<StatusReport> {
        Ok(self.client.status(self.config.step_timeout()).await?)
    }

    pub async fn generate(
        &self,
        head: &dyn ModelHead,
        prompt: &[u32],
        options: &GenerateOptions,
    ) -> Result<Generation> {
        self.run(head, prompt, options, None).await
    }

    /// Like [`generate`](Self::generate), additionally sending every token
    /// to `events` as soon as it is sampled. Dropping the receiver stops
    /// generation after the current pass.
    pub async fn generate_streaming(
        &self,
        head: &dyn ModelHead,
        prompt: &[u32],
        options: &GenerateOptions,
        events: mpsc::Sender<TokenEvent>,
    ) -> Result<Generation> {
        self.run(head, prompt, options, Some(&events)).await
    }

    async fn run(
        &self,
        head: &dyn ModelHead,
        prompt: &[u32],
        options: &GenerateOptions,
        events: Option<&mpsc::Sender<TokenEvent>>,
    ) -> Result<Generation> {
        if prompt.is_empty() {
            return Err(OrchestratorError::EmptyPrompt);
        }
        let session_id = Uuid::new_v4().to_string();
        let num_layers = head.num_layers();
        let max_passes = options.max_new_tokens.max(1);

        self.open(&session_id, num_layers, max_passes).await?;
        info!(
            session_id = %session_id,
            num_layers,
            prompt_tokens = prompt.len(),
            max_new_tokens = max_passes,
            "generation started"
        );

        let mut tokens: Vec<u32> = Vec::new();
        let mut seq = 0u64;
        let mut hidden = head.embed(prompt);

        let finish = loop {
            for layer in 0..num_layers {
                seq += 1;
                let experts = head.route(layer, &hidden);
                let request = Envelope::new(
                    session_id.as_str(),
                    seq,
                    MessageBody::Step(StepRequest {
                        layer,
                        experts,
                        hidden,
                        deadline_ms: options.step_deadline_ms,
                    }),
                );
                hidden = match self.step(request).await {
                    Ok(result) => result.hidden,
                    Err(reply) => {
                        warn!(session_id = %session_id, layer, seq, error = %reply, "generation failed");
                        self.close(&session_id, seq + 1, Some("step failed")).await;
                        return Err(OrchestratorError::Step {
                            kind: reply.kind,
                            message: reply.message,
                            committed: tokens,
                        });
                    }
                };
            }

            let token = head.next_token(&hidden);
            if options.stop_token == Some(token) {
                break FinishReason::Stop;
            }
            tokens.push(token);
            if let Some(tx) = events {
                let index = tokens.len() as u32 - 1;
                if tx.send(TokenEvent::Token { index, token }).await.is_err() {
                    break FinishReason::Cancelled;
                }
            }
            if tokens.len() as u32 >= max_passes {
                break FinishReason::Length;
            }
            hidden = head.embed(&[token]);
        };

        let reason = match finish {
            FinishReason::Length => None,
            FinishReason::Stop => Some("stop token"),
            FinishReason::Cancelled => Some("client cancelled"),
        };
        let summary = self.close(&session_id, seq + 1, reason).await;

        if let Some(tx) = events {
            let _ = tx
                .send(TokenEvent::Finished { finish, generated: tokens.len() as u32 })
                .await;
        }

        if let Some(s) = &summary {
            info!(
                session_id = %session_id,
                %finish,
                generated = tokens.len(),
                ttft_s = s.time_to_first_token_s,
                tokens_per_second = s.tokens_per_second,
                fallbacks = s.fallbacks,
                "generation finished"
            );
        }
        Ok(Generation { session_id, tokens, finish, summary })
    }

    async fn open(&self, session_id: &str, num_layers: u32, max_passes: u32) -> Result<()> {
        let start = Envelope::new(
            session_id,
            0,
            MessageBody::SessionStart(SessionStart { num_layers, max_passes }),
        );
        // SessionStart is idempotent server side, so it shares the step retry.
        let reply = self.exchange(start).await?;
        match reply.body {
            MessageBody::SessionAccepted(accepted) => {
                debug!(
                    session_id,
                    mode = %accepted.placement_mode,
                    step_deadline_ms = accepted.step_deadline_ms,
                    "session accepted"
                );
                Ok(())
            }
            MessageBody::Error(e) => Err(OrchestratorError::Rejected(e)),
            other => Err(OrchestratorError::Unexpected(other.kind_name())),
        }
    }

    async fn step(&self, request: Envelope) -> std::result::Result<StepResult, ErrorReply> {
        let reply = self.exchange(request).await.map_err(|e| ErrorReply {
            kind: e.kind(),
            message: e.to_string(),
        })?;
        match reply.body {
            MessageBody::StepResult(result) => Ok(result),
            MessageBody::Error(e) => Err(e),
            other => Err(ErrorReply {
                kind: ErrorKind::ProtocolViolation,
                message: format!("unexpected {} reply", other.kind_name()),
            }),
        }
    }

    /// One request, re-sent on reply timeout up to `max_step_retries` times.
    async fn exchange(&self, request: Envelope) -> std::result::Result<Envelope, NetError> {
        let timeout = self.config.step_timeout();
        let mut attempt = 0;
        loop {
            match self.client.request(request.clone(), timeout).await {
                Err(NetError::Timeout(waited)) if attempt < self.config.max_step_retries => {
                    attempt += 1;
                    warn!(
                        session_id = %request.session_id,
                        seq = request.seq,
                        attempt,
                        waited_ms = waited.as_millis() as u64,
                        "reply timed out, re-sending"
                    );
                }
                other => return other,
            }
        }
    }

    /// Best-effort `SessionEnd`.
    async fn close(&self, session_id: &str, seq: u64, reason: Option<&str>) -> Option<SessionSummary> {
        let end = Envelope::new(session_id, seq, MessageBody::SessionEnd { reason: reason.map(String::from) });
        match self.client.request(end, self.config.step_timeout()).await {
            Ok(Envelope { body: MessageBody::SessionClosed(summary), .. }) => Some(summary),
            Ok(Envelope { body: MessageBody::Error(e), .. }) => {
                warn!(session_id, error = %e, "session end rejected");
                None
            }
            Ok(other) => {
                warn!(session_id, kind = other.body.kind_name(), "unexpected reply to session end");
                None
            }
            Err(e) => {
                warn!(session_id, error = %e, "session end failed");
                None
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
