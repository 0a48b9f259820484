//! `split-orchestrator`: client side of split inference.
//!
//! Holds the model head (embedding, router, sampler) and walks every token
//! through the scheduler's layers one step at a time.

pub mod error;
pub mod head;
pub mod orchestrator;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use error::{OrchestratorError, Result};
pub use head::{ModelHead, SyntheticHead};
pub use orchestrator::{FinishReason, GenerateOptions, Generation, Orchestrator, TokenEvent};
