//! `split-scheduler`: runs a model's layers across heterogeneous local
//! devices on behalf of remote orchestrators.
//!
//! The scheduler never computes anything itself. It decides where each
//! layer step runs, enforces pipeline order per session, and falls back to
//! the CPU when an accelerator is busy, failing or gone.
//!
//! ```text
//!  orchestrator ──Step(layer, experts, hidden)──▶ Scheduler
//!                                                  │ admit (seq, cursor)
//!                                                  │ resolve (snapshot)
//!                                                  ▼
//!                               ┌──────────────┬──────────────┐
//!                               │  igpu exec   │   cpu exec   │ ◀─ fallback
//!                               └──────────────┴──────────────┘
//! ```

pub mod backend;
pub mod device;
pub mod error;
pub mod health;
pub mod metrics;
pub mod placement;
pub mod scheduler;
pub mod session;
pub mod usage;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use backend::{BackendError, BackendProvider, ComputeBackend, LayerCall, LayerOutput, ReferenceBackend, ReferenceProvider};
pub use device::{DeviceExecutor, DeviceRegistry, ExecutionFailure, ExecutionResult, WorkItem};
pub use error::{Result, SchedulerError};
pub use health::HealthTracker;
pub use metrics::PhaseClock;
pub use placement::{PlacementPolicy, PlacementTable, Resolution, RoutingSnapshot};
pub use scheduler::Scheduler;
pub use session::{Session, StepAdmission};
pub use usage::UsageCounters;
