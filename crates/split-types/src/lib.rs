//! `split-types`: data model shared by the scheduler, the transport and
//! the orchestrator.

pub mod config;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod placement;
pub mod tensor;
pub mod wire;

pub use device::{DeviceHealth, DeviceId, DeviceKind, DeviceStatus};
pub use error::{ConfigError, ErrorKind};
pub use placement::{Component, PlacementKey, PlacementMode};
pub use tensor::{TensorDtype, TensorPayload};
pub use wire::{Envelope, MessageBody, SessionPhase};
