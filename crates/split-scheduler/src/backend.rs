//! Compute backend seam.
//!
//! The scheduler never performs forward-pass arithmetic itself. Each device
//! wraps a [`ComputeBackend`] supplied by a [`BackendProvider`] at probe
//! time; the backend is treated as opaque and already tested.
//!
//! [`ReferenceBackend`] is the built-in stand-in used when no kernel
//! library is linked: it applies a deterministic residual update to F32
//! activations and keeps a per-layer token counter as its opaque state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use split_types::config::DeviceConfig;
use split_types::{DeviceKind, TensorDtype, TensorPayload};

/// Default DRM render node checked for an integrated GPU.
pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

/// Input to one layer invocation.
#[derive(Debug, Clone)]
pub struct LayerCall {
    pub layer: u32,
    pub experts: Vec<u32>,
    pub hidden: TensorPayload,
    /// Opaque per-layer state from the previous pass (KV-cache equivalent).
    pub state: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct LayerOutput {
    pub hidden: TensorPayload,
    pub state: Option<Vec<u8>>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("malformed input: {0}")]
    Malformed(String),
}

/// `execute(layer_params, input_tensor) -> output_tensor | error`.
///
/// Called from a blocking worker thread; implementations may block.
pub trait ComputeBackend: Send + Sync {
    fn execute(&self, call: LayerCall) -> Result<LayerOutput, BackendError>;
}

/// Initialises the backend for one configured device. Failure marks the
/// device Unavailable.
pub trait BackendProvider: Send + Sync {
    fn probe(&self, device: &DeviceConfig) -> Result<Arc<dyn ComputeBackend>, String>;
}

// ── Reference backend ────────────────────────────────────────────────────────

pub struct ReferenceBackend {
    kind: DeviceKind,
}

impl ReferenceBackend {
    pub fn new(kind: DeviceKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Residual offset added by `layer` with the given experts.
    pub fn layer_offset(layer: u32, experts: &[u32]) -> f32 {
        let expert_term: u32 = experts.iter().map(|e| e + 1).sum();
        0.001 * (layer + 1) as f32 + 0.0001 * expert_term as f32
    }
}

impl ComputeBackend for ReferenceBackend {
    fn execute(&self, call: LayerCall) -> Result<LayerOutput, BackendError> {
        call.hidden.validate().map_err(BackendError::Malformed)?;

        let hidden = match call.hidden.dtype {
            TensorDtype::F32 => {
                let offset = Self::layer_offset(call.layer, &call.experts);
                let values: Vec<f32> = call
                    .hidden
                    .to_f32()
                    .ok_or_else(|| BackendError::Malformed("ragged f32 payload".into()))?
                    .into_iter()
                    .map(|v| v + offset)
                    .collect();
                TensorPayload::from_f32(call.hidden.shape.clone(), &values)
            }
            // Half-precision kernels are not part of the reference path.
            TensorDtype::F16 | TensorDtype::BF16 => call.hidden.clone(),
        };

        let seen = call
            .state
            .as_deref()
            .and_then(|s| s.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0);
        let total = seen + u64::from(call.hidden.seq_len());

        Ok(LayerOutput {
            hidden,
            state: Some(total.to_le_bytes().to_vec()),
        })
    }
}

/// Probes devices for the reference backend: the CPU always initialises,
/// an integrated GPU only when its render node exists.
#[derive(Debug, Default)]
pub struct ReferenceProvider;

impl ReferenceProvider {
    fn render_node(device: &DeviceConfig) -> PathBuf {
        device
            .render_node
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDER_NODE))
    }
}

impl BackendProvider for ReferenceProvider {
    fn probe(&self, device: &DeviceConfig) -> Result<Arc<dyn ComputeBackend>, String> {
        match device.kind {
            DeviceKind::Cpu => Ok(Arc::new(ReferenceBackend::new(DeviceKind::Cpu))),
            DeviceKind::IntegratedGpu => {
                let node = Self::render_node(device);
                if Path::new(&node).exists() {
                    Ok(Arc::new(ReferenceBackend::new(DeviceKind::IntegratedGpu)))
                } else {
                    Err(format!("no DRM render node at {}", node.display()))
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
