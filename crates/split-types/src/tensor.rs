// Activation tensors carried between the orchestrator and device executors.
//
// The scheduler never interprets tensor contents. It only checks that the
// byte length agrees with the declared shape before handing the payload to
// a compute backend.

use serde::{Deserialize, Serialize};

// ── Tensor Dtype ─────────────────────────────────────────────────────────────

/// Element type of an activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TensorDtype {
    F16  = 0,
    BF16 = 1,
    F32  = 2,
}

impl TensorDtype {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::F16),
            1 => Some(Self::BF16),
            2 => Some(Self::F32),
            _ => None,
        }
    }

    /// Bytes per element for this dtype.
    pub fn element_bytes(&self) -> usize {
        match self {
            Self::F16 | Self::BF16 => 2,
            Self::F32 => 4,
        }
    }
}

impl std::fmt::Display for TensorDtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::F16  => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
            Self::F32  => write!(f, "f32"),
        }
    }
}

// ── Tensor Payload ───────────────────────────────────────────────────────────

/// Opaque activation tensor: dtype, row-major shape and raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorPayload {
    pub dtype: TensorDtype,
    /// Typically `[seq_len, hidden_dim]`.
    pub shape: Vec<u32>,
    pub data: Vec<u8>,
}

impl TensorPayload {
    pub fn new(dtype: TensorDtype, shape: Vec<u32>, data: Vec<u8>) -> Self {
        Self { dtype, shape, data }
    }

    /// Build an F32 payload from host floats (little-endian encoding).
    pub fn from_f32(shape: Vec<u32>, values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self { dtype: TensorDtype::F32, shape, data }
    }

    /// Decode an F32 payload back into host floats.
    ///
    /// Returns `None` for other dtypes or a ragged byte length.
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        if self.dtype != TensorDtype::F32 || self.data.len() % 4 != 0 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// Element count, or `None` when the shape overflows `usize`.
    pub fn num_elements(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
    }

    /// Byte length implied by the shape, or `None` on overflow.
    pub fn expected_bytes(&self) -> Option<usize> {
        self.num_elements()?.checked_mul(self.dtype.element_bytes())
    }

    /// Leading dimension, interpreted as the number of tokens in the batch.
    pub fn seq_len(&self) -> u32 {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Check that the byte length matches `shape × element_bytes`.
    pub fn validate(&self) -> Result<(), String> {
        if self.shape.is_empty() {
            return Err("tensor has an empty shape".into());
        }
        let expected = self
            .expected_bytes()
            .ok_or_else(|| format!("tensor shape {:?} overflows", self.shape))?;
        if expected != self.data.len() {
            return Err(format!(
                "tensor shape {:?} ({}) needs {expected} bytes, payload has {}",
                self.shape,
                self.dtype,
                self.data.len()
            ));
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
