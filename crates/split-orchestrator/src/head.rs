//! Model-side collaborator of the orchestrator.
//!
//! The orchestrator owns the token loop but nothing model-specific: the
//! embedding table, the MoE router and the sampler all sit behind
//! [`ModelHead`].

use split_types::TensorPayload;

pub trait ModelHead: Send + Sync {
    fn num_layers(&self) -> u32;

    /// Hidden state for `tokens`, shape `[tokens.len(), hidden_dim]`.
    fn embed(&self, tokens: &[u32]) -> TensorPayload;

    /// Experts selected for `layer` given its input. Empty for dense layers.
    fn route(&self, layer: u32, hidden: &TensorPayload) -> Vec<u32>;

    /// Sample the next token from the last layer's output.
    fn next_token(&self, hidden: &TensorPayload) -> u32;
}

// ── Synthetic head ───────────────────────────────────────────────────────────

/// Deterministic stand-in for a real model: fixed pseudo-embeddings, a
/// router keyed on the activations and a checksum sampler. Useful for
/// exercising a scheduler end to end without weights.
#[derive(Debug, Clone)]
pub struct SyntheticHead {
    pub num_layers: u32,
    pub num_experts: u32,
    pub hidden_dim: u32,
    pub vocab_size: u32,
}

impl SyntheticHead {
    pub fn new(num_layers: u32, num_experts: u32) -> Self {
        Self { num_layers, num_experts, hidden_dim: 16, vocab_size: 32_000 }
    }

    /// Crude whitespace tokenizer for demos.
    pub fn tokenize(&self, text: &str) -> Vec<u32> {
        text.split_whitespace()
            .map(|word| {
                word.bytes()
                    .fold(17u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)))
                    % self.vocab_size.max(1)
            })
            .collect()
    }

    fn last_row(&self, hidden: &TensorPayload) -> Vec<f32> {
        let dim = self.hidden_dim.max(1) as usize;
        hidden
            .to_f32()
            .map(|v| v[v.len().saturating_sub(dim)..].to_vec())
            .unwrap_or_default()
    }
}

impl ModelHead for SyntheticHead {
    fn num_layers(&self) -> u32 {
        self.num_layers
    }

    fn embed(&self, tokens: &[u32]) -> TensorPayload {
        let dim = self.hidden_dim;
        let values: Vec<f32> = tokens
            .iter()
            .flat_map(|&t| (0..dim).map(move |j| (t.wrapping_mul(31).wrapping_add(j * 7) % 97) as f32 / 97.0))
            .collect();
        TensorPayload::from_f32(vec![tokens.len() as u32, dim], &values)
    }

    fn route(&self, layer: u32, hidden: &TensorPayload) -> Vec<u32> {
        if self.num_experts == 0 {
            return Vec::new();
        }
        let sum: f32 = self.last_row(hidden).iter().sum();
        let bucket = (sum.abs() * 1000.0) as u32;
        vec![bucket.wrapping_add(layer) % self.num_experts]
    }

    fn next_token(&self, hidden: &TensorPayload) -> u32 {
        let sum: f32 = self.last_row(hidden).iter().sum();
        (sum.abs() * 10_000.0) as u32 % self.vocab_size.max(1)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
