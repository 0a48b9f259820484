// Placement key space: which model component a unit of work belongs to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The part of a transformer layer a work item computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Component {
    /// Attention (and any dense, non-expert part of the layer).
    Attention,
    /// One MoE expert within the layer.
    Expert(u32),
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attention => write!(f, "attention"),
            Self::Expert(e) => write!(f, "expert {e}"),
        }
    }
}

/// `(layer, component)`: the unit the placement table maps to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlacementKey {
    pub layer: u32,
    pub component: Component,
}

impl PlacementKey {
    pub fn attention(layer: u32) -> Self {
        Self { layer, component: Component::Attention }
    }

    pub fn expert(layer: u32, expert: u32) -> Self {
        Self { layer, component: Component::Expert(expert) }
    }

    /// Key used to route a step: the first selected expert, or attention
    /// when the step carries no expert subset.
    pub fn for_step(layer: u32, experts: &[u32]) -> Self {
        match experts.first() {
            Some(&e) => Self::expert(layer, e),
            None => Self::attention(layer),
        }
    }
}

impl fmt::Display for PlacementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer {} {}", self.layer, self.component)
    }
}

/// How the placement table was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementMode {
    Static,
    ProfileGuided,
    UniformFallback,
}

impl Default for PlacementMode {
    fn default() -> Self {
        Self::Static
    }
}

impl fmt::Display for PlacementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static          => write!(f, "static"),
            Self::ProfileGuided   => write!(f, "profile-guided"),
            Self::UniformFallback => write!(f, "uniform-fallback"),
        }
    }
}
