// Device identity and health types shared by the scheduler, the wire
// protocol and the status surface.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tensor::TensorDtype;

// ── Device Identity ──────────────────────────────────────────────────────────

/// Configured device name, e.g. `"cpu"` or `"igpu"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Cpu,
    IntegratedGpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu           => write!(f, "cpu"),
            Self::IntegratedGpu => write!(f, "integrated-gpu"),
        }
    }
}

// ── Health ───────────────────────────────────────────────────────────────────

/// Healthy → Degraded → Unavailable, driven by consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceHealth {
    Healthy     = 0,
    Degraded    = 1,
    Unavailable = 2,
}

impl DeviceHealth {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Healthy,
            1 => Self::Degraded,
            _ => Self::Unavailable,
        }
    }

    /// Degraded devices still take work; only Unavailable ones are skipped.
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Unavailable)
    }
}

impl fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy     => write!(f, "Healthy"),
            Self::Degraded    => write!(f, "Degraded"),
            Self::Unavailable => write!(f, "Unavailable"),
        }
    }
}

// ── Status snapshot ──────────────────────────────────────────────────────────

/// Point-in-time view of one device, reported by the status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub health: DeviceHealth,
    pub precisions: Vec<TensorDtype>,
    pub max_concurrent: u32,
    pub in_flight: u32,
    pub consecutive_failures: u32,
    pub submissions: u64,
    pub mean_latency_us: u64,
    pub is_fallback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_from_u8_saturates() {
        assert_eq!(DeviceHealth::from_u8(0), DeviceHealth::Healthy);
        assert_eq!(DeviceHealth::from_u8(1), DeviceHealth::Degraded);
        assert_eq!(DeviceHealth::from_u8(2), DeviceHealth::Unavailable);
        assert_eq!(DeviceHealth::from_u8(9), DeviceHealth::Unavailable);
    }

    #[test]
    fn device_kind_serde_names() {
        let json = serde_json::to_string(&DeviceKind::IntegratedGpu).unwrap();
        assert_eq!(json, "\"integrated-gpu\"");
        let id: DeviceId = serde_json::from_str("\"igpu\"").unwrap();
        assert_eq!(id.as_str(), "igpu");
    }
}
