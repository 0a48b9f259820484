//! Scheduler and orchestrator configuration.
//!
//! The scheduler loads a TOML file once at startup and validates it before
//! probing any device. Invalid entries fail startup; nothing is silently
//! ignored.
//!
//! ```toml
//! listen = "tcp://127.0.0.1:7070"
//!
//! [model]
//! num_layers = 32
//! num_experts = 16
//!
//! [[device]]
//! name = "igpu"
//! kind = "integrated-gpu"
//! max_concurrent = 2
//! backpressure = "queue"
//! queue_depth = 8
//!
//! [[device]]
//! name = "cpu"
//! kind = "cpu"
//! max_concurrent = 4
//!
//! [placement]
//! mode = "static"
//! default_device = "igpu"
//! fallback_device = "cpu"
//!
//! [[placement.entry]]
//! layer = 5
//! expert = 3
//! device = "cpu"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, DeviceKind};
use crate::error::ConfigError;
use crate::placement::{Component, PlacementKey, PlacementMode};
use crate::tensor::TensorDtype;

pub const DEFAULT_LISTEN: &str = "tcp://127.0.0.1:7070";

/// Safety limit for a single frame: 128 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 128 * 1024 * 1024;

// ── Scheduler ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub model: ModelConfig,
    /// Devices in preference order.
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

/// Key space supplied by the model loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub num_layers: u32,
    #[serde(default)]
    pub num_experts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Wait for a slot, up to `queue_depth` waiters.
    Queue,
    /// Fail immediately with `DeviceBusy` when all slots are taken.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: DeviceKind,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: u32,
    #[serde(default = "default_backpressure")]
    pub backpressure: BackpressureMode,
    #[serde(default = "default_precisions")]
    pub precisions: Vec<TensorDtype>,
    /// DRM render node probed for integrated GPUs.
    #[serde(default)]
    pub render_node: Option<PathBuf>,
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_queue_depth() -> u32 {
    8
}

fn default_backpressure() -> BackpressureMode {
    BackpressureMode::Queue
}

fn default_precisions() -> Vec<TensorDtype> {
    vec![TensorDtype::F32]
}

impl DeviceConfig {
    /// The CPU device registered when the config does not list one.
    pub fn implicit_cpu() -> Self {
        Self {
            name: "cpu".into(),
            kind: DeviceKind::Cpu,
            max_concurrent: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            queue_depth: default_queue_depth(),
            backpressure: BackpressureMode::Queue,
            precisions: vec![TensorDtype::F32, TensorDtype::BF16],
            render_node: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        DeviceId::new(self.name.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementConfig {
    #[serde(default)]
    pub mode: PlacementMode,
    /// Global default device. Defaults to the first configured device.
    #[serde(default)]
    pub default_device: Option<String>,
    /// Defaults to the first CPU device.
    #[serde(default)]
    pub fallback_device: Option<String>,
    /// Rebuild a profile-guided table every N completed sessions.
    #[serde(default = "default_replan_every")]
    pub replan_every: u32,
    /// Hot (layer, expert) keys a profile-guided table may put on the
    /// accelerator.
    #[serde(default = "default_expert_budget")]
    pub accelerator_expert_budget: u32,
    #[serde(default, rename = "layer")]
    pub layers: Vec<LayerDefault>,
    #[serde(default, rename = "entry")]
    pub entries: Vec<PlacementEntry>,
}

fn default_replan_every() -> u32 {
    8
}

fn default_expert_budget() -> u32 {
    64
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            mode: PlacementMode::Static,
            default_device: None,
            fallback_device: None,
            replan_every: default_replan_every(),
            accelerator_expert_budget: default_expert_budget(),
            layers: Vec::new(),
            entries: Vec::new(),
        }
    }
}

/// Per-layer default device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerDefault {
    pub layer: u32,
    pub device: String,
}

/// Exact `(layer, expert)` entry. A missing `expert` means attention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementEntry {
    pub layer: u32,
    #[serde(default)]
    pub expert: Option<u32>,
    pub device: String,
}

impl PlacementEntry {
    pub fn key(&self) -> PlacementKey {
        PlacementKey {
            layer: self.layer,
            component: match self.expert {
                Some(e) => Component::Expert(e),
                None => Component::Attention,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// Consecutive failures before Healthy → Degraded.
    pub degrade_after: u32,
    /// Consecutive failures before → Unavailable.
    pub unavailable_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { degrade_after: 2, unavailable_after: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    pub step_deadline_ms: u64,
    pub max_sessions: u32,
    pub session_idle_timeout_secs: u64,
    /// Acknowledged step results kept per session for idempotent replay.
    pub replay_window: u32,
    pub max_frame_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            step_deadline_ms: 5_000,
            max_sessions: 64,
            session_idle_timeout_secs: 300,
            replay_window: 16,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl LimitsConfig {
    pub fn step_deadline(&self) -> Duration {
        Duration::from_millis(self.step_deadline_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}

impl SchedulerConfig {
    /// Minimal config: the given key space, an implicit CPU device.
    pub fn for_model(num_layers: u32, num_experts: u32) -> Self {
        Self {
            listen: default_listen(),
            model: ModelConfig { num_layers, num_experts },
            devices: Vec::new(),
            placement: PlacementConfig::default(),
            health: HealthConfig::default(),
            limits: LimitsConfig::default(),
        }
    }

    /// Loads and validates configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check every entry and fill in derived defaults (implicit CPU device,
    /// default and fallback device names).
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.model.num_layers == 0 {
            return Err(ConfigError::Invalid("model.num_layers must be at least 1".into()));
        }

        if !self.devices.iter().any(|d| d.kind == DeviceKind::Cpu) {
            self.devices.push(DeviceConfig::implicit_cpu());
        }

        let mut names = HashSet::new();
        for dev in &self.devices {
            if dev.name.trim().is_empty() {
                return Err(ConfigError::Invalid("device name must not be empty".into()));
            }
            if !names.insert(dev.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate device '{}'", dev.name)));
            }
            if dev.max_concurrent == 0 {
                return Err(ConfigError::Invalid(format!(
                    "device '{}': max_concurrent must be at least 1",
                    dev.name
                )));
            }
            if dev.precisions.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "device '{}': precisions must not be empty",
                    dev.name
                )));
            }
        }

        let fallback = match self.placement.fallback_device.clone() {
            Some(name) => name,
            None => self
                .devices
                .iter()
                .find(|d| d.kind == DeviceKind::Cpu)
                .map(|d| d.name.clone())
                .ok_or_else(|| ConfigError::Invalid("no CPU device for fallback".into()))?,
        };
        self.require_device(&fallback, "placement.fallback_device")?;
        self.placement.fallback_device = Some(fallback);

        let default = match self.placement.default_device.clone() {
            Some(name) => name,
            None => self.devices[0].name.clone(),
        };
        self.require_device(&default, "placement.default_device")?;
        self.placement.default_device = Some(default);

        let mut seen_layers = HashSet::new();
        for ld in &self.placement.layers {
            self.require_layer(ld.layer, "placement.layer")?;
            self.require_device(&ld.device, &format!("placement.layer[{}]", ld.layer))?;
            if !seen_layers.insert(ld.layer) {
                return Err(ConfigError::Invalid(format!(
                    "placement.layer: layer {} listed twice",
                    ld.layer
                )));
            }
        }

        let mut seen_keys = HashSet::new();
        for entry in &self.placement.entries {
            let key = entry.key();
            self.require_layer(entry.layer, "placement.entry")?;
            if let Some(e) = entry.expert {
                if e >= self.model.num_experts {
                    return Err(ConfigError::Invalid(format!(
                        "placement.entry: expert {e} out of range (model has {})",
                        self.model.num_experts
                    )));
                }
            }
            self.require_device(&entry.device, &format!("placement.entry[{key}]"))?;
            if !seen_keys.insert(key) {
                return Err(ConfigError::Invalid(format!("placement.entry: {key} listed twice")));
            }
        }

        if self.placement.replan_every == 0 {
            return Err(ConfigError::Invalid("placement.replan_every must be at least 1".into()));
        }

        if self.health.degrade_after == 0
            || self.health.unavailable_after < self.health.degrade_after
        {
            return Err(ConfigError::Invalid(format!(
                "health thresholds must satisfy 1 <= degrade_after ({}) <= unavailable_after ({})",
                self.health.degrade_after, self.health.unavailable_after
            )));
        }

        let limits = &self.limits;
        if limits.step_deadline_ms == 0 {
            return Err(ConfigError::Invalid("limits.step_deadline_ms must be positive".into()));
        }
        if limits.max_sessions == 0 {
            return Err(ConfigError::Invalid("limits.max_sessions must be at least 1".into()));
        }
        if limits.replay_window == 0 {
            return Err(ConfigError::Invalid("limits.replay_window must be at least 1".into()));
        }
        if limits.max_frame_bytes < 1024 {
            return Err(ConfigError::Invalid("limits.max_frame_bytes must be at least 1024".into()));
        }

        crate::endpoint::parse_endpoint(&self.listen)
            .map_err(|e| ConfigError::Invalid(format!("listen: {e}")))?;

        Ok(())
    }

    pub fn fallback_device(&self) -> DeviceId {
        DeviceId::new(self.placement.fallback_device.clone().unwrap_or_else(|| "cpu".into()))
    }

    pub fn default_device(&self) -> DeviceId {
        DeviceId::new(
            self.placement
                .default_device
                .clone()
                .unwrap_or_else(|| self.fallback_device().0),
        )
    }

    fn require_device(&self, name: &str, field: &str) -> Result<(), ConfigError> {
        if self.devices.iter().any(|d| d.name == name) {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!("{field}: unknown device '{name}'")))
        }
    }

    fn require_layer(&self, layer: u32, field: &str) -> Result<(), ConfigError> {
        if layer < self.model.num_layers {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "{field}: layer {layer} out of range (model has {})",
                self.model.num_layers
            )))
        }
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub endpoint: String,
    /// Transport-level wait for one reply.
    pub step_timeout_ms: u64,
    /// Re-sends of a step after a transport timeout.
    pub max_step_retries: u32,
    pub connect_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LISTEN.to_string(),
            step_timeout_ms: 10_000,
            max_step_retries: 2,
            connect_timeout_ms: 5_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl OrchestratorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
