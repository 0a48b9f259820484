//! Placement policy: `(layer, component) → device`.
//!
//! Resolution is deterministic and total:
//! 1. Exact `(layer, component)` entry.
//! 2. Per-layer default.
//! 3. Global default device.
//! 4. If the device from 1–3 is Unavailable (at session start or now),
//!    the registry's fallback device.
//! 5. If the fallback is Unavailable too → `NoDeviceAvailable`.
//!
//! Tables are immutable. A session captures a [`RoutingSnapshot`] at start,
//! so replacing the policy's table never changes routing mid-session.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::info;

use split_types::config::SchedulerConfig;
use split_types::{Component, DeviceId, PlacementKey, PlacementMode};

use crate::device::{DeviceExecutor, DeviceRegistry};
use crate::error::{Result, SchedulerError};
use crate::usage::UsageCounters;

// ── Placement Table ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PlacementTable {
    mode: PlacementMode,
    entries: HashMap<PlacementKey, DeviceId>,
    layer_defaults: HashMap<u32, DeviceId>,
    default_device: DeviceId,
}

impl PlacementTable {
    /// Static table straight from the configuration.
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            mode: PlacementMode::Static,
            entries: config
                .placement
                .entries
                .iter()
                .map(|e| (e.key(), DeviceId::new(e.device.clone())))
                .collect(),
            layer_defaults: config
                .placement
                .layers
                .iter()
                .map(|l| (l.layer, DeviceId::new(l.device.clone())))
                .collect(),
            default_device: config.default_device(),
        }
    }

    /// Everything to one device.
    pub fn uniform(device: DeviceId) -> Self {
        Self {
            mode: PlacementMode::UniformFallback,
            entries: HashMap::new(),
            layer_defaults: HashMap::new(),
            default_device: device,
        }
    }

    /// Rebuild from usage: the hottest expert keys go to the fastest live
    /// accelerator, up to `budget` keys; experts seen but not hot go to the
    /// fallback. Attention entries and layer defaults are kept from `base`.
    pub fn profile_guided(
        base: &PlacementTable,
        usage: &UsageCounters,
        registry: &DeviceRegistry,
        budget: u32,
    ) -> Self {
        let fallback = registry.fallback_id().clone();

        let Some(accelerator) = fastest_accelerator(registry) else {
            let mut table = Self::uniform(fallback);
            table.mode = PlacementMode::ProfileGuided;
            return table;
        };

        let mut entries: HashMap<PlacementKey, DeviceId> = base
            .entries
            .iter()
            .filter(|(k, _)| k.component == Component::Attention)
            .map(|(k, d)| (*k, d.clone()))
            .collect();

        for (rank, (key, _hits)) in usage.ranked_experts().into_iter().enumerate() {
            let device = if (rank as u32) < budget { &accelerator } else { &fallback };
            entries.insert(key, device.clone());
        }

        Self {
            mode: PlacementMode::ProfileGuided,
            entries,
            layer_defaults: base.layer_defaults.clone(),
            default_device: base.default_device.clone(),
        }
    }

    pub fn mode(&self) -> PlacementMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Levels 1–3: the configured device for `key`, ignoring health.
    pub fn preferred(&self, key: &PlacementKey) -> &DeviceId {
        self.entries
            .get(key)
            .or_else(|| self.layer_defaults.get(&key.layer))
            .unwrap_or(&self.default_device)
    }
}

/// Lowest mean latency among live non-fallback devices; devices without
/// telemetry rank after measured ones, in preference order.
fn fastest_accelerator(registry: &DeviceRegistry) -> Option<DeviceId> {
    registry
        .devices()
        .iter()
        .enumerate()
        .filter(|(_, d)| d.is_usable() && d.id() != registry.fallback_id())
        .min_by_key(|(i, d)| (d.tracker().mean_latency().unwrap_or(Duration::MAX), *i))
        .map(|(_, d)| d.id().clone())
}

// ── Routing Snapshot ─────────────────────────────────────────────────────────

/// Outcome of resolving one key.
#[derive(Clone)]
pub struct Resolution {
    pub device: Arc<DeviceExecutor>,
    pub preferred: DeviceId,
    /// True when the preferred device was skipped for the fallback.
    pub rerouted: bool,
}

/// Table plus device availability, frozen at session start.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    table: Arc<PlacementTable>,
    unavailable_at_start: HashSet<DeviceId>,
}

impl RoutingSnapshot {
    pub fn new(table: Arc<PlacementTable>, registry: &DeviceRegistry) -> Self {
        Self { table, unavailable_at_start: registry.unavailable() }
    }

    pub fn table(&self) -> &PlacementTable {
        &self.table
    }

    pub fn mode(&self) -> PlacementMode {
        self.table.mode()
    }

    pub fn resolve(&self, key: &PlacementKey, registry: &DeviceRegistry) -> Result<Resolution> {
        let preferred = self.table.preferred(key).clone();

        let usable_now = registry.is_usable(&preferred);
        if usable_now && !self.unavailable_at_start.contains(&preferred) {
            if let Some(device) = registry.get(&preferred) {
                return Ok(Resolution { device: Arc::clone(device), preferred, rerouted: false });
            }
        }

        let fallback = registry.fallback();
        if !fallback.is_usable() {
            return Err(SchedulerError::NoDeviceAvailable(format!(
                "{key}: preferred device '{preferred}' and fallback '{}' are unavailable",
                fallback.id()
            )));
        }
        let rerouted = fallback.id() != &preferred;
        Ok(Resolution { device: Arc::clone(fallback), preferred, rerouted })
    }
}

// ── Policy ───────────────────────────────────────────────────────────────────

/// Holds the current table; replaced wholesale, never edited in place.
pub struct PlacementPolicy {
    mode: PlacementMode,
    base: Arc<PlacementTable>,
    current: RwLock<Arc<PlacementTable>>,
    budget: u32,
}

impl PlacementPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let base = Arc::new(PlacementTable::from_config(config));
        let initial = match config.placement.mode {
            PlacementMode::UniformFallback => Arc::new(PlacementTable::uniform(config.fallback_device())),
            // Profile-guided starts from the static table until usage exists.
            PlacementMode::Static | PlacementMode::ProfileGuided => Arc::clone(&base),
        };
        Self {
            mode: config.placement.mode,
            base,
            current: RwLock::new(initial),
            budget: config.placement.accelerator_expert_budget,
        }
    }

    pub fn mode(&self) -> PlacementMode {
        self.mode
    }

    pub fn current(&self) -> Arc<PlacementTable> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Atomically swap in a new table. Running sessions keep their snapshot.
    pub fn replace(&self, table: PlacementTable) {
        let table = Arc::new(table);
        match self.current.write() {
            Ok(mut guard) => *guard = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
    }

    pub fn snapshot(&self, registry: &DeviceRegistry) -> RoutingSnapshot {
        RoutingSnapshot::new(self.current(), registry)
    }

    /// Recompute a profile-guided table. No-op for other modes or without
    /// usage data.
    pub fn replan(&self, usage: &UsageCounters, registry: &DeviceRegistry) -> bool {
        if self.mode != PlacementMode::ProfileGuided || usage.is_empty() {
            return false;
        }
        let table = PlacementTable::profile_guided(&self.base, usage, registry, self.budget);
        info!(entries = table.len(), budget = self.budget, "placement table replanned");
        self.replace(table);
        true
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{two_device_config, ScriptedProvider};
    use split_types::config::{BackpressureMode, LayerDefault, PlacementEntry};

    fn config() -> SchedulerConfig {
        let mut cfg = two_device_config(BackpressureMode::Queue);
        cfg.placement.layers = vec![LayerDefault { layer: 5, device: "igpu".into() }];
        cfg.placement.entries = vec![PlacementEntry { layer: 5, expert: Some(1), device: "cpu".into() }];
        cfg.placement.default_device = Some("cpu".into());
        cfg.validate().unwrap();
        cfg
    }

    fn registry(cfg: &SchedulerConfig, fail: &[&str]) -> DeviceRegistry {
        let provider = ScriptedProvider {
            fail: fail.iter().map(|s| s.to_string()).collect(),
            backend: None,
        };
        DeviceRegistry::probe(cfg, &provider).unwrap()
    }

    #[test]
    fn three_level_lookup() {
        let table = PlacementTable::from_config(&config());
        assert_eq!(table.preferred(&PlacementKey::expert(5, 1)), &DeviceId::new("cpu"));
        assert_eq!(table.preferred(&PlacementKey::expert(5, 2)), &DeviceId::new("igpu"));
        assert_eq!(table.preferred(&PlacementKey::attention(5)), &DeviceId::new("igpu"));
        assert_eq!(table.preferred(&PlacementKey::attention(0)), &DeviceId::new("cpu"));
    }

    #[test]
    fn unavailable_device_resolves_to_fallback() {
        let cfg = config();
        let reg = registry(&cfg, &["igpu"]);
        let policy = PlacementPolicy::from_config(&cfg);
        let snap = policy.snapshot(&reg);
        let res = snap.resolve(&PlacementKey::attention(5), &reg).unwrap();
        assert_eq!(res.device.id(), &DeviceId::new("cpu"));
        assert_eq!(res.preferred, DeviceId::new("igpu"));
        assert!(res.rerouted);
    }

    #[test]
    fn snapshot_does_not_flip_back_after_recovery() {
        let cfg = config();
        let reg = registry(&cfg, &[]);
        let igpu = DeviceId::new("igpu");
        reg.get(&igpu).unwrap().tracker().mark_unavailable();

        let policy = PlacementPolicy::from_config(&cfg);
        let snap = policy.snapshot(&reg);
        reg.recover(&igpu).unwrap();

        for _ in 0..3 {
            let res = snap.resolve(&PlacementKey::attention(5), &reg).unwrap();
            assert_eq!(res.device.id(), &DeviceId::new("cpu"));
        }
        // A fresh snapshot sees the recovered device.
        let fresh = policy.snapshot(&reg);
        assert_eq!(fresh.resolve(&PlacementKey::attention(5), &reg).unwrap().device.id(), &igpu);
    }

    #[test]
    fn device_lost_mid_session_is_skipped() {
        let cfg = config();
        let reg = registry(&cfg, &[]);
        let policy = PlacementPolicy::from_config(&cfg);
        let snap = policy.snapshot(&reg);
        reg.get(&DeviceId::new("igpu")).unwrap().tracker().mark_unavailable();
        let res = snap.resolve(&PlacementKey::attention(5), &reg).unwrap();
        assert_eq!(res.device.id(), &DeviceId::new("cpu"));
    }

    #[test]
    fn fails_when_fallback_unavailable() {
        let cfg = config();
        let reg = registry(&cfg, &[]);
        reg.fallback().tracker().mark_unavailable();
        let snap = PlacementPolicy::from_config(&cfg).snapshot(&reg);
        let err = snap.resolve(&PlacementKey::attention(0), &reg).err().unwrap();
        assert!(matches!(err, SchedulerError::NoDeviceAvailable(_)));
    }

    #[test]
    fn uniform_mode_routes_everything_to_fallback() {
        let mut cfg = config();
        cfg.placement.mode = PlacementMode::UniformFallback;
        let reg = registry(&cfg, &[]);
        let snap = PlacementPolicy::from_config(&cfg).snapshot(&reg);
        for layer in 0..8 {
            let res = snap.resolve(&PlacementKey::attention(layer), &reg).unwrap();
            assert_eq!(res.device.id(), &DeviceId::new("cpu"));
        }
        assert_eq!(snap.mode(), PlacementMode::UniformFallback);
    }

    #[test]
    fn profile_guided_puts_hot_experts_on_accelerator() {
        let mut cfg = config();
        cfg.placement.mode = PlacementMode::ProfileGuided;
        cfg.placement.accelerator_expert_budget = 1;
        let reg = registry(&cfg, &[]);
        let policy = PlacementPolicy::from_config(&cfg);

        let mut usage = UsageCounters::new();
        usage.record(2, &[3]);
        usage.record(2, &[3]);
        usage.record(2, &[0]);

        let before = policy.snapshot(&reg);
        assert!(policy.replan(&usage, &reg));
        let table = policy.current();
        assert_eq!(table.mode(), PlacementMode::ProfileGuided);
        assert_eq!(table.preferred(&PlacementKey::expert(2, 3)), &DeviceId::new("igpu"));
        assert_eq!(table.preferred(&PlacementKey::expert(2, 0)), &DeviceId::new("cpu"));

        // The earlier snapshot still routes by the old table.
        assert_eq!(before.table().preferred(&PlacementKey::expert(2, 3)), &DeviceId::new("cpu"));
    }

    #[test]
    fn static_mode_ignores_replan() {
        let cfg = config();
        let reg = registry(&cfg, &[]);
        let policy = PlacementPolicy::from_config(&cfg);
        let mut usage = UsageCounters::new();
        usage.record(0, &[0]);
        assert!(!policy.replan(&usage, &reg));
        assert_eq!(policy.current().mode(), PlacementMode::Static);
    }
}
