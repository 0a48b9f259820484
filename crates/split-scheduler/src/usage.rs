//! Per-(layer, expert) usage counters feeding profile-guided placement.

use std::collections::HashMap;

use split_types::{Component, PlacementKey};

#[derive(Debug, Clone, Default)]
pub struct UsageCounters {
    hits: HashMap<PlacementKey, u64>,
}

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one step that selected `experts` at `layer`.
    pub fn record(&mut self, layer: u32, experts: &[u32]) {
        for &e in experts {
            *self.hits.entry(PlacementKey::expert(layer, e)).or_insert(0) += 1;
        }
    }

    pub fn merge(&mut self, other: &UsageCounters) {
        for (key, n) in &other.hits {
            *self.hits.entry(*key).or_insert(0) += n;
        }
    }

    pub fn get(&self, key: &PlacementKey) -> u64 {
        self.hits.get(key).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Expert keys ordered hottest first; ties broken by key so the order is
    /// deterministic.
    pub fn ranked_experts(&self) -> Vec<(PlacementKey, u64)> {
        let mut ranked: Vec<(PlacementKey, u64)> = self
            .hits
            .iter()
            .filter(|(k, _)| matches!(k.component, Component::Expert(_)))
            .map(|(k, n)| (*k, *n))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
    }

    /// Expert id → hits, summed across layers.
    pub fn per_expert(&self) -> std::collections::BTreeMap<u32, u64> {
        let mut out = std::collections::BTreeMap::new();
        for (key, n) in &self.hits {
            if let Component::Expert(e) = key.component {
                *out.entry(e).or_insert(0) += n;
            }
        }
        out
    }
}
