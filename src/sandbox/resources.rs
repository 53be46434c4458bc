//! Resource presets and per-call limits for sandboxed code

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Named resource tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePreset {
    Low,
    #[default]
    Medium,
    High,
    Max,
}

impl ResourcePreset {
    pub fn limits(self) -> ResourceLimits {
        let (cpus, memory_mb, timeout_secs) = match self {
            ResourcePreset::Low => (0.5, 128, 10),
            ResourcePreset::Medium => (1.0, 256, 30),
            ResourcePreset::High => (2.0, 512, 60),
            ResourcePreset::Max => (4.0, 1024, 120),
        };
        ResourceLimits {
            cpus,
            memory_mb,
            timeout_secs,
            pids: 64,
            network: false,
        }
    }
}

/// Concrete limits applied to one execution
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub cpus: f64,
    pub memory_mb: u64,
    pub timeout_secs: u64,
    pub pids: i64,
    /// Container network access; off unless explicitly enabled
    pub network: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourcePreset::default().limits()
    }
}

impl ResourceLimits {
    pub fn with_cpus(mut self, cpus: Option<f64>) -> Self {
        if let Some(cpus) = cpus {
            self.cpus = cpus;
        }
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: Option<u64>) -> Self {
        if let Some(memory_mb) = memory_mb {
            self.memory_mb = memory_mb;
        }
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: Option<u64>) -> Self {
        if let Some(timeout_secs) = timeout_secs {
            self.timeout_secs = timeout_secs;
        }
        self
    }

    pub fn with_network(mut self, network: Option<bool>) -> Self {
        if let Some(network) = network {
            self.network = network;
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64) * 1024 * 1024
    }

    /// CPU quota in the units Docker expects
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(ResourcePreset::Low.limits().memory_mb, 128);
        assert_eq!(ResourcePreset::Max.limits().timeout_secs, 120);
        assert_eq!(ResourceLimits::default(), ResourcePreset::Medium.limits());
        assert!(!ResourceLimits::default().network);
    }

    #[test]
    fn test_overrides() {
        let limits = ResourcePreset::Low
            .limits()
            .with_cpus(Some(1.5))
            .with_memory_mb(None)
            .with_timeout_secs(Some(5));
        assert_eq!(limits.cpus, 1.5);
        assert_eq!(limits.memory_mb, 128);
        assert_eq!(limits.timeout(), Duration::from_secs(5));
        assert_eq!(limits.nano_cpus(), 1_500_000_000);
        assert_eq!(limits.memory_bytes(), 128 * 1024 * 1024);
    }

    #[test]
    fn test_preset_names() {
        let preset: ResourcePreset = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(preset, ResourcePreset::High);
    }
}
