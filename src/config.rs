use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::address::MrpConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    /// upper bound of concurrently pooled session setups
    pub max_session_setups: usize,
    pub max_handshake_clients: usize,
    pub lookup_timeout_ms: u64,
    /// used until a peer advertises its own timing
    pub default_mrp: MrpConfig,
}

impl SetupConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            max_session_setups: 16,
            max_handshake_clients: 4,
            lookup_timeout_ms: 10_000,
            default_mrp: MrpConfig::default(),
        }
    }
}

pub fn load_config(path: &str) -> Result<SetupConfig> {
    let data = std::fs::read_to_string(path).context(format!("reading config from {}", path))?;
    serde_json::from_str(&data).context(format!("parsing {}", path))
}

pub fn save_config(path: &str, config: &SetupConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data).context(format!("writing config to {}", path))
}
