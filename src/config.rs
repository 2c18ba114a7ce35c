//! Node configuration

use anyhow::{anyhow, bail, Context, Result};
use guardian_core::{CeremonyConfig, HardwareId};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the JSON configuration file
pub const CONFIG_ENV: &str = "GUARDIAN_CONFIG";

/// Ceremony parameters plus the size of the local demo network
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Passed to every guardian's state machine
    pub ceremony: CeremonyConfig,
    /// Number of guardians spawned on the in-process broker
    pub guardians: u8,
    /// Device address the simulated guardians count up from, `aa:bb:cc:dd:ee:ff`
    pub base_hardware_id: String,
    /// Overall deadline for the ceremony
    pub timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            ceremony: CeremonyConfig::default(),
            guardians: 3,
            base_hardware_id: "24:6f:28:00:00:00".to_string(),
            timeout_secs: 60,
        }
    }
}

impl NodeConfig {
    /// Load from the file named by `GUARDIAN_CONFIG`, or use defaults
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Parse and validate a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    fn from_json(text: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(text)?;
        config.ceremony.validate()?;
        if config.guardians == 0 {
            bail!("guardians must be positive");
        }
        config.hardware_ids()?;
        Ok(config)
    }

    /// Guardian addresses: the base address with its last octet plus 1..=n
    pub fn hardware_ids(&self) -> Result<Vec<HardwareId>> {
        let base: HardwareId = self
            .base_hardware_id
            .parse()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Invalid base_hardware_id {:?}", self.base_hardware_id))?;

        (1..=self.guardians)
            .map(|offset| -> Result<HardwareId> {
                let mut bytes = *base.as_bytes();
                bytes[5] = bytes[5].checked_add(offset).ok_or_else(|| {
                    anyhow!("base_hardware_id leaves no room for {} guardians", self.guardians)
                })?;
                Ok(HardwareId::new(bytes))
            })
            .collect()
    }

    /// Overall ceremony deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
