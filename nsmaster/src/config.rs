use anyhow::{Context, Result};
use libnamespace::MasterConfig;
use std::fs;
use std::path::Path;

/// Read a YAML master configuration. Missing keys take their defaults.
pub fn load_config(path: &Path) -> Result<MasterConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: MasterConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
