use serde::Deserialize;

use crate::policy::SandboxPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub policy: SandboxPolicy,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Built-in facility names the host runtime provides. Any name
    /// absent from this list is classified as an external package.
    pub builtin_modules: Vec<String>,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${SANDBOX_POLICY_DIR}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}
