//! Agent settings file the consumer reads at startup.
//!
//! The harness writes `agent_settings.toml` into the persistence root
//! before the consumer initializes, pointing its backend at the mock
//! server's base URL.

use crate::errors::HarnessError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE_NAME: &str = "agent_settings.toml";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o".to_string(),
            llm_base_url: None,
            api_key: None,
        }
    }
}

/// Base-URL precedence: explicit argument, then settings value, then the
/// built-in default. Whitespace-only values are treated as absent at both
/// levels.
pub fn resolve_llm_base_url(settings: &AgentSettings, explicit: Option<&str>) -> String {
    if let Some(url) = non_blank(explicit) {
        return url.to_string();
    }
    if let Some(url) = non_blank(settings.llm_base_url.as_deref()) {
        return url.to_string();
    }
    DEFAULT_LLM_BASE_URL.to_string()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn load_settings(path: &Path) -> Result<AgentSettings, HarnessError> {
    let raw = std::fs::read_to_string(path).map_err(|e| HarnessError::Io(e.to_string()))?;
    toml::from_str(&raw).map_err(|e| HarnessError::SettingsParse(e.to_string()))
}

/// Write the settings file into `persistence_dir`; returns its path.
pub fn write_agent_settings(
    persistence_dir: &Path,
    settings: &AgentSettings,
) -> Result<PathBuf, HarnessError> {
    std::fs::create_dir_all(persistence_dir).map_err(|e| HarnessError::Io(e.to_string()))?;
    let path = persistence_dir.join(SETTINGS_FILE_NAME);
    let rendered =
        toml::to_string_pretty(settings).map_err(|e| HarnessError::SettingsParse(e.to_string()))?;
    std::fs::write(&path, rendered).map_err(|e| HarnessError::Io(e.to_string()))?;
    Ok(path)
}
