use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    // AI collaborator endpoint (the autonomous-ai backend function)
    #[serde(default = "default_ai_api_url")]
    pub ai_api_url: String,
    #[serde(default)]
    pub ai_api_key: Option<String>,
    #[serde(default)]
    pub ai_model: Option<String>,

    // Fleet database (activation state + agent audit log)
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Continuous operation loop
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_agent_pause_ms")]
    pub agent_pause_ms: u64,
    #[serde(default = "default_testing_interval_mins")]
    pub testing_interval_mins: u64,

    // Auto-activation. The console activates itself shortly after start;
    // the only way out is an explicit deactivate afterwards.
    #[serde(default = "default_auto_activate")]
    pub auto_activate: bool,
    #[serde(default = "default_activation_delay_ms")]
    pub activation_delay_ms: u64,
    #[serde(default = "default_initial_testing_delay_secs")]
    pub initial_testing_delay_secs: u64,

    // Where frontend-task generated pages land. None disables the sink.
    #[serde(default)]
    pub page_output_dir: Option<String>,
}

fn default_ai_api_url() -> String {
    "http://127.0.0.1:8790/functions/v1/autonomous-ai".to_string()
}

fn default_database_path() -> String {
    "fleet_memory.db".to_string()
}

fn default_cycle_interval_secs() -> u64 {
    5
}

fn default_agent_pause_ms() -> u64 {
    1000
}

fn default_testing_interval_mins() -> u64 {
    60
}

fn default_auto_activate() -> bool {
    true
}

fn default_activation_delay_ms() -> u64 {
    100
}

fn default_initial_testing_delay_secs() -> u64 {
    2
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            ai_api_url: default_ai_api_url(),
            ai_api_key: None,
            ai_model: None,
            database_path: default_database_path(),
            cycle_interval_secs: default_cycle_interval_secs(),
            agent_pause_ms: default_agent_pause_ms(),
            testing_interval_mins: default_testing_interval_mins(),
            auto_activate: default_auto_activate(),
            activation_delay_ms: default_activation_delay_ms(),
            initial_testing_delay_secs: default_initial_testing_delay_secs(),
            page_output_dir: None,
        }
    }
}

impl FleetConfig {
    fn get_base_dir() -> PathBuf {
        match env::current_exe() {
            Ok(exe) => exe
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (env override, then next to executable)
    pub fn config_path() -> PathBuf {
        if let Ok(path) = env::var("TMS_FLEET_CONFIG") {
            return PathBuf::from(path);
        }
        Self::get_base_dir().join("fleet_config.toml")
    }

    /// Load config from fleet_config.toml, falling back to the user config
    /// dir and finally to defaults + env vars
    pub fn load() -> Self {
        let mut candidates = vec![Self::config_path()];
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("tms_fleet").join("fleet_config.toml"));
        }

        for path in candidates {
            if let Ok(contents) = fs::read_to_string(&path) {
                match toml::from_str::<FleetConfig>(&contents) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables on top of defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("TMS_AI_API_URL") {
            config.ai_api_url = url;
        }
        if let Ok(key) = env::var("TMS_AI_API_KEY") {
            if !key.trim().is_empty() {
                config.ai_api_key = Some(key);
            }
        }
        if let Ok(model) = env::var("TMS_AI_MODEL") {
            if !model.trim().is_empty() {
                config.ai_model = Some(model);
            }
        }
        if let Ok(path) = env::var("TMS_FLEET_DB") {
            config.database_path = path;
        }
        if let Ok(dir) = env::var("TMS_PAGE_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                config.page_output_dir = Some(dir);
            }
        }

        config
    }
}
