//! Configuration Loader (Figment-based)
//!
//! Loads and merges configuration from multiple sources using Figment:
//! 1. Built-in defaults (Serialized)
//! 2. Global config (platform config dir, reportloom/config.toml)
//! 3. Project config (.reportloom/config.toml)
//! 4. Environment variables (REPORTLOOM_* prefix, `__` separates sections)

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::types::Config;
use crate::types::{LoomError, Result};

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with full resolution chain using Figment:
    /// defaults → global → project → env vars
    pub fn load() -> Result<Config> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            debug!("Loading global config from: {}", global_path.display());
            figment = figment.merge(Toml::file(&global_path));
        }

        let project_path = Self::project_config_path();
        if project_path.exists() {
            debug!("Loading project config from: {}", project_path.display());
            figment = figment.merge(Toml::file(&project_path));
        }

        Self::finish(figment)
    }

    /// Load configuration from a specific file (plus env overrides)
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path));
        Self::finish(figment)
    }

    fn finish(figment: Figment) -> Result<Config> {
        // REPORTLOOM_PIPELINE__TOKEN_CEILING -> pipeline.token_ceiling
        let figment = figment.merge(Env::prefixed("REPORTLOOM_").split("__").lowercase(true));

        let mut config: Config = figment
            .extract()
            .map_err(|e| LoomError::Config(format!("Configuration error: {}", e)))?;

        if config.llm.api_key.is_none() {
            config.llm.api_key = std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    // =========================================================================
    // Path Management
    // =========================================================================

    /// Platform config directory for reportloom
    pub fn global_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "reportloom").map(|d| d.config_dir().to_path_buf())
    }

    /// Get path to global config file
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_dir().map(|dir| dir.join("config.toml"))
    }

    /// Get path to project config file
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".reportloom/config.toml")
    }

    // =========================================================================
    // Config Commands
    // =========================================================================

    /// Describe config file locations
    pub fn describe_paths() -> Vec<(String, Option<PathBuf>, bool)> {
        let global = Self::global_config_path();
        let global_exists = global.as_ref().is_some_and(|p| p.exists());
        let project = Self::project_config_path();
        let project_exists = project.exists();
        vec![
            ("Global".to_string(), global, global_exists),
            ("Project".to_string(), Some(project), project_exists),
        ]
    }

    /// Render the effective configuration
    pub fn render(config: &Config, as_json: bool) -> Result<String> {
        if as_json {
            Ok(serde_json::to_string_pretty(config)?)
        } else {
            toml::to_string_pretty(config).map_err(|e| LoomError::Config(e.to_string()))
        }
    }
}
