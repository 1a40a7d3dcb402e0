//! Config Command
//!
//! Usage:
//!   reportloom config show [-f text|json]
//!   reportloom config path

use std::path::Path;

use crate::cli::ui::Output;
use crate::cli::util::load_config;
use crate::config::ConfigLoader;
use crate::types::Result;

/// Show the merged effective configuration
pub fn show(config_path: Option<&Path>, format: &str) -> Result<()> {
    let config = load_config(config_path)?;
    println!("{}", ConfigLoader::render(&config, format == "json")?);
    Ok(())
}

/// Show configuration file paths
pub fn path() -> Result<()> {
    let out = Output::new();
    out.header("Configuration files");
    for (label, path, exists) in ConfigLoader::describe_paths() {
        let shown = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(unavailable)".to_string());
        let marker = if exists { "" } else { " (not found)" };
        out.field(&label, &format!("{}{}", shown, marker));
    }
    out.info("Environment overrides use the REPORTLOOM_ prefix, e.g. REPORTLOOM_PIPELINE__TOKEN_CEILING");
    Ok(())
}
