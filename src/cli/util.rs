//! CLI Common Utilities
//!
//! Shared initialization and context management for CLI commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::ai::create_transport;
use crate::config::{Config, ConfigLoader};
use crate::pipeline::{
    InMemoryRetriever, PipelineOrchestrator, SharedRetriever, SharedSink, WaitMode,
};
use crate::storage::{Database, SharedDatabase};
use crate::types::{LoomError, Result};

/// Command execution context
///
/// Loaded config plus the opened, initialized report database.
#[derive(Clone)]
pub struct CommandContext {
    pub config: Config,
    pub db: SharedDatabase,
}

impl CommandContext {
    /// Load config (explicit file if it exists, else the resolution chain) and open the database
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = load_config(config_path)?;
        let db = open_report_db(&config.storage.db_path)?;
        Ok(Self {
            config,
            db: Arc::new(db),
        })
    }

    pub fn sink(&self) -> SharedSink {
        self.db.clone()
    }

    /// Orchestrator wired to the configured transport and this database
    pub fn orchestrator(
        &self,
        retriever: SharedRetriever,
        wait_mode: WaitMode,
    ) -> Result<PipelineOrchestrator> {
        let transport = create_transport(&self.config.llm)?;
        Ok(
            PipelineOrchestrator::new(&self.config, transport, retriever, self.sink())
                .with_wait_mode(wait_mode),
        )
    }
}

pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) if path.exists() => ConfigLoader::load_from_file(path),
        _ => ConfigLoader::load(),
    }
}

/// Open and initialize the report database, creating parent directories
pub fn open_report_db(db_path: &Path) -> Result<Database> {
    let db = Database::open(db_path)?;
    db.initialize()?;
    Ok(db)
}

/// Corpus from a JSON file, or an empty corpus
pub fn load_retriever(corpus: Option<&Path>) -> Result<SharedRetriever> {
    let retriever = match corpus {
        Some(path) => InMemoryRetriever::from_json_file(path)?,
        None => InMemoryRetriever::default(),
    };
    if retriever.is_empty() {
        tracing::warn!("Corpus is empty; exemplar selection will be skipped");
    }
    Ok(Arc::new(retriever))
}

/// Resolve `@path` to the file's contents; anything else is literal text
pub fn read_input(raw: &str) -> Result<String> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(PathBuf::from(path)).map_err(|e| {
            LoomError::Config(format!("Cannot read input file '{}': {}", path, e))
        })?,
        None => raw.to_string(),
    };
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(LoomError::Config("Input text is empty".to_string()));
    }
    Ok(text)
}
