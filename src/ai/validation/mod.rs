//! Model output validation
//!
//! Turns raw model text into a typed stage output. Anything that fails
//! here becomes `LoomError::MalformedOutput` and never reaches later
//! context projections.

mod json_repair;

pub use json_repair::{Recovery, extract_json};

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::constants::model::LOG_PREVIEW_CHARS;
use crate::types::{LoomError, Result, preview};

/// Typed stage output with a shape check beyond deserialization
pub trait Validate {
    fn validate(&self, stage: &str) -> Result<()>;
}

/// Extract, deserialize and validate a stage's output.
pub fn decode<T>(stage: &str, raw: &str) -> Result<T>
where
    T: DeserializeOwned + Validate,
{
    let (value, recovery) = extract_json(raw).map_err(|message| {
        warn!(
            stage,
            preview = %preview(raw, LOG_PREVIEW_CHARS),
            "Model output contained no usable JSON"
        );
        LoomError::malformed(stage, message)
    })?;

    if recovery != Recovery::Clean {
        warn!(stage, ?recovery, "Model output needed JSON recovery");
    }

    let parsed: T = serde_json::from_value(value).map_err(|e| {
        warn!(
            stage,
            preview = %preview(raw, LOG_PREVIEW_CHARS),
            "Model output did not match the expected shape: {}",
            e
        );
        LoomError::malformed(stage, e.to_string())
    })?;

    parsed.validate(stage)?;
    Ok(parsed)
}
