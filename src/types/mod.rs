pub mod error;
pub mod utils;

pub use error::{
    ErrorCategory, ErrorClassifier, FailureKind, LlmError, LoomError, Result, ResultExt,
};
pub use utils::{bounded_list, capitalize_first, preview, require_items, require_text, truncate_chars};

// =============================================================================
// Domain Newtypes
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type-safe wrapper for report IDs
///
/// Reports are the unit of persistence, resume, and clarification routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(String);

impl ReportId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ReportId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ReportId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ReportId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod newtype_tests {
    use super::*;

    #[test]
    fn test_report_id() {
        let id = ReportId::new("rep-123");
        assert_eq!(id.as_str(), "rep-123");
        assert_eq!(format!("{}", id), "rep-123");
    }

    #[test]
    fn test_report_id_generate_unique() {
        assert_ne!(ReportId::generate(), ReportId::generate());
    }

    #[test]
    fn test_report_id_serializes_as_string() {
        let json = serde_json::to_string(&ReportId::new("r1")).unwrap();
        assert_eq!(json, "\"r1\"");
    }
}
