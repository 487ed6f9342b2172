use std::fmt;

use crate::error::{ModelError, Result};

/// Scope segment used in place of a node name for cluster-wide results.
pub const GLOBAL_SCOPE: &str = "global";

/// One outcome a run must collect, keyed by `(node, result type)`.
///
/// An empty `node_name` marks a cluster-wide result produced by a single
/// execution unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExpectedResult {
    #[cfg_attr(feature = "serde", serde(default))]
    pub node_name: String,
    pub result_type: String,
}

impl ExpectedResult {
    pub fn global(result_type: impl Into<String>) -> Self {
        Self {
            node_name: String::new(),
            result_type: result_type.into(),
        }
    }

    pub fn for_node(
        node_name: impl Into<String>,
        result_type: impl Into<String>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            result_type: result_type.into(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.node_name.is_empty()
    }

    /// Directory segment the result is filed under: the node name, or
    /// [`GLOBAL_SCOPE`] for cluster-wide results.
    pub fn scope(&self) -> &str {
        if self.is_global() {
            GLOBAL_SCOPE
        } else {
            &self.node_name
        }
    }

    /// Check that both halves of the key are safe to use as single path
    /// segments, on disk and on the wire.
    pub fn validate(&self) -> Result<()> {
        if !self.is_global() {
            validate_segment(&self.node_name)?;
        }
        validate_segment(&self.result_type)
    }
}

impl fmt::Display for ExpectedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope(), self.result_type)
    }
}

/// Reject empty segments, separators, and dot-prefixed names.
pub fn validate_segment(segment: &str) -> Result<()> {
    let bad = segment.is_empty()
        || segment.starts_with('.')
        || segment
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control());

    if bad {
        return Err(ModelError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}
