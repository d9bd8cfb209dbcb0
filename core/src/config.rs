//! Session-wide configuration.

use serde::{Deserialize, Serialize};

/// Settings shared by every request issued through one `Session`.
///
/// Loadable from JSON; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfiguration {
    /// Applied before descriptor headers; a descriptor header with the same
    /// name replaces the default.
    pub default_headers: Vec<(String, String)>,

    /// Sent as `User-Agent` unless the request already sets one.
    pub user_agent: Option<String>,

    /// Upper bound on undelivered progress events per stream. Progress events
    /// beyond it are dropped; lifecycle and terminal events never are.
    pub max_buffered_progress_events: usize,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            default_headers: Vec::new(),
            user_agent: None,
            max_buffered_progress_events: 256,
        }
    }
}

impl SessionConfiguration {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
