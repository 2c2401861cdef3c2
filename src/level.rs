use serde::{Deserialize, Serialize};

/// Per-check severity level used by diagnostics and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum Level {
    Allow,
    #[default]
    Warn,
    Error,
}

impl Level {
    /// String representation used in rendered output and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Allow => "allow",
            Level::Warn => "warning",
            Level::Error => "error",
        }
    }
}
