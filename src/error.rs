//! Unified error types for leakcheck.
//!
//! Library code uses `Error` and `Result<T>`. Embedder glue (drivers, build
//! integration) is expected to use `anyhow` and convert at the boundary.
//!
//! Note the split mandated by the two error layers of the checker: user-level
//! findings are *never* errors, they are [`crate::diagnostics::Diagnostic`]s.
//! `Error` is reserved for malfunctions of the checker itself or its inputs.

use std::path::PathBuf;
use thiserror::Error as ThisError;

/// Unified error type for leakcheck library operations.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Internal type-system invariant violation.
    ///
    /// Raised when annotations or the supplied program representation are
    /// inconsistent in a way user code cannot cause: incompatible must-call
    /// sets merged into one alias set, a postcondition naming an unknown
    /// exit kind, and similar. The driver treats each method analysis as a
    /// transactional unit, so this aborts one method, not the run.
    #[error("type system invariant violated: {message}")]
    TypeSystem {
        /// Description of the violated invariant.
        message: String,
    },

    /// A method body referenced a CFG block that does not exist.
    #[error("malformed control-flow graph: {message}")]
    MalformedCfg {
        /// Description of what went wrong.
        message: String,
    },

    /// Configuration file error.
    #[error("configuration error in {}: {message}", path.display())]
    Config {
        /// Path to the problematic configuration file.
        path: PathBuf,
        /// Description of what went wrong.
        message: String,
    },

    /// Configuration parse error.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Unknown check key provided (in config or a level override).
    #[error("unknown check: {0}")]
    UnknownCheck(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context.
    #[error("{context}: {message}")]
    WithContext {
        /// Context describing where the error occurred.
        context: String,
        /// The underlying error message.
        message: String,
    },

    /// Generic error for other cases.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an internal type-system error.
    pub fn type_system(message: impl Into<String>) -> Self {
        Self::TypeSystem {
            message: message.into(),
        }
    }

    /// Create a malformed-CFG error.
    pub fn malformed_cfg(message: impl Into<String>) -> Self {
        Self::MalformedCfg {
            message: message.into(),
        }
    }

    /// Create a config error.
    pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an unknown check error.
    pub fn unknown_check(name: impl Into<String>) -> Self {
        Self::UnknownCheck(name.into())
    }

    /// Create a generic error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Add context to an error.
    #[must_use]
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            message: self.to_string(),
        }
    }

    /// True iff this error is an internal invariant failure that the driver
    /// should surface as a `type.system.error` diagnostic rather than
    /// propagate.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::TypeSystem { .. } | Self::MalformedCfg { .. })
    }
}

/// Result type alias for leakcheck library operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::other(err.to_string())
    }
}

/// Convenience macro mirroring `anyhow::bail!` but returning a
/// type-system-internal `Error`.
#[macro_export]
macro_rules! invariant_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::type_system(format!($($arg)*)));
    };
}

/// Convenience macro mirroring `anyhow::ensure!` for internal invariants.
#[macro_export]
macro_rules! invariant_ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::invariant_bail!($($arg)*);
        }
    };
}
