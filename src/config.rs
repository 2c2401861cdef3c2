use crate::diagnostics::find_descriptor;
use crate::error::{Error, Result};
use crate::level::Level;
use anyhow::Context;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from `leakcheck.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct LeakCheckConfig {
    #[serde(default)]
    pub checker: CheckerSection,

    /// Explicit per-check levels (e.g. `"owning.override.param" = "error"`).
    #[serde(default)]
    pub checks: HashMap<String, Level>,
}

/// The `[checker]` section: boolean switches and list-valued policies.
#[derive(Debug, Default, Deserialize)]
pub struct CheckerSection {
    /// Exempt `static` owning fields from the owning-field check.
    #[serde(default)]
    pub permit_static_owning: bool,

    /// Disable ownership tracking entirely on locals and owning fields.
    ///
    /// With this set, only the override checks run; no obligation is ever
    /// created, so no leak is ever reported.
    #[serde(default)]
    pub no_lightweight_ownership: bool,

    /// Match postcondition expressions against fields exactly (`f` or
    /// `this.f`) instead of by simple-name substring.
    #[serde(default)]
    pub strict_field_matching: bool,

    /// Exception types whose call-site edges are excluded from the
    /// exceptional-exit analysis. When absent, [`DEFAULT_IGNORED_EXCEPTIONS`]
    /// applies.
    pub ignored_exceptions: Option<Vec<String>>,

    /// Type names whose declarations are exempt from the owning-field check.
    #[serde(default)]
    pub skip_uses: Vec<String>,
}

/// Exception types treated as unrecoverable faults rather than exits.
///
/// A callee raising one of these does not contribute an exceptional edge to
/// the caller's analysis: such a fault indicates a bug, not a state any
/// cleanup handler is expected to recover from. Explicit `throw`s are always
/// analyzed regardless of this list.
///
/// This is the single place the allowlist is enumerated.
pub const DEFAULT_IGNORED_EXCEPTIONS: &[&str] = &[
    "ArithmeticException",
    "ArrayIndexOutOfBoundsException",
    "ArrayStoreException",
    "ClassCastException",
    "IndexOutOfBoundsException",
    "NegativeArraySizeException",
    "NullPointerException",
    "StringIndexOutOfBoundsException",
    "AssertionError",
    "OutOfMemoryError",
    "StackOverflowError",
];

/// Resolved options consumed by the checker, independent of any config file.
#[derive(Debug, Clone)]
pub struct Options {
    pub permit_static_owning: bool,
    pub no_lightweight_ownership: bool,
    pub strict_field_matching: bool,
    pub ignored_exceptions: BTreeSet<String>,
    pub skip_uses: Vec<String>,
    /// Per-key severity overrides; read through [`Options::level_for`].
    pub levels: HashMap<String, Level>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            permit_static_owning: false,
            no_lightweight_ownership: false,
            strict_field_matching: false,
            ignored_exceptions: DEFAULT_IGNORED_EXCEPTIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            skip_uses: Vec::new(),
            levels: HashMap::new(),
        }
    }
}

impl Options {
    /// Resolve options from a parsed config file.
    ///
    /// Rejects level overrides whose key is not in the descriptor table, so
    /// typos surface at load time rather than as silently inert settings.
    pub fn from_config(config: &LeakCheckConfig) -> Result<Self> {
        for key in config.checks.keys() {
            if find_descriptor(key).is_none() {
                return Err(Error::unknown_check(key.clone()));
            }
        }
        let mut options = Options {
            permit_static_owning: config.checker.permit_static_owning,
            no_lightweight_ownership: config.checker.no_lightweight_ownership,
            strict_field_matching: config.checker.strict_field_matching,
            skip_uses: config.checker.skip_uses.clone(),
            levels: config.checks.clone(),
            ..Options::default()
        };
        if let Some(list) = &config.checker.ignored_exceptions {
            options.ignored_exceptions = list.iter().cloned().collect();
        }
        Ok(options)
    }

    /// Effective severity for a message key.
    pub fn level_for(&self, key: &str) -> Level {
        self.levels.get(key).copied().unwrap_or_default()
    }

    /// Simple-name match against the ignored-exception list; entries may be
    /// written qualified or unqualified.
    pub fn is_ignored_exception(&self, exception: &str) -> bool {
        let simple = exception.rsplit('.').next().unwrap_or(exception);
        self.ignored_exceptions.contains(exception) || self.ignored_exceptions.contains(simple)
    }

    /// True iff declarations of `type_name` are exempt from owning-field
    /// checking.
    pub fn skips_uses_of(&self, type_name: &str) -> bool {
        self.skip_uses.iter().any(|t| t == type_name)
    }
}

/// Default file name for configuration that `leakcheck` searches for.
pub const DEFAULT_CONFIG_FILE_NAME: &str = "leakcheck.toml";

/// Walk up from `start_dir` to find the nearest `leakcheck.toml`, if any.
#[must_use]
pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut cur = Some(start_dir);
    while let Some(dir) = cur {
        let candidate = dir.join(DEFAULT_CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        cur = dir.parent();
    }
    None
}

/// Load and parse a configuration file from disk.
#[must_use = "configuration may contain important settings"]
pub fn load_config_file(path: &Path) -> anyhow::Result<LeakCheckConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let cfg: LeakCheckConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(cfg)
}

/// Load configuration from an explicit path or by searching from `start_dir`.
#[must_use = "configuration may contain important settings"]
pub fn load_config(
    explicit_path: Option<&Path>,
    start_dir: &Path,
) -> anyhow::Result<Option<(PathBuf, LeakCheckConfig)>> {
    if let Some(p) = explicit_path {
        let cfg = load_config_file(p)?;
        return Ok(Some((p.to_path_buf(), cfg)));
    }

    let Some(p) = find_config_file(start_dir) else {
        return Ok(None);
    };
    let cfg = load_config_file(&p)?;
    Ok(Some((p, cfg)))
}
