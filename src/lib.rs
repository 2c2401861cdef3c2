//! Static resource-leak / must-call consistency checker core.
//!
//! Given an already-typed program representation ([`hir::Program`]) with
//! per-method control-flow graphs ([`cfg::Cfg`]), the engine checks that
//! every value carrying a must-call obligation has that obligation
//! discharged on every control-flow path, exceptional ones included, and
//! that ownership annotations are well-formed across declarations and
//! overrides.
//!
//! The engine produces [`diagnostics::Diagnostic`] values; rendering them is
//! the embedder's job.

pub mod annotations;
pub mod cfg;
pub mod config;
pub mod consistency;
pub mod decl_check;
pub mod diagnostics;
pub mod error;
pub mod hir;
pub mod level;
pub mod obligation;
pub mod telemetry;

use crate::annotations::AnnotationOracle;
use crate::config::Options;
use crate::consistency::ConsistencyAnalyzer;
use crate::decl_check::DeclChecker;
use crate::diagnostics::{CheckKind, Diagnostic, TYPE_SYSTEM_ERROR};
use crate::error::Result;
use crate::hir::Program;
use crate::level::Level;

/// Engine orchestrating the two checker phases: declaration checks for every
/// class, then per-body consistency analysis.
pub struct CheckEngine {
    options: Options,
}

impl Default for CheckEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckEngine {
    pub fn new() -> Self {
        Self {
            options: Options::default(),
        }
    }

    pub fn with_options(options: Options) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Check a whole program.
    ///
    /// The two phases are independent: a finding in one never suppresses the
    /// other. Each method analysis is a transactional unit; an internal
    /// invariant failure discards that method's partial state, surfaces as a
    /// `type.system.error` diagnostic, and the remaining methods still run.
    pub fn check_program(&self, program: &Program) -> Result<Vec<Diagnostic>> {
        let oracle = AnnotationOracle::new(program);
        let mut out = Vec::new();

        let decl_checker = DeclChecker::new(&oracle, &self.options);
        for class in program.classes() {
            out.extend(decl_checker.check_class(class));
        }

        for class in program.classes() {
            for method in &class.methods {
                let span = tracing::info_span!(
                    "consistency",
                    method = %Program::method_path(class, method)
                );
                let _guard = span.enter();
                let analyzer = ConsistencyAnalyzer::new(&oracle, &self.options, class, method);
                match analyzer.analyze() {
                    Ok(diagnostics) => out.extend(diagnostics),
                    Err(err) if err.is_internal() => {
                        out.push(
                            Diagnostic::new(
                                &TYPE_SYSTEM_ERROR,
                                Program::method_path(class, method),
                                err.to_string(),
                            )
                            .with_help("this is a bug in annotations or the framework, not in the analyzed code"),
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(self.apply_levels(out))
    }

    /// Apply configured severities. `allow` drops a finding; internal
    /// findings are always errors and cannot be configured away.
    fn apply_levels(&self, diagnostics: Vec<Diagnostic>) -> Vec<Diagnostic> {
        diagnostics
            .into_iter()
            .filter_map(|mut d| {
                if d.check.kind == CheckKind::Internal {
                    d.level = Level::Error;
                    return Some(d);
                }
                match self.options.level_for(d.check.key) {
                    Level::Allow => None,
                    level => {
                        d.level = level;
                        Some(d)
                    }
                }
            })
            .collect()
    }
}

/// Engine with default options.
pub fn create_default_engine() -> CheckEngine {
    CheckEngine::new()
}
