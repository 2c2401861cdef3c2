//! Declaration-level checks: owning-field validity and behavioral subtyping
//! for ownership annotations.
//!
//! Everything here is syntactic over declarations; no bodies are inspected.
//! Each check is independent and reports through the shared descriptor
//! table, so one violation never masks another.

use crate::annotations::AnnotationOracle;
use crate::config::Options;
use crate::diagnostics::{
    CREATES_MUSTCALL_FOR_INVALID_TARGET, CREATES_MUSTCALL_FOR_OVERRIDE_INVALID, Diagnostic,
    OWNING_OVERRIDE_PARAM, OWNING_OVERRIDE_RETURN, REQUIRED_METHOD_NOT_CALLED,
};
use crate::hir::{ClassDecl, FieldDecl, MethodDecl, Program, TypeRef};
use crate::obligation::{ExitKind, canonicalize};
use std::collections::BTreeSet;
use tracing::debug;

/// Checks the rules for owning fields and for override compatibility of
/// ownership and creates-must-call annotations.
pub struct DeclChecker<'p> {
    oracle: &'p AnnotationOracle<'p>,
    options: &'p Options,
}

impl<'p> DeclChecker<'p> {
    pub fn new(oracle: &'p AnnotationOracle<'p>, options: &'p Options) -> Self {
        Self { oracle, options }
    }

    /// Run all declaration checks for one class.
    pub fn check_class(&self, class: &ClassDecl) -> Vec<Diagnostic> {
        debug!(class = %class.name, "declaration checks");
        let mut out = Vec::new();

        for field in &class.fields {
            if !self.options.no_lightweight_ownership && self.oracle.owning_field(field) {
                self.check_owning_field(class, field, &mut out);
            }
        }

        for method in &class.methods {
            let cmcf_targets = self.oracle.creates_must_call_for(method);
            self.check_cmcf_overrides(class, method, &cmcf_targets, &mut out);
            if !cmcf_targets.is_empty() {
                self.check_cmcf_targets(class, method, &cmcf_targets, &mut out);
            }
            self.check_owning_overrides(class, method, &mut out);
        }

        out
    }

    /// Validity of a field `f` declared owning with must-call set `M`: the
    /// enclosing type must itself have a non-empty must-call set, and for
    /// every exit kind and every `m` in `M`, some destructor method of the
    /// enclosing type must carry a postcondition for that exit kind naming
    /// `f` and listing `m`.
    fn check_owning_field(&self, class: &ClassDecl, field: &FieldDecl, out: &mut Vec<Diagnostic>) {
        if self.options.skips_uses_of(&field.ty.name) {
            return;
        }
        if field.is_static {
            if self.options.permit_static_owning {
                return;
            }
            // A final static field is initialized once; its leak is a
            // program-lifetime matter deliberately delegated to the user.
            if field.is_final {
                return;
            }
        }

        let Some(field_must_call) = self
            .oracle
            .must_call_of(&field.ty)
            .known()
            .filter(|m| !m.is_empty())
            .cloned()
        else {
            return;
        };

        let mut unsatisfied: BTreeSet<(String, ExitKind)> = field_must_call
            .iter()
            .flat_map(|m| ExitKind::ALL.map(|kind| (m.clone(), kind)))
            .collect();

        let enclosing_must_call = self.enclosing_must_call(class);
        let failure: String = match &enclosing_must_call {
            None => format!(
                "the enclosing type {} doesn't have a must-call annotation",
                class.name
            ),
            Some(values) if values.is_empty() => format!(
                "the enclosing type {} has an empty must-call annotation",
                class.name
            ),
            Some(values) => {
                'scan: for sibling in &class.methods {
                    if !values.contains(&sibling.name) {
                        continue;
                    }
                    for fact in self.oracle.ensures_called_methods(sibling) {
                        if !self.expression_matches_field(&fact.expression, field) {
                            continue;
                        }
                        for method in &fact.methods {
                            unsatisfied.remove(&(method.clone(), fact.exit_kind));
                        }
                        if unsatisfied.is_empty() {
                            break 'scan;
                        }
                    }
                }
                format!(
                    "postconditions written on must-call methods of {} are missing",
                    class.name
                )
            }
        };

        if unsatisfied.is_empty() {
            return;
        }

        out.push(
            Diagnostic::new(
                &REQUIRED_METHOD_NOT_CALLED,
                Program::field_path(class, field),
                format!(
                    "owning field {} of type {} may leak: {}",
                    field.name, field.ty.name, failure
                ),
            )
            .with_help(format!(
                "add {}",
                format_missing_postconditions(field, &unsatisfied)
            )),
        );
    }

    /// The must-call values of the enclosing type, distinguishing "no
    /// annotation" (`None`) from "empty annotation". An inherited set counts
    /// as declared.
    fn enclosing_must_call(&self, class: &ClassDecl) -> Option<BTreeSet<String>> {
        if let Some(declared) = self.oracle.declared_must_call_of(class) {
            return Some(declared.into_iter().collect());
        }
        self.oracle
            .must_call_of(&TypeRef::new(class.name.clone()))
            .known()
            .filter(|m| !m.is_empty())
            .cloned()
    }

    /// Whether a postcondition expression names this field.
    ///
    /// The default is a substring match on the simple name, which
    /// over-accepts (`resource` also matches `resourceCopy`).
    /// TODO: drop the substring form once strict_field_matching has been
    /// the default for a release.
    fn expression_matches_field(&self, expression: &str, field: &FieldDecl) -> bool {
        if self.options.strict_field_matching {
            canonicalize(expression) == field.name
        } else {
            expression.contains(&field.name)
        }
    }

    /// Behavioral subtyping for ownership marks: an owning parameter stays
    /// owning in overriders, and a not-owning return stays not-owning.
    fn check_owning_overrides(
        &self,
        class: &ClassDecl,
        method: &MethodDecl,
        out: &mut Vec<Diagnostic>,
    ) {
        for (ancestor, overridden) in self.oracle.program().overridden_methods(class, method) {
            // Indexed loop: overrider and overridden have equal arity, and
            // the rule is positional.
            for i in 0..overridden.params.len() {
                if self.oracle.owning_param(&overridden.params[i])
                    && !self.oracle.owning_param(&method.params[i])
                {
                    out.push(Diagnostic::new(
                        &OWNING_OVERRIDE_PARAM,
                        Program::method_path(class, method),
                        format!(
                            "parameter {} of {} must be owning to override {}",
                            method.params[i].name,
                            Program::method_path(class, method),
                            Program::method_path(ancestor, overridden),
                        ),
                    ));
                }
            }

            if self.oracle.not_owning_return(overridden) && !self.oracle.not_owning_return(method) {
                out.push(Diagnostic::new(
                    &OWNING_OVERRIDE_RETURN,
                    Program::method_path(class, method),
                    format!(
                        "return of {} must be not-owning to override {}",
                        Program::method_path(class, method),
                        Program::method_path(ancestor, overridden),
                    ),
                ));
            }
        }
    }

    /// An overrider must create at least the must-call obligations its
    /// overridden method creates; otherwise dynamic dispatch would let the
    /// override silently drop an effect the caller relies on.
    fn check_cmcf_overrides(
        &self,
        class: &ClassDecl,
        method: &MethodDecl,
        cmcf_targets: &[String],
        out: &mut Vec<Diagnostic>,
    ) {
        let own: BTreeSet<String> = cmcf_targets.iter().map(|t| canonicalize(t)).collect();
        for (ancestor, overridden) in self.oracle.program().overridden_methods(class, method) {
            let inherited: BTreeSet<String> = self
                .oracle
                .creates_must_call_for(overridden)
                .iter()
                .map(|t| canonicalize(t))
                .collect();
            if !inherited.is_subset(&own) {
                let missing: Vec<_> = inherited.difference(&own).cloned().collect();
                out.push(Diagnostic::new(
                    &CREATES_MUSTCALL_FOR_OVERRIDE_INVALID,
                    Program::method_path(class, method),
                    format!(
                        "{} creates must-call obligations for [{}] but its override {} does not create them for [{}]",
                        Program::method_path(ancestor, overridden),
                        inherited.iter().cloned().collect::<Vec<_>>().join(", "),
                        Program::method_path(class, method),
                        missing.join(", "),
                    ),
                ));
            }
        }
    }

    /// Every creates-must-call target must resolve, at the declaration, to a
    /// value whose type has a non-empty must-call set; reinstating nothing
    /// is an annotation bug.
    fn check_cmcf_targets(
        &self,
        class: &ClassDecl,
        method: &MethodDecl,
        cmcf_targets: &[String],
        out: &mut Vec<Diagnostic>,
    ) {
        for target in cmcf_targets {
            let resolved = self.resolve_target_type(class, method, target);
            let valid = resolved
                .as_ref()
                .is_some_and(|ty| self.oracle.must_call_of(ty).has_obligations());
            if !valid {
                let described = resolved
                    .map(|ty| ty.name)
                    .unwrap_or_else(|| "<unresolved>".to_string());
                out.push(Diagnostic::new(
                    &CREATES_MUSTCALL_FOR_INVALID_TARGET,
                    Program::method_path(class, method),
                    format!(
                        "creates-must-call target {target} (of type {described}) has no must-call obligation"
                    ),
                ));
            }
        }
    }

    /// Declared type of a target expression at the declaration site:
    /// `this`, a field of the enclosing type, a parameter by name, or a
    /// parameter by `#N` index.
    fn resolve_target_type(
        &self,
        class: &ClassDecl,
        method: &MethodDecl,
        target: &str,
    ) -> Option<TypeRef> {
        let canonical = canonicalize(target);
        if canonical == "this" {
            return Some(TypeRef::new(class.name.clone()));
        }
        if let Some(index) = canonical.strip_prefix('#') {
            let index: usize = index.parse().ok()?;
            return method.params.get(index.checked_sub(1)?).map(|p| p.ty.clone());
        }
        if let Some(param) = method.params.iter().find(|p| p.name == canonical) {
            return Some(param.ty.clone());
        }
        self.find_field(class, &canonical).map(|f| f.ty.clone())
    }

    fn find_field<'c>(&self, class: &'c ClassDecl, name: &str) -> Option<&'c FieldDecl>
    where
        'p: 'c,
    {
        if let Some(field) = class.find_field(name) {
            return Some(field);
        }
        let mut current = class.superclass.as_deref();
        let mut fuel = self.oracle.program().classes().len() + 1;
        while let Some(superclass) = current {
            if fuel == 0 {
                break;
            }
            fuel -= 1;
            let ancestor = self.oracle.program().class(superclass)?;
            if let Some(field) = ancestor.find_field(name) {
                return Some(field);
            }
            current = ancestor.superclass.as_deref();
        }
        None
    }
}

/// Render the missing `(method, exit-kind)` pairs as the postcondition
/// annotations that would satisfy them.
fn format_missing_postconditions(
    field: &FieldDecl,
    unsatisfied: &BTreeSet<(String, ExitKind)>,
) -> String {
    unsatisfied
        .iter()
        .map(|(method, kind)| {
            format!(
                "{}(value = \"{}\", methods = \"{}\")",
                kind.postcondition_annotation(),
                field.name,
                method
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}
