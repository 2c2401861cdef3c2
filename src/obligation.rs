//! Value datatypes shared by the declaration checker and the consistency
//! analyzer: exit kinds, obligations, postcondition facts, and the alias-set
//! representation of a tracked resource.

use crate::cfg::ProgramPoint;
use crate::error::Result;
use crate::invariant_ensure;
use std::collections::BTreeSet;
use std::fmt;

/// How a method can leave. Postconditions and pending obligations are
/// indexed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExitKind {
    NormalReturn,
    ExceptionalExit,
}

impl ExitKind {
    pub const ALL: [ExitKind; 2] = [ExitKind::NormalReturn, ExitKind::ExceptionalExit];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::NormalReturn => "normal return",
            ExitKind::ExceptionalExit => "exceptional exit",
        }
    }

    /// The postcondition annotation that covers this exit kind, for
    /// suggestions in diagnostics.
    pub fn postcondition_annotation(&self) -> &'static str {
        match self {
            ExitKind::NormalReturn => "@EnsuresCalledMethods",
            ExitKind::ExceptionalExit => "@EnsuresCalledMethodsOnException",
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical form of an expression string: surrounding whitespace trimmed
/// and one implicit `this.` prefix stripped, so `this.resource` and
/// `resource` compare equal. The receiver itself stays `this`.
pub fn canonicalize(expression: &str) -> String {
    let trimmed = expression.trim();
    match trimmed.strip_prefix("this.") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => trimmed.to_string(),
    }
}

/// A pending must-call fact: on paths exiting with `exit_kind`, `method`
/// must have been invoked on `expression`. Equality is structural;
/// expressions are compared after canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Obligation {
    pub expression: String,
    pub method: String,
    pub exit_kind: ExitKind,
}

impl Obligation {
    pub fn new(expression: &str, method: impl Into<String>, exit_kind: ExitKind) -> Self {
        Self {
            expression: canonicalize(expression),
            method: method.into(),
            exit_kind,
        }
    }
}

/// A postcondition fact: after exiting with `exit_kind`, `methods` have been
/// called on `expression`. Expression strings are verbatim (unadapted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostconditionFact {
    pub expression: String,
    pub methods: Vec<String>,
    pub exit_kind: ExitKind,
}

/// A precondition fact: on entry, `methods` must already have been called on
/// `expression`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionFact {
    pub expression: String,
    pub methods: Vec<String>,
}

/// Where a tracked resource came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Provenance {
    Parameter,
    Allocation,
    FieldRead,
    MethodResult,
}

/// An alias set: the analyzer's unit of tracking. All member expressions
/// refer to the same underlying resource; no expression belongs to two sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Canonicalized member expressions.
    pub aliases: BTreeSet<String>,
    /// The must-call set of the underlying value.
    pub must_call: BTreeSet<String>,
    /// Methods observed called on some member, on the current path.
    pub called: BTreeSet<String>,
    /// Whether this procedure is responsible for discharging `must_call`.
    pub owning: bool,
    pub provenance: Provenance,
    /// Exit kinds on which this resource still owes its obligations.
    pub exit_kinds: BTreeSet<ExitKind>,
    /// Where the resource was born, for leak reporting.
    pub origin: ProgramPoint,
    /// The owning field of `this` the resource was stored into, if any.
    /// Only meaningful inside constructors, where the half-built receiver
    /// makes such stores leak on exceptional exit.
    pub stored_in_field: Option<String>,
}

impl Resource {
    pub fn new(
        alias: &str,
        must_call: impl IntoIterator<Item = impl Into<String>>,
        owning: bool,
        provenance: Provenance,
        origin: ProgramPoint,
    ) -> Self {
        let mut aliases = BTreeSet::new();
        aliases.insert(canonicalize(alias));
        Self {
            aliases,
            must_call: must_call.into_iter().map(Into::into).collect(),
            called: BTreeSet::new(),
            owning,
            provenance,
            exit_kinds: ExitKind::ALL.into_iter().collect(),
            origin,
            stored_in_field: None,
        }
    }

    pub fn contains_alias(&self, canonical: &str) -> bool {
        self.aliases.contains(canonical)
    }

    pub fn add_alias(&mut self, expression: &str) {
        self.aliases.insert(canonicalize(expression));
    }

    pub fn remove_alias(&mut self, canonical: &str) {
        self.aliases.remove(canonical);
    }

    /// The methods still owed on `kind`: `must_call \ called`, or nothing if
    /// the resource no longer owes on that exit kind.
    pub fn pending(&self, kind: ExitKind) -> BTreeSet<String> {
        if !self.exit_kinds.contains(&kind) || !self.owning {
            return BTreeSet::new();
        }
        self.must_call.difference(&self.called).cloned().collect()
    }

    /// True iff every must-call method has been observed.
    pub fn is_discharged(&self) -> bool {
        self.must_call.is_subset(&self.called)
    }

    /// Drop all obligations: ownership moved elsewhere.
    pub fn transfer(&mut self) {
        self.owning = false;
        self.exit_kinds.clear();
    }

    /// Reinstate the full must-call set, as a creates-must-call effect does.
    pub fn reinstate(&mut self) {
        self.called.clear();
        self.owning = true;
        self.exit_kinds = ExitKind::ALL.into_iter().collect();
    }

    /// Join with the state of the same resource on another predecessor.
    ///
    /// Pending obligations take the union, so the called-set takes the
    /// intersection. Two sets for the same resource can only disagree on
    /// must-call contents if annotations are inconsistent; that is an
    /// internal error, not a user diagnostic.
    pub fn merge_with(&self, other: &Resource) -> Result<Resource> {
        invariant_ensure!(
            self.must_call == other.must_call,
            "alias sets for {:?} disagree on must-call set: {:?} vs {:?}",
            self.aliases,
            self.must_call,
            other.must_call
        );
        Ok(Resource {
            aliases: self.aliases.union(&other.aliases).cloned().collect(),
            must_call: self.must_call.clone(),
            called: self.called.intersection(&other.called).cloned().collect(),
            owning: self.owning || other.owning,
            provenance: self.provenance.min(other.provenance),
            exit_kinds: self.exit_kinds.union(&other.exit_kinds).cloned().collect(),
            origin: self.origin.min(other.origin),
            stored_in_field: self
                .stored_in_field
                .clone()
                .or_else(|| other.stored_in_field.clone()),
        })
    }
}
