//! Centralized interpretation of annotation facts.
//!
//! The oracle answers pure queries against program elements: must-call sets
//! of types, owning marks on locations, ensures/requires postconditions, and
//! creates-must-call effects. Expression strings are returned verbatim;
//! viewpoint adaptation (binding `this`, parameter names, and `#N` indices
//! to call-site expressions) is the caller's duty.
//!
//! Type queries can recurse through superclass links, which name-based
//! linkage allows to be cyclic; they are therefore memoized by type name
//! with an in-progress marker, never answered reentrantly.

use crate::hir::{AnnotationFact, ClassDecl, FieldDecl, MethodDecl, ParamDecl, Program, TypeRef};
use crate::obligation::{ExitKind, PostconditionFact, PreconditionFact};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

/// Built-in types whose must-call set is empty irrespective of annotation:
/// boxed primitives, strings, and the immutable collection wrappers. This is
/// the single place the allowlist is enumerated.
pub const IMMUTABLE_TYPES: &[&str] = &[
    "Boolean",
    "Byte",
    "Character",
    "Short",
    "Integer",
    "Long",
    "Float",
    "Double",
    "Void",
    "String",
    "CharSequence",
    "BigInteger",
    "BigDecimal",
    "ImmutableList",
    "ImmutableSet",
    "ImmutableMap",
];

/// The must-call set of a type. The lattice orders sets by superset; the
/// empty set (no obligation) is the bottom of interest and `Unknown` is top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MustCallSet {
    /// Nothing is known about the type: it is external and not on the
    /// immutable allowlist.
    Unknown,
    Methods(BTreeSet<String>),
}

impl MustCallSet {
    pub fn empty() -> Self {
        MustCallSet::Methods(BTreeSet::new())
    }

    pub fn of(methods: impl IntoIterator<Item = impl Into<String>>) -> Self {
        MustCallSet::Methods(methods.into_iter().map(Into::into).collect())
    }

    /// The enumerable methods, when the set is known.
    pub fn known(&self) -> Option<&BTreeSet<String>> {
        match self {
            MustCallSet::Unknown => None,
            MustCallSet::Methods(m) => Some(m),
        }
    }

    /// True iff the set is known and non-empty. `Unknown` has no enumerable
    /// obligations, so it answers false.
    pub fn has_obligations(&self) -> bool {
        matches!(self, MustCallSet::Methods(m) if !m.is_empty())
    }
}

/// Pure annotation queries against a [`Program`].
pub struct AnnotationOracle<'p> {
    program: &'p Program,
    /// Memo for type queries. `None` marks a computation in progress; a
    /// reentrant query for the same type answers `Unknown` instead of
    /// recursing.
    must_call_memo: RefCell<HashMap<String, Option<MustCallSet>>>,
}

impl<'p> AnnotationOracle<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            must_call_memo: RefCell::new(HashMap::new()),
        }
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    /// The must-call set of a type.
    ///
    /// A class without its own `MustCall` fact inherits its superclass's
    /// set; a declared class with neither has the empty set. Undeclared
    /// types are `Unknown`, except the immutable allowlist.
    pub fn must_call_of(&self, ty: &TypeRef) -> MustCallSet {
        if let Some(entry) = self.must_call_memo.borrow().get(&ty.name) {
            return entry.clone().unwrap_or(MustCallSet::Unknown);
        }
        self.must_call_memo
            .borrow_mut()
            .insert(ty.name.clone(), None);
        let result = self.compute_must_call(&ty.name);
        self.must_call_memo
            .borrow_mut()
            .insert(ty.name.clone(), Some(result.clone()));
        result
    }

    fn compute_must_call(&self, name: &str) -> MustCallSet {
        if IMMUTABLE_TYPES.contains(&name) {
            return MustCallSet::empty();
        }
        let Some(class) = self.program.class(name) else {
            return MustCallSet::Unknown;
        };
        if let Some(methods) = declared_must_call(class) {
            return MustCallSet::of(methods.iter().cloned());
        }
        match &class.superclass {
            Some(superclass) => self.must_call_of(&TypeRef::new(superclass.clone())),
            None => MustCallSet::empty(),
        }
    }

    /// The `MustCall` fact written directly on a class, if any. Callers that
    /// need to distinguish "no annotation" from "empty annotation" (the
    /// owning-field check does, for its message variants) use this instead
    /// of [`Self::must_call_of`].
    pub fn declared_must_call_of(&self, class: &ClassDecl) -> Option<Vec<String>> {
        declared_must_call(class).cloned()
    }

    pub fn owning_field(&self, field: &FieldDecl) -> bool {
        has_owning(&field.annotations)
    }

    pub fn owning_param(&self, param: &ParamDecl) -> bool {
        has_owning(&param.annotations)
    }

    pub fn not_owning_return(&self, method: &MethodDecl) -> bool {
        method
            .annotations
            .iter()
            .any(|a| matches!(a, AnnotationFact::NotOwning))
    }

    /// Whether callers take responsibility for the returned value. Returns
    /// are owning unless marked otherwise; a constructor result always is.
    pub fn owning_return(&self, method: &MethodDecl) -> bool {
        method.is_constructor || !self.not_owning_return(method)
    }

    /// All called-methods postconditions of a method, both exit kinds,
    /// flattened to one fact per expression list.
    pub fn ensures_called_methods(&self, method: &MethodDecl) -> Vec<PostconditionFact> {
        let mut facts = Vec::new();
        for annotation in &method.annotations {
            match annotation {
                AnnotationFact::EnsuresCalledMethods {
                    expressions,
                    methods,
                } => {
                    for expression in expressions {
                        facts.push(PostconditionFact {
                            expression: expression.clone(),
                            methods: methods.clone(),
                            exit_kind: ExitKind::NormalReturn,
                        });
                    }
                }
                AnnotationFact::EnsuresCalledMethodsOnException {
                    expressions,
                    methods,
                } => {
                    for expression in expressions {
                        facts.push(PostconditionFact {
                            expression: expression.clone(),
                            methods: methods.clone(),
                            exit_kind: ExitKind::ExceptionalExit,
                        });
                    }
                }
                _ => {}
            }
        }
        facts
    }

    /// All called-methods preconditions of a method.
    pub fn requires_called_methods(&self, method: &MethodDecl) -> Vec<PreconditionFact> {
        let mut facts = Vec::new();
        for annotation in &method.annotations {
            if let AnnotationFact::RequiresCalledMethods {
                expressions,
                methods,
            } = annotation
            {
                for expression in expressions {
                    facts.push(PreconditionFact {
                        expression: expression.clone(),
                        methods: methods.clone(),
                    });
                }
            }
        }
        facts
    }

    /// Target expressions of the method's creates-must-call effects. A fact
    /// written without an explicit target defaults to `"this"`. Empty iff
    /// the method carries no such fact.
    pub fn creates_must_call_for(&self, method: &MethodDecl) -> Vec<String> {
        method
            .annotations
            .iter()
            .filter_map(|a| match a {
                AnnotationFact::CreatesMustCallFor { target } => {
                    Some(target.clone().unwrap_or_else(|| "this".to_string()))
                }
                _ => None,
            })
            .collect()
    }
}

fn declared_must_call(class: &ClassDecl) -> Option<&Vec<String>> {
    class.annotations.iter().find_map(|a| match a {
        AnnotationFact::MustCall(methods) => Some(methods),
        _ => None,
    })
}

fn has_owning(annotations: &[AnnotationFact]) -> bool {
    annotations.iter().any(|a| matches!(a, AnnotationFact::Owning))
}
