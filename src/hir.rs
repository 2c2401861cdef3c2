//! The already-typed program representation consumed by the checker.
//!
//! Parsing and symbol resolution happen upstream; this module is the shape
//! of their output. Everything is plain data with builder-style
//! constructors, so drivers and tests can assemble programs directly.
//!
//! Annotations arrive as abstract facts attached to elements, not as syntax.
//! Repeatable annotation forms are modeled by repeating the fact; the
//! original list-wrapper forms are flattened away before the facts get here.

use crate::cfg::Cfg;

/// A reference to a type by name. Types not declared in the [`Program`] are
/// external; the annotation oracle decides what their must-call set is.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeRef {
    pub name: String,
}

impl TypeRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl From<&str> for TypeRef {
    fn from(name: &str) -> Self {
        TypeRef::new(name)
    }
}

impl From<String> for TypeRef {
    fn from(name: String) -> Self {
        TypeRef::new(name)
    }
}

/// An annotation fact attached to a program element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationFact {
    /// Methods that must be called on any instance before it is dropped.
    /// Attached to type declarations.
    MustCall(Vec<String>),
    /// The holder of this location is responsible for discharging the
    /// value's must-call set. Attached to fields and parameters.
    Owning,
    /// The return value stays owned by the callee's side; callers are
    /// borrowers. Attached to methods.
    NotOwning,
    /// On normal return, `methods` have been called on each of
    /// `expressions`. Expressions are verbatim; `this` binding happens at
    /// the use site.
    EnsuresCalledMethods {
        expressions: Vec<String>,
        methods: Vec<String>,
    },
    /// On exceptional exit, `methods` have been called on each of
    /// `expressions`.
    EnsuresCalledMethodsOnException {
        expressions: Vec<String>,
        methods: Vec<String>,
    },
    /// On entry, `methods` must already have been called on each of
    /// `expressions`.
    RequiresCalledMethods {
        expressions: Vec<String>,
        methods: Vec<String>,
    },
    /// Calling this method reinstates the full must-call set of `target`
    /// (default: the receiver).
    CreatesMustCallFor { target: Option<String> },
}

/// A field declaration.
#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: String,
    pub ty: TypeRef,
    pub is_static: bool,
    pub is_final: bool,
    pub annotations: Vec<AnnotationFact>,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, ty: impl Into<TypeRef>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            is_static: false,
            is_final: false,
            annotations: Vec::new(),
        }
    }

    #[must_use]
    pub fn owning(mut self) -> Self {
        self.annotations.push(AnnotationFact::Owning);
        self
    }

    #[must_use]
    pub fn static_(mut self) -> Self {
        self.is_static = true;
        self
    }

    #[must_use]
    pub fn final_(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// A formal parameter.
#[derive(Debug, Clone)]
pub struct ParamDecl {
    pub name: String,
    pub ty: TypeRef,
    pub annotations: Vec<AnnotationFact>,
}

impl ParamDecl {
    pub fn new(name: impl Into<String>, ty: impl Into<TypeRef>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            annotations: Vec::new(),
        }
    }

    #[must_use]
    pub fn owning(mut self) -> Self {
        self.annotations.push(AnnotationFact::Owning);
        self
    }
}

/// A method or constructor declaration, optionally carrying a body.
#[derive(Debug, Clone)]
pub struct MethodDecl {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub return_ty: Option<TypeRef>,
    pub is_constructor: bool,
    pub annotations: Vec<AnnotationFact>,
    pub body: Option<Cfg>,
}

impl MethodDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            return_ty: None,
            is_constructor: false,
            annotations: Vec::new(),
            body: None,
        }
    }

    /// A constructor for the enclosing class. The name is only used in
    /// element paths.
    pub fn constructor() -> Self {
        let mut m = Self::new("<init>");
        m.is_constructor = true;
        m
    }

    #[must_use]
    pub fn param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    #[must_use]
    pub fn returns(mut self, ty: impl Into<TypeRef>) -> Self {
        self.return_ty = Some(ty.into());
        self
    }

    #[must_use]
    pub fn not_owning_return(mut self) -> Self {
        self.annotations.push(AnnotationFact::NotOwning);
        self
    }

    #[must_use]
    pub fn ensures_called_methods(
        mut self,
        expressions: impl IntoIterator<Item = impl Into<String>>,
        methods: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.annotations.push(AnnotationFact::EnsuresCalledMethods {
            expressions: expressions.into_iter().map(Into::into).collect(),
            methods: methods.into_iter().map(Into::into).collect(),
        });
        self
    }

    #[must_use]
    pub fn ensures_called_methods_on_exception(
        mut self,
        expressions: impl IntoIterator<Item = impl Into<String>>,
        methods: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.annotations
            .push(AnnotationFact::EnsuresCalledMethodsOnException {
                expressions: expressions.into_iter().map(Into::into).collect(),
                methods: methods.into_iter().map(Into::into).collect(),
            });
        self
    }

    #[must_use]
    pub fn requires_called_methods(
        mut self,
        expressions: impl IntoIterator<Item = impl Into<String>>,
        methods: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.annotations
            .push(AnnotationFact::RequiresCalledMethods {
                expressions: expressions.into_iter().map(Into::into).collect(),
                methods: methods.into_iter().map(Into::into).collect(),
            });
        self
    }

    /// Attach a creates-must-call effect. `None` is the written-bare form,
    /// which defaults to the receiver.
    #[must_use]
    pub fn creates_must_call_for(mut self, target: Option<&str>) -> Self {
        self.annotations.push(AnnotationFact::CreatesMustCallFor {
            target: target.map(str::to_string),
        });
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Cfg) -> Self {
        self.body = Some(body);
        self
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// A class declaration with name-based superclass linkage.
#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: String,
    pub superclass: Option<String>,
    pub annotations: Vec<AnnotationFact>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<MethodDecl>,
}

impl ClassDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    #[must_use]
    pub fn extends(mut self, superclass: impl Into<String>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    #[must_use]
    pub fn must_call(mut self, methods: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.annotations.push(AnnotationFact::MustCall(
            methods.into_iter().map(Into::into).collect(),
        ));
        self
    }

    #[must_use]
    pub fn field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn method(mut self, method: MethodDecl) -> Self {
        self.methods.push(method);
        self
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn find_method(&self, name: &str) -> Option<&MethodDecl> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// A whole compilation unit: the set of classes under analysis.
#[derive(Debug, Clone, Default)]
pub struct Program {
    classes: Vec<ClassDecl>,
}

impl Program {
    pub fn new(classes: impl IntoIterator<Item = ClassDecl>) -> Self {
        Self {
            classes: classes.into_iter().collect(),
        }
    }

    pub fn classes(&self) -> &[ClassDecl] {
        &self.classes
    }

    pub fn class(&self, name: &str) -> Option<&ClassDecl> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Methods this one overrides, walking the superclass chain. A method
    /// overrides the nearest superclass method with the same name and arity;
    /// the walk continues past it so every transitively overridden
    /// declaration is checked.
    pub fn overridden_methods<'p>(
        &'p self,
        class: &ClassDecl,
        method: &MethodDecl,
    ) -> Vec<(&'p ClassDecl, &'p MethodDecl)> {
        let mut found = Vec::new();
        if method.is_constructor {
            return found;
        }
        let mut current = class.superclass.as_deref();
        // Name-based superclass links can be cyclic in malformed input.
        let mut fuel = self.classes.len() + 1;
        while let Some(name) = current {
            if fuel == 0 {
                break;
            }
            fuel -= 1;
            let Some(ancestor) = self.class(name) else {
                break;
            };
            if let Some(overridden) = ancestor
                .methods
                .iter()
                .find(|m| m.name == method.name && m.arity() == method.arity())
            {
                found.push((ancestor, overridden));
            }
            current = ancestor.superclass.as_deref();
        }
        found
    }

    /// `Class#method` element path used in diagnostics.
    pub fn method_path(class: &ClassDecl, method: &MethodDecl) -> String {
        format!("{}#{}", class.name, method.name)
    }

    /// `Class.field` element path used in diagnostics.
    pub fn field_path(class: &ClassDecl, field: &FieldDecl) -> String {
        format!("{}.{}", class.name, field.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_resolution_walks_superclass_chain() {
        let program = Program::new([
            ClassDecl::new("A").method(MethodDecl::new("close")),
            ClassDecl::new("B")
                .extends("A")
                .method(MethodDecl::new("close")),
            ClassDecl::new("C")
                .extends("B")
                .method(MethodDecl::new("close"))
                .method(MethodDecl::new("open")),
        ]);

        let c = program.class("C").unwrap();
        let close = c.find_method("close").unwrap();
        let overridden = program.overridden_methods(c, close);
        let names: Vec<_> = overridden.iter().map(|(cls, _)| cls.name.as_str()).collect();
        assert_eq!(names, ["B", "A"]);

        let open = c.find_method("open").unwrap();
        assert!(program.overridden_methods(c, open).is_empty());
    }

    #[test]
    fn override_resolution_requires_matching_arity() {
        let program = Program::new([
            ClassDecl::new("A")
                .method(MethodDecl::new("write").param(ParamDecl::new("b", "Buffer"))),
            ClassDecl::new("B").extends("A").method(MethodDecl::new("write")),
        ]);
        let b = program.class("B").unwrap();
        let write = b.find_method("write").unwrap();
        assert!(program.overridden_methods(b, write).is_empty());
    }

    #[test]
    fn override_resolution_tolerates_superclass_cycles() {
        let program = Program::new([
            ClassDecl::new("A").extends("B").method(MethodDecl::new("m")),
            ClassDecl::new("B").extends("A").method(MethodDecl::new("m")),
        ]);
        let a = program.class("A").unwrap();
        let m = a.find_method("m").unwrap();
        // Terminates and reports the one genuine ancestor before cycling.
        let overridden = program.overridden_methods(a, m);
        assert!(!overridden.is_empty());
    }
}
