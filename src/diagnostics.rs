//! Diagnostic value types and the static check descriptor table.
//!
//! Every finding the checker can produce is identified by a stable message
//! key (e.g. `required.method.not.called`). The table below is the single
//! source of truth for those keys; drivers render [`Diagnostic`]s however
//! they like (the crate itself never prints).

use crate::cfg::ProgramPoint;
use crate::level::Level;
use serde::Serialize;
use serde::ser::Serializer;

/// Which phase of the checker emits a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    /// Declaration-level checks: owning fields, override rules.
    Declaration,
    /// Flow-sensitive obligation consistency over a method body.
    Consistency,
    /// Internal invariant failure surfaced to the driver; not a user finding.
    Internal,
}

/// Static metadata describing one reportable check.
#[derive(Debug)]
pub struct CheckDescriptor {
    /// Stable message key, as consumed by downstream renderers.
    pub key: &'static str,
    pub kind: CheckKind,
    pub description: &'static str,
}

/// An unsatisfied must-call obligation: a local leak, a missing owning-field
/// destructor postcondition, or an unproven precondition.
pub static REQUIRED_METHOD_NOT_CALLED: CheckDescriptor = CheckDescriptor {
    key: "required.method.not.called",
    kind: CheckKind::Consistency,
    description: "a must-call obligation is not discharged on every path",
};

/// An overrider dropped an `Owning` mark from a parameter.
pub static OWNING_OVERRIDE_PARAM: CheckDescriptor = CheckDescriptor {
    key: "owning.override.param",
    kind: CheckKind::Declaration,
    description: "override removes an owning parameter annotation",
};

/// An overrider dropped a `NotOwning` mark from the return position.
pub static OWNING_OVERRIDE_RETURN: CheckDescriptor = CheckDescriptor {
    key: "owning.override.return",
    kind: CheckKind::Declaration,
    description: "override removes a not-owning return annotation",
};

/// An overrider narrowed the set of creates-must-call targets.
pub static CREATES_MUSTCALL_FOR_OVERRIDE_INVALID: CheckDescriptor = CheckDescriptor {
    key: "creates.mustcall.for.override.invalid",
    kind: CheckKind::Declaration,
    description: "override creates fewer must-call obligations than the overridden method",
};

/// A creates-must-call target resolves to a type with an empty must-call set.
pub static CREATES_MUSTCALL_FOR_INVALID_TARGET: CheckDescriptor = CheckDescriptor {
    key: "creates.mustcall.for.invalid.target",
    kind: CheckKind::Declaration,
    description: "creates-must-call target has no must-call obligation to reinstate",
};

/// Type-qualifier mismatch on an assignment. The consistency analyzer never
/// emits this itself; the key is reserved for the called-methods collaborator
/// so that both analyses share one key table.
pub static ASSIGNMENT: CheckDescriptor = CheckDescriptor {
    key: "assignment",
    kind: CheckKind::Consistency,
    description: "type qualifier mismatch on an assignment",
};

/// Internal invariant failure. The driver may abort on this kind.
pub static TYPE_SYSTEM_ERROR: CheckDescriptor = CheckDescriptor {
    key: "type.system.error",
    kind: CheckKind::Internal,
    description: "internal type-system invariant violated",
};

/// All descriptors, in reporting-priority order.
pub fn descriptors() -> &'static [&'static CheckDescriptor] {
    static DESCRIPTORS: &[&CheckDescriptor] = &[
        &REQUIRED_METHOD_NOT_CALLED,
        &OWNING_OVERRIDE_PARAM,
        &OWNING_OVERRIDE_RETURN,
        &CREATES_MUSTCALL_FOR_OVERRIDE_INVALID,
        &CREATES_MUSTCALL_FOR_INVALID_TARGET,
        &ASSIGNMENT,
        &TYPE_SYSTEM_ERROR,
    ];
    DESCRIPTORS
}

/// Look up a descriptor by its message key.
pub fn find_descriptor(key: &str) -> Option<&'static CheckDescriptor> {
    descriptors().iter().copied().find(|d| d.key == key)
}

/// A single finding, anchored to a program element and optionally to a
/// program point inside a method body.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    #[serde(serialize_with = "serialize_check_key", rename = "check")]
    pub check: &'static CheckDescriptor,
    pub level: Level,
    /// Element path, e.g. `Socket`, `Socket#close`, or `Socket.channel`.
    pub element: String,
    /// Program point of the finding, when it lies inside a body.
    pub point: Option<ProgramPoint>,
    pub message: String,
    pub help: Option<String>,
}

fn serialize_check_key<S: Serializer>(
    check: &&'static CheckDescriptor,
    ser: S,
) -> std::result::Result<S::Ok, S::Error> {
    ser.serialize_str(check.key)
}

impl Diagnostic {
    /// Construct a finding with the descriptor's default level and no help.
    pub fn new(
        check: &'static CheckDescriptor,
        element: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            check,
            level: Level::default(),
            element: element.into(),
            point: None,
            message: message.into(),
            help: None,
        }
    }

    #[must_use]
    pub fn at(mut self, point: ProgramPoint) -> Self {
        self.point = Some(point);
        self
    }

    #[must_use]
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_lookup_by_key() {
        let d = find_descriptor("required.method.not.called").unwrap();
        assert_eq!(d.kind, CheckKind::Consistency);
        assert!(find_descriptor("no.such.key").is_none());
    }

    #[test]
    fn descriptor_keys_are_unique() {
        let keys: Vec<_> = descriptors().iter().map(|d| d.key).collect();
        let mut deduped = keys.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(keys.len(), deduped.len());
    }
}
