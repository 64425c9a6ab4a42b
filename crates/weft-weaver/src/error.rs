//! Weave failure taxonomy

use thiserror::Error;
use weft_classfile::{ClassError, FrameError, VerifyError};

/// Why a class weave was abandoned
///
/// Every variant leads to the same fallback: the original class is kept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WeaveError {
    /// Target bytes could not be decoded or the result could not be encoded
    #[error("Class format error: {0}")]
    ClassFormat(#[from] ClassError),

    /// Bytes decode to a class other than the announced identity
    #[error("Bytes define {found}, expected {expected}")]
    IdentityMismatch {
        /// Identity given by the loader
        expected: String,
        /// Name inside the bytes
        found: String,
    },

    /// A call-original patch method has no counterpart in the target
    #[error("No target method for call-original in {method}")]
    UnresolvedMarker {
        /// Patch method signature
        method: String,
    },

    /// A target method of the same name exists, but with another descriptor
    #[error("Descriptor mismatch for {name}: patch has {expected}, target has {found}")]
    DescriptorMismatch {
        /// Method name
        name: String,
        /// Patch descriptor
        expected: String,
        /// Target descriptor
        found: String,
    },

    /// Static and instance methods cannot be merged
    #[error("Static modifier of {method} differs between patch and target")]
    StaticMismatch {
        /// Method signature
        method: String,
    },

    /// The target method has no body to splice
    #[error("Target method {method} has no code")]
    NoOriginalBody {
        /// Method signature
        method: String,
    },

    /// A member the patch declares as matched is absent from the target
    #[error("Matched {kind} {name}:{descriptor} missing from target")]
    MissingMember {
        /// "field" or "method"
        kind: &'static str,
        /// Member name
        name: String,
        /// Member descriptor
        descriptor: String,
    },

    /// Injected field name already taken
    #[error("Field {0} already exists in target")]
    FieldCollision(String),

    /// Injected method signature already taken
    #[error("Method {0} already exists in target")]
    MethodCollision(String),

    /// Marker reached with operands below it in a method whose original has handlers
    #[error("Call-original in {method} has a non-empty stack and the original has exception handlers")]
    StackAtMarker {
        /// Method signature
        method: String,
    },

    /// Renumbered original locals run past the last addressable slot
    #[error("Locals of {method} exceed the slot range after renumbering")]
    LocalsOverflow {
        /// Method signature
        method: String,
    },

    /// Frames of the merged method could not be computed
    #[error("Unreconcilable frame in {method}: {source}")]
    UnreconcilableFrame {
        /// Method signature
        method: String,
        /// Analysis failure
        #[source]
        source: FrameError,
    },

    /// Retransformation would add a member
    #[error("Retransformation cannot add {0}")]
    StructuralChangeForbidden(String),

    /// Patch code refers to a pool entry that does not exist
    #[error("Patch code refers to missing pool entry {0}")]
    BadPatchReference(u16),

    /// The merged class needs more pool entries than the format allows
    #[error("Reference pool overflow")]
    PoolOverflow,

    /// Post-weave structural check failed
    #[error("Verifier rejected woven class: {0}")]
    VerifierRejection(#[from] VerifyError),

    /// The engine panicked; caught at the coordinator
    #[error("Weave panicked: {0}")]
    Panicked(String),
}

impl WeaveError {
    /// Whether this is a post-weave verifier rejection rather than a merge failure
    pub fn is_verifier_rejection(&self) -> bool {
        matches!(self, WeaveError::VerifierRejection(_))
    }
}
