//! Self-consistency checks for patch definitions
//!
//! The real targets are unknown when the catalog is built, so only the
//! definition itself is checked here.

use super::{CatalogError, PatchDefinition, PatchModule, Selector};
use rustc_hash::FxHashSet;
use thiserror::Error;
use weft_classfile::{Analyzer, DescriptorError, FrameError, MethodDescriptor, ValueType};

/// Why a definition was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// Selector is empty or not an internal class name
    #[error("Invalid selector {0:?}")]
    InvalidSelector(String),

    /// Two fields with the same name
    #[error("Duplicate field {0}")]
    DuplicateField(String),

    /// Two methods with the same name and descriptor
    #[error("Duplicate method {0}")]
    DuplicateMethod(String),

    /// Skip-if-present guards carry no members
    #[error("Skip-if-present guard declares methods or fields")]
    GuardWithMembers,

    /// Matched declarations are body-less
    #[error("Matched method {0} has code")]
    MatchedWithCode(String),

    /// Non-matched methods need a body
    #[error("Method {0} has no code")]
    MissingCode(String),

    /// Constructor patches must run the original constructor
    #[error("Constructor patch {0} never calls the original")]
    ConstructorWithoutOriginal(String),

    /// Bad member descriptor
    #[error("Bad descriptor on {member}: {source}")]
    Descriptor {
        /// Member name or signature
        member: String,
        /// Parse error
        #[source]
        source: DescriptorError,
    },

    /// Method body has no coherent local/stack signature
    #[error("Incoherent method {method}: {source}")]
    IncoherentMethod {
        /// Method signature
        method: String,
        /// Analysis failure
        #[source]
        source: FrameError,
    },
}

/// Validate every definition of `module`
pub(super) fn validate_module(module: &PatchModule) -> Result<(), CatalogError> {
    for (index, def) in module.definitions.iter().enumerate() {
        validate_definition(def).map_err(|reason| CatalogError::Invalid {
            module: module.name.clone(),
            index: index as u32,
            reason,
        })?;
    }
    Ok(())
}

/// Validate one definition
pub(super) fn validate_definition(def: &PatchDefinition) -> Result<(), DefinitionError> {
    if !is_internal_name(def.selector.name()) {
        return Err(DefinitionError::InvalidSelector(def.selector.name().to_string()));
    }

    if matches!(def.selector, Selector::SkipIfPresent(_)) {
        if !def.methods.is_empty() || !def.fields.is_empty() {
            return Err(DefinitionError::GuardWithMembers);
        }
        return Ok(());
    }

    let mut fields = FxHashSet::default();
    for field in &def.fields {
        ValueType::parse_field(&field.decl.descriptor).map_err(|source| {
            DefinitionError::Descriptor {
                member: field.decl.name.clone(),
                source,
            }
        })?;
        if !fields.insert(field.decl.name.as_str()) {
            return Err(DefinitionError::DuplicateField(field.decl.name.clone()));
        }
    }

    let mut methods = FxHashSet::default();
    for pm in &def.methods {
        let method = &pm.method;
        let signature = method.signature();
        if !methods.insert((method.name.as_str(), method.descriptor.as_str())) {
            return Err(DefinitionError::DuplicateMethod(signature));
        }
        MethodDescriptor::parse(&method.descriptor).map_err(|source| {
            DefinitionError::Descriptor {
                member: signature.clone(),
                source,
            }
        })?;

        if pm.matched {
            if !method.code.is_empty() {
                return Err(DefinitionError::MatchedWithCode(signature));
            }
            continue;
        }
        if method.code.is_empty() {
            return Err(DefinitionError::MissingCode(signature));
        }
        if pm.constructor && !pm.calls_original() {
            return Err(DefinitionError::ConstructorWithoutOriginal(signature));
        }

        // Markers push the method's own return value; the analysis checks
        // that every use of it agrees with the descriptor
        Analyzer::new(&def.pool)
            .allow_call_original(true)
            .analyze(method)
            .map_err(|source| DefinitionError::IncoherentMethod {
                method: signature,
                source,
            })?;
    }

    Ok(())
}

/// `pkg/sub/Name` with non-empty segments and no whitespace
fn is_internal_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('/').all(|segment| {
            !segment.is_empty()
                && !segment
                    .chars()
                    .any(|c| c.is_whitespace() || matches!(c, '.' | ';' | '['))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PatchField, PatchId, PatchMethod};
    use weft_classfile::{access, CompiledMethod, ConstantPool, FieldDecl, Insn, Opcode};

    fn method(name: &str, descriptor: &str, code: Vec<Insn>) -> PatchMethod {
        PatchMethod {
            method: CompiledMethod {
                flags: access::PUBLIC,
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                max_stack: 0,
                max_locals: 0,
                code,
                handlers: Vec::new(),
                frames: Vec::new(),
            },
            matched: false,
            async_continuation: false,
            constructor: false,
        }
    }

    fn definition(methods: Vec<PatchMethod>, fields: Vec<PatchField>) -> PatchDefinition {
        PatchDefinition {
            id: PatchId::new("test", 0),
            selector: Selector::ExactClass("org/eclipse/jetty/server/Response".to_string()),
            lenient: false,
            class_name: "weft/jetty/ResponsePatch".to_string(),
            pool: ConstantPool::new(),
            methods,
            fields,
        }
    }

    fn new_field(name: &str) -> PatchField {
        PatchField {
            decl: FieldDecl::new(access::PRIVATE, name, "Ljava/lang/Object;"),
            new_field: true,
        }
    }

    #[test]
    fn test_selector_names() {
        assert!(is_internal_name("io/grpc/internal/ServerCallImpl"));
        assert!(is_internal_name("Outer$Inner"));
        for bad in ["", "a//b", "/a", "a/", "a b", "io.grpc.Server", "[I"] {
            assert!(!is_internal_name(bad), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_valid_definition() {
        let def = definition(
            vec![method(
                "getStatus",
                "()I",
                vec![
                    Insn::CallOriginal,
                    Insn::IConst(1),
                    Insn::Op(Opcode::IAdd),
                    Insn::Op(Opcode::IReturn),
                ],
            )],
            vec![new_field("token")],
        );
        assert_eq!(validate_definition(&def), Ok(()));
    }

    #[test]
    fn test_duplicate_field() {
        let def = definition(Vec::new(), vec![new_field("token"), new_field("token")]);
        assert_eq!(
            validate_definition(&def),
            Err(DefinitionError::DuplicateField("token".to_string()))
        );
    }

    #[test]
    fn test_marker_stack_effect_checked() {
        // The original returns a long; treating it as an int is incoherent
        let def = definition(
            vec![method(
                "contentLength",
                "()J",
                vec![Insn::CallOriginal, Insn::Op(Opcode::IReturn)],
            )],
            Vec::new(),
        );
        assert!(matches!(
            validate_definition(&def),
            Err(DefinitionError::IncoherentMethod { .. })
        ));
    }

    #[test]
    fn test_guard_with_members() {
        let mut def = definition(Vec::new(), vec![new_field("x")]);
        def.selector = Selector::SkipIfPresent("jakarta/servlet/Filter".to_string());
        assert_eq!(
            validate_definition(&def),
            Err(DefinitionError::GuardWithMembers)
        );
    }

    #[test]
    fn test_matched_and_missing_code() {
        let mut matched = method("flush", "()V", vec![Insn::Op(Opcode::Return)]);
        matched.matched = true;
        assert_eq!(
            validate_definition(&definition(vec![matched], Vec::new())),
            Err(DefinitionError::MatchedWithCode("flush()V".to_string()))
        );

        let empty = method("flush", "()V", Vec::new());
        assert_eq!(
            validate_definition(&definition(vec![empty], Vec::new())),
            Err(DefinitionError::MissingCode("flush()V".to_string()))
        );
    }

    #[test]
    fn test_constructor_must_call_original() {
        let mut ctor = method("<init>", "()V", vec![Insn::Op(Opcode::Return)]);
        ctor.constructor = true;
        assert_eq!(
            validate_definition(&definition(vec![ctor], Vec::new())),
            Err(DefinitionError::ConstructorWithoutOriginal("<init>()V".to_string()))
        );
    }

    #[test]
    fn test_rejection_names_module() {
        let module = PatchModule {
            name: "jetty-9".to_string(),
            version: "1".to_string(),
            definitions: vec![definition(Vec::new(), vec![new_field("a"), new_field("a")])],
        };
        let err = validate_module(&module).unwrap_err();
        assert_eq!(err.module(), "jetty-9");
        assert!(err.to_string().contains("Duplicate field a"));
    }
}
