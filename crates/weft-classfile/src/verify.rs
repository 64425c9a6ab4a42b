//! Class verification
//!
//! Structural checks plus a full frame recomputation per method. A class
//! passes only when its recorded `max_stack`, `max_locals` and frames agree
//! with what the analysis derives from the instructions.

use crate::class::{CompiledClass, CompiledMethod};
use crate::descriptor::{DescriptorError, MethodDescriptor, ValueType};
use crate::frame::{Analyzer, FrameError};
use rustc_hash::FxHashSet;

/// Class verification errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Two methods with the same name and descriptor
    #[error("Duplicate method {0}")]
    DuplicateMethod(String),

    /// Two fields with the same name
    #[error("Duplicate field {0}")]
    DuplicateField(String),

    /// Bad field or method descriptor on a declaration
    #[error("Bad descriptor on {member}: {source}")]
    Descriptor {
        /// Member signature
        member: String,
        /// Parse error
        #[source]
        source: DescriptorError,
    },

    /// Abstract method carrying code, or concrete method without it
    #[error("Method {0}: body does not agree with the abstract flag")]
    BodyMismatch(String),

    /// Handler catch type is not a class entry
    #[error("Method {method}: handler catch type {index} is not a class reference")]
    BadCatchType {
        /// Method signature
        method: String,
        /// Pool index
        index: u16,
    },

    /// Instruction-level failure from the frame analysis
    #[error("Method {method}: {source}")]
    Frame {
        /// Method signature
        method: String,
        /// Analysis error
        #[source]
        source: FrameError,
    },

    /// Declared `max_stack` below what the code needs
    #[error("Method {method}: max_stack {declared} is below the required {required}")]
    MaxStack {
        /// Method signature
        method: String,
        /// Declared value
        declared: u16,
        /// Computed value
        required: u16,
    },

    /// Declared `max_locals` below what the code needs
    #[error("Method {method}: max_locals {declared} is below the required {required}")]
    MaxLocals {
        /// Method signature
        method: String,
        /// Declared value
        declared: u16,
        /// Computed value
        required: u16,
    },

    /// Recorded frames differ from the computed ones
    #[error("Method {method}: recorded frame at instruction {at} is stale")]
    StaleFrame {
        /// Method signature
        method: String,
        /// First differing instruction index
        at: usize,
    },
}

/// Verify every declaration and method body of `class`
pub fn verify_class(class: &CompiledClass, max_stack: u16) -> Result<(), VerifyError> {
    let mut fields = FxHashSet::default();
    for field in &class.fields {
        ValueType::parse_field(&field.descriptor).map_err(|source| VerifyError::Descriptor {
            member: field.name.clone(),
            source,
        })?;
        if !fields.insert(field.name.as_str()) {
            return Err(VerifyError::DuplicateField(field.name.clone()));
        }
    }

    let mut methods = FxHashSet::default();
    for method in &class.methods {
        if !methods.insert((method.name.as_str(), method.descriptor.as_str())) {
            return Err(VerifyError::DuplicateMethod(method.signature()));
        }
        verify_method(class, method, max_stack)?;
    }

    Ok(())
}

/// Verify a single method body against the class pool
pub fn verify_method(
    class: &CompiledClass,
    method: &CompiledMethod,
    max_stack: u16,
) -> Result<(), VerifyError> {
    MethodDescriptor::parse(&method.descriptor).map_err(|source| VerifyError::Descriptor {
        member: method.signature(),
        source,
    })?;

    // Abstract methods have no body to check
    if method.is_abstract() || method.code.is_empty() {
        if method.is_abstract() != method.code.is_empty() {
            return Err(VerifyError::BodyMismatch(method.signature()));
        }
        return Ok(());
    }

    for handler in &method.handlers {
        if let Some(index) = handler.catch_type {
            if class.pool.class_name(index).is_none() {
                return Err(VerifyError::BadCatchType {
                    method: method.signature(),
                    index,
                });
            }
        }
    }

    let analysis = Analyzer::new(&class.pool)
        .max_stack(max_stack)
        .analyze(method)
        .map_err(|source| VerifyError::Frame {
            method: method.signature(),
            source,
        })?;

    if method.max_stack < analysis.max_stack {
        return Err(VerifyError::MaxStack {
            method: method.signature(),
            declared: method.max_stack,
            required: analysis.max_stack,
        });
    }
    if method.max_locals < analysis.max_locals {
        return Err(VerifyError::MaxLocals {
            method: method.signature(),
            declared: method.max_locals,
            required: analysis.max_locals,
        });
    }

    let expected = analysis.recorded_frames(method);
    if expected != method.frames {
        let at = expected
            .iter()
            .zip(&method.frames)
            .find(|(a, b)| a != b)
            .map(|(a, _)| a.at)
            .or_else(|| {
                let shorter = expected.len().min(method.frames.len());
                expected
                    .get(shorter)
                    .or_else(|| method.frames.get(shorter))
                    .map(|f| f.at)
            })
            .unwrap_or_default();
        return Err(VerifyError::StaleFrame {
            method: method.signature(),
            at,
        });
    }

    Ok(())
}
