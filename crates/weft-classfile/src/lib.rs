//! Weft compiled-class format
//!
//! This crate provides the binary class format consumed and produced by the
//! weaver: the reference pool, the instruction set, an indexed instruction
//! representation, frame computation and class verification.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builder;
pub mod class;
pub mod constants;
pub mod descriptor;
pub mod encoder;
pub mod frame;
pub mod insn;
pub mod opcode;
pub mod verify;

pub use builder::{BuildError, CodeBuilder, Label};
pub use class::{
    access, ClassError, CompiledClass, CompiledMethod, ExceptionHandler, FieldDecl, Frame,
    FrameEntry, FrameSlot,
};
pub use constants::{Constant, ConstantPool, MemberRef};
pub use descriptor::{DescriptorError, MethodDescriptor, ValueType};
pub use encoder::{ByteReader, ByteWriter, DecodeError};
pub use frame::{analyze, recompute_frames, Analyzer, FrameAnalysis, FrameError, MAX_STACK_DEPTH};
pub use insn::{decode_code, disassemble, encode_code, CodeError, Insn};
pub use opcode::Opcode;
pub use verify::{verify_class, verify_method, VerifyError};
