//! Compiled class model and binary format
//!
//! A [`CompiledClass`] is read once from runtime-supplied bytes and never
//! mutated in place by the weaver: transformations build a new value.

use crate::constants::ConstantPool;
use crate::descriptor::{DescriptorError, MethodDescriptor};
use crate::encoder::{ByteReader, ByteWriter, DecodeError};
use crate::insn::{decode_code, encode_code, instruction_offsets, CodeError, Insn};
use thiserror::Error;

/// Magic number for compiled classes: "WEFT"
pub const MAGIC: [u8; 4] = *b"WEFT";

/// Current format version
pub const VERSION: u32 = 1;

/// Marker for "no superclass" / "catch any" in `u16` index fields
const NONE_INDEX: u16 = 0xFFFF;

/// Access and property flags
pub mod access {
    /// Visible everywhere
    pub const PUBLIC: u16 = 0x0001;
    /// Visible to the declaring class only
    pub const PRIVATE: u16 = 0x0002;
    /// Visible to subclasses
    pub const PROTECTED: u16 = 0x0004;
    /// No receiver
    pub const STATIC: u16 = 0x0008;
    /// Not overridable / assignable once
    pub const FINAL: u16 = 0x0010;
    /// Type is an interface
    pub const INTERFACE: u16 = 0x0200;
    /// No body
    pub const ABSTRACT: u16 = 0x0400;
    /// Generated by a tool
    pub const SYNTHETIC: u16 = 0x1000;
}

/// Class encoding/decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassError {
    /// Byte-level decode failure
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected WEFT, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum stored in the header
        expected: u32,
        /// Checksum of the body
        actual: u32,
    },

    /// A pool index does not name an entry of the expected kind
    #[error("Pool index {index} is not a {expected}")]
    BadPoolRef {
        /// The index
        index: u16,
        /// Expected entry kind
        expected: &'static str,
    },

    /// Invalid method body
    #[error("Method {method}: {source}")]
    Code {
        /// `name` + descriptor of the method
        method: String,
        /// Underlying failure
        #[source]
        source: CodeError,
    },

    /// Invalid descriptor
    #[error("{0}")]
    Descriptor(#[from] DescriptorError),
}

/// Verification kind of a local slot or stack entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameSlot {
    /// Unusable (uninitialized, merged conflict, or second half of a wide value)
    Top,
    /// Int
    Int,
    /// Long (first slot)
    Long,
    /// Double (first slot)
    Double,
    /// Reference
    Ref,
}

impl FrameSlot {
    fn tag(self) -> u8 {
        match self {
            FrameSlot::Top => 0,
            FrameSlot::Int => 1,
            FrameSlot::Long => 2,
            FrameSlot::Double => 3,
            FrameSlot::Ref => 4,
        }
    }

    fn from_tag(tag: u8, offset: usize) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(FrameSlot::Top),
            1 => Ok(FrameSlot::Int),
            2 => Ok(FrameSlot::Long),
            3 => Ok(FrameSlot::Double),
            4 => Ok(FrameSlot::Ref),
            _ => Err(DecodeError::InvalidTag {
                kind: "frame slot",
                tag,
                offset,
            }),
        }
    }

    /// Width in slots of a stack entry of this kind
    pub fn width(self) -> u16 {
        match self {
            FrameSlot::Long | FrameSlot::Double => 2,
            _ => 1,
        }
    }
}

/// Locals and operand stack at an instruction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// One entry per local slot; wide values are followed by `Top`
    pub locals: Vec<FrameSlot>,
    /// One entry per stack value, bottom first
    pub stack: Vec<FrameSlot>,
}

impl Frame {
    /// Operand stack depth in slots
    pub fn stack_slots(&self) -> u16 {
        self.stack.iter().map(|s| s.width()).sum()
    }
}

/// Recorded frame at a branch target or handler entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEntry {
    /// Instruction index
    pub at: usize,
    /// Expected state on entry
    pub frame: Frame,
}

/// Exception handler; ranges are instruction indices, `end` exclusive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// First covered instruction
    pub start: usize,
    /// One past the last covered instruction
    pub end: usize,
    /// Handler entry instruction
    pub handler: usize,
    /// Pool index of the caught class, `None` for catch-all
    pub catch_type: Option<u16>,
}

/// Field declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    /// Access flags
    pub flags: u16,
    /// Field name
    pub name: String,
    /// Field descriptor
    pub descriptor: String,
}

impl FieldDecl {
    /// Build a field declaration
    pub fn new(flags: u16, name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            flags,
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

/// Method with its body and verifier metadata
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledMethod {
    /// Access flags
    pub flags: u16,
    /// Method name
    pub name: String,
    /// Method descriptor
    pub descriptor: String,
    /// Maximum operand stack depth in slots
    pub max_stack: u16,
    /// Number of local slots, parameters included
    pub max_locals: u16,
    /// Instructions
    pub code: Vec<Insn>,
    /// Exception table, searched in order
    pub handlers: Vec<ExceptionHandler>,
    /// Frames at branch targets and handler entries
    pub frames: Vec<FrameEntry>,
}

impl CompiledMethod {
    /// Whether the method has no receiver
    pub fn is_static(&self) -> bool {
        self.flags & access::STATIC != 0
    }

    /// Whether the method has no body
    pub fn is_abstract(&self) -> bool {
        self.flags & access::ABSTRACT != 0
    }

    /// Parse the descriptor
    pub fn parsed_descriptor(&self) -> Result<MethodDescriptor, DescriptorError> {
        MethodDescriptor::parse(&self.descriptor)
    }

    /// Slots used by the receiver and parameters
    pub fn param_slots(&self) -> Result<u16, DescriptorError> {
        Ok(self.parsed_descriptor()?.param_slots(self.is_static()))
    }

    /// `name` + descriptor, as used in messages
    pub fn signature(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }

    /// Whether this method has the given name and descriptor
    pub fn is(&self, name: &str, descriptor: &str) -> bool {
        self.name == name && self.descriptor == descriptor
    }

    fn encode(&self, writer: &mut ByteWriter) -> Result<(), ClassError> {
        let code = encode_code(&self.code).map_err(|source| ClassError::Code {
            method: self.signature(),
            source,
        })?;
        let offsets = instruction_offsets(&self.code);
        let offset_of = |index: usize| -> Result<u32, ClassError> {
            offsets.get(index).copied().ok_or_else(|| ClassError::Code {
                method: self.signature(),
                source: CodeError::DanglingLabel {
                    index,
                    target: index,
                    len: self.code.len(),
                },
            })
        };

        writer.emit_u16(self.flags);
        writer.emit_str(&self.name);
        writer.emit_str(&self.descriptor);
        writer.emit_u16(self.max_stack);
        writer.emit_u16(self.max_locals);
        writer.emit_u32(code.len() as u32);
        writer.emit_bytes(&code);

        writer.emit_u16(self.handlers.len() as u16);
        for h in &self.handlers {
            writer.emit_u32(offset_of(h.start)?);
            writer.emit_u32(offset_of(h.end)?);
            writer.emit_u32(offset_of(h.handler)?);
            writer.emit_u16(h.catch_type.unwrap_or(NONE_INDEX));
        }

        writer.emit_u16(self.frames.len() as u16);
        for entry in &self.frames {
            writer.emit_u32(offset_of(entry.at)?);
            writer.emit_u16(entry.frame.locals.len() as u16);
            for slot in &entry.frame.locals {
                writer.emit_u8(slot.tag());
            }
            writer.emit_u16(entry.frame.stack.len() as u16);
            for slot in &entry.frame.stack {
                writer.emit_u8(slot.tag());
            }
        }
        Ok(())
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, ClassError> {
        let flags = reader.read_u16()?;
        let name = reader.read_string()?;
        let descriptor = reader.read_string()?;
        let max_stack = reader.read_u16()?;
        let max_locals = reader.read_u16()?;
        let code_len = reader.read_u32()? as usize;
        let code_bytes = reader.read_bytes(code_len)?;

        let code_err = |source: CodeError| ClassError::Code {
            method: format!("{name}{descriptor}"),
            source,
        };
        let decoded = decode_code(&code_bytes).map_err(code_err)?;

        let handler_count = reader.read_u16()? as usize;
        let mut handlers = Vec::with_capacity(handler_count);
        for _ in 0..handler_count {
            let start = decoded.index_of(reader.read_u32()?).map_err(code_err)?;
            let end = decoded.index_of(reader.read_u32()?).map_err(code_err)?;
            let handler = decoded.index_of(reader.read_u32()?).map_err(code_err)?;
            let catch_raw = reader.read_u16()?;
            handlers.push(ExceptionHandler {
                start,
                end,
                handler,
                catch_type: (catch_raw != NONE_INDEX).then_some(catch_raw),
            });
        }

        let frame_count = reader.read_u16()? as usize;
        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            let at = decoded.index_of(reader.read_u32()?).map_err(code_err)?;
            let local_count = reader.read_u16()? as usize;
            let mut locals = Vec::with_capacity(local_count);
            for _ in 0..local_count {
                let offset = reader.position();
                locals.push(FrameSlot::from_tag(reader.read_u8()?, offset)?);
            }
            let stack_count = reader.read_u16()? as usize;
            let mut stack = Vec::with_capacity(stack_count);
            for _ in 0..stack_count {
                let offset = reader.position();
                stack.push(FrameSlot::from_tag(reader.read_u8()?, offset)?);
            }
            frames.push(FrameEntry {
                at,
                frame: Frame { locals, stack },
            });
        }

        Ok(Self {
            flags,
            name,
            descriptor,
            max_stack,
            max_locals,
            code: decoded.insns,
            handlers,
            frames,
        })
    }
}

/// A compiled class
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledClass {
    /// Access flags
    pub flags: u16,
    /// Internal name (`pkg/sub/Name`)
    pub name: String,
    /// Superclass internal name
    pub super_name: Option<String>,
    /// Directly implemented interfaces
    pub interfaces: Vec<String>,
    /// Fields in declaration order
    pub fields: Vec<FieldDecl>,
    /// Methods in declaration order
    pub methods: Vec<CompiledMethod>,
    /// Reference pool
    pub pool: ConstantPool,
}

impl CompiledClass {
    /// Create an empty class
    pub fn new(name: impl Into<String>, super_name: Option<&str>) -> Self {
        Self {
            flags: access::PUBLIC,
            name: name.into(),
            super_name: super_name.map(str::to_string),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            pool: ConstantPool::new(),
        }
    }

    /// Whether this type is an interface
    pub fn is_interface(&self) -> bool {
        self.flags & access::INTERFACE != 0
    }

    /// Find a method by name and descriptor
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&CompiledMethod> {
        self.methods.iter().find(|m| m.is(name, descriptor))
    }

    /// Find a field by name
    pub fn find_field(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Encode to the binary format
    ///
    /// Header: magic (4) + version (u32) + flags (u32) + crc32 of the body (u32).
    pub fn encode(&self) -> Result<Vec<u8>, ClassError> {
        let mut pool = self.pool.clone();
        let name_idx = pool.class(&self.name);
        let super_idx = self
            .super_name
            .as_deref()
            .map(|s| pool.class(s))
            .unwrap_or(NONE_INDEX);
        let interface_idx: Vec<u16> = self.interfaces.iter().map(|i| pool.class(i)).collect();

        let mut body = ByteWriter::new();
        pool.encode(&mut body);
        body.emit_u16(name_idx);
        body.emit_u16(super_idx);
        body.emit_u16(interface_idx.len() as u16);
        for idx in interface_idx {
            body.emit_u16(idx);
        }
        body.emit_u16(self.fields.len() as u16);
        for field in &self.fields {
            body.emit_u16(field.flags);
            body.emit_str(&field.name);
            body.emit_str(&field.descriptor);
        }
        body.emit_u16(self.methods.len() as u16);
        for method in &self.methods {
            method.encode(&mut body)?;
        }
        let body = body.into_bytes();

        let mut writer = ByteWriter::with_capacity(body.len() + 16);
        writer.emit_bytes(&MAGIC);
        writer.emit_u32(VERSION);
        writer.emit_u32(self.flags as u32);
        writer.emit_u32(crc32fast::hash(&body));
        writer.emit_bytes(&body);
        Ok(writer.into_bytes())
    }

    /// Decode from the binary format
    pub fn decode(bytes: &[u8]) -> Result<Self, ClassError> {
        let mut reader = ByteReader::new(bytes);
        let magic_bytes = reader.read_bytes(4)?;
        let magic = [magic_bytes[0], magic_bytes[1], magic_bytes[2], magic_bytes[3]];
        if magic != MAGIC {
            return Err(ClassError::InvalidMagic(magic));
        }
        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(ClassError::UnsupportedVersion(version));
        }
        let flags = reader.read_u32()? as u16;
        let expected = reader.read_u32()?;
        let actual = crc32fast::hash(&bytes[reader.position()..]);
        if expected != actual {
            return Err(ClassError::ChecksumMismatch { expected, actual });
        }

        let pool = ConstantPool::decode(&mut reader)?;
        let class_at = |index: u16| -> Result<String, ClassError> {
            pool.class_name(index)
                .map(str::to_string)
                .ok_or(ClassError::BadPoolRef {
                    index,
                    expected: "class",
                })
        };

        let name = class_at(reader.read_u16()?)?;
        let super_raw = reader.read_u16()?;
        let super_name = if super_raw == NONE_INDEX {
            None
        } else {
            Some(class_at(super_raw)?)
        };
        let interface_count = reader.read_u16()? as usize;
        let mut interfaces = Vec::with_capacity(interface_count);
        for _ in 0..interface_count {
            interfaces.push(class_at(reader.read_u16()?)?);
        }

        let field_count = reader.read_u16()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(FieldDecl {
                flags: reader.read_u16()?,
                name: reader.read_string()?,
                descriptor: reader.read_string()?,
            });
        }

        let method_count = reader.read_u16()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            methods.push(CompiledMethod::decode(&mut reader)?);
        }

        Ok(Self {
            flags,
            name,
            super_name,
            interfaces,
            fields,
            methods,
            pool,
        })
    }
}
