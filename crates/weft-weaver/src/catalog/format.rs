//! Patch module binary format
//!
//! ```text
//! magic "WFTP" | version u32 | crc32 u32 (over the rest)
//! name str | version str | definition count u16
//! per definition:
//!   selector tag u8 | selector name str | flags u8
//!   class length u32 | class bytes (WEFT format)
//!   method count u16 | flags u8 per method
//!   field count u16  | flags u8 per field
//! ```

use super::{PatchDefinition, PatchField, PatchId, PatchMethod, PatchModule, Selector};
use thiserror::Error;
use weft_classfile::{ByteReader, ByteWriter, ClassError, CompiledClass, DecodeError};

/// Magic number of a patch module
pub const MODULE_MAGIC: [u8; 4] = *b"WFTP";

/// Current module format version
pub const MODULE_VERSION: u32 = 1;

const DEF_LENIENT: u8 = 0x01;

const METHOD_MATCHED: u8 = 0x01;
const METHOD_ASYNC_CONTINUATION: u8 = 0x02;
const METHOD_CONSTRUCTOR: u8 = 0x04;

const FIELD_NEW: u8 = 0x01;

/// Patch module decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// Truncated or malformed bytes
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected WFTP, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported format version
    #[error("Unsupported module version: {0}")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum in the header
        expected: u32,
        /// Checksum of the body
        actual: u32,
    },

    /// Unknown selector tag
    #[error("Unknown selector tag {0}")]
    UnknownSelector(u8),

    /// Flag bits outside the known set
    #[error("Unknown {kind} flags {flags:#04x}")]
    UnknownFlags {
        /// Which flag byte
        kind: &'static str,
        /// Raw value
        flags: u8,
    },

    /// Embedded patch class failed to decode
    #[error("Patch class {index}: {source}")]
    Class {
        /// Definition index
        index: u32,
        /// Class codec error
        #[source]
        source: ClassError,
    },

    /// Metadata count differs from the class's member count
    #[error("Definition {index}: {found} {kind} metadata entries for {expected} members")]
    MetadataCount {
        /// Definition index
        index: u32,
        /// "method" or "field"
        kind: &'static str,
        /// Member count in the class
        expected: usize,
        /// Metadata entries present
        found: usize,
    },

    /// Bytes after the last definition
    #[error("{0} trailing bytes after module")]
    TrailingBytes(usize),
}

impl Selector {
    fn tag(&self) -> u8 {
        match self {
            Selector::ExactClass(_) => 1,
            Selector::Interface(_) => 2,
            Selector::BaseClass(_) => 3,
            Selector::SkipIfPresent(_) => 4,
        }
    }

    fn from_tag(tag: u8, name: String) -> Result<Self, FormatError> {
        match tag {
            1 => Ok(Selector::ExactClass(name)),
            2 => Ok(Selector::Interface(name)),
            3 => Ok(Selector::BaseClass(name)),
            4 => Ok(Selector::SkipIfPresent(name)),
            _ => Err(FormatError::UnknownSelector(tag)),
        }
    }
}

impl PatchDefinition {
    /// Reassemble the compiled patch class
    pub fn to_class(&self) -> CompiledClass {
        let mut class = CompiledClass::new(self.class_name.clone(), None);
        class.pool = self.pool.clone();
        class.fields = self.fields.iter().map(|f| f.decl.clone()).collect();
        class.methods = self.methods.iter().map(|m| m.method.clone()).collect();
        class
    }
}

impl PatchModule {
    /// Encode the module
    pub fn encode(&self) -> Result<Vec<u8>, ClassError> {
        let mut body = ByteWriter::new();
        body.emit_str(&self.name);
        body.emit_str(&self.version);
        body.emit_u16(self.definitions.len() as u16);

        for def in &self.definitions {
            body.emit_u8(def.selector.tag());
            body.emit_str(def.selector.name());
            body.emit_u8(if def.lenient { DEF_LENIENT } else { 0 });

            let class = def.to_class().encode()?;
            body.emit_u32(class.len() as u32);
            body.emit_bytes(&class);

            body.emit_u16(def.methods.len() as u16);
            for m in &def.methods {
                let mut flags = 0;
                if m.matched {
                    flags |= METHOD_MATCHED;
                }
                if m.async_continuation {
                    flags |= METHOD_ASYNC_CONTINUATION;
                }
                if m.constructor {
                    flags |= METHOD_CONSTRUCTOR;
                }
                body.emit_u8(flags);
            }

            body.emit_u16(def.fields.len() as u16);
            for f in &def.fields {
                body.emit_u8(if f.new_field { FIELD_NEW } else { 0 });
            }
        }

        let body = body.into_bytes();
        let mut out = ByteWriter::with_capacity(body.len() + 12);
        out.emit_bytes(&MODULE_MAGIC);
        out.emit_u32(MODULE_VERSION);
        out.emit_u32(crc32fast::hash(&body));
        out.emit_bytes(&body);
        Ok(out.into_bytes())
    }

    /// Decode a module
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut reader = ByteReader::new(bytes);
        let magic = reader.read_bytes(4)?;
        if magic != MODULE_MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(&magic);
            return Err(FormatError::InvalidMagic(found));
        }
        let version = reader.read_u32()?;
        if version != MODULE_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let expected = reader.read_u32()?;
        let actual = crc32fast::hash(&bytes[reader.position()..]);
        if expected != actual {
            return Err(FormatError::ChecksumMismatch { expected, actual });
        }

        let name = reader.read_string()?;
        let module_version = reader.read_string()?;
        let count = reader.read_u16()? as usize;
        let mut definitions = Vec::with_capacity(count);

        for index in 0..count as u32 {
            let tag = reader.read_u8()?;
            let selector = Selector::from_tag(tag, reader.read_string()?)?;
            let flags = reader.read_u8()?;
            if flags & !DEF_LENIENT != 0 {
                return Err(FormatError::UnknownFlags {
                    kind: "definition",
                    flags,
                });
            }

            let class_len = reader.read_u32()? as usize;
            let class_bytes = reader.read_bytes(class_len)?;
            let class = CompiledClass::decode(&class_bytes)
                .map_err(|source| FormatError::Class { index, source })?;

            let method_count = reader.read_u16()? as usize;
            if method_count != class.methods.len() {
                return Err(FormatError::MetadataCount {
                    index,
                    kind: "method",
                    expected: class.methods.len(),
                    found: method_count,
                });
            }
            let mut methods = Vec::with_capacity(method_count);
            for method in class.methods {
                let bits = reader.read_u8()?;
                if bits & !(METHOD_MATCHED | METHOD_ASYNC_CONTINUATION | METHOD_CONSTRUCTOR) != 0 {
                    return Err(FormatError::UnknownFlags {
                        kind: "method",
                        flags: bits,
                    });
                }
                methods.push(PatchMethod {
                    method,
                    matched: bits & METHOD_MATCHED != 0,
                    async_continuation: bits & METHOD_ASYNC_CONTINUATION != 0,
                    constructor: bits & METHOD_CONSTRUCTOR != 0,
                });
            }

            let field_count = reader.read_u16()? as usize;
            if field_count != class.fields.len() {
                return Err(FormatError::MetadataCount {
                    index,
                    kind: "field",
                    expected: class.fields.len(),
                    found: field_count,
                });
            }
            let mut fields = Vec::with_capacity(field_count);
            for decl in class.fields {
                let bits = reader.read_u8()?;
                if bits & !FIELD_NEW != 0 {
                    return Err(FormatError::UnknownFlags {
                        kind: "field",
                        flags: bits,
                    });
                }
                fields.push(PatchField {
                    decl,
                    new_field: bits & FIELD_NEW != 0,
                });
            }

            definitions.push(PatchDefinition {
                id: PatchId::new(name.clone(), index),
                selector,
                lenient: flags & DEF_LENIENT != 0,
                class_name: class.name,
                pool: class.pool,
                methods,
                fields,
            });
        }

        if reader.has_more() {
            return Err(FormatError::TrailingBytes(reader.remaining()));
        }

        Ok(PatchModule {
            name,
            version: module_version,
            definitions,
        })
    }
}
