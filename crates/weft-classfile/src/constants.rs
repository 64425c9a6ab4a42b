//! Reference pool of a compiled class
//!
//! Instructions refer to classes, fields, methods and literal constants by a
//! `u16` index into the pool. Member references carry their owner, name and
//! descriptor as plain strings so pools can be merged by value.

use crate::encoder::{ByteReader, ByteWriter, DecodeError};

/// Owner, name and descriptor of a field or method reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    /// Internal name of the declaring class
    pub class: String,
    /// Member name
    pub name: String,
    /// Field or method descriptor
    pub descriptor: String,
}

impl MemberRef {
    /// Build a member reference
    pub fn new(
        class: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

/// A single pool entry
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// String literal
    Utf8(String),
    /// Class reference by internal name
    Class(String),
    /// Field reference
    Field(MemberRef),
    /// Class method reference
    Method(MemberRef),
    /// Interface method reference
    InterfaceMethod(MemberRef),
    /// Int literal
    Int(i32),
    /// Long literal
    Long(i64),
    /// Double literal
    Double(f64),
}

impl Constant {
    fn tag(&self) -> u8 {
        match self {
            Constant::Utf8(_) => 1,
            Constant::Class(_) => 2,
            Constant::Field(_) => 3,
            Constant::Method(_) => 4,
            Constant::InterfaceMethod(_) => 5,
            Constant::Int(_) => 6,
            Constant::Long(_) => 7,
            Constant::Double(_) => 8,
        }
    }

    /// The member reference carried by field and method entries
    pub fn as_member(&self) -> Option<&MemberRef> {
        match self {
            Constant::Field(m) | Constant::Method(m) | Constant::InterfaceMethod(m) => Some(m),
            _ => None,
        }
    }

    /// Same constant, compared bit-exactly for doubles
    fn same_as(&self, other: &Constant) -> bool {
        match (self, other) {
            (Constant::Double(a), Constant::Double(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

/// Ordered pool of constants
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at `index`
    pub fn get(&self, index: u16) -> Option<&Constant> {
        self.entries.get(index as usize)
    }

    /// Iterate entries in index order
    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.entries.iter()
    }

    /// Return the index of an equal entry, adding it if absent
    pub fn intern(&mut self, constant: Constant) -> u16 {
        if let Some(idx) = self.entries.iter().position(|c| c.same_as(&constant)) {
            return idx as u16;
        }
        let idx = self.entries.len();
        self.entries.push(constant);
        idx as u16
    }

    /// Intern a class reference
    pub fn class(&mut self, name: &str) -> u16 {
        self.intern(Constant::Class(name.to_string()))
    }

    /// Intern a string literal
    pub fn utf8(&mut self, value: &str) -> u16 {
        self.intern(Constant::Utf8(value.to_string()))
    }

    /// Intern a field reference
    pub fn field(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.intern(Constant::Field(MemberRef::new(class, name, descriptor)))
    }

    /// Intern a class method reference
    pub fn method(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.intern(Constant::Method(MemberRef::new(class, name, descriptor)))
    }

    /// Intern an interface method reference
    pub fn interface_method(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.intern(Constant::InterfaceMethod(MemberRef::new(class, name, descriptor)))
    }

    /// Class name at `index`, if that entry is a class
    pub fn class_name(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            Constant::Class(name) => Some(name),
            _ => None,
        }
    }

    /// Member reference at `index`, if that entry is a field or method
    pub fn member(&self, index: u16) -> Option<&MemberRef> {
        self.get(index)?.as_member()
    }

    /// Encode the pool
    ///
    /// Format: u16 count, then `tag u8` + payload per entry.
    pub fn encode(&self, writer: &mut ByteWriter) {
        writer.emit_u16(self.entries.len() as u16);
        for entry in &self.entries {
            writer.emit_u8(entry.tag());
            match entry {
                Constant::Utf8(s) | Constant::Class(s) => writer.emit_str(s),
                Constant::Field(m) | Constant::Method(m) | Constant::InterfaceMethod(m) => {
                    writer.emit_str(&m.class);
                    writer.emit_str(&m.name);
                    writer.emit_str(&m.descriptor);
                }
                Constant::Int(v) => writer.emit_i32(*v),
                Constant::Long(v) => writer.emit_i64(*v),
                Constant::Double(v) => writer.emit_f64(*v),
            }
        }
    }

    /// Decode the pool
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let count = reader.read_u16()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = reader.position();
            let tag = reader.read_u8()?;
            let entry = match tag {
                1 => Constant::Utf8(reader.read_string()?),
                2 => Constant::Class(reader.read_string()?),
                3..=5 => {
                    let member = MemberRef {
                        class: reader.read_string()?,
                        name: reader.read_string()?,
                        descriptor: reader.read_string()?,
                    };
                    match tag {
                        3 => Constant::Field(member),
                        4 => Constant::Method(member),
                        _ => Constant::InterfaceMethod(member),
                    }
                }
                6 => Constant::Int(reader.read_i32()?),
                7 => Constant::Long(reader.read_i64()?),
                8 => Constant::Double(reader.read_f64()?),
                _ => {
                    return Err(DecodeError::InvalidTag {
                        kind: "pool entry",
                        tag,
                        offset,
                    })
                }
            };
            entries.push(entry);
        }
        Ok(Self { entries })
    }
}
