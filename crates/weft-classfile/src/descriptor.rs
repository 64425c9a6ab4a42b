//! Field and method descriptors
//!
//! Descriptors use the `(params)ret` form: `I`, `Z`, `B`, `C`, `S` are ints,
//! `J` is a long, `D` a double, `Lpkg/Name;` and `[...` are references and `V`
//! is a void return. Longs and doubles occupy two local slots.

use thiserror::Error;

/// Descriptor parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// The descriptor is not well formed
    #[error("Malformed descriptor {descriptor:?} at position {position}")]
    Malformed {
        /// The descriptor text
        descriptor: String,
        /// Position of the first bad character
        position: usize,
    },
}

/// Verification-level value kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// 32-bit int (also booleans, bytes, chars, shorts)
    Int,
    /// 64-bit long
    Long,
    /// 64-bit double
    Double,
    /// Object or array reference (including null)
    Ref,
}

impl ValueType {
    /// Number of local/stack slots the value occupies
    pub fn slots(self) -> u16 {
        match self {
            ValueType::Long | ValueType::Double => 2,
            ValueType::Int | ValueType::Ref => 1,
        }
    }

    /// Parse a field descriptor (`I`, `Ljava/lang/String;`, `[J`, ...)
    pub fn parse_field(descriptor: &str) -> Result<Self, DescriptorError> {
        let bytes = descriptor.as_bytes();
        let (ty, end) = parse_value(descriptor, bytes, 0)?;
        if end != bytes.len() {
            return Err(malformed(descriptor, end));
        }
        Ok(ty)
    }
}

/// A parsed method descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Parameter types in declaration order
    pub params: Vec<ValueType>,
    /// Return type, `None` for void
    pub ret: Option<ValueType>,
}

impl MethodDescriptor {
    /// Parse a method descriptor such as `(ILjava/lang/String;)J`
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let bytes = descriptor.as_bytes();
        if bytes.first() != Some(&b'(') {
            return Err(malformed(descriptor, 0));
        }

        let mut pos = 1;
        let mut params = Vec::new();
        loop {
            match bytes.get(pos) {
                Some(b')') => {
                    pos += 1;
                    break;
                }
                Some(_) => {
                    let (ty, next) = parse_value(descriptor, bytes, pos)?;
                    params.push(ty);
                    pos = next;
                }
                None => return Err(malformed(descriptor, pos)),
            }
        }

        let ret = match bytes.get(pos) {
            Some(b'V') if pos + 1 == bytes.len() => None,
            Some(_) => {
                let (ty, end) = parse_value(descriptor, bytes, pos)?;
                if end != bytes.len() {
                    return Err(malformed(descriptor, end));
                }
                Some(ty)
            }
            None => return Err(malformed(descriptor, pos)),
        };

        Ok(Self { params, ret })
    }

    /// Slots taken by the parameters, plus one for `this` on instance methods
    pub fn param_slots(&self, is_static: bool) -> u16 {
        let receiver = if is_static { 0 } else { 1 };
        receiver + self.params.iter().map(|p| p.slots()).sum::<u16>()
    }
}

fn malformed(descriptor: &str, position: usize) -> DescriptorError {
    DescriptorError::Malformed {
        descriptor: descriptor.to_string(),
        position,
    }
}

fn parse_value(
    descriptor: &str,
    bytes: &[u8],
    pos: usize,
) -> Result<(ValueType, usize), DescriptorError> {
    match bytes.get(pos) {
        Some(b'I' | b'Z' | b'B' | b'C' | b'S') => Ok((ValueType::Int, pos + 1)),
        Some(b'J') => Ok((ValueType::Long, pos + 1)),
        Some(b'D') => Ok((ValueType::Double, pos + 1)),
        Some(b'L') => {
            let end = bytes[pos..]
                .iter()
                .position(|&b| b == b';')
                .ok_or_else(|| malformed(descriptor, pos))?;
            if end <= 1 {
                return Err(malformed(descriptor, pos));
            }
            Ok((ValueType::Ref, pos + end + 1))
        }
        Some(b'[') => {
            let mut elem = pos + 1;
            while bytes.get(elem) == Some(&b'[') {
                elem += 1;
            }
            let (_, end) = parse_value(descriptor, bytes, elem)?;
            Ok((ValueType::Ref, end))
        }
        _ => Err(malformed(descriptor, pos)),
    }
}
