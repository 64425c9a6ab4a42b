//! Indexed instruction IR
//!
//! Method bodies are decoded into a flat list of [`Insn`] records whose branch
//! operands are *instruction indices* instead of byte offsets. Splicing and
//! renumbering operate on this list; byte offsets are recomputed when the
//! method is encoded again.

use crate::encoder::{ByteReader, ByteWriter, DecodeError};
use crate::opcode::Opcode;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Errors converting between code bytes and the IR
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    /// Byte-level decode failure
    #[error("{0}")]
    Decode(#[from] DecodeError),

    /// A branch lands outside the method or between instructions
    #[error("Branch at offset {offset} targets {target}, which is not an instruction boundary")]
    InvalidBranchTarget {
        /// Offset of the branch instruction
        offset: u32,
        /// Absolute byte target
        target: i64,
    },

    /// A branch refers to an instruction index past the end of the list
    #[error("Instruction {index} branches to index {target} (length {len})")]
    DanglingLabel {
        /// Index of the branch instruction
        index: usize,
        /// Target index
        target: usize,
        /// Number of instructions
        len: usize,
    },

    /// Byte offset that is not an instruction boundary (handler or frame)
    #[error("Offset {0} is not an instruction boundary")]
    NotABoundary(u32),
}

/// A decoded instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    /// Instruction without operands
    Op(Opcode),
    /// `ICONST`
    IConst(i32),
    /// `LCONST`
    LConst(i64),
    /// `DCONST`
    DConst(f64),
    /// Local load or store
    Local(Opcode, u16),
    /// `IINC`
    IInc {
        /// Local slot
        slot: u16,
        /// Increment
        delta: i16,
    },
    /// Single-target branch; the operand is an instruction index
    Branch(Opcode, usize),
    /// `TABLESWITCH`; targets are instruction indices
    TableSwitch {
        /// Key of the first target
        low: i32,
        /// Target when the key is out of range
        default: usize,
        /// Targets for `low..low + targets.len()`
        targets: Vec<usize>,
    },
    /// Instruction with a pool operand (`LDC`, fields, invokes, types)
    Pool(Opcode, u16),
    /// Call-original marker
    CallOriginal,
}

impl Insn {
    /// Opcode of this instruction
    pub fn opcode(&self) -> Opcode {
        match self {
            Insn::Op(op) | Insn::Local(op, _) | Insn::Branch(op, _) | Insn::Pool(op, _) => *op,
            Insn::IConst(_) => Opcode::IConst,
            Insn::LConst(_) => Opcode::LConst,
            Insn::DConst(_) => Opcode::DConst,
            Insn::IInc { .. } => Opcode::IInc,
            Insn::TableSwitch { .. } => Opcode::TableSwitch,
            Insn::CallOriginal => Opcode::CallOriginal,
        }
    }

    /// Instruction indices this instruction may branch to
    pub fn targets(&self) -> Vec<usize> {
        match self {
            Insn::Branch(_, target) => vec![*target],
            Insn::TableSwitch {
                default, targets, ..
            } => {
                let mut all = Vec::with_capacity(targets.len() + 1);
                all.push(*default);
                all.extend_from_slice(targets);
                all
            }
            _ => Vec::new(),
        }
    }

    /// Rewrite every branch target through `f`
    pub fn map_targets(&mut self, mut f: impl FnMut(usize) -> usize) {
        match self {
            Insn::Branch(_, target) => *target = f(*target),
            Insn::TableSwitch {
                default, targets, ..
            } => {
                *default = f(*default);
                for t in targets.iter_mut() {
                    *t = f(*t);
                }
            }
            _ => {}
        }
    }

    /// Whether control can continue to the next instruction
    pub fn falls_through(&self) -> bool {
        !self.opcode().is_terminator()
    }

    /// Encoded size in bytes
    pub fn encoded_size(&self) -> u32 {
        match self {
            Insn::Op(_) | Insn::CallOriginal => 1,
            Insn::IConst(_) => 5,
            Insn::LConst(_) | Insn::DConst(_) => 9,
            Insn::Local(..) | Insn::Pool(..) => 3,
            Insn::IInc { .. } => 5,
            Insn::Branch(..) => 5,
            Insn::TableSwitch { targets, .. } => 1 + 4 + 2 + 4 + 4 * targets.len() as u32,
        }
    }
}

/// Result of decoding a code attribute
#[derive(Debug, Clone)]
pub struct DecodedCode {
    /// Instructions in order
    pub insns: Vec<Insn>,
    /// Byte offset of each instruction, plus the code length as a final entry
    pub offsets: Vec<u32>,
}

impl DecodedCode {
    /// Instruction index at a byte offset; the code length maps to `insns.len()`
    pub fn index_of(&self, offset: u32) -> Result<usize, CodeError> {
        self.offsets
            .binary_search(&offset)
            .map_err(|_| CodeError::NotABoundary(offset))
    }
}

enum RawTarget {
    None,
    One(i64),
    Switch { default: i64, targets: Vec<i64> },
}

/// Decode code bytes into the IR, resolving branch targets to indices
pub fn decode_code(code: &[u8]) -> Result<DecodedCode, CodeError> {
    let mut reader = ByteReader::new(code);
    let mut raw = Vec::new();
    let mut offsets = Vec::new();

    while reader.has_more() {
        let offset = reader.position() as u32;
        let byte = reader.read_u8()?;
        let opcode =
            Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte, offset as usize))?;
        let base = offset as i64;

        let (insn, target) = match opcode {
            Opcode::IConst => (Insn::IConst(reader.read_i32()?), RawTarget::None),
            Opcode::LConst => (Insn::LConst(reader.read_i64()?), RawTarget::None),
            Opcode::DConst => (Insn::DConst(reader.read_f64()?), RawTarget::None),
            Opcode::IInc => {
                let slot = reader.read_u16()?;
                let delta = reader.read_i16()?;
                (Insn::IInc { slot, delta }, RawTarget::None)
            }
            Opcode::TableSwitch => {
                let low = reader.read_i32()?;
                let count = reader.read_u16()? as usize;
                let default = base + reader.read_i32()? as i64;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    targets.push(base + reader.read_i32()? as i64);
                }
                (
                    Insn::TableSwitch {
                        low,
                        default: 0,
                        targets: vec![0; count],
                    },
                    RawTarget::Switch { default, targets },
                )
            }
            Opcode::CallOriginal => (Insn::CallOriginal, RawTarget::None),
            op if op.is_branch() => {
                let rel = reader.read_i32()? as i64;
                (Insn::Branch(op, 0), RawTarget::One(base + rel))
            }
            op if op.is_local_access() => (Insn::Local(op, reader.read_u16()?), RawTarget::None),
            op if op.is_pool_access() => (Insn::Pool(op, reader.read_u16()?), RawTarget::None),
            op => (Insn::Op(op), RawTarget::None),
        };

        offsets.push(offset);
        raw.push((offset, insn, target));
    }

    let index_by_offset: FxHashMap<i64, usize> = offsets
        .iter()
        .enumerate()
        .map(|(idx, &off)| (off as i64, idx))
        .collect();
    let resolve = |offset: u32, target: i64| {
        index_by_offset
            .get(&target)
            .copied()
            .ok_or(CodeError::InvalidBranchTarget { offset, target })
    };

    let mut insns = Vec::with_capacity(raw.len());
    for (offset, mut insn, target) in raw {
        match target {
            RawTarget::None => {}
            RawTarget::One(t) => {
                let idx = resolve(offset, t)?;
                insn.map_targets(|_| idx);
            }
            RawTarget::Switch { default, targets } => {
                let default = resolve(offset, default)?;
                let targets = targets
                    .into_iter()
                    .map(|t| resolve(offset, t))
                    .collect::<Result<Vec<_>, _>>()?;
                if let Insn::TableSwitch {
                    default: d,
                    targets: ts,
                    ..
                } = &mut insn
                {
                    *d = default;
                    *ts = targets;
                }
            }
        }
        insns.push(insn);
    }

    offsets.push(code.len() as u32);
    Ok(DecodedCode { insns, offsets })
}

/// Byte offset of every instruction, plus the total length as a final entry
pub fn instruction_offsets(insns: &[Insn]) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(insns.len() + 1);
    let mut pos = 0u32;
    for insn in insns {
        offsets.push(pos);
        pos += insn.encoded_size();
    }
    offsets.push(pos);
    offsets
}

/// Encode the IR back to code bytes
pub fn encode_code(insns: &[Insn]) -> Result<Vec<u8>, CodeError> {
    let offsets = instruction_offsets(insns);
    let total = offsets.last().copied().unwrap_or(0) as usize;
    let mut writer = ByteWriter::with_capacity(total);

    let relative = |index: usize, target: usize| -> Result<i32, CodeError> {
        if target >= insns.len() {
            return Err(CodeError::DanglingLabel {
                index,
                target,
                len: insns.len(),
            });
        }
        Ok(offsets[target] as i32 - offsets[index] as i32)
    };

    for (index, insn) in insns.iter().enumerate() {
        writer.emit_u8(insn.opcode().to_u8());
        match insn {
            Insn::Op(_) | Insn::CallOriginal => {}
            Insn::IConst(v) => writer.emit_i32(*v),
            Insn::LConst(v) => writer.emit_i64(*v),
            Insn::DConst(v) => writer.emit_f64(*v),
            Insn::Local(_, slot) | Insn::Pool(_, slot) => writer.emit_u16(*slot),
            Insn::IInc { slot, delta } => {
                writer.emit_u16(*slot);
                writer.emit_i16(*delta);
            }
            Insn::Branch(_, target) => writer.emit_i32(relative(index, *target)?),
            Insn::TableSwitch {
                low,
                default,
                targets,
            } => {
                writer.emit_i32(*low);
                writer.emit_u16(targets.len() as u16);
                writer.emit_i32(relative(index, *default)?);
                for t in targets {
                    writer.emit_i32(relative(index, *t)?);
                }
            }
        }
    }

    Ok(writer.into_bytes())
}

/// Render instructions one per line, for diagnostics and test failures
pub fn disassemble(insns: &[Insn]) -> String {
    let mut out = String::new();
    for (idx, insn) in insns.iter().enumerate() {
        let name = insn.opcode().name();
        let line = match insn {
            Insn::Op(_) | Insn::CallOriginal => name.to_string(),
            Insn::IConst(v) => format!("{name} {v}"),
            Insn::LConst(v) => format!("{name} {v}"),
            Insn::DConst(v) => format!("{name} {v}"),
            Insn::Local(_, slot) => format!("{name} {slot}"),
            Insn::IInc { slot, delta } => format!("{name} {slot} {delta}"),
            Insn::Branch(_, t) => format!("{name} @{t}"),
            Insn::TableSwitch {
                low,
                default,
                targets,
            } => format!("{name} low={low} default=@{default} targets={targets:?}"),
            Insn::Pool(_, idx) => format!("{name} #{idx}"),
        };
        out.push_str(&format!("{idx:4}: {line}\n"));
    }
    out
}
