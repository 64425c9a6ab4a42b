//! Frame computation
//!
//! Abstract interpretation over a method's instruction list. The analysis
//! yields the locals/stack state on entry to every reachable instruction,
//! from which `max_stack`, `max_locals` and the recorded frames at branch
//! targets and handler entries are derived.

use crate::class::{CompiledMethod, Frame, FrameEntry, FrameSlot};
use crate::constants::{Constant, ConstantPool};
use crate::descriptor::{DescriptorError, MethodDescriptor, ValueType};
use crate::insn::Insn;
use crate::opcode::Opcode;
use rustc_hash::FxHashSet;
use thiserror::Error;

/// Default bound on operand stack depth, in slots
pub const MAX_STACK_DEPTH: u16 = 1024;

/// Frame analysis errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Pop from an empty stack
    #[error("Stack underflow at instruction {0}")]
    StackUnderflow(usize),

    /// Stack grew past the configured bound
    #[error("Stack overflow at instruction {at} (depth: {depth})")]
    StackOverflow {
        /// Instruction index
        at: usize,
        /// Depth in slots
        depth: u32,
    },

    /// Operand of the wrong kind
    #[error("Type mismatch at instruction {at}: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        /// Instruction index
        at: usize,
        /// Expected kind
        expected: FrameSlot,
        /// Actual kind
        found: FrameSlot,
    },

    /// Local slot does not hold the expected kind
    #[error("Local {slot} at instruction {at}: expected {expected:?}, found {found:?}")]
    LocalMismatch {
        /// Instruction index
        at: usize,
        /// Slot
        slot: u16,
        /// Expected kind
        expected: FrameSlot,
        /// Actual kind
        found: FrameSlot,
    },

    /// Two paths reach an instruction with different stack shapes
    #[error("Inconsistent stack shape at instruction {at}: {left:?} vs {right:?}")]
    StackShapeMismatch {
        /// Instruction index
        at: usize,
        /// Stack from the first path
        left: Vec<FrameSlot>,
        /// Stack from the second path
        right: Vec<FrameSlot>,
    },

    /// Execution runs past the last instruction
    #[error("Execution falls off the end of the method at instruction {0}")]
    FallOffEnd(usize),

    /// Branch or handler index outside the method
    #[error("Instruction {at} refers to index {target}, outside the method")]
    BadTarget {
        /// Referring instruction (or handler entry)
        at: usize,
        /// Target index
        target: usize,
    },

    /// Pool index that does not name the right kind of entry
    #[error("Instruction {at} uses pool index {index}, which is not a {expected}")]
    BadPoolRef {
        /// Instruction index
        at: usize,
        /// Pool index
        index: u16,
        /// Expected kind
        expected: &'static str,
    },

    /// Return kind does not match the method descriptor
    #[error("Return at instruction {0} does not match the method descriptor")]
    ReturnMismatch(usize),

    /// `CALL_ORIGINAL` outside patch code
    #[error("CALL_ORIGINAL at instruction {0} is only valid in patch code")]
    UnexpectedCallOriginal(usize),

    /// Bad descriptor on the method or a referenced member
    #[error("{0}")]
    Descriptor(#[from] DescriptorError),
}

/// Result of analysing a method
#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    /// State on entry to each instruction, `None` when unreachable
    pub entry: Vec<Option<Frame>>,
    /// Maximum operand stack depth in slots
    pub max_stack: u16,
    /// Number of local slots used, parameters included
    pub max_locals: u16,
}

impl FrameAnalysis {
    /// State on entry to instruction `index`
    pub fn frame_at(&self, index: usize) -> Option<&Frame> {
        self.entry.get(index).and_then(Option::as_ref)
    }

    /// Frames to record: reachable branch targets and handler entries, by index
    pub fn recorded_frames(&self, method: &CompiledMethod) -> Vec<FrameEntry> {
        let mut points: Vec<usize> = method
            .code
            .iter()
            .flat_map(Insn::targets)
            .chain(method.handlers.iter().map(|h| h.handler))
            .collect::<FxHashSet<_>>()
            .into_iter()
            .collect();
        points.sort_unstable();
        points
            .into_iter()
            .filter_map(|at| {
                self.frame_at(at).map(|frame| FrameEntry {
                    at,
                    frame: frame.clone(),
                })
            })
            .collect()
    }
}

/// Configurable frame analyzer
#[derive(Debug, Clone)]
pub struct Analyzer<'a> {
    pool: &'a ConstantPool,
    allow_call_original: bool,
    max_stack: u16,
}

impl<'a> Analyzer<'a> {
    /// Analyzer resolving references against `pool`
    pub fn new(pool: &'a ConstantPool) -> Self {
        Self {
            pool,
            allow_call_original: false,
            max_stack: MAX_STACK_DEPTH,
        }
    }

    /// Accept `CALL_ORIGINAL` (pushes the method's own return value)
    pub fn allow_call_original(mut self, allow: bool) -> Self {
        self.allow_call_original = allow;
        self
    }

    /// Bound on operand stack depth
    pub fn max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = max_stack;
        self
    }

    /// Run the analysis
    pub fn analyze(&self, method: &CompiledMethod) -> Result<FrameAnalysis, FrameError> {
        let descriptor = method.parsed_descriptor()?;
        let len = method.code.len();
        let mut entry: Vec<Option<Frame>> = vec![None; len];

        let initial = initial_frame(&descriptor, method.is_static());
        let mut max_stack = 0u16;
        let mut max_locals = initial.locals.len() as u16;

        for h in &method.handlers {
            if h.handler >= len || h.start > h.end || h.end > len {
                return Err(FrameError::BadTarget {
                    at: h.handler,
                    target: h.handler.max(h.end),
                });
            }
        }

        if len == 0 {
            return Ok(FrameAnalysis {
                entry,
                max_stack,
                max_locals,
            });
        }

        entry[0] = Some(initial);
        let mut worklist = vec![0usize];

        while let Some(at) = worklist.pop() {
            let Some(state) = entry[at].clone() else {
                continue;
            };
            let insn = &method.code[at];

            // Handlers covering this instruction see its entry locals
            for h in method.handlers.iter().filter(|h| h.start <= at && at < h.end) {
                let handler_frame = Frame {
                    locals: state.locals.clone(),
                    stack: vec![FrameSlot::Ref],
                };
                max_stack = max_stack.max(1);
                if merge_into(&mut entry[h.handler], handler_frame, h.handler)? {
                    worklist.push(h.handler);
                }
            }

            let mut out = state;
            self.transfer(at, insn, &descriptor, &mut out)?;

            let depth = out.stack_slots();
            if depth > self.max_stack {
                return Err(FrameError::StackOverflow {
                    at,
                    depth: depth as u32,
                });
            }
            max_stack = max_stack.max(depth);
            max_locals = max_locals.max(out.locals.len() as u16);

            let mut successors = insn.targets();
            if insn.falls_through() {
                if at + 1 >= len {
                    return Err(FrameError::FallOffEnd(at));
                }
                successors.push(at + 1);
            }
            for succ in successors {
                if succ >= len {
                    return Err(FrameError::BadTarget { at, target: succ });
                }
                if merge_into(&mut entry[succ], out.clone(), succ)? {
                    worklist.push(succ);
                }
            }
        }

        for frame in entry.iter().flatten() {
            max_stack = max_stack.max(frame.stack_slots());
        }

        Ok(FrameAnalysis {
            entry,
            max_stack,
            max_locals,
        })
    }

    /// A copy of `method` with its limits and frames taken from the analysis
    pub fn recompute(&self, method: &CompiledMethod) -> Result<CompiledMethod, FrameError> {
        let analysis = self.analyze(method)?;
        let mut out = method.clone();
        out.frames = analysis.recorded_frames(method);
        out.max_stack = analysis.max_stack;
        out.max_locals = analysis.max_locals.max(method.param_slots()?);
        Ok(out)
    }

    fn transfer(
        &self,
        at: usize,
        insn: &Insn,
        descriptor: &MethodDescriptor,
        f: &mut Frame,
    ) -> Result<(), FrameError> {
        use FrameSlot::*;

        match insn {
            Insn::IConst(_) => f.stack.push(Int),
            Insn::LConst(_) => f.stack.push(Long),
            Insn::DConst(_) => f.stack.push(Double),
            Insn::IInc { slot, .. } => expect_local(f, at, *slot, Int)?,
            Insn::Local(op, slot) => match op {
                Opcode::ILoad => load(f, at, *slot, Int)?,
                Opcode::LLoad => load(f, at, *slot, Long)?,
                Opcode::DLoad => load(f, at, *slot, Double)?,
                Opcode::ALoad => load(f, at, *slot, Ref)?,
                Opcode::IStore => store(f, at, *slot, Int)?,
                Opcode::LStore => store(f, at, *slot, Long)?,
                Opcode::DStore => store(f, at, *slot, Double)?,
                _ => store(f, at, *slot, Ref)?,
            },
            Insn::Branch(op, _) => match op {
                Opcode::Goto => {}
                Opcode::IfICmpEq | Opcode::IfICmpNe | Opcode::IfICmpLt | Opcode::IfICmpGe => {
                    pop(f, at, Int)?;
                    pop(f, at, Int)?;
                }
                Opcode::IfNull | Opcode::IfNonNull => pop(f, at, Ref)?,
                _ => pop(f, at, Int)?,
            },
            Insn::TableSwitch { .. } => pop(f, at, Int)?,
            Insn::CallOriginal => {
                if !self.allow_call_original {
                    return Err(FrameError::UnexpectedCallOriginal(at));
                }
                if let Some(ret) = descriptor.ret {
                    f.stack.push(slot_of(ret));
                }
            }
            Insn::Pool(op, index) => self.transfer_pool(at, *op, *index, f)?,
            Insn::Op(op) => match op {
                Opcode::Nop => {}
                Opcode::Pop => {
                    let top = pop_any(f, at)?;
                    if top.width() != 1 {
                        return Err(FrameError::TypeMismatch {
                            at,
                            expected: Int,
                            found: top,
                        });
                    }
                }
                Opcode::Pop2 => {
                    let top = pop_any(f, at)?;
                    if top.width() == 1 {
                        let second = pop_any(f, at)?;
                        if second.width() != 1 {
                            return Err(FrameError::TypeMismatch {
                                at,
                                expected: Int,
                                found: second,
                            });
                        }
                    }
                }
                Opcode::Dup => {
                    let top = *f.stack.last().ok_or(FrameError::StackUnderflow(at))?;
                    if top.width() != 1 {
                        return Err(FrameError::TypeMismatch {
                            at,
                            expected: Int,
                            found: top,
                        });
                    }
                    f.stack.push(top);
                }
                Opcode::Swap => {
                    let a = pop_any(f, at)?;
                    let b = pop_any(f, at)?;
                    if a.width() != 1 || b.width() != 1 {
                        return Err(FrameError::TypeMismatch {
                            at,
                            expected: Int,
                            found: if a.width() != 1 { a } else { b },
                        });
                    }
                    f.stack.push(a);
                    f.stack.push(b);
                }
                Opcode::AConstNull => f.stack.push(Ref),
                Opcode::IAdd | Opcode::ISub | Opcode::IMul | Opcode::IDiv => binary(f, at, Int, Int)?,
                Opcode::LAdd | Opcode::LSub | Opcode::LMul => binary(f, at, Long, Long)?,
                Opcode::DAdd | Opcode::DSub | Opcode::DMul | Opcode::DDiv => {
                    binary(f, at, Double, Double)?
                }
                Opcode::LCmp => binary(f, at, Long, Int)?,
                Opcode::INeg => unary(f, at, Int, Int)?,
                Opcode::I2L => unary(f, at, Int, Long)?,
                Opcode::L2I => unary(f, at, Long, Int)?,
                Opcode::I2D => unary(f, at, Int, Double)?,
                Opcode::IReturn | Opcode::LReturn | Opcode::DReturn | Opcode::AReturn => {
                    let kind = match op {
                        Opcode::IReturn => Int,
                        Opcode::LReturn => Long,
                        Opcode::DReturn => Double,
                        _ => Ref,
                    };
                    if descriptor.ret.map(slot_of) != Some(kind) {
                        return Err(FrameError::ReturnMismatch(at));
                    }
                    pop(f, at, kind)?;
                }
                Opcode::Return => {
                    if descriptor.ret.is_some() {
                        return Err(FrameError::ReturnMismatch(at));
                    }
                }
                Opcode::AThrow => pop(f, at, Ref)?,
                other => {
                    // Every other opcode carries operands and never decodes to `Insn::Op`
                    return Err(FrameError::BadPoolRef {
                        at,
                        index: other.to_u8() as u16,
                        expected: "operand-free opcode",
                    });
                }
            },
        }
        Ok(())
    }

    fn transfer_pool(
        &self,
        at: usize,
        op: Opcode,
        index: u16,
        f: &mut Frame,
    ) -> Result<(), FrameError> {
        let entry = self.pool.get(index);
        let bad = |expected: &'static str| FrameError::BadPoolRef {
            at,
            index,
            expected,
        };

        match op {
            Opcode::Ldc => {
                let slot = match entry {
                    Some(Constant::Utf8(_) | Constant::Class(_)) => FrameSlot::Ref,
                    Some(Constant::Int(_)) => FrameSlot::Int,
                    Some(Constant::Long(_)) => FrameSlot::Long,
                    Some(Constant::Double(_)) => FrameSlot::Double,
                    _ => return Err(bad("loadable constant")),
                };
                f.stack.push(slot);
            }
            Opcode::GetField | Opcode::PutField | Opcode::GetStatic | Opcode::PutStatic => {
                let Some(Constant::Field(member)) = entry else {
                    return Err(bad("field reference"));
                };
                let kind = slot_of(ValueType::parse_field(&member.descriptor)?);
                match op {
                    Opcode::GetField => {
                        pop(f, at, FrameSlot::Ref)?;
                        f.stack.push(kind);
                    }
                    Opcode::PutField => {
                        pop(f, at, kind)?;
                        pop(f, at, FrameSlot::Ref)?;
                    }
                    Opcode::GetStatic => f.stack.push(kind),
                    _ => pop(f, at, kind)?,
                }
            }
            Opcode::InvokeVirtual
            | Opcode::InvokeSpecial
            | Opcode::InvokeStatic
            | Opcode::InvokeInterface => {
                let member = match (op, entry) {
                    (Opcode::InvokeVirtual, Some(Constant::Method(m))) => m,
                    (Opcode::InvokeInterface, Some(Constant::InterfaceMethod(m))) => m,
                    (
                        Opcode::InvokeSpecial | Opcode::InvokeStatic,
                        Some(Constant::Method(m) | Constant::InterfaceMethod(m)),
                    ) => m,
                    _ => return Err(bad("method reference")),
                };
                let callee = MethodDescriptor::parse(&member.descriptor)?;
                for param in callee.params.iter().rev() {
                    pop(f, at, slot_of(*param))?;
                }
                if op != Opcode::InvokeStatic {
                    pop(f, at, FrameSlot::Ref)?;
                }
                if let Some(ret) = callee.ret {
                    f.stack.push(slot_of(ret));
                }
            }
            Opcode::New | Opcode::CheckCast | Opcode::InstanceOf => {
                if !matches!(entry, Some(Constant::Class(_))) {
                    return Err(bad("class reference"));
                }
                match op {
                    Opcode::New => f.stack.push(FrameSlot::Ref),
                    Opcode::CheckCast => unary(f, at, FrameSlot::Ref, FrameSlot::Ref)?,
                    _ => unary(f, at, FrameSlot::Ref, FrameSlot::Int)?,
                }
            }
            _ => return Err(bad("pool-operand opcode")),
        }
        Ok(())
    }
}

/// Analyze a class method with the default settings
pub fn analyze(method: &CompiledMethod, pool: &ConstantPool) -> Result<FrameAnalysis, FrameError> {
    Analyzer::new(pool).analyze(method)
}

/// A copy of `method` with `max_stack`, `max_locals` and frames recomputed
pub fn recompute_frames(
    method: &CompiledMethod,
    pool: &ConstantPool,
    max_stack: u16,
) -> Result<CompiledMethod, FrameError> {
    Analyzer::new(pool).max_stack(max_stack).recompute(method)
}

/// Kind of a value of type `ty`
pub fn slot_of(ty: ValueType) -> FrameSlot {
    match ty {
        ValueType::Int => FrameSlot::Int,
        ValueType::Long => FrameSlot::Long,
        ValueType::Double => FrameSlot::Double,
        ValueType::Ref => FrameSlot::Ref,
    }
}

fn initial_frame(descriptor: &MethodDescriptor, is_static: bool) -> Frame {
    let mut locals = Vec::new();
    if !is_static {
        locals.push(FrameSlot::Ref);
    }
    for param in &descriptor.params {
        locals.push(slot_of(*param));
        if param.slots() == 2 {
            locals.push(FrameSlot::Top);
        }
    }
    Frame {
        locals,
        stack: Vec::new(),
    }
}

fn merge_into(target: &mut Option<Frame>, incoming: Frame, at: usize) -> Result<bool, FrameError> {
    let Some(existing) = target else {
        *target = Some(incoming);
        return Ok(true);
    };

    if existing.stack != incoming.stack {
        return Err(FrameError::StackShapeMismatch {
            at,
            left: existing.stack.clone(),
            right: incoming.stack,
        });
    }

    // Conflicting locals degrade to Top
    let mut changed = false;
    let len = existing.locals.len().max(incoming.locals.len());
    existing.locals.resize(len, FrameSlot::Top);
    for (idx, slot) in existing.locals.iter_mut().enumerate() {
        let other = incoming.locals.get(idx).copied().unwrap_or(FrameSlot::Top);
        if *slot != other && *slot != FrameSlot::Top {
            *slot = FrameSlot::Top;
            changed = true;
        }
    }
    Ok(changed)
}

fn pop_any(f: &mut Frame, at: usize) -> Result<FrameSlot, FrameError> {
    f.stack.pop().ok_or(FrameError::StackUnderflow(at))
}

fn pop(f: &mut Frame, at: usize, expected: FrameSlot) -> Result<(), FrameError> {
    let found = pop_any(f, at)?;
    if found != expected {
        return Err(FrameError::TypeMismatch {
            at,
            expected,
            found,
        });
    }
    Ok(())
}

fn unary(f: &mut Frame, at: usize, input: FrameSlot, output: FrameSlot) -> Result<(), FrameError> {
    pop(f, at, input)?;
    f.stack.push(output);
    Ok(())
}

fn binary(f: &mut Frame, at: usize, input: FrameSlot, output: FrameSlot) -> Result<(), FrameError> {
    pop(f, at, input)?;
    pop(f, at, input)?;
    f.stack.push(output);
    Ok(())
}

fn expect_local(f: &Frame, at: usize, slot: u16, expected: FrameSlot) -> Result<(), FrameError> {
    let found = f.locals.get(slot as usize).copied().unwrap_or(FrameSlot::Top);
    if found != expected {
        return Err(FrameError::LocalMismatch {
            at,
            slot,
            expected,
            found,
        });
    }
    Ok(())
}

fn load(f: &mut Frame, at: usize, slot: u16, kind: FrameSlot) -> Result<(), FrameError> {
    expect_local(f, at, slot, kind)?;
    f.stack.push(kind);
    Ok(())
}

fn store(f: &mut Frame, at: usize, slot: u16, kind: FrameSlot) -> Result<(), FrameError> {
    pop(f, at, kind)?;
    let idx = slot as usize;
    let needed = idx + kind.width() as usize;
    if f.locals.len() < needed {
        f.locals.resize(needed, FrameSlot::Top);
    }
    // Overwriting the high half of a wide value invalidates its low half
    if idx > 0 && matches!(f.locals[idx - 1], FrameSlot::Long | FrameSlot::Double) {
        f.locals[idx - 1] = FrameSlot::Top;
    }
    f.locals[idx] = kind;
    if kind.width() == 2 {
        f.locals[idx + 1] = FrameSlot::Top;
    }
    Ok(())
}
