//! Call-original splicing
//!
//! Each `CALL_ORIGINAL` in a patch body is replaced by a copy of the target
//! method's instructions. Parameter slots are shared with the patch; the
//! original's other locals move above the patch's locals. Every original
//! return becomes a jump to the instruction after the copy, leaving the
//! return value on the stack where the marker promised it.

use crate::error::WeaveError;
use weft_classfile::{
    access, Analyzer, CompiledMethod, ConstantPool, ExceptionHandler, FrameError, FrameSlot,
    Insn, Opcode,
};

/// A merged body, frames not yet computed
pub(crate) struct Spliced {
    pub method: CompiledMethod,
    pub markers: usize,
    pub discards: usize,
}

/// Splice `original` into every marker of `patch`
///
/// Both methods must already use `pool` indices.
pub(crate) fn splice_original(
    original: &CompiledMethod,
    patch: &CompiledMethod,
    pool: &ConstantPool,
    max_stack: u16,
) -> Result<Spliced, WeaveError> {
    let signature = original.signature();
    if original.code.is_empty() {
        return Err(WeaveError::NoOriginalBody { method: signature });
    }

    let frame_err = |source: FrameError| WeaveError::UnreconcilableFrame {
        method: signature.clone(),
        source,
    };
    let original_flow = Analyzer::new(pool)
        .max_stack(max_stack)
        .analyze(original)
        .map_err(frame_err)?;
    let patch_flow = Analyzer::new(pool)
        .allow_call_original(true)
        .max_stack(max_stack)
        .analyze(patch)
        .map_err(frame_err)?;

    let params = original
        .param_slots()
        .map_err(|e| frame_err(FrameError::Descriptor(e)))?;
    let patch_locals = patch.max_locals.max(patch_flow.max_locals).max(params);
    let shift = patch_locals - params;
    let original_locals = original.max_locals.max(original_flow.max_locals).max(params);
    let overflow = || WeaveError::LocalsOverflow {
        method: patch.signature(),
    };
    let scratch = original_locals.checked_add(shift);

    // Layout of one copy: position of each original instruction within it
    let mut layout = Vec::with_capacity(original.code.len() + 1);
    let mut len = 0usize;
    for (j, insn) in original.code.iter().enumerate() {
        layout.push(len);
        len += match return_shape(insn, original_flow.frame_at(j).map(|f| f.stack.as_slice())) {
            Some((_, 0)) | None => 1,
            Some((true, extra)) => extra + 3,
            Some((false, extra)) => extra + 1,
        };
    }
    layout.push(len);

    let mut code = Vec::with_capacity(patch.code.len() + len);
    let mut patch_pos = Vec::with_capacity(patch.code.len() + 1);
    let mut needs_fixup = Vec::new();
    let mut original_handlers = Vec::new();
    let mut markers = 0;
    let mut discards = 0;

    for (i, insn) in patch.code.iter().enumerate() {
        patch_pos.push(code.len());

        if !matches!(insn, Insn::CallOriginal) {
            if !insn.targets().is_empty() {
                needs_fixup.push(code.len());
            }
            code.push(insn.clone());
            continue;
        }

        // Handler entry clears the stack, which would drop the patch's operands
        let depth = patch_flow.frame_at(i).map_or(0, |f| f.stack.len());
        if depth > 0 && !original.handlers.is_empty() {
            return Err(WeaveError::StackAtMarker {
                method: patch.signature(),
            });
        }

        markers += 1;
        let start = code.len();
        let join = start + len;

        for (j, insn) in original.code.iter().enumerate() {
            let stack = original_flow.frame_at(j).map(|f| f.stack.as_slice());
            match return_shape(insn, stack) {
                Some((has_value, extra)) => {
                    if extra > 0 {
                        let stack = stack.unwrap_or_default();
                        let value = has_value.then(|| stack[stack.len() - 1]);
                        let scratch = match value {
                            Some(kind) => scratch
                                .filter(|s| s.checked_add(kind.width() - 1).is_some())
                                .ok_or_else(overflow)?,
                            None => 0,
                        };
                        if let Some(kind) = value {
                            code.push(Insn::Local(store_op(kind), scratch));
                        }
                        for slot in stack[..extra].iter().rev() {
                            code.push(Insn::Op(if slot.width() == 2 {
                                Opcode::Pop2
                            } else {
                                Opcode::Pop
                            }));
                        }
                        if let Some(kind) = value {
                            code.push(Insn::Local(load_op(kind), scratch));
                        }
                        discards += extra;
                    }
                    code.push(Insn::Branch(Opcode::Goto, join));
                }
                None => {
                    let mut copy = insn.clone();
                    relocate_local(&mut copy, params, shift).ok_or_else(overflow)?;
                    copy.map_targets(|t| start + layout[t]);
                    code.push(copy);
                }
            }
        }

        for h in &original.handlers {
            original_handlers.push(ExceptionHandler {
                start: start + layout[h.start],
                end: start + layout[h.end],
                handler: start + layout[h.handler],
                catch_type: h.catch_type,
            });
        }
    }
    patch_pos.push(code.len());

    for at in needs_fixup {
        code[at].map_targets(|t| patch_pos[t]);
    }

    // Original handlers are innermost, so they are searched first
    let mut handlers = original_handlers;
    handlers.extend(patch.handlers.iter().map(|h| ExceptionHandler {
        start: patch_pos[h.start],
        end: patch_pos[h.end],
        handler: patch_pos[h.handler],
        catch_type: h.catch_type,
    }));

    Ok(Spliced {
        method: CompiledMethod {
            flags: original.flags & !access::ABSTRACT,
            name: original.name.clone(),
            descriptor: original.descriptor.clone(),
            max_stack: 0,
            max_locals: 0,
            code,
            handlers,
            frames: Vec::new(),
        },
        markers,
        discards,
    })
}

/// For a return instruction: whether it returns a value, and how many
/// operands sit below that value at the return
fn return_shape(insn: &Insn, stack: Option<&[FrameSlot]>) -> Option<(bool, usize)> {
    let op = insn.opcode();
    if !op.is_return() {
        return None;
    }
    let has_value = op != Opcode::Return;
    let depth = stack.map_or(0, <[FrameSlot]>::len);
    Some((has_value, depth.saturating_sub(has_value as usize)))
}

/// Move a non-parameter local up by `shift`; `None` when the slot (or the
/// second half of a wide slot) no longer fits
fn relocate_local(insn: &mut Insn, params: u16, shift: u16) -> Option<()> {
    let width = match insn {
        Insn::Local(op, _) if is_wide(*op) => 2,
        _ => 1,
    };
    match insn {
        Insn::Local(_, slot) | Insn::IInc { slot, .. } if *slot >= params => {
            let moved = slot.checked_add(shift)?;
            moved.checked_add(width - 1)?;
            *slot = moved;
        }
        _ => {}
    }
    Some(())
}

fn is_wide(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::LLoad | Opcode::LStore | Opcode::DLoad | Opcode::DStore
    )
}

fn store_op(kind: FrameSlot) -> Opcode {
    match kind {
        FrameSlot::Int => Opcode::IStore,
        FrameSlot::Long => Opcode::LStore,
        FrameSlot::Double => Opcode::DStore,
        FrameSlot::Ref | FrameSlot::Top => Opcode::AStore,
    }
}

fn load_op(kind: FrameSlot) -> Opcode {
    match kind {
        FrameSlot::Int => Opcode::ILoad,
        FrameSlot::Long => Opcode::LLoad,
        FrameSlot::Double => Opcode::DLoad,
        FrameSlot::Ref | FrameSlot::Top => Opcode::ALoad,
    }
}
