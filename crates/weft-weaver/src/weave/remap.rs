//! Re-interning patch references into the target pool
//!
//! Patch code is compiled against the patch class. Before it can run inside
//! the target, every pool operand is translated: self-references move to the
//! target class and injected fields take their prefixed names.

use crate::catalog::PatchDefinition;
use crate::error::WeaveError;
use rustc_hash::FxHashMap;
use weft_classfile::{CompiledMethod, Constant, ConstantPool, Insn, MemberRef, Opcode};

/// Translates pool indices of one patch definition into a target pool
pub(crate) struct Remapper<'a> {
    patch: &'a PatchDefinition,
    target_class: &'a str,
    target_is_interface: bool,
    field_names: &'a FxHashMap<String, String>,
    cache: FxHashMap<u16, u16>,
}

impl<'a> Remapper<'a> {
    pub(crate) fn new(
        patch: &'a PatchDefinition,
        target_class: &'a str,
        target_is_interface: bool,
        field_names: &'a FxHashMap<String, String>,
    ) -> Self {
        Self {
            patch,
            target_class,
            target_is_interface,
            field_names,
            cache: FxHashMap::default(),
        }
    }

    /// Target-pool index for patch-pool `index`
    pub(crate) fn index(&mut self, index: u16, pool: &mut ConstantPool) -> Result<u16, WeaveError> {
        if let Some(&mapped) = self.cache.get(&index) {
            return Ok(mapped);
        }
        let constant = self
            .patch
            .pool
            .get(index)
            .ok_or(WeaveError::BadPatchReference(index))?;
        let mapped = pool.intern(self.translate(constant));
        // Index 0xFFFF is reserved for "none"
        if pool.len() > u16::MAX as usize {
            return Err(WeaveError::PoolOverflow);
        }
        self.cache.insert(index, mapped);
        Ok(mapped)
    }

    /// Copy of a patch method with every pool operand translated
    ///
    /// Frames are dropped; the caller recomputes them for the merged body.
    pub(crate) fn method(
        &mut self,
        method: &CompiledMethod,
        pool: &mut ConstantPool,
    ) -> Result<CompiledMethod, WeaveError> {
        let mut out = method.clone();
        out.frames.clear();
        for insn in &mut out.code {
            if let Insn::Pool(op, index) = insn {
                *index = self.index(*index, pool)?;
                // A self-call changes kind when patch and target kinds differ
                *op = match (*op, pool.get(*index)) {
                    (Opcode::InvokeVirtual, Some(Constant::InterfaceMethod(_))) => {
                        Opcode::InvokeInterface
                    }
                    (Opcode::InvokeInterface, Some(Constant::Method(_))) => Opcode::InvokeVirtual,
                    (op, _) => op,
                };
            }
        }
        for handler in &mut out.handlers {
            if let Some(catch) = handler.catch_type {
                handler.catch_type = Some(self.index(catch, pool)?);
            }
        }
        Ok(out)
    }

    fn translate(&self, constant: &Constant) -> Constant {
        match constant {
            Constant::Class(name) if *name == self.patch.class_name => {
                Constant::Class(self.target_class.to_string())
            }
            Constant::Field(member) if member.class == self.patch.class_name => {
                let name = self
                    .field_names
                    .get(&member.name)
                    .cloned()
                    .unwrap_or_else(|| member.name.clone());
                Constant::Field(MemberRef::new(self.target_class, name, &member.descriptor))
            }
            Constant::Method(member) | Constant::InterfaceMethod(member)
                if member.class == self.patch.class_name =>
            {
                let member = MemberRef::new(self.target_class, &member.name, &member.descriptor);
                if self.target_is_interface {
                    Constant::InterfaceMethod(member)
                } else {
                    Constant::Method(member)
                }
            }
            other => other.clone(),
        }
    }
}
