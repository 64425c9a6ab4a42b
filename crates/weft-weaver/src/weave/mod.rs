//! Weaving engine
//!
//! Merges the matched patch definitions into a target class, one definition
//! at a time in catalog order. The result is a new class or the untouched
//! original with the failure that stopped the weave; a class is never
//! returned half-woven.

mod remap;
mod splice;

use crate::catalog::{PatchDefinition, PatchId, PatchMethod};
use crate::config::WeaverConfig;
use crate::error::WeaveError;
use remap::Remapper;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use splice::splice_original;
use tracing::{debug, trace};
use weft_classfile::{access, verify_class, Analyzer, CompiledClass, CompiledMethod, FieldDecl};

/// Whether members may be added to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeaveMode {
    /// First load; any change is allowed
    Load,
    /// Class already active; only method bodies may change
    Retransform,
}

/// How a target method was changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MethodChange {
    /// Body replaced by the patch body
    Replaced,
    /// Original body spliced into the patch at each marker
    Spliced {
        /// Number of call-original markers
        markers: usize,
    },
    /// Method added to the class
    Added,
}

/// One changed method
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodReport {
    /// Patch that changed it
    pub patch: PatchId,
    /// Method signature
    pub method: String,
    /// Kind of change
    pub change: MethodChange,
    /// Operands discarded at return sites of the spliced original
    pub discards: usize,
    /// The method is a trace continuation point
    pub async_continuation: bool,
}

/// A successful weave
#[derive(Debug, Clone)]
pub struct Woven {
    /// New class
    pub class: CompiledClass,
    /// Applied patches in catalog order
    pub applied: Vec<PatchId>,
    /// Changed methods
    pub methods: Vec<MethodReport>,
    /// Number of injected fields
    pub fields_added: usize,
}

/// What stopped a weave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeaveFailure {
    /// Offending patch; `None` when the merged class as a whole was rejected
    pub patch: Option<PatchId>,
    /// Reason
    pub error: WeaveError,
}

/// Outcome of [`WeaveEngine::weave`]
#[derive(Debug, Clone)]
pub enum WeaveResult {
    /// Every patch applied
    Woven(Woven),
    /// Nothing applied; the original class is handed back
    Failed {
        /// Unmodified target
        original: CompiledClass,
        /// Failure
        failure: WeaveFailure,
    },
}

impl WeaveResult {
    /// Whether the weave succeeded
    pub fn is_woven(&self) -> bool {
        matches!(self, WeaveResult::Woven(_))
    }

    /// Resulting class: the woven class, or the original on failure
    pub fn class(&self) -> &CompiledClass {
        match self {
            WeaveResult::Woven(woven) => &woven.class,
            WeaveResult::Failed { original, .. } => original,
        }
    }

    /// Failure, if any
    pub fn failure(&self) -> Option<&WeaveFailure> {
        match self {
            WeaveResult::Woven(_) => None,
            WeaveResult::Failed { failure, .. } => Some(failure),
        }
    }
}

/// Merges patch definitions into classes
#[derive(Debug, Clone)]
pub struct WeaveEngine {
    field_prefix: String,
    verify_output: bool,
    max_stack: u16,
}

impl Default for WeaveEngine {
    fn default() -> Self {
        Self::new(&WeaverConfig::default())
    }
}

#[derive(Default)]
struct Applied {
    methods: Vec<MethodReport>,
    fields: usize,
}

impl WeaveEngine {
    /// Engine with the limits and naming of `config`
    pub fn new(config: &WeaverConfig) -> Self {
        Self {
            field_prefix: config.field_prefix.clone(),
            verify_output: config.verify_output,
            max_stack: config.max_stack,
        }
    }

    /// Name given to an injected field
    pub fn field_name(&self, patch: &PatchId, field: &str) -> String {
        format!("{}{}${}", self.field_prefix, patch.module, field)
    }

    /// Weave `patches` into `target`, in order
    ///
    /// Skip-if-present guards in `patches` are ignored. With no applicable
    /// patch the target comes back unchanged with an empty `applied` list.
    pub fn weave(
        &self,
        target: CompiledClass,
        patches: &[&PatchDefinition],
        mode: WeaveMode,
    ) -> WeaveResult {
        let mut work = target.clone();
        let mut applied = Vec::new();
        let mut methods = Vec::new();
        let mut fields_added = 0;
        let mut added = FxHashSet::default();

        for def in patches.iter().filter(|d| !d.selector.is_guard()) {
            match self.apply(&mut work, def, mode, &mut added) {
                Ok(out) => {
                    debug!(
                        class = %work.name,
                        patch = %def.id,
                        methods = out.methods.len(),
                        fields = out.fields,
                        "patch merged"
                    );
                    methods.extend(out.methods);
                    fields_added += out.fields;
                    applied.push(def.id.clone());
                }
                Err(error) => {
                    return WeaveResult::Failed {
                        original: target,
                        failure: WeaveFailure {
                            patch: Some(def.id.clone()),
                            error,
                        },
                    }
                }
            }
        }

        if self.verify_output && !applied.is_empty() {
            if let Err(e) = verify_class(&work, self.max_stack) {
                return WeaveResult::Failed {
                    original: target,
                    failure: WeaveFailure {
                        patch: None,
                        error: e.into(),
                    },
                };
            }
        }

        WeaveResult::Woven(Woven {
            class: work,
            applied,
            methods,
            fields_added,
        })
    }

    fn apply(
        &self,
        work: &mut CompiledClass,
        def: &PatchDefinition,
        mode: WeaveMode,
        added: &mut FxHashSet<(String, String)>,
    ) -> Result<Applied, WeaveError> {
        let mut out = Applied::default();

        let mut field_names = FxHashMap::default();
        for field in &def.fields {
            let decl = &field.decl;
            if !field.new_field {
                match work.find_field(&decl.name) {
                    Some(existing) if existing.descriptor == decl.descriptor => continue,
                    _ => {
                        return Err(WeaveError::MissingMember {
                            kind: "field",
                            name: decl.name.clone(),
                            descriptor: decl.descriptor.clone(),
                        })
                    }
                }
            }
            let name = self.field_name(&def.id, &decl.name);
            if mode == WeaveMode::Retransform {
                return Err(WeaveError::StructuralChangeForbidden(format!("field {name}")));
            }
            if work.find_field(&name).is_some() {
                return Err(WeaveError::FieldCollision(name));
            }
            work.fields.push(FieldDecl::new(decl.flags, name.clone(), &decl.descriptor));
            field_names.insert(decl.name.clone(), name);
            out.fields += 1;
        }

        let target_name = work.name.clone();
        let target_is_interface = work.is_interface();
        let mut remapper = Remapper::new(def, &target_name, target_is_interface, &field_names);

        for pm in &def.methods {
            let patch_method = &pm.method;
            if pm.matched {
                if work.find_method(&patch_method.name, &patch_method.descriptor).is_none() {
                    return Err(WeaveError::MissingMember {
                        kind: "method",
                        name: patch_method.name.clone(),
                        descriptor: patch_method.descriptor.clone(),
                    });
                }
                continue;
            }

            let signature = patch_method.signature();
            let key = (patch_method.name.clone(), patch_method.descriptor.clone());
            if added.contains(&key) {
                return Err(WeaveError::MethodCollision(signature));
            }

            let position = work
                .methods
                .iter()
                .position(|m| m.is(&patch_method.name, &patch_method.descriptor));
            let Some(position) = position else {
                if self.absent_method(work, def, pm, mode)? {
                    let method = remapper.method(patch_method, &mut work.pool)?;
                    let method = self.recompute(work, &method)?;
                    work.methods.push(method);
                    added.insert(key);
                    out.methods.push(report(def, pm, MethodChange::Added, 0));
                }
                continue;
            };

            let original = &work.methods[position];
            if original.is_static() != patch_method.is_static() {
                return Err(WeaveError::StaticMismatch { method: signature });
            }

            let patched = remapper.method(patch_method, &mut work.pool)?;
            let (merged, change, discards) = if pm.calls_original() {
                let spliced =
                    splice_original(&work.methods[position], &patched, &work.pool, self.max_stack)?;
                let change = MethodChange::Spliced {
                    markers: spliced.markers,
                };
                (spliced.method, change, spliced.discards)
            } else {
                let mut replaced = patched;
                replaced.flags = work.methods[position].flags & !access::ABSTRACT;
                (replaced, MethodChange::Replaced, 0)
            };
            let merged = self.recompute(work, &merged)?;
            work.methods[position] = merged;
            out.methods.push(report(def, pm, change, discards));
        }

        Ok(out)
    }

    /// Whether a method the target lacks should be appended
    fn absent_method(
        &self,
        work: &CompiledClass,
        def: &PatchDefinition,
        pm: &PatchMethod,
        mode: WeaveMode,
    ) -> Result<bool, WeaveError> {
        let method = &pm.method;
        if pm.calls_original() {
            if def.skips_absent_methods() {
                trace!(
                    class = %work.name,
                    patch = %def.id,
                    method = %method.signature(),
                    "call-original method absent from target, skipped"
                );
                return Ok(false);
            }
            if let Some(other) = work.methods.iter().find(|m| m.name == method.name) {
                return Err(WeaveError::DescriptorMismatch {
                    name: method.name.clone(),
                    expected: method.descriptor.clone(),
                    found: other.descriptor.clone(),
                });
            }
            return Err(WeaveError::UnresolvedMarker {
                method: method.signature(),
            });
        }
        if mode == WeaveMode::Retransform {
            return Err(WeaveError::StructuralChangeForbidden(format!(
                "method {}",
                method.signature()
            )));
        }
        Ok(true)
    }

    fn recompute(
        &self,
        work: &CompiledClass,
        method: &CompiledMethod,
    ) -> Result<CompiledMethod, WeaveError> {
        Analyzer::new(&work.pool)
            .max_stack(self.max_stack)
            .recompute(method)
            .map_err(|source| WeaveError::UnreconcilableFrame {
                method: method.signature(),
                source,
            })
    }
}

fn report(
    def: &PatchDefinition,
    pm: &PatchMethod,
    change: MethodChange,
    discards: usize,
) -> MethodReport {
    MethodReport {
        patch: def.id.clone(),
        method: pm.method.signature(),
        change,
        discards,
        async_continuation: pm.async_continuation,
    }
}
