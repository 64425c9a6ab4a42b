//! Label-based code construction
//!
//! Used for hand-assembled methods (patch authoring, fixtures, benches).
//! Branches name labels; `finish` resolves them to instruction indices.

use crate::class::{CompiledMethod, ExceptionHandler};
use crate::frame::{Analyzer, FrameError};
use crate::insn::Insn;
use crate::opcode::Opcode;
use thiserror::Error;

/// Errors from finishing a builder
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// A branch or handler refers to a label that was never bound
    #[error("Label {0} used but never bound")]
    UnboundLabel(usize),

    /// Frame computation failed on the finished method
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Forward-referencable position in the instruction list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

struct PendingHandler {
    start: Label,
    end: Label,
    handler: Label,
    catch_type: Option<u16>,
}

/// Instruction list builder
#[derive(Default)]
pub struct CodeBuilder {
    insns: Vec<Insn>,
    labels: Vec<Option<usize>>,
    handlers: Vec<PendingHandler>,
}

impl CodeBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an unbound label
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted instruction
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.insns.len());
        self
    }

    /// Allocate a label bound here
    pub fn here(&mut self) -> Label {
        let label = self.new_label();
        self.bind(label);
        label
    }

    /// Emit an operand-free instruction
    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        self.insns.push(Insn::Op(opcode));
        self
    }

    /// Emit an int constant
    pub fn iconst(&mut self, value: i32) -> &mut Self {
        self.insns.push(Insn::IConst(value));
        self
    }

    /// Emit a long constant
    pub fn lconst(&mut self, value: i64) -> &mut Self {
        self.insns.push(Insn::LConst(value));
        self
    }

    /// Emit a double constant
    pub fn dconst(&mut self, value: f64) -> &mut Self {
        self.insns.push(Insn::DConst(value));
        self
    }

    /// Emit a load or store
    pub fn local(&mut self, opcode: Opcode, slot: u16) -> &mut Self {
        self.insns.push(Insn::Local(opcode, slot));
        self
    }

    /// Emit an in-place int increment
    pub fn iinc(&mut self, slot: u16, delta: i16) -> &mut Self {
        self.insns.push(Insn::IInc { slot, delta });
        self
    }

    /// Emit a branch to `target`
    pub fn branch(&mut self, opcode: Opcode, target: Label) -> &mut Self {
        self.insns.push(Insn::Branch(opcode, target.0));
        self
    }

    /// Emit a table switch
    pub fn table_switch(&mut self, low: i32, default: Label, targets: &[Label]) -> &mut Self {
        self.insns.push(Insn::TableSwitch {
            low,
            default: default.0,
            targets: targets.iter().map(|l| l.0).collect(),
        });
        self
    }

    /// Emit a pool-operand instruction
    pub fn pool(&mut self, opcode: Opcode, index: u16) -> &mut Self {
        self.insns.push(Insn::Pool(opcode, index));
        self
    }

    /// Emit the call-original marker
    pub fn call_original(&mut self) -> &mut Self {
        self.insns.push(Insn::CallOriginal);
        self
    }

    /// Register an exception handler over `[start, end)`
    pub fn handler(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<u16>,
    ) -> &mut Self {
        self.handlers.push(PendingHandler {
            start,
            end,
            handler,
            catch_type,
        });
        self
    }

    /// Resolve labels into instruction indices
    pub fn finish(self) -> Result<(Vec<Insn>, Vec<ExceptionHandler>), BuildError> {
        let resolve = |label: usize| -> Result<usize, BuildError> {
            self.labels
                .get(label)
                .copied()
                .flatten()
                .ok_or(BuildError::UnboundLabel(label))
        };

        let mut insns = self.insns.clone();
        for insn in &mut insns {
            let mut failed = None;
            insn.map_targets(|label| match resolve(label) {
                Ok(index) => index,
                Err(_) => {
                    failed.get_or_insert(label);
                    label
                }
            });
            if let Some(label) = failed {
                return Err(BuildError::UnboundLabel(label));
            }
        }

        let handlers = self
            .handlers
            .iter()
            .map(|h| {
                Ok(ExceptionHandler {
                    start: resolve(h.start.0)?,
                    end: resolve(h.end.0)?,
                    handler: resolve(h.handler.0)?,
                    catch_type: h.catch_type,
                })
            })
            .collect::<Result<Vec<_>, BuildError>>()?;

        Ok((insns, handlers))
    }

    /// Finish into a method whose limits and frames come from `analyzer`
    pub fn build_method(
        self,
        flags: u16,
        name: &str,
        descriptor: &str,
        analyzer: &Analyzer<'_>,
    ) -> Result<CompiledMethod, BuildError> {
        let (code, handlers) = self.finish()?;
        let method = CompiledMethod {
            flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            max_stack: 0,
            max_locals: 0,
            code,
            handlers,
            frames: Vec::new(),
        };
        Ok(analyzer.recompute(&method)?)
    }
}
