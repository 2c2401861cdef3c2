//! Per-method control-flow graphs.
//!
//! The CFG is produced upstream by the dataflow collaborator; this module
//! fixes its shape. Each graph has one entry block, one normal-exit block,
//! and a *single* exceptional-exit block aggregating all uncaught throws.
//! Because of that single block, the analysis cannot distinguish which
//! exception type caused an exit; exception type names appear on call edges
//! and throws only so the ignored-exception policy can filter them.
//!
//! Straight-line instructions never throw. Anything that can complete
//! abruptly (a call, an explicit throw) is a block terminator with explicit
//! edges, which is what gives the consistency analyzer its normal-edge /
//! exceptional-edge asymmetry.

use crate::error::{Error, Result};
use crate::hir::TypeRef;
use serde::Serialize;
use std::fmt;

/// Index of a basic block within its [`Cfg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BlockId(pub usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// A point inside a method body: a block plus an instruction index.
/// Terminators sit at index `instrs.len()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ProgramPoint {
    pub block: BlockId,
    pub index: usize,
}

impl fmt::Display for ProgramPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.index)
    }
}

/// Reference to a callee by receiver type and method name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    /// Name of the type declaring the callee. May be undeclared (external).
    pub on: String,
    pub name: String,
}

impl MethodRef {
    pub fn new(on: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            on: on.into(),
            name: name.into(),
        }
    }
}

/// Right-hand side of a straight-line assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rvalue {
    /// Copy of an existing expression: the target becomes an alias.
    Use(String),
    /// Direct, non-throwing allocation of a fresh value of `ty`.
    Alloc { ty: TypeRef },
    /// Read of `object.field`.
    FieldRead { object: String, field: String },
}

/// A non-throwing instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    Assign { lhs: String, rvalue: Rvalue },
}

/// An exceptional out-edge, tagged with the exception type that rides it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrowEdge {
    pub exception: String,
    pub target: BlockId,
}

/// Block terminator. Calls and throws carry their abrupt-completion edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Goto(BlockId),
    /// Two-way branch; the condition itself is abstracted away.
    Branch { then_target: BlockId, else_target: BlockId },
    /// Method invocation. `normal` receives control when the call returns;
    /// each [`ThrowEdge`] receives control when the call throws that
    /// exception (a handler block, or the exceptional exit).
    Call {
        callee: MethodRef,
        receiver: Option<String>,
        args: Vec<String>,
        dest: Option<String>,
        normal: BlockId,
        exceptional: Vec<ThrowEdge>,
    },
    /// Explicit throw; `target` is the handler or the exceptional exit.
    Throw { exception: String, target: BlockId },
    /// Normal return; flows to the normal-exit block.
    Return { value: Option<String> },
    /// Terminator of the two exit blocks.
    Exit,
}

/// A basic block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
}

/// A method body in control-flow-graph form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cfg {
    blocks: Vec<Block>,
    pub entry: BlockId,
    pub normal_exit: BlockId,
    pub exceptional_exit: BlockId,
}

impl Cfg {
    pub fn block(&self, id: BlockId) -> Result<&Block> {
        self.blocks
            .get(id.0)
            .ok_or_else(|| Error::malformed_cfg(format!("no such block: {id}")))
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len()).map(BlockId)
    }

    /// All out-edges of a terminator, exceptional ones included.
    pub fn successors(&self, block: &Block) -> Vec<BlockId> {
        match &block.terminator {
            Terminator::Goto(t) => vec![*t],
            Terminator::Branch {
                then_target,
                else_target,
            } => vec![*then_target, *else_target],
            Terminator::Call {
                normal,
                exceptional,
                ..
            } => {
                let mut out = vec![*normal];
                out.extend(exceptional.iter().map(|e| e.target));
                out
            }
            Terminator::Throw { target, .. } => vec![*target],
            Terminator::Return { .. } => vec![self.normal_exit],
            Terminator::Exit => vec![],
        }
    }

    /// Check edge targets and the distinguished blocks before analysis.
    pub fn validate(&self) -> Result<()> {
        for id in [self.entry, self.normal_exit, self.exceptional_exit] {
            self.block(id)?;
        }
        for id in self.block_ids() {
            let block = self.block(id)?;
            for succ in self.successors(block) {
                self.block(succ).map_err(|_| {
                    Error::malformed_cfg(format!("block {id} has dangling edge to {succ}"))
                })?;
            }
        }
        if !matches!(self.block(self.normal_exit)?.terminator, Terminator::Exit) {
            return Err(Error::malformed_cfg("normal exit block must not have successors"));
        }
        if !matches!(
            self.block(self.exceptional_exit)?.terminator,
            Terminator::Exit
        ) {
            return Err(Error::malformed_cfg(
                "exceptional exit block must not have successors",
            ));
        }
        Ok(())
    }
}

/// Incremental builder for [`Cfg`]s.
///
/// The two exit blocks are created up front; every other block is created
/// with [`CfgBuilder::add_block`]. The first added block is the entry.
#[derive(Debug)]
pub struct CfgBuilder {
    blocks: Vec<(Vec<Instr>, Option<Terminator>)>,
    entry: Option<BlockId>,
}

impl Default for CfgBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CfgBuilder {
    pub fn new() -> Self {
        Self {
            // Slots 0 and 1 are the normal and exceptional exits.
            blocks: vec![(Vec::new(), Some(Terminator::Exit)); 2],
            entry: None,
        }
    }

    pub fn normal_exit(&self) -> BlockId {
        BlockId(0)
    }

    pub fn exceptional_exit(&self) -> BlockId {
        BlockId(1)
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push((Vec::new(), None));
        if self.entry.is_none() {
            self.entry = Some(id);
        }
        id
    }

    pub fn assign(&mut self, block: BlockId, lhs: impl Into<String>, rvalue: Rvalue) -> &mut Self {
        self.blocks[block.0].0.push(Instr::Assign {
            lhs: lhs.into(),
            rvalue,
        });
        self
    }

    pub fn terminate(&mut self, block: BlockId, terminator: Terminator) -> &mut Self {
        self.blocks[block.0].1 = Some(terminator);
        self
    }

    /// Finish the graph. Blocks left unterminated fall through to a plain
    /// `return`.
    pub fn finish(self) -> Cfg {
        let entry = self.entry.unwrap_or(BlockId(0));
        let blocks = self
            .blocks
            .into_iter()
            .map(|(instrs, terminator)| Block {
                instrs,
                terminator: terminator.unwrap_or(Terminator::Return { value: None }),
            })
            .collect();
        Cfg {
            blocks,
            entry,
            normal_exit: BlockId(0),
            exceptional_exit: BlockId(1),
        }
    }
}
