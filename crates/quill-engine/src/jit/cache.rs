//! Per-script compiled-block cache.
//!
//! A monotonic memoization table keyed by block entry address: blocks are
//! compiled on first execution, read-only after creation, and never
//! invalidated within one execution session (the underlying bytecode is
//! immutable after assembly finalization). A compilation failure latches the
//! whole script into interpreter-only execution; a script is never partly
//! compiled and partly interpreted within one block.

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::asm::instruction::{Instr, Pc};

use super::analysis::BlockMap;
use super::backend::{BlockCompiler, BlockFn};
use super::CompileError;

/// Every native block compiled for one script, plus the module that owns
/// their code memory.
pub struct CompiledScript {
    compiler: BlockCompiler,
    blocks: FxHashMap<Pc, BlockFn>,
    broken: bool,
}

impl CompiledScript {
    /// Fresh, empty cache with its own JIT module.
    pub fn new() -> Result<Self, CompileError> {
        Ok(CompiledScript {
            compiler: BlockCompiler::new()?,
            blocks: FxHashMap::default(),
            broken: false,
        })
    }

    /// Fetch the block starting at `pc`, compiling it on first use.
    pub fn get_or_compile(
        &mut self,
        pc: Pc,
        code: &[Instr],
        blocks: &BlockMap,
    ) -> Result<BlockFn, CompileError> {
        if self.broken {
            return Err(CompileError::Disabled);
        }
        if let Some(&f) = self.blocks.get(&pc) {
            return Ok(f);
        }
        match self.compiler.compile_block(pc, code, blocks) {
            Ok(f) => {
                self.blocks.insert(pc, f);
                Ok(f)
            }
            Err(e) => {
                warn!(pc, error = %e, "block compilation failed; script latched to interpreter");
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Number of blocks compiled so far.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Whether compilation has been disabled for this script.
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}
