//! Basic-block discovery over the finalized instruction stream.
//!
//! A basic block is a maximal instruction run with no internal control
//! transfer. Block starts are: every script entry from the run table, every
//! jump/call target, and the instruction after any control transfer
//! (including waits, whose successor is the resume point recorded in the
//! wait index).

use rustc_hash::FxHashMap;

use crate::asm::instruction::{Instr, Pc, Target};

/// Immutable block table for one assembled program, shared by every
/// per-script compiler.
#[derive(Debug)]
pub struct BlockMap {
    starts: Vec<Pc>,
    index_of: FxHashMap<Pc, usize>,
    code_len: usize,
}

impl BlockMap {
    /// Build the table from the finalized stream and the run-table entry
    /// points.
    pub fn build(code: &[Instr], entries: impl IntoIterator<Item = Pc>) -> BlockMap {
        let mut starts: Vec<Pc> = Vec::new();
        if !code.is_empty() {
            starts.push(0);
        }
        for pc in entries {
            if (pc as usize) < code.len() {
                starts.push(pc);
            }
        }
        for (pc, instr) in code.iter().enumerate() {
            if let Some(Target::Pc(t)) = instr.op.target() {
                if (t as usize) < code.len() {
                    starts.push(t);
                }
            }
            if instr.op.is_control() && pc + 1 < code.len() {
                starts.push((pc + 1) as Pc);
            }
        }
        starts.sort_unstable();
        starts.dedup();
        let index_of = starts
            .iter()
            .enumerate()
            .map(|(i, &pc)| (pc, i))
            .collect();
        BlockMap {
            starts,
            index_of,
            code_len: code.len(),
        }
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.starts.len()
    }

    /// Whether `pc` starts a block.
    pub fn is_start(&self, pc: Pc) -> bool {
        self.index_of.contains_key(&pc)
    }

    /// Index of the block starting at `pc`.
    pub fn block_index(&self, pc: Pc) -> Option<usize> {
        self.index_of.get(&pc).copied()
    }

    /// Inclusive `[start, last]` range of the block starting at `pc`.
    pub fn block_range(&self, pc: Pc) -> Option<(Pc, Pc)> {
        let idx = self.block_index(pc)?;
        let start = self.starts[idx];
        let last = match self.starts.get(idx + 1) {
            Some(&next) => next - 1,
            None => (self.code_len as Pc).saturating_sub(1),
        };
        Some((start, last))
    }
}
