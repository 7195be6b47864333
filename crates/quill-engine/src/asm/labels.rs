//! Label-usage index.
//!
//! A label id has no inherent position; it becomes meaningful when the
//! instruction carrying it is pinned to a program-counter address. Besides
//! operand slots inside instruction lists, labels are referenced from
//! *external cells*: run-table start/end pairs, debug-scope start/end pairs,
//! and prologue-end markers. This index tracks those cells so that label
//! merges performed by the optimizer are pure table rewrites with no
//! dangling references.
//!
//! Scope-boundary ids (debug-scope and prologue-end anchors) are protected:
//! passes must never drop them, only re-anchor them to a surviving
//! instruction.

use rustc_hash::{FxHashMap, FxHashSet};

use super::instruction::LabelId;

/// What an external cell anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// Run-table boundary (script start or end).
    Run,
    /// Debug-scope boundary or prologue-end marker.
    Scope,
}

/// Handle to a registered external cell.
pub type CellId = usize;

/// Index of every external reference to a label, plus the alias record left
/// behind by merges.
#[derive(Debug, Default)]
pub struct LabelIndex {
    cells: Vec<(LabelId, CellKind)>,
    by_label: FxHashMap<LabelId, Vec<CellId>>,
    scope_labels: FxHashSet<LabelId>,
    aliases: FxHashMap<LabelId, LabelId>,
}

impl LabelIndex {
    /// An empty index.
    pub fn new() -> Self {
        LabelIndex::default()
    }

    /// Register an external cell holding `label`.
    pub fn register_cell(&mut self, label: LabelId, kind: CellKind) -> CellId {
        let id = self.cells.len();
        self.cells.push((label, kind));
        self.by_label.entry(label).or_default().push(id);
        if kind == CellKind::Scope {
            self.scope_labels.insert(label);
        }
        id
    }

    /// Mark a label as a scope boundary without registering a cell.
    pub fn protect(&mut self, label: LabelId) {
        self.scope_labels.insert(label);
    }

    /// Whether a label anchors a debug scope (and must survive).
    pub fn is_scope_label(&self, label: LabelId) -> bool {
        self.scope_labels.contains(&label)
    }

    /// Current label held by a cell.
    pub fn cell_label(&self, cell: CellId) -> LabelId {
        self.cells[cell].0
    }

    /// Rewrite every cell holding `from` to hold `into` instead. When
    /// `scope_cells` is false only run cells are touched; when true only
    /// scope cells are.
    pub fn rewrite_cells(&mut self, from: LabelId, into: LabelId, scope_cells: bool) {
        if from == into {
            return;
        }
        let Some(mut ids) = self.by_label.remove(&from) else {
            return;
        };
        let mut moved = Vec::new();
        {
            let cells = &self.cells;
            ids.retain(|&id| {
                let is_scope = cells[id].1 == CellKind::Scope;
                if is_scope == scope_cells {
                    moved.push(id);
                    false
                } else {
                    true
                }
            });
        }
        if !ids.is_empty() {
            self.by_label.insert(from, ids);
        }
        for id in moved {
            self.cells[id].0 = into;
            self.by_label.entry(into).or_default().push(id);
        }
    }

    /// Rewrite every cell holding `from`, scope and run alike.
    pub fn rewrite_all_cells(&mut self, from: LabelId, into: LabelId) {
        self.rewrite_cells(from, into, false);
        self.rewrite_cells(from, into, true);
    }

    /// Record that `from` was merged into `into`: references to `from`
    /// elsewhere in the program resolve through `into` from now on.
    pub fn record_alias(&mut self, from: LabelId, into: LabelId) {
        if from != into {
            self.aliases.insert(from, into);
        }
    }

    /// Follow the alias chain left behind by merges.
    pub fn resolve(&self, label: LabelId) -> LabelId {
        let mut cur = label;
        // Chains are short; the bound guards against a malformed cycle.
        for _ in 0..self.aliases.len() + 1 {
            match self.aliases.get(&cur) {
                Some(&next) => cur = next,
                None => return cur,
            }
        }
        cur
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_follow_rewrites() {
        let mut idx = LabelIndex::new();
        let run = idx.register_cell(7, CellKind::Run);
        let scope = idx.register_cell(7, CellKind::Scope);

        idx.rewrite_cells(7, 9, false);
        assert_eq!(idx.cell_label(run), 9);
        assert_eq!(idx.cell_label(scope), 7);

        idx.rewrite_cells(7, 11, true);
        assert_eq!(idx.cell_label(scope), 11);
    }

    #[test]
    fn rewrite_all_moves_both_kinds() {
        let mut idx = LabelIndex::new();
        let run = idx.register_cell(3, CellKind::Run);
        let scope = idx.register_cell(3, CellKind::Scope);
        idx.rewrite_all_cells(3, 4);
        assert_eq!(idx.cell_label(run), 4);
        assert_eq!(idx.cell_label(scope), 4);
        // Further rewrites of the new id keep following.
        idx.rewrite_all_cells(4, 5);
        assert_eq!(idx.cell_label(run), 5);
        assert_eq!(idx.cell_label(scope), 5);
    }

    #[test]
    fn scope_protection_tracks_registration() {
        let mut idx = LabelIndex::new();
        idx.register_cell(1, CellKind::Run);
        idx.register_cell(2, CellKind::Scope);
        idx.protect(3);
        assert!(!idx.is_scope_label(1));
        assert!(idx.is_scope_label(2));
        assert!(idx.is_scope_label(3));
    }

    #[test]
    fn alias_chains_resolve() {
        let mut idx = LabelIndex::new();
        idx.record_alias(1, 2);
        idx.record_alias(2, 5);
        assert_eq!(idx.resolve(1), 5);
        assert_eq!(idx.resolve(2), 5);
        assert_eq!(idx.resolve(5), 5);
        assert_eq!(idx.resolve(99), 99);
    }
}
