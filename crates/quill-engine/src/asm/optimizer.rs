//! Peephole optimizer.
//!
//! Rewrites a function's instruction list without changing observable
//! behavior: dead code, redundant data movement, and branch-encoding form
//! may change; the ordered multiset of side-effecting operations and all
//! register/stack outcomes may not.
//!
//! The sequence lives in a slot arena (`Vec<Option<Instr>>`) so deletion is
//! O(1) and never invalidates the operand-use side table. Passes run in a
//! fixed order, and the whole order is repeated until a full sweep changes
//! nothing.

use rustc_hash::FxHashMap;
use tracing::debug;

use super::instruction::{
    invert_cmp, Instr, LabelId, Op, Target, CMP_BOOL, CMP_FLAGS, CMP_SETI,
};
use super::labels::LabelIndex;

/// Upper bound on full-sequence sweeps; each sweep only repeats if the
/// previous one changed something.
const MAX_SWEEPS: usize = 8;

/// Optimize one function body. `index` carries the external label cells and
/// scope-boundary set; merges performed here keep it consistent. Binding
/// functions pass `only_remove_nops` since their bodies are invariant
/// contracts. Returns the rewritten list and the number of instructions
/// eliminated.
pub fn optimize_code(
    code: Vec<Instr>,
    index: &mut LabelIndex,
    only_remove_nops: bool,
) -> (Vec<Instr>, u32) {
    let mut opt = Opt::new(code, index);

    opt.trim_nops();
    if only_remove_nops {
        return opt.finish();
    }

    for _ in 0..MAX_SWEEPS {
        let before = opt.revision;
        opt.peek_at_zero();
        opt.store_then_load();
        opt.batch_pops();
        opt.batch_pushes();
        opt.goto_if_never();
        opt.canonicalize_gotos();
        opt.merge_consecutive_gotos();
        opt.merge_gotocmp_pairs();
        opt.goto_to_next();
        opt.fuse_gotocmp_over_goto();
        opt.merge_consecutive_gotos();
        opt.goto_to_next();
        opt.set_then_trace();
        opt.trim_nops();
        if opt.revision == before {
            break;
        }
    }

    opt.finish()
}

enum Trash {
    Deleted,
    Kept,
    Holder,
}

struct Opt<'a> {
    slots: Vec<Option<Instr>>,
    /// Label id -> slots whose jump/call operand references it.
    uses: FxHashMap<LabelId, Vec<usize>>,
    index: &'a mut LabelIndex,
    saved: u32,
    /// Bumped on every structural change; drives the sweep loop.
    revision: u64,
}

impl<'a> Opt<'a> {
    fn new(code: Vec<Instr>, index: &'a mut LabelIndex) -> Self {
        let mut uses: FxHashMap<LabelId, Vec<usize>> = FxHashMap::default();
        for (i, instr) in code.iter().enumerate() {
            if let Some(Target::Label(l)) = instr.op.target() {
                uses.entry(l).or_default().push(i);
            }
        }
        Opt {
            slots: code.into_iter().map(Some).collect(),
            uses,
            index,
            saved: 0,
            revision: 0,
        }
    }

    fn finish(self) -> (Vec<Instr>, u32) {
        let out: Vec<Instr> = self.slots.into_iter().flatten().collect();
        if self.saved > 0 {
            debug!(saved = self.saved, "peephole pass eliminated instructions");
        }
        (out, self.saved)
    }

    fn next_live(&self, i: usize) -> Option<usize> {
        (i + 1..self.slots.len()).find(|&j| self.slots[j].is_some())
    }

    fn first_live(&self) -> Option<usize> {
        (0..self.slots.len()).find(|&j| self.slots[j].is_some())
    }

    fn instr(&self, i: usize) -> &Instr {
        self.slots[i].as_ref().unwrap()
    }

    fn instr_mut(&mut self, i: usize) -> &mut Instr {
        self.slots[i].as_mut().unwrap()
    }

    /// Drop the operand-use record of slot `i`, if it has one.
    fn remove_use(&mut self, i: usize) {
        if let Some(Target::Label(l)) = self.instr(i).op.target() {
            if let Some(sites) = self.uses.get_mut(&l) {
                sites.retain(|&s| s != i);
            }
        }
    }

    /// Point slot `i`'s jump operand at a new label, keeping `uses` sound.
    fn retarget(&mut self, i: usize, new_label: LabelId) {
        self.remove_use(i);
        if let Some(t) = self.instr_mut(i).op.target_mut() {
            *t = Target::Label(new_label);
        }
        self.uses.entry(new_label).or_default().push(i);
        self.revision += 1;
    }

    fn delete(&mut self, i: usize) {
        self.remove_use(i);
        self.slots[i] = None;
        self.saved += 1;
        self.revision += 1;
    }

    /// Merge label `from` into `into`: every operand use, run cell, and
    /// scope cell of `from` now points at `into`'s carrier.
    fn merge_labels(&mut self, into: LabelId, from: LabelId) {
        if into == from {
            return;
        }
        if let Some(sites) = self.uses.remove(&from) {
            for &s in &sites {
                if let Some(instr) = self.slots[s].as_mut() {
                    if let Some(t) = instr.op.target_mut() {
                        *t = Target::Label(into);
                    }
                }
            }
            self.uses.entry(into).or_default().extend(sites);
        }
        self.index.rewrite_all_cells(from, into);
        self.index.record_alias(from, into);
        self.revision += 1;
    }

    /// Delete slot `i`, forwarding its label onto the next live instruction
    /// (or converting the slot into a bare label holder when nothing
    /// follows). Scope-boundary carriers are left alone unless they are the
    /// first instruction.
    fn trash(&mut self, i: usize) -> Trash {
        let label = self.instr(i).label;
        if let Some(l) = label {
            if self.index.is_scope_label(l) && self.first_live() != Some(i) {
                return Trash::Kept;
            }
        }
        let comment = std::mem::take(&mut self.instr_mut(i).comment);
        let next = self.next_live(i);

        if label.is_none() {
            if let Some(j) = next {
                self.instr_mut(j).merge_comment(&comment, true);
            }
            self.delete(i);
            return Trash::Deleted;
        }
        let Some(j) = next else {
            // Nothing follows: the label survives on a bare holder.
            let instr = self.instr_mut(i);
            instr.comment = comment;
            if instr.op != Op::Nop {
                instr.op = Op::Nop;
                self.revision += 1;
            }
            return Trash::Holder;
        };
        self.instr_mut(j).merge_comment(&comment, true);
        let from = label.unwrap();
        match self.instr(j).label {
            None => {
                self.instr_mut(j).label = Some(from);
                self.delete(i);
            }
            Some(into) => {
                self.delete(i);
                self.merge_labels(into, from);
            }
        }
        Trash::Deleted
    }

    // ===== Passes =====

    /// Trim no-op instructions, preserving their labels.
    fn trim_nops(&mut self) {
        for i in 0..self.slots.len() {
            let Some(instr) = self.slots[i].as_ref() else {
                continue;
            };
            if instr.op != Op::Nop {
                continue;
            }
            // A bare holder (label, nothing after) stays as-is.
            if instr.label.is_some() && self.next_live(i).is_none() {
                continue;
            }
            let _ = self.trash(i);
        }
    }

    /// `PeekAt r, 0` is just `Peek r`.
    fn peek_at_zero(&mut self) {
        for i in 0..self.slots.len() {
            if let Some(instr) = self.slots[i].as_mut() {
                if let Op::PeekAt(r, 0) = instr.op {
                    instr.op = Op::Peek(r);
                    self.revision += 1;
                }
            }
        }
    }

    /// A store immediately followed by a load of the same register and slot
    /// leaves the register already holding the loaded value.
    fn store_then_load(&mut self) {
        for i in 0..self.slots.len() {
            let Some(instr) = self.slots[i].as_ref() else {
                continue;
            };
            let Op::Store(r, off) = instr.op else {
                continue;
            };
            let Some(j) = self.next_live(i) else {
                continue;
            };
            let next = self.instr(j);
            if next.op == Op::Load(r, off) && next.label.is_none() {
                let comment = next.comment.clone();
                self.instr_mut(i).merge_comment(&comment, false);
                self.delete(j);
            }
        }
    }

    /// Coalesce consecutive identical pops; a lone pop feeding a push of the
    /// same register becomes a non-destructive peek.
    fn batch_pops(&mut self) {
        for i in 0..self.slots.len() {
            let Some(instr) = self.slots[i].as_ref() else {
                continue;
            };
            let (reg, start_count) = match instr.op {
                Op::Pop(r) => (r, 1u32),
                Op::PopArgs(r, n) => (r, n),
                _ => continue,
            };
            let mut added = 0u32;
            while let Some(j) = self.next_live(i) {
                let next = self.instr(j);
                if next.label.is_some() {
                    break;
                }
                match next.op {
                    Op::Pop(r) if r == reg => added += 1,
                    Op::PopArgs(r, n) if r == reg => added += n,
                    _ => break,
                }
                let comment = next.comment.clone();
                self.instr_mut(i).merge_comment(&comment, false);
                self.delete(j);
            }
            if added > 0 {
                self.instr_mut(i).op = Op::PopArgs(reg, start_count + added);
                self.revision += 1;
                continue;
            }
            if start_count == 1 {
                // Lone pop: peek conversion when the next op pushes the
                // popped register straight back.
                if let Some(j) = self.next_live(i) {
                    let next = self.instr(j);
                    if next.op == Op::PushReg(reg) && next.label.is_none() {
                        let comment = next.comment.clone();
                        self.instr_mut(i).merge_comment(&comment, false);
                        self.delete(j);
                        self.instr_mut(i).op = Op::Peek(reg);
                        continue;
                    }
                }
                if let Op::PopArgs(r, 1) = self.instr(i).op {
                    self.instr_mut(i).op = Op::Pop(r);
                    self.revision += 1;
                }
            }
        }
    }

    /// Coalesce consecutive identical pushes (register and immediate forms).
    fn batch_pushes(&mut self) {
        enum Head {
            Reg(u32, u32),
            Imm(i32, u32),
        }
        for i in 0..self.slots.len() {
            let Some(instr) = self.slots[i].as_ref() else {
                continue;
            };
            let mut head = match instr.op {
                Op::PushReg(r) => Head::Reg(r, 1),
                Op::PushArgsReg(r, n) => Head::Reg(r, n),
                Op::PushImm(v) => Head::Imm(v, 1),
                Op::PushArgsImm(v, n) => Head::Imm(v, n),
                _ => continue,
            };
            let mut added = 0u32;
            while let Some(j) = self.next_live(i) {
                let next = self.instr(j);
                if next.label.is_some() {
                    break;
                }
                let grown = match (&head, next.op) {
                    (Head::Reg(r, _), Op::PushReg(r2)) if *r == r2 => 1,
                    (Head::Reg(r, _), Op::PushArgsReg(r2, n)) if *r == r2 => n,
                    (Head::Imm(v, _), Op::PushImm(v2)) if *v == v2 => 1,
                    (Head::Imm(v, _), Op::PushArgsImm(v2, n)) if *v == v2 => n,
                    _ => break,
                };
                added += grown;
                let comment = next.comment.clone();
                self.instr_mut(i).merge_comment(&comment, false);
                self.delete(j);
            }
            if added > 0 {
                match &mut head {
                    Head::Reg(_, n) | Head::Imm(_, n) => *n += added,
                }
                self.instr_mut(i).op = match head {
                    Head::Reg(r, n) => Op::PushArgsReg(r, n),
                    Head::Imm(v, n) => Op::PushArgsImm(v, n),
                };
                self.revision += 1;
            } else if let Op::PushArgsReg(r, 1) = self.instr(i).op {
                self.instr_mut(i).op = Op::PushReg(r);
                self.revision += 1;
            } else if let Op::PushArgsImm(v, 1) = self.instr(i).op {
                self.instr_mut(i).op = Op::PushImm(v);
                self.revision += 1;
            }
        }
    }

    /// A conditional jump with an empty outcome mask never fires.
    fn goto_if_never(&mut self) {
        for i in 0..self.slots.len() {
            let Some(instr) = self.slots[i].as_ref() else {
                continue;
            };
            if let Op::GotoCmp(_, cmp) = instr.op {
                if cmp & CMP_FLAGS == 0 {
                    let _ = self.trash(i);
                }
            }
        }
    }

    /// Convert boolean-result conditional gotos into the canonical
    /// compare-mask form.
    fn canonicalize_gotos(&mut self) {
        for i in 0..self.slots.len() {
            let Some(instr) = self.slots[i].as_mut() else {
                continue;
            };
            let new_op = match instr.op {
                Op::GotoTrue(t) | Op::GotoFalse(t) | Op::GotoMore(t) | Op::GotoLess(t) => {
                    let mask = instr.op.consumer_mask().unwrap();
                    Some(Op::GotoCmp(t, mask))
                }
                _ => None,
            };
            if let Some(op) = new_op {
                instr.op = op;
                self.revision += 1;
            }
        }
    }

    /// Two identical unconditional jumps in a row need only the second.
    fn merge_consecutive_gotos(&mut self) {
        for i in 0..self.slots.len() {
            let Some(instr) = self.slots[i].as_ref() else {
                continue;
            };
            let Op::Goto(t1) = instr.op else {
                continue;
            };
            let Some(j) = self.next_live(i) else {
                continue;
            };
            if self.instr(j).op != Op::Goto(t1) {
                continue;
            }
            self.drop_first_of_pair(i, j);
        }
    }

    /// Delete slot `i` in favor of the following slot `j`, moving or merging
    /// `i`'s label onto `j`.
    fn drop_first_of_pair(&mut self, i: usize, j: usize) {
        let label = self.instr(i).label;
        let comment = std::mem::take(&mut self.instr_mut(i).comment);
        self.instr_mut(j).merge_comment(&comment, true);
        match (label, self.instr(j).label) {
            (Some(l), None) => {
                self.instr_mut(j).label = Some(l);
                self.delete(i);
            }
            (Some(l), Some(l2)) => {
                self.delete(i);
                self.merge_labels(l2, l);
            }
            (None, _) => self.delete(i),
        }
    }

    /// Merge two canonical conditional jumps that share a target by OR-ing
    /// their outcome masks into the second; a full mask downgrades to an
    /// unconditional jump.
    fn merge_gotocmp_pairs(&mut self) {
        for i in 0..self.slots.len() {
            let Some(instr) = self.slots[i].as_ref() else {
                continue;
            };
            let Op::GotoCmp(t1, c1_raw) = instr.op else {
                continue;
            };
            let c1 = c1_raw & !CMP_SETI;
            if c1 != c1_raw {
                self.instr_mut(i).op = Op::GotoCmp(t1, c1);
                self.revision += 1;
            }
            if let Some(j) = self.next_live(i) {
                if let Op::GotoCmp(t2, c2) = self.instr(j).op {
                    if t1 == t2 && (c1 & CMP_BOOL) == (c2 & CMP_BOOL) {
                        let merged = (c2 & !CMP_SETI) | c1;
                        self.instr_mut(j).op = Op::GotoCmp(t2, merged);
                        self.drop_first_of_pair(i, j);
                        continue;
                    }
                }
            }
            if c1 & CMP_FLAGS == CMP_FLAGS {
                self.instr_mut(i).op = Op::Goto(t1);
                self.revision += 1;
            }
        }
    }

    /// A jump whose target is the very next instruction does nothing.
    fn goto_to_next(&mut self) {
        for i in 0..self.slots.len() {
            let Some(instr) = self.slots[i].as_ref() else {
                continue;
            };
            let target = match instr.op {
                Op::Goto(Target::Label(l)) | Op::GotoCmp(Target::Label(l), _) => l,
                _ => continue,
            };
            let Some(j) = self.next_live(i) else {
                continue;
            };
            if self.instr(j).label != Some(target) {
                continue;
            }
            self.drop_first_of_pair(i, j);
        }
    }

    /// `GotoCmp(L); Goto(X); L: ...` — jump straight to X on the inverted
    /// condition. Any label on the deleted Goto is redirected: code
    /// references follow it to X, while a scope anchor is transplanted onto
    /// the next surviving instruction so the scope-range table stays sound.
    fn fuse_gotocmp_over_goto(&mut self) {
        for i in 0..self.slots.len() {
            let Some(instr) = self.slots[i].as_ref() else {
                continue;
            };
            let Op::GotoCmp(Target::Label(t), c) = instr.op else {
                continue;
            };
            let Some(j) = self.next_live(i) else {
                continue;
            };
            let Some(k) = self.next_live(j) else {
                continue;
            };
            if self.instr(k).label != Some(t) {
                continue;
            }
            let Op::Goto(Target::Label(x)) = self.instr(j).op else {
                continue;
            };
            if let Some(jl) = self.instr(j).label {
                // Other jumps to the deleted Goto really want its
                // destination; run cells follow the same redirect.
                if let Some(sites) = self.uses.remove(&jl) {
                    for &s in &sites {
                        if s == j {
                            continue;
                        }
                        if let Some(si) = self.slots[s].as_mut() {
                            if let Some(tgt) = si.op.target_mut() {
                                *tgt = Target::Label(x);
                            }
                        }
                        self.uses.entry(x).or_default().push(s);
                    }
                }
                self.index.rewrite_cells(jl, x, false);
                // The scope anchor must keep its physical position: attach
                // it to the instruction after the deleted Goto.
                self.index.rewrite_cells(jl, t, true);
            }
            let goto_comment = self.instr(j).comment.clone();
            self.instr_mut(i).merge_comment(&goto_comment, false);
            self.retarget(i, x);
            self.instr_mut(i).op = Op::GotoCmp(Target::Label(x), invert_cmp(c));
            // The Goto's label bookkeeping is done by hand above.
            self.instr_mut(j).label = None;
            self.delete(j);
        }
    }

    /// `SetImm r, v` feeding only a `TraceReg r` is a `TraceImm v`.
    fn set_then_trace(&mut self) {
        for i in 0..self.slots.len() {
            let Some(instr) = self.slots[i].as_ref() else {
                continue;
            };
            let Op::SetImm(r, v) = instr.op else {
                continue;
            };
            let Some(j) = self.next_live(i) else {
                continue;
            };
            if self.instr(j).op != Op::TraceReg(r) {
                continue;
            }
            let set_label = instr.label;
            let trace_label = self.instr(j).label;
            let trace_comment = self.instr(j).comment.clone();
            self.delete(j);
            let merged_label = match (set_label, trace_label) {
                (Some(sl), Some(tl)) => {
                    self.merge_labels(sl, tl);
                    Some(sl)
                }
                (None, Some(tl)) => Some(tl),
                (sl, None) => sl,
            };
            let instr = self.instr_mut(i);
            instr.op = Op::TraceImm(v);
            instr.label = merged_label;
            instr.merge_comment(&trace_comment, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::instruction::{d, CMP_EQ, CMP_GE, CMP_LE, CMP_NE};
    use crate::asm::labels::CellKind;

    fn ops(code: &[Instr]) -> Vec<Op> {
        code.iter().map(|i| i.op).collect()
    }

    fn run(code: Vec<Instr>) -> Vec<Instr> {
        let mut index = LabelIndex::new();
        optimize_code(code, &mut index, false).0
    }

    #[test]
    fn pushes_batch_into_one() {
        let code = vec![
            Instr::new(Op::PushReg(d(3))),
            Instr::new(Op::PushReg(d(3))),
            Instr::new(Op::PushReg(d(3))),
            Instr::new(Op::PushReg(d(3))),
            Instr::new(Op::Quit),
        ];
        assert_eq!(run(code), vec![
            Instr::new(Op::PushArgsReg(d(3), 4)),
            Instr::new(Op::Quit),
        ]);
    }

    #[test]
    fn push_batching_breaks_on_other_register() {
        let code = vec![
            Instr::new(Op::PushReg(d(3))),
            Instr::new(Op::PushReg(d(3))),
            Instr::new(Op::PushReg(d(2))),
            Instr::new(Op::PushReg(d(3))),
            Instr::new(Op::Quit),
        ];
        assert_eq!(
            ops(&run(code)),
            vec![
                Op::PushArgsReg(d(3), 2),
                Op::PushReg(d(2)),
                Op::PushReg(d(3)),
                Op::Quit,
            ]
        );
    }

    #[test]
    fn pops_batch_into_one() {
        let code = vec![
            Instr::new(Op::Pop(d(3))),
            Instr::new(Op::Pop(d(3))),
            Instr::new(Op::Pop(d(3))),
            Instr::new(Op::Pop(d(3))),
            Instr::new(Op::Quit),
        ];
        assert_eq!(
            ops(&run(code)),
            vec![Op::PopArgs(d(3), 4), Op::Quit]
        );
    }

    #[test]
    fn lone_pop_then_push_becomes_peek() {
        let code = vec![
            Instr::new(Op::Pop(d(4))),
            Instr::new(Op::PushReg(d(4))),
            Instr::new(Op::Quit),
        ];
        assert_eq!(ops(&run(code)), vec![Op::Peek(d(4)), Op::Quit]);
    }

    #[test]
    fn store_then_load_drops_the_load() {
        let code = vec![
            Instr::new(Op::Store(d(1), 20_000)),
            Instr::new(Op::Load(d(1), 20_000)),
            Instr::new(Op::Quit),
        ];
        assert_eq!(ops(&run(code)), vec![Op::Store(d(1), 20_000), Op::Quit]);
    }

    #[test]
    fn store_then_load_respects_labels() {
        // A labeled load is a jump target; it must survive.
        let code = vec![
            Instr::new(Op::Store(d(1), 0)),
            Instr::new(Op::Load(d(1), 0)).with_label(5),
            Instr::new(Op::Goto(Target::Label(5))),
        ];
        let out = run(code);
        assert_eq!(
            ops(&out),
            vec![Op::Store(d(1), 0), Op::Load(d(1), 0), Op::Goto(Target::Label(5))]
        );
    }

    #[test]
    fn nop_trim_forwards_label() {
        let code = vec![
            Instr::new(Op::Nop).with_label(9),
            Instr::new(Op::TraceImm(1)),
            Instr::new(Op::Goto(Target::Label(9))),
        ];
        let out = run(code);
        assert_eq!(out[0].op, Op::TraceImm(1));
        assert_eq!(out[0].label, Some(9));
    }

    #[test]
    fn trailing_nop_becomes_label_holder() {
        let code = vec![
            Instr::new(Op::Goto(Target::Label(2))),
            Instr::new(Op::TraceImm(5)),
            Instr::new(Op::Nop).with_label(2),
        ];
        let out = run(code);
        // The label has nothing after it to forward onto; a bare holder
        // survives so the jump still resolves.
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].op, Op::Nop);
        assert_eq!(out[2].label, Some(2));
    }

    #[test]
    fn nop_trim_merges_labels_and_rewrites_uses() {
        let code = vec![
            Instr::new(Op::Goto(Target::Label(7))),
            Instr::new(Op::Nop).with_label(7),
            Instr::new(Op::TraceImm(1)).with_label(8),
            Instr::new(Op::Quit),
        ];
        let mut index = LabelIndex::new();
        let (out, _) = optimize_code(code, &mut index, false);
        // Label 7 merged into 8, making the goto a jump-to-next, which is
        // then eliminated in turn.
        assert_eq!(ops(&out), vec![Op::TraceImm(1), Op::Quit]);
        assert_eq!(out[0].label, Some(8));
        assert_eq!(index.resolve(7), 8);
    }

    #[test]
    fn legacy_gotos_canonicalize() {
        let code = vec![
            Instr::new(Op::CompareImm(d(2), 0)),
            Instr::new(Op::GotoTrue(Target::Label(1))),
            Instr::new(Op::TraceImm(0)),
            Instr::new(Op::Quit).with_label(1),
        ];
        let out = run(code);
        assert_eq!(out[1].op, Op::GotoCmp(Target::Label(1), CMP_EQ));
    }

    #[test]
    fn gotocmp_superset_absorbs() {
        // Masks GE then EQ on the same target merge into GE.
        let code = vec![
            Instr::new(Op::CompareReg(d(3), d(2))),
            Instr::new(Op::GotoCmp(Target::Label(1), CMP_GE)),
            Instr::new(Op::GotoCmp(Target::Label(1), CMP_EQ)),
            Instr::new(Op::TraceImm(0)),
            Instr::new(Op::Quit).with_label(1),
        ];
        let out = run(code);
        assert_eq!(
            ops(&out),
            vec![
                Op::CompareReg(d(3), d(2)),
                Op::GotoCmp(Target::Label(1), CMP_GE),
                Op::TraceImm(0),
                Op::Quit,
            ]
        );
    }

    #[test]
    fn full_mask_downgrades_to_goto() {
        let code = vec![
            Instr::new(Op::CompareReg(d(3), d(2))),
            Instr::new(Op::GotoCmp(Target::Label(1), CMP_GE)),
            Instr::new(Op::GotoCmp(Target::Label(1), CMP_LE)),
            Instr::new(Op::TraceImm(0)),
            Instr::new(Op::Quit).with_label(1),
        ];
        let out = run(code);
        // GE | LE covers every outcome.
        assert_eq!(out[1].op, Op::Goto(Target::Label(1)));
        assert_eq!(out[2].op, Op::TraceImm(0));
    }

    #[test]
    fn goto_if_never_is_trashed() {
        let code = vec![
            Instr::new(Op::GotoCmp(Target::Label(1), CMP_SETI)),
            Instr::new(Op::TraceImm(0)),
            Instr::new(Op::Quit).with_label(1),
        ];
        let out = run(code);
        assert_eq!(ops(&out), vec![Op::TraceImm(0), Op::Quit]);
    }

    #[test]
    fn jump_to_next_is_removed() {
        let code = vec![
            Instr::new(Op::TraceImm(0)),
            Instr::new(Op::Goto(Target::Label(4))),
            Instr::new(Op::TraceImm(1)).with_label(4),
            Instr::new(Op::Quit),
        ];
        let out = run(code);
        assert_eq!(ops(&out), vec![Op::TraceImm(0), Op::TraceImm(1), Op::Quit]);
        assert_eq!(out[1].label, Some(4));
    }

    #[test]
    fn gotocmp_over_goto_fuses_with_inverted_mask() {
        let code = vec![
            Instr::new(Op::CompareImm(d(2), 0)),
            Instr::new(Op::GotoCmp(Target::Label(1), CMP_EQ)),
            Instr::new(Op::Goto(Target::Label(2))),
            Instr::new(Op::TraceImm(7)).with_label(1),
            Instr::new(Op::Quit).with_label(2),
        ];
        let out = run(code);
        assert_eq!(
            ops(&out),
            vec![
                Op::CompareImm(d(2), 0),
                Op::GotoCmp(Target::Label(2), CMP_NE),
                Op::TraceImm(7),
                Op::Quit,
            ]
        );
        assert_eq!(out[2].label, Some(1));
    }

    #[test]
    fn fusion_transplants_scope_anchor() {
        let mut index = LabelIndex::new();
        // Label 9 is a scope boundary anchored on the Goto that fusion
        // deletes; it must land on the next surviving instruction.
        let scope_cell = index.register_cell(9, CellKind::Scope);
        let code = vec![
            Instr::new(Op::CompareImm(d(2), 0)),
            Instr::new(Op::GotoCmp(Target::Label(1), CMP_EQ)),
            Instr::new(Op::Goto(Target::Label(2))).with_label(9),
            Instr::new(Op::TraceImm(7)).with_label(1),
            Instr::new(Op::Quit).with_label(2),
        ];
        let (out, _) = optimize_code(code, &mut index, false);
        assert_eq!(out[1].op, Op::GotoCmp(Target::Label(2), CMP_NE));
        // The anchor cell now names the label carried by the survivor.
        assert_eq!(index.cell_label(scope_cell), 1);
        assert!(out.iter().any(|i| i.label == Some(1)));
    }

    #[test]
    fn set_then_trace_fuses() {
        let code = vec![
            Instr::new(Op::SetImm(d(2), 1337)),
            Instr::new(Op::TraceReg(d(2))),
            Instr::new(Op::Quit),
        ];
        let out = run(code);
        assert_eq!(ops(&out), vec![Op::TraceImm(1337), Op::Quit]);
    }

    #[test]
    fn scope_labeled_nop_survives_in_the_middle() {
        let mut index = LabelIndex::new();
        index.register_cell(5, CellKind::Scope);
        let code = vec![
            Instr::new(Op::TraceImm(0)),
            Instr::new(Op::Nop).with_label(5),
            Instr::new(Op::Quit),
        ];
        let (out, _) = optimize_code(code, &mut index, false);
        assert_eq!(ops(&out), vec![Op::TraceImm(0), Op::Nop, Op::Quit]);
        assert_eq!(out[1].label, Some(5));
    }

    #[test]
    fn binding_pass_only_removes_nops() {
        let mut index = LabelIndex::new();
        let code = vec![
            Instr::new(Op::Nop),
            Instr::new(Op::PushReg(d(0))),
            Instr::new(Op::PushReg(d(0))),
            Instr::new(Op::Return),
        ];
        let (out, saved) = optimize_code(code, &mut index, true);
        // Pushes are untouched; only the placeholder went away.
        assert_eq!(
            ops(&out),
            vec![Op::PushReg(d(0)), Op::PushReg(d(0)), Op::Return]
        );
        assert_eq!(saved, 1);
    }

    #[test]
    fn merge_soundness_every_reference_resolves() {
        // Pile several label-affecting rewrites together, then verify every
        // referenced label is carried by some surviving instruction.
        let code = vec![
            Instr::new(Op::Nop).with_label(1),
            Instr::new(Op::Goto(Target::Label(1))).with_label(2),
            Instr::new(Op::Nop).with_label(3),
            Instr::new(Op::GotoCmp(Target::Label(3), CMP_EQ)),
            Instr::new(Op::Goto(Target::Label(2))),
            Instr::new(Op::TraceImm(1)).with_label(4),
            Instr::new(Op::Quit),
        ];
        let mut index = LabelIndex::new();
        let (out, _) = optimize_code(code, &mut index, false);
        for instr in &out {
            if let Some(Target::Label(l)) = instr.op.target() {
                let resolved = index.resolve(l);
                assert!(
                    out.iter().any(|i| i.label == Some(resolved)),
                    "label {l} (resolved {resolved}) has no live carrier"
                );
            }
        }
    }
}
