//! Assembler and linker.
//!
//! Turns a [`Program`] into an [`Artifact`]: one linear, fully resolved
//! instruction stream, a run table mapping script names to address ranges,
//! and the debug-data bundle. The pass is one-shot and non-reentrant;
//! nothing may mutate the finalized stream afterwards.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use tracing::debug;

use super::debug::{build_debug_data, DebugBuildInput, DebugData};
use super::instruction::{Instr, LabelId, Op, Pc, RegId, SourceLoc, Target, REG_FRAME};
use super::labels::{CellId, CellKind, LabelIndex};
use super::optimizer::optimize_code;
use super::program::{FuncFlags, Function, Program, Script, ScriptKind, ScriptMeta};

/// Name of the synthesized global-init script.
pub const INIT_SCRIPT_NAME: &str = "~Init";

/// Fatal assembly failure. Surfaced to the caller as a compile failure;
/// no bytecode reaches the runtime.
#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    /// A referenced label was never pinned to an instruction.
    #[error("unresolved label {label}")]
    UnresolvedLabel {
        /// The offending label id.
        label: LabelId,
    },
}

/// A script's resolved address range plus the metadata external callers use
/// to invoke it by name.
#[derive(Debug, Clone)]
pub struct RunRange {
    /// Address of the first instruction.
    pub start: Pc,
    /// Address of the last instruction.
    pub end: Pc,
    /// Script type tag.
    pub kind: ScriptKind,
    /// Script metadata record.
    pub meta: ScriptMeta,
}

/// Final assembler output: the flat instruction stream, the run table, and
/// the debugger bundle. Read-only once produced.
#[derive(Debug)]
pub struct Artifact {
    /// The instruction stream. Every target is a resolved [`Target::Pc`].
    pub code: Vec<Instr>,
    /// Script name → address range.
    pub run_table: FxHashMap<String, RunRange>,
    /// Debug bundle for the external debugger client.
    pub debug: DebugData,
}

impl Artifact {
    /// Look up a script's address range.
    pub fn run_range(&self, name: &str) -> Option<&RunRange> {
        self.run_table.get(name)
    }
}

/// Assembler options.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssemblerOptions {
    /// Also link binding-function bodies so the debugger can show them.
    pub emit_binding_functions: bool,
}

/// One-shot assembler. Construct with a front-end [`Program`], call
/// [`Assembler::assemble`].
pub struct Assembler {
    program: Program,
    options: AssemblerOptions,
    index: LabelIndex,
    rval: Vec<Instr>,
    functions_by_label: FxHashMap<LabelId, usize>,
    run_cells: Vec<(usize, CellId, CellId)>,
    scope_cells: Vec<(usize, Option<CellId>, Option<CellId>)>,
    prologue_cells: Vec<(usize, CellId)>,
    used_functions: Vec<usize>,
    run_functions: FxHashSet<usize>,
    emitted_run: FxHashSet<usize>,
    saved_total: u32,
}

impl Assembler {
    /// Wrap a program for assembly with default options.
    pub fn new(program: Program) -> Self {
        Assembler::with_options(program, AssemblerOptions::default())
    }

    /// Wrap a program for assembly.
    pub fn with_options(program: Program, options: AssemblerOptions) -> Self {
        Assembler {
            program,
            options,
            index: LabelIndex::new(),
            rval: Vec::new(),
            functions_by_label: FxHashMap::default(),
            run_cells: Vec::new(),
            scope_cells: Vec::new(),
            prologue_cells: Vec::new(),
            used_functions: Vec::new(),
            run_functions: FxHashSet::default(),
            emitted_run: FxHashSet::default(),
            saved_total: 0,
        }
    }

    /// Run the whole pipeline.
    pub fn assemble(mut self) -> Result<Artifact, AssembleError> {
        self.build_function_map();
        self.gather_scope_labels();
        self.assemble_init();
        self.assemble_scripts();
        self.link_functions();
        self.optimize_linked();
        self.output_code();
        let linenos = self.finalize_labels()?;
        let run_table = self.resolve_run_table(&linenos)?;
        let debug_data = self.fill_debug_data(&linenos);

        debug!(
            instructions = self.rval.len(),
            scripts = run_table.len(),
            saved = self.saved_total,
            "assembly complete"
        );

        Ok(Artifact {
            code: self.rval,
            run_table,
            debug: debug_data,
        })
    }

    /// Map every callable entry label to its function.
    fn build_function_map(&mut self) {
        for func in &self.program.functions {
            if func.flags.prototype {
                continue;
            }
            self.functions_by_label.insert(func.label, func.id);
            if func.flags.constructor {
                if let Some(alt) = func.alt_label {
                    self.functions_by_label.insert(alt, func.id);
                }
            }
        }
    }

    /// Register scope boundary and prologue-end labels as protected cells
    /// before any optimization runs.
    fn gather_scope_labels(&mut self) {
        for (idx, scope) in self.program.scopes.iter().enumerate() {
            let start = scope
                .start_label
                .map(|l| self.index.register_cell(l, CellKind::Scope));
            let end = scope
                .end_label
                .map(|l| self.index.register_cell(l, CellKind::Scope));
            if start.is_some() || end.is_some() {
                self.scope_cells.push((idx, start, end));
            }
        }
        for func in &self.program.functions {
            if let Some(l) = func.prologue_end_label {
                let cell = self.index.register_cell(l, CellKind::Scope);
                self.prologue_cells.push((func.id, cell));
            }
        }
    }

    /// Synthesize the hidden `~Init` script: global-variable initializers,
    /// then a call to every init-weighted global script ordered by ascending
    /// weight then declaration order, then a terminating quit.
    fn assemble_init(&mut self) {
        let mut ginit = std::mem::take(&mut self.program.globals_init);

        let mut by_weight: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        for (idx, script) in self.program.scripts.iter().enumerate() {
            if script.kind != ScriptKind::Global {
                continue;
            }
            let run = &self.program.functions[script.run];
            if run.flags.prototype {
                continue;
            }
            // A user script named "Init" joins the sequence at weight 0.
            let weight = if script.name == "Init" {
                Some(script.init_weight.unwrap_or(0))
            } else {
                script.init_weight
            };
            if let Some(w) = weight {
                by_weight.entry(w).or_default().push(idx);
            }
        }

        for scripts in by_weight.values() {
            for &idx in scripts {
                let script = &self.program.scripts[idx];
                let run = &self.program.functions[script.run];
                let label = run.label;
                let comment = format!("call {}::run", script.name);
                ginit.push(Instr::new(Op::PushReg(REG_FRAME)).with_comment(comment));
                ginit.push(Instr::new(Op::Call(Target::Label(label))));
                ginit.push(Instr::new(Op::Pop(REG_FRAME)));
            }
        }
        ginit.push(Instr::new(Op::Quit));

        let (ginit, saved) = optimize_code(ginit, &mut self.index, false);
        self.saved_total += saved;

        let label = self.program.fresh_label();
        let init_fn = self.program.add_function(Function {
            id: 0,
            name: "run".into(),
            code: ginit,
            flags: FuncFlags::default(),
            label,
            alt_label: None,
            prologue_end_label: None,
            param_count: 0,
            scope: None,
            loc: SourceLoc::NONE,
        });
        self.functions_by_label.insert(label, init_fn);

        let script_idx = self.program.scripts.len();
        self.program.scripts.push(Script {
            name: INIT_SCRIPT_NAME.into(),
            kind: ScriptKind::Global,
            meta: ScriptMeta::default(),
            run: init_fn,
            init_weight: None,
        });
        self.assemble_script(script_idx);
    }

    /// Append one script's run function to the stream: implicit parameter
    /// pushes first (the typed `this` in slot 0 when the kind takes one),
    /// then the body, recording the start/end label pair in the run table.
    fn assemble_script(&mut self, script_idx: usize) {
        let run_id = self.program.scripts[script_idx].run;
        let sig = format!("{}::run", self.program.scripts[script_idx].name);
        let nparams = self.program.functions[run_id].param_count;

        let mut new_code: Vec<Instr> = (0..nparams)
            .map(|i| Instr::new(Op::PushReg(i as RegId)))
            .collect();
        if nparams > 0 {
            new_code[0].comment = format!("{sig} params");
        }

        let body = std::mem::take(&mut self.program.functions[run_id].code);
        let body_len = body.len();
        new_code.extend(body);
        match body_len {
            0 => {}
            1 => {
                let last = new_code.len() - 1;
                new_code[last].merge_comment(&format!("{sig} body"), false);
            }
            _ => {
                let first = new_code.len() - body_len;
                new_code[first].merge_comment(&format!("{sig} body start"), false);
                let last = new_code.len() - 1;
                new_code[last].merge_comment(&format!("{sig} body end"), false);
            }
        }
        if new_code.is_empty() {
            new_code.push(Instr::new(Op::Quit).with_comment(format!("{sig} empty body")));
        }

        let start_label = match new_code[0].label {
            Some(l) => l,
            None => {
                let l = self.program.fresh_label();
                new_code[0].label = Some(l);
                l
            }
        };
        let last = new_code.len() - 1;
        let end_label = match new_code[last].label {
            Some(l) => l,
            None => {
                let l = self.program.fresh_label();
                new_code[last].label = Some(l);
                l
            }
        };
        let start_cell = self.index.register_cell(start_label, CellKind::Run);
        let end_cell = self.index.register_cell(end_label, CellKind::Run);
        self.run_cells.push((script_idx, start_cell, end_cell));

        self.rval.extend(new_code.iter().cloned());
        self.program.functions[run_id].code = new_code;
        self.run_functions.insert(run_id);
        self.emitted_run.insert(run_id);
    }

    /// Assemble every user script, skipping the init family, untyped
    /// scripts, and prototype-only run functions.
    fn assemble_scripts(&mut self) {
        for idx in 0..self.program.scripts.len() {
            let script = &self.program.scripts[idx];
            if script.name == INIT_SCRIPT_NAME {
                continue;
            }
            if script.kind == ScriptKind::Global
                && (script.name == "Init" || script.init_weight.is_some())
            {
                continue;
            }
            if script.kind == ScriptKind::Untyped {
                continue;
            }
            let run_id = script.run;
            if self.program.functions[run_id].flags.prototype {
                continue;
            }
            self.optimize_function(run_id);
            self.assemble_script(idx);
        }
    }

    fn optimize_function(&mut self, func_id: usize) {
        let code = std::mem::take(&mut self.program.functions[func_id].code);
        let only_nops = self.program.functions[func_id].flags.binding;
        let (code, saved) = optimize_code(code, &mut self.index, only_nops);
        self.saved_total += saved;
        self.program.functions[func_id].code = code;
    }

    /// Fixed-point reachability over the label → function map: starting from
    /// every label referenced by the flattened stream, transitively walk each
    /// referenced function's body until no new labels appear. Only functions
    /// reached this way survive.
    fn link_functions(&mut self) {
        let mut used_labels: FxHashSet<LabelId> = FxHashSet::default();
        let mut pending: Vec<LabelId> = Vec::new();
        for instr in &self.rval {
            if let Some(Target::Label(l)) = instr.op.target() {
                if used_labels.insert(l) {
                    pending.push(l);
                }
            }
        }

        let mut processed: FxHashSet<usize> = FxHashSet::default();
        while let Some(label) = pending.pop() {
            let Some(&func_id) = self.functions_by_label.get(&label) else {
                continue;
            };
            if !processed.insert(func_id) {
                continue;
            }
            for instr in &self.program.functions[func_id].code {
                if let Some(Target::Label(l)) = instr.op.target() {
                    if used_labels.insert(l) {
                        pending.push(l);
                    }
                }
            }
        }

        if self.options.emit_binding_functions {
            for func in &self.program.functions {
                if func.flags.binding && !func.flags.prototype {
                    used_labels.insert(func.label);
                }
            }
        }

        let mut seen: FxHashSet<usize> = FxHashSet::default();
        for label in used_labels {
            let Some(&func_id) = self.functions_by_label.get(&label) else {
                continue;
            };
            if self.emitted_run.contains(&func_id) {
                continue;
            }
            if seen.insert(func_id) {
                self.used_functions.push(func_id);
            }
        }
    }

    /// Optimize every retained function. Binding functions only get the
    /// placeholder strip since their bodies are invariant contracts.
    fn optimize_linked(&mut self) {
        for i in 0..self.used_functions.len() {
            self.optimize_function(self.used_functions[i]);
        }
    }

    /// Concatenate retained functions, sorted by source position so the
    /// line-table deltas stay small. Purely an encoding aid.
    fn output_code(&mut self) {
        let functions = &self.program.functions;
        self.used_functions.sort_by_key(|&id| {
            let f = &functions[id];
            (f.loc.file, f.loc.line, f.id)
        });

        for &func_id in &self.used_functions {
            let func = &self.program.functions[func_id];
            let start = self.rval.len();
            self.rval.extend(func.code.iter().cloned());
            let added = self.rval.len() - start;
            if added == 1 {
                let name = func.name.clone();
                self.rval[start].merge_comment(&format!("fn[{name}] body"), false);
            } else if added > 1 {
                let name = func.name.clone();
                self.rval[start].merge_comment(&format!("fn[{name}] body start"), false);
                let last = self.rval.len() - 1;
                self.rval[last].merge_comment(&format!("fn[{name}] body end"), false);
            }
        }
    }

    /// Record each label's resolved 1-based line, then rewrite every stored
    /// label operand to its 0-based address. Any miss is fatal.
    fn finalize_labels(&mut self) -> Result<FxHashMap<LabelId, u32>, AssembleError> {
        let mut linenos: FxHashMap<LabelId, u32> = FxHashMap::default();
        for (i, instr) in self.rval.iter().enumerate() {
            if let Some(l) = instr.label {
                linenos.insert(l, (i + 1) as u32);
            }
        }

        for instr in self.rval.iter_mut() {
            if let Some(t) = instr.op.target_mut() {
                if let Target::Label(l) = *t {
                    let resolved = self.index.resolve(l);
                    match linenos.get(&resolved) {
                        Some(&line) => *t = Target::Pc(line - 1),
                        None => return Err(AssembleError::UnresolvedLabel { label: l }),
                    }
                }
            }
        }
        Ok(linenos)
    }

    fn resolve_cell(
        &self,
        cell: CellId,
        linenos: &FxHashMap<LabelId, u32>,
    ) -> Result<Pc, AssembleError> {
        let label = self.index.cell_label(cell);
        let resolved = self.index.resolve(label);
        linenos
            .get(&resolved)
            .map(|&line| line - 1)
            .ok_or(AssembleError::UnresolvedLabel { label })
    }

    fn resolve_run_table(
        &self,
        linenos: &FxHashMap<LabelId, u32>,
    ) -> Result<FxHashMap<String, RunRange>, AssembleError> {
        let mut table = FxHashMap::default();
        for &(script_idx, start_cell, end_cell) in &self.run_cells {
            let script = &self.program.scripts[script_idx];
            table.insert(
                script.name.clone(),
                RunRange {
                    start: self.resolve_cell(start_cell, linenos)?,
                    end: self.resolve_cell(end_cell, linenos)?,
                    kind: script.kind,
                    meta: script.meta.clone(),
                },
            );
        }
        Ok(table)
    }

    fn fill_debug_data(&self, linenos: &FxHashMap<LabelId, u32>) -> DebugData {
        let prologue_labels: FxHashSet<LabelId> = self
            .prologue_cells
            .iter()
            .map(|&(_, cell)| self.index.cell_label(cell))
            .collect();

        let mut included: FxHashSet<usize> = self.used_functions.iter().copied().collect();
        included.extend(self.run_functions.iter().copied());

        let scope_ranges: FxHashMap<usize, (Option<Pc>, Option<Pc>)> = self
            .scope_cells
            .iter()
            .map(|&(scope_idx, start, end)| {
                let resolve = |cell: Option<CellId>| {
                    cell.and_then(|c| self.resolve_cell(c, linenos).ok())
                };
                (scope_idx, (resolve(start), resolve(end)))
            })
            .collect();

        build_debug_data(DebugBuildInput {
            program: &self.program,
            code: &self.rval,
            prologue_labels: &prologue_labels,
            included_functions: &included,
            run_functions: &self.run_functions,
            scope_ranges: &scope_ranges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::instruction::d;
    use crate::asm::program::{FuncFlags, Function, Program, Script, ScriptKind, ScriptMeta};

    fn mk_fn(p: &mut Program, name: &str, code: Vec<Instr>) -> (usize, LabelId) {
        let label = p.fresh_label();
        let mut code = code;
        if let Some(first) = code.first_mut() {
            first.label = Some(label);
        }
        let id = p.add_function(Function {
            id: 0,
            name: name.into(),
            code,
            flags: FuncFlags::default(),
            label,
            alt_label: None,
            prologue_end_label: None,
            param_count: 0,
            scope: None,
            loc: SourceLoc::NONE,
        });
        (id, label)
    }

    fn mk_script(p: &mut Program, name: &str, kind: ScriptKind, run: usize) -> usize {
        let idx = p.scripts.len();
        p.scripts.push(Script {
            name: name.into(),
            kind,
            meta: ScriptMeta::default(),
            run,
            init_weight: None,
        });
        idx
    }

    #[test]
    fn unreferenced_function_is_pruned() {
        let mut p = Program::new();
        let (f2, f2_label) = mk_fn(
            &mut p,
            "callee",
            vec![Instr::new(Op::TraceImm(77)), Instr::new(Op::Return)],
        );
        let (_f3, _) = mk_fn(
            &mut p,
            "dead",
            vec![Instr::new(Op::TraceImm(42)), Instr::new(Op::Return)],
        );
        let (run, _) = mk_fn(
            &mut p,
            "run",
            vec![
                Instr::new(Op::Call(Target::Label(f2_label))),
                Instr::new(Op::Quit),
            ],
        );
        let _ = f2;
        mk_script(&mut p, "main", ScriptKind::Global, run);

        let artifact = Assembler::new(p).assemble().unwrap();
        assert!(artifact.code.iter().any(|i| i.op == Op::TraceImm(77)));
        assert!(!artifact.code.iter().any(|i| i.op == Op::TraceImm(42)));
    }

    #[test]
    fn transitive_callees_are_retained() {
        let mut p = Program::new();
        let (_leaf, leaf_label) = mk_fn(
            &mut p,
            "leaf",
            vec![Instr::new(Op::TraceImm(3)), Instr::new(Op::Return)],
        );
        let (_mid, mid_label) = mk_fn(
            &mut p,
            "mid",
            vec![
                Instr::new(Op::Call(Target::Label(leaf_label))),
                Instr::new(Op::Return),
            ],
        );
        let (run, _) = mk_fn(
            &mut p,
            "run",
            vec![
                Instr::new(Op::Call(Target::Label(mid_label))),
                Instr::new(Op::Quit),
            ],
        );
        mk_script(&mut p, "main", ScriptKind::Global, run);

        let artifact = Assembler::new(p).assemble().unwrap();
        assert!(artifact.code.iter().any(|i| i.op == Op::TraceImm(3)));
    }

    #[test]
    fn run_table_covers_script_body() {
        let mut p = Program::new();
        let (run, _) = mk_fn(
            &mut p,
            "run",
            vec![
                Instr::new(Op::SetImm(d(0), 10_000)),
                Instr::new(Op::TraceReg(d(0))),
                Instr::new(Op::Quit),
            ],
        );
        mk_script(&mut p, "main", ScriptKind::Entity, run);
        // Entity scripts take an implicit `this` parameter.
        p.functions[run].param_count = 1;

        let artifact = Assembler::new(p).assemble().unwrap();
        let range = artifact.run_range("main").unwrap();
        assert!(range.end > range.start);
        // First instruction is the implicit this push.
        assert_eq!(artifact.code[range.start as usize].op, Op::PushReg(d(0)));
        assert_eq!(range.kind, ScriptKind::Entity);
        // The init script is always present too.
        assert!(artifact.run_range(INIT_SCRIPT_NAME).is_some());
    }

    #[test]
    fn call_targets_resolve_to_function_entries() {
        let mut p = Program::new();
        let (_callee, callee_label) = mk_fn(
            &mut p,
            "callee",
            vec![Instr::new(Op::TraceImm(9)), Instr::new(Op::Return)],
        );
        let (run, _) = mk_fn(
            &mut p,
            "run",
            vec![
                Instr::new(Op::Call(Target::Label(callee_label))),
                Instr::new(Op::Quit),
            ],
        );
        mk_script(&mut p, "main", ScriptKind::Global, run);

        let artifact = Assembler::new(p).assemble().unwrap();
        let range = artifact.run_range("main").unwrap();
        let call = &artifact.code[range.start as usize];
        let Op::Call(Target::Pc(target)) = call.op else {
            panic!("expected resolved call, got {:?}", call.op);
        };
        assert_eq!(artifact.code[target as usize].op, Op::TraceImm(9));
    }

    #[test]
    fn unresolved_label_is_fatal() {
        let mut p = Program::new();
        let (run, _) = mk_fn(
            &mut p,
            "run",
            vec![
                Instr::new(Op::Goto(Target::Label(99_999))),
                Instr::new(Op::Quit),
            ],
        );
        mk_script(&mut p, "main", ScriptKind::Global, run);

        let err = Assembler::new(p).assemble().unwrap_err();
        assert!(matches!(
            err,
            AssembleError::UnresolvedLabel { label: 99_999 }
        ));
    }

    #[test]
    fn init_scripts_run_in_weight_then_declaration_order() {
        let mut p = Program::new();
        let (heavy, _) = mk_fn(
            &mut p,
            "run",
            vec![Instr::new(Op::TraceImm(2)), Instr::new(Op::Return)],
        );
        let (light_a, _) = mk_fn(
            &mut p,
            "run",
            vec![Instr::new(Op::TraceImm(1)), Instr::new(Op::Return)],
        );
        let (light_b, _) = mk_fn(
            &mut p,
            "run",
            vec![Instr::new(Op::TraceImm(11)), Instr::new(Op::Return)],
        );
        let s_heavy = mk_script(&mut p, "late", ScriptKind::Global, heavy);
        let s_a = mk_script(&mut p, "early_a", ScriptKind::Global, light_a);
        let s_b = mk_script(&mut p, "early_b", ScriptKind::Global, light_b);
        p.scripts[s_heavy].init_weight = Some(10);
        p.scripts[s_a].init_weight = Some(1);
        p.scripts[s_b].init_weight = Some(1);

        let artifact = Assembler::new(p).assemble().unwrap();
        let init = artifact.run_range(INIT_SCRIPT_NAME).unwrap();

        // Execute the init region symbolically: collect call order.
        let mut call_pcs = Vec::new();
        for pc in init.start..=init.end {
            if let Op::Call(Target::Pc(t)) = artifact.code[pc as usize].op {
                call_pcs.push(t);
            }
        }
        let traces: Vec<i32> = call_pcs
            .iter()
            .map(|&t| match artifact.code[t as usize].op {
                Op::TraceImm(v) => v,
                other => panic!("expected trace at callee entry, got {other:?}"),
            })
            .collect();
        assert_eq!(traces, vec![1, 11, 2]);
        // Init region ends with a quit.
        assert_eq!(artifact.code[init.end as usize].op, Op::Quit);
    }

    #[test]
    fn binding_functions_keep_their_shape() {
        let mut p = Program::new();
        let (bind, bind_label) = mk_fn(
            &mut p,
            "bound",
            vec![
                Instr::new(Op::Nop),
                Instr::new(Op::PushReg(d(0))),
                Instr::new(Op::PushReg(d(0))),
                Instr::new(Op::Return),
            ],
        );
        p.functions[bind].flags.binding = true;
        let (run, _) = mk_fn(
            &mut p,
            "run",
            vec![
                Instr::new(Op::Call(Target::Label(bind_label))),
                Instr::new(Op::Quit),
            ],
        );
        mk_script(&mut p, "main", ScriptKind::Global, run);

        let artifact = Assembler::new(p).assemble().unwrap();
        // The two pushes were not coalesced; the placeholder nop is gone.
        let pushes = artifact
            .code
            .iter()
            .filter(|i| i.op == Op::PushReg(d(0)))
            .count();
        assert_eq!(pushes, 2);
        assert!(!artifact
            .code
            .iter()
            .any(|i| matches!(i.op, Op::PushArgsReg(..))));
    }

    #[test]
    fn prototype_scripts_are_skipped() {
        let mut p = Program::new();
        let (run, _) = mk_fn(&mut p, "run", vec![Instr::new(Op::Quit)]);
        p.functions[run].flags.prototype = true;
        mk_script(&mut p, "ghost", ScriptKind::Global, run);

        let artifact = Assembler::new(p).assemble().unwrap();
        assert!(artifact.run_range("ghost").is_none());
    }
}
