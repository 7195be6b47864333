//! Debug-data bundle for the external source-level debugger.
//!
//! Built once at the end of assembly, never mutated by the runtime. Holds:
//! the source files, a run-length encoded line table mapping pc ranges to
//! (file, line), the scope tree, and the symbol/type tables. The line table
//! uses a compact "simple step" byte for the common case of one line
//! advancing by a small pc delta, and an "extended step" record otherwise.

use once_cell::sync::OnceCell;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use super::instruction::{Instr, LabelId, Pc};
use super::program::{Program, ScopeKind, SymbolStorage, TypeRef};

/// Largest pc delta a simple-step byte can carry (line always advances 1).
pub const LINE_OP_SIMPLE_STEP_MAX: u8 = 0xEF;
/// Switch the current file; ULEB128 file index follows.
pub const LINE_OP_SET_FILE: u8 = 0xF0;
/// Arbitrary step; ULEB128 pc delta and zigzag line delta follow.
pub const LINE_OP_EXTENDED_STEP: u8 = 0xF1;
/// Marks the previous record as a function prologue end.
pub const LINE_OP_PROLOGUE_END: u8 = 0xF2;

/// Scope tree node tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeTag {
    /// The single root node.
    Root,
    /// A source file.
    File,
    /// A namespace.
    Namespace,
    /// A script.
    Script,
    /// A function body.
    Function,
    /// A class body.
    Class,
    /// An enum; members read as constants.
    Enum,
    /// A lexical block.
    Block,
}

/// Scope hidden from normal listings.
pub const SCOPE_FLAG_HIDDEN: u8 = 1;
/// Scope belongs to the host bindings.
pub const SCOPE_FLAG_INTERNAL: u8 = 2;
/// Scope is deprecated.
pub const SCOPE_FLAG_DEPRECATED: u8 = 4;

/// One node of the emitted scope tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugScope {
    /// Node tag.
    pub tag: ScopeTag,
    /// `SCOPE_FLAG_*` bits.
    pub flags: u8,
    /// Parent node index; -1 for the root.
    pub parent_index: i32,
    /// Base-class node index for classes; -1 otherwise.
    pub inheritance_index: i32,
    /// Type id of the function return / enum base type; 0 when untyped.
    pub type_id: u32,
    /// Resolved `[start_pc, end_pc]` for function and block scopes.
    pub range: Option<(Pc, Pc)>,
    /// Scope name; the file path for file nodes.
    pub name: String,
    /// Imported scopes (namespace `using`s, promoted enums).
    pub imports: Vec<i32>,
}

/// Symbol storage kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// Compile-time constant; `offset` holds the value.
    Constant,
    /// Frame-relative stack slot.
    Stack,
    /// Global register bank slot.
    Global,
    /// Machine register.
    Register,
    /// Class field index.
    ClassMember,
}

/// Symbol hidden from the variables view.
pub const SYM_FLAG_HIDDEN: u8 = 1;
/// Symbol collects variadic arguments.
pub const SYM_FLAG_VARARGS: u8 = 2;

/// One symbol record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugSymbol {
    /// Owning scope index.
    pub scope_index: i32,
    /// Symbol name.
    pub name: String,
    /// Storage kind.
    pub storage: StorageKind,
    /// Location or value, depending on `storage`.
    pub offset: i32,
    /// Type id.
    pub type_id: u32,
    /// 1-based declaration line.
    pub declaration_line: i32,
    /// `SYM_FLAG_*` bits.
    pub flags: u8,
}

// Primitive type ids, implicit and never stored in the table.
/// `void`.
pub const TYPE_VOID: u32 = 0;
/// Unbound template parameter.
pub const TYPE_TEMPLATE_UNBOUNDED: u32 = 1;
/// Untyped value.
pub const TYPE_UNTYPED: u32 = 2;
/// Boolean.
pub const TYPE_BOOL: u32 = 3;
/// The fixed-point `int`.
pub const TYPE_INT: u32 = 4;
/// Unscaled 32-bit integer.
pub const TYPE_LONG: u32 = 5;
/// Character.
pub const TYPE_CHAR: u32 = 6;
/// First id stored in the composite type table.
pub const TYPE_TABLE_START: u32 = 32;

/// Composite type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeTag {
    /// Immutable view of `extra` (a type id).
    Const,
    /// Array of `extra` (a type id).
    Array,
    /// Class; `extra` is a scope index.
    Class,
    /// Enum; `extra` is a scope index.
    Enum,
    /// Bitflags enum; `extra` is a scope index.
    Bitflags,
}

/// One composite type table entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DebugType {
    /// Composite tag.
    pub tag: TypeTag,
    /// Type id or scope index, depending on the tag.
    pub extra: i32,
}

/// One shipped source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    /// Normalized path.
    pub path: String,
    /// Full contents.
    pub contents: String,
}

/// The whole bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugData {
    /// Source files, indexed by the line table's file indices.
    pub source_files: Vec<SourceFile>,
    /// Run-length encoded pc → (file, line) table.
    pub line_table: Vec<u8>,
    /// Scope tree; node 0 is the root.
    pub scopes: Vec<DebugScope>,
    /// Symbol records.
    pub symbols: Vec<DebugSymbol>,
    /// Composite type table, ids starting at [`TYPE_TABLE_START`].
    pub types: Vec<DebugType>,
    /// Ranged scopes ordered by start pc, built on first resolve.
    #[serde(skip)]
    sorted_scopes: OnceCell<Vec<usize>>,
}

fn write_uleb(buf: &mut Vec<u8>, mut v: u32) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn read_uleb(buf: &[u8], pos: &mut usize) -> u32 {
    let mut v = 0u32;
    let mut shift = 0;
    while *pos < buf.len() {
        let byte = buf[*pos];
        *pos += 1;
        v |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    v
}

fn write_sleb(buf: &mut Vec<u8>, v: i32) {
    // Zigzag.
    write_uleb(buf, ((v << 1) ^ (v >> 31)) as u32);
}

fn read_sleb(buf: &[u8], pos: &mut usize) -> i32 {
    let z = read_uleb(buf, pos);
    ((z >> 1) as i32) ^ -((z & 1) as i32)
}

impl DebugData {
    /// Append a set-file record.
    pub fn append_set_file(&mut self, file: u32) {
        self.line_table.push(LINE_OP_SET_FILE);
        write_uleb(&mut self.line_table, file);
    }

    /// Append a simple step: pc advances `d_pc`, line advances one.
    pub fn append_simple_step(&mut self, d_pc: u8) {
        debug_assert!(d_pc <= LINE_OP_SIMPLE_STEP_MAX);
        self.line_table.push(d_pc);
    }

    /// Append an extended step.
    pub fn append_extended_step(&mut self, d_pc: u32, d_line: i32) {
        self.line_table.push(LINE_OP_EXTENDED_STEP);
        write_uleb(&mut self.line_table, d_pc);
        write_sleb(&mut self.line_table, d_line);
    }

    /// Mark the previous record as a prologue end.
    pub fn append_prologue_end(&mut self) {
        self.line_table.push(LINE_OP_PROLOGUE_END);
    }

    /// Resolve a pc to its (file index, line), if any code at or before it
    /// carried a source location.
    pub fn resolve_location(&self, query: Pc) -> Option<(usize, i32)> {
        let mut pos = 0usize;
        let mut pc: u32 = 0;
        let mut line: i32 = 1;
        let mut file: usize = 0;
        let mut best: Option<(usize, i32)> = None;
        while pos < self.line_table.len() {
            let op = self.line_table[pos];
            pos += 1;
            match op {
                LINE_OP_SET_FILE => {
                    file = read_uleb(&self.line_table, &mut pos) as usize;
                }
                LINE_OP_EXTENDED_STEP => {
                    pc += read_uleb(&self.line_table, &mut pos);
                    line += read_sleb(&self.line_table, &mut pos);
                    if pc > query {
                        return best;
                    }
                    best = Some((file, line));
                }
                LINE_OP_PROLOGUE_END => {}
                d_pc => {
                    pc += d_pc as u32;
                    line += 1;
                    if pc > query {
                        return best;
                    }
                    best = Some((file, line));
                }
            }
        }
        best
    }

    /// Program counters flagged as function prologue ends.
    pub fn prologue_pcs(&self) -> Vec<Pc> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        let mut pc: u32 = 0;
        while pos < self.line_table.len() {
            let op = self.line_table[pos];
            pos += 1;
            match op {
                LINE_OP_SET_FILE => {
                    let _ = read_uleb(&self.line_table, &mut pos);
                }
                LINE_OP_EXTENDED_STEP => {
                    pc += read_uleb(&self.line_table, &mut pos);
                    let _ = read_sleb(&self.line_table, &mut pos);
                }
                LINE_OP_PROLOGUE_END => out.push(pc),
                d_pc => pc += d_pc as u32,
            }
        }
        out
    }

    /// Innermost scope whose pc range contains `pc`.
    pub fn resolve_scope(&self, pc: Pc) -> Option<usize> {
        let order = self.sorted_scopes.get_or_init(|| {
            let mut v: Vec<usize> = (0..self.scopes.len())
                .filter(|&i| self.scopes[i].range.is_some())
                .collect();
            v.sort_by_key(|&i| self.scopes[i].range.map(|(s, _)| s));
            v
        });
        let mut best: Option<usize> = None;
        for &i in order {
            let Some((start, end)) = self.scopes[i].range else {
                continue;
            };
            if start > pc {
                break;
            }
            if pc <= end {
                best = Some(i);
            }
        }
        best
    }

    /// Every symbol visible at `pc`: the innermost scope, its imports, and
    /// all enclosing scopes up to the root (with their imports).
    pub fn symbols_in_scope_at(&self, pc: Pc) -> Vec<&DebugSymbol> {
        let mut visible: FxHashSet<i32> = FxHashSet::default();
        let mut cursor = self.resolve_scope(pc).map(|i| i as i32).unwrap_or(0);
        loop {
            visible.insert(cursor);
            for &import in &self.scopes[cursor as usize].imports {
                visible.insert(import);
            }
            let parent = self.scopes[cursor as usize].parent_index;
            if parent < 0 {
                break;
            }
            cursor = parent;
        }
        self.symbols
            .iter()
            .filter(|s| visible.contains(&s.scope_index))
            .collect()
    }

    /// Serialize the bundle for the debugger transport.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserialize a bundle.
    pub fn decode(bytes: &[u8]) -> Option<DebugData> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Everything the scope/line emission needs from the assembler.
pub struct DebugBuildInput<'a> {
    /// The (consumed) front-end program.
    pub program: &'a Program,
    /// The final instruction stream.
    pub code: &'a [Instr],
    /// Current label ids marking prologue ends.
    pub prologue_labels: &'a FxHashSet<LabelId>,
    /// Functions present in the final stream.
    pub included_functions: &'a FxHashSet<usize>,
    /// Script entry functions.
    pub run_functions: &'a FxHashSet<usize>,
    /// Resolved scope ranges, by scope-declaration index.
    pub scope_ranges: &'a FxHashMap<usize, (Option<Pc>, Option<Pc>)>,
}

/// Build the whole bundle: the line table from the final stream, then the
/// scope/symbol/type tables from the front end's scope graph.
pub fn build_debug_data(input: DebugBuildInput<'_>) -> DebugData {
    let mut data = DebugData::default();
    for file in input.program.files.iter() {
        data.source_files.push(SourceFile {
            path: file.path.clone(),
            contents: file.contents.clone(),
        });
    }
    fill_line_table(&mut data, &input);
    fill_scopes(&mut data, &input);
    data
}

fn fill_line_table(data: &mut DebugData, input: &DebugBuildInput<'_>) {
    let mut prev_file: i32 = 0;
    let mut prev_line: i32 = 1;
    let mut prev_pc: u32 = 0;

    for (pc, instr) in input.code.iter().enumerate() {
        let pc = pc as u32;
        if instr.loc.line <= 0 {
            continue;
        }
        let is_prologue_end = instr
            .label
            .is_some_and(|l| input.prologue_labels.contains(&l));

        let mut file_changed = false;
        if instr.loc.file >= 0 && instr.loc.file != prev_file {
            // Flush the range still using the old file.
            let gap = pc - prev_pc;
            if gap > 0 {
                data.append_extended_step(gap, 0);
                prev_pc = pc;
            }
            data.append_set_file(instr.loc.file as u32);
            prev_file = instr.loc.file;
            file_changed = true;
        }

        if !file_changed && !is_prologue_end && instr.loc.line == prev_line {
            continue;
        }

        let d_line = instr.loc.line - prev_line;
        let d_pc = pc - prev_pc;
        if d_line == 1 && d_pc <= LINE_OP_SIMPLE_STEP_MAX as u32 {
            data.append_simple_step(d_pc as u8);
        } else {
            data.append_extended_step(d_pc, d_line);
        }
        if is_prologue_end {
            data.append_prologue_end();
        }
        prev_line = instr.loc.line;
        prev_pc = pc;
    }
}

struct TypeWork {
    scope_types: Vec<Option<TypeRef>>,
    symbol_types: Vec<Option<TypeRef>>,
}

fn fill_scopes(data: &mut DebugData, input: &DebugBuildInput<'_>) {
    let program = input.program;
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); program.scopes.len()];
    for (idx, scope) in program.scopes.iter().enumerate() {
        if let Some(p) = scope.parent {
            children[p].push(idx);
        }
    }

    let mut work = TypeWork {
        scope_types: Vec::new(),
        symbol_types: Vec::new(),
    };
    let mut decl_to_emitted: FxHashMap<usize, i32> = FxHashMap::default();

    struct Entry {
        decl: usize,
        parent: i32,
        within_func: bool,
    }
    let mut stack = vec![Entry {
        decl: 0,
        parent: -1,
        within_func: false,
    }];

    while let Some(Entry {
        decl,
        parent,
        within_func,
    }) = stack.pop()
    {
        let scope = &program.scopes[decl];
        let mut within_func = within_func;
        let mut emit = true;
        let mut flags = 0u8;
        let mut name = scope.name.clone();

        let tag = match scope.kind {
            ScopeKind::Root => ScopeTag::Root,
            // Files never nest; hardcode the parent to the root.
            ScopeKind::File => ScopeTag::File,
            ScopeKind::Namespace => ScopeTag::Namespace,
            ScopeKind::Script => ScopeTag::Script,
            ScopeKind::Class => ScopeTag::Class,
            ScopeKind::Enum => ScopeTag::Enum,
            ScopeKind::Function => {
                within_func = true;
                let Some(fid) = scope.function else {
                    continue;
                };
                let func = &program.functions[fid];
                let is_run = input.run_functions.contains(&fid);
                if !is_run {
                    let is_used = input.included_functions.contains(&fid);
                    if !func.flags.binding && !is_used {
                        continue;
                    }
                }
                if func.flags.binding {
                    flags |= SCOPE_FLAG_INTERNAL;
                }
                if func.flags.destructor && !name.starts_with('~') {
                    name = format!("~{name}");
                }
                ScopeTag::Function
            }
            ScopeKind::Block => {
                if !within_func {
                    continue;
                }
                ScopeTag::Block
            }
        };
        if scope.deprecated {
            flags |= SCOPE_FLAG_DEPRECATED;
        }

        let mut my_idx = parent;
        if emit && tag == ScopeTag::File && name.is_empty() {
            emit = false;
        }
        if emit {
            let parent_index = if tag == ScopeTag::File { 0 } else { parent };
            let range = match tag {
                ScopeTag::Function | ScopeTag::Block => input
                    .scope_ranges
                    .get(&decl)
                    .and_then(|&(s, e)| s.zip(e)),
                _ => None,
            };
            let emitted_idx = data.scopes.len() as i32;
            data.scopes.push(DebugScope {
                tag,
                flags,
                parent_index,
                inheritance_index: -1,
                type_id: 0,
                range,
                name,
                imports: Vec::new(),
            });
            work.scope_types.push(scope.type_of.clone());

            let mut symbol_count = 0usize;
            for sym in &scope.symbols {
                let (storage, offset) = match sym.storage {
                    SymbolStorage::Constant(v) => (StorageKind::Constant, v),
                    SymbolStorage::Stack(o) => (StorageKind::Stack, o),
                    SymbolStorage::Global(g) => (StorageKind::Global, g as i32),
                    SymbolStorage::Register(r) => (StorageKind::Register, r as i32),
                    SymbolStorage::ClassMember(i) => (StorageKind::ClassMember, i as i32),
                };
                let mut sflags = 0u8;
                if sym.hidden {
                    sflags |= SYM_FLAG_HIDDEN;
                }
                if sym.varargs {
                    sflags |= SYM_FLAG_VARARGS;
                }
                data.symbols.push(DebugSymbol {
                    scope_index: emitted_idx,
                    name: sym.name.clone(),
                    storage,
                    offset,
                    type_id: 0,
                    declaration_line: sym.declaration_line,
                    flags: sflags,
                });
                work.symbol_types.push(Some(sym.ty.clone()));
                symbol_count += 1;
            }

            let has_content = symbol_count > 0 || !scope.uses_namespaces.is_empty();
            if tag == ScopeTag::Block && !has_content {
                // Hollow block: never emit it; debuggers shouldn't see it.
                data.scopes.pop();
                work.scope_types.pop();
            } else {
                my_idx = emitted_idx;
                decl_to_emitted.insert(decl, emitted_idx);
                if tag == ScopeTag::File {
                    data.scopes[0].imports.push(emitted_idx);
                }
                if tag == ScopeTag::Enum {
                    promote_enum(data, emitted_idx, parent);
                }
            }
        }

        for &child in children[decl].iter().rev() {
            stack.push(Entry {
                decl: child,
                parent: my_idx,
                within_func,
            });
        }
    }

    // Imports and inheritance become emitted-tree indices.
    for (decl, &emitted) in &decl_to_emitted {
        let scope = &program.scopes[*decl];
        for ns in &scope.uses_namespaces {
            if let Some(&target) = decl_to_emitted.get(ns) {
                data.scopes[emitted as usize].imports.push(target);
            }
        }
        if let Some(base) = scope.base_class {
            if let Some(&target) = decl_to_emitted.get(&base) {
                data.scopes[emitted as usize].inheritance_index = target;
            }
        }
    }

    // Type tables last, once every scope has its final index.
    let mut builder = TypeBuilder {
        table: Vec::new(),
        cache: FxHashMap::default(),
        decl_to_emitted: &decl_to_emitted,
    };
    for (i, ty) in work.scope_types.iter().enumerate() {
        if let Some(t) = ty {
            data.scopes[i].type_id = builder.type_id(t);
        }
    }
    for (i, ty) in work.symbol_types.iter().enumerate() {
        if let Some(t) = ty {
            data.symbols[i].type_id = builder.type_id(t);
        }
    }
    data.types = builder.table;
}

/// Import an enum into the nearest enclosing namespace or root scope so
/// every member reads as a global.
fn promote_enum(data: &mut DebugData, enum_idx: i32, mut parent: i32) {
    while parent >= 0 {
        let scope = &mut data.scopes[parent as usize];
        if scope.tag == ScopeTag::Root || scope.tag == ScopeTag::Namespace {
            scope.imports.push(enum_idx);
            return;
        }
        parent = scope.parent_index;
    }
}

struct TypeBuilder<'a> {
    table: Vec<DebugType>,
    cache: FxHashMap<String, u32>,
    decl_to_emitted: &'a FxHashMap<usize, i32>,
}

impl TypeBuilder<'_> {
    fn type_id(&mut self, ty: &TypeRef) -> u32 {
        match ty {
            TypeRef::Void => TYPE_VOID,
            TypeRef::Untyped => TYPE_UNTYPED,
            TypeRef::Bool => TYPE_BOOL,
            TypeRef::Int => TYPE_INT,
            TypeRef::Long => TYPE_LONG,
            TypeRef::Char => TYPE_CHAR,
            TypeRef::Const(inner) => {
                let base = self.type_id(inner);
                self.entry(format!("const:{base}"), TypeTag::Const, base as i32)
            }
            TypeRef::Array(inner) => {
                let elem = self.type_id(inner);
                self.entry(format!("array:{elem}"), TypeTag::Array, elem as i32)
            }
            TypeRef::Class(decl) => {
                let extra = self.decl_to_emitted.get(decl).copied().unwrap_or(-1);
                self.entry(format!("class:{decl}"), TypeTag::Class, extra)
            }
            TypeRef::Enum(decl) => {
                let extra = self.decl_to_emitted.get(decl).copied().unwrap_or(-1);
                self.entry(format!("enum:{decl}"), TypeTag::Enum, extra)
            }
            TypeRef::Bitflags(decl) => {
                let extra = self.decl_to_emitted.get(decl).copied().unwrap_or(-1);
                self.entry(format!("bitflags:{decl}"), TypeTag::Bitflags, extra)
            }
        }
    }

    fn entry(&mut self, key: String, tag: TypeTag, extra: i32) -> u32 {
        if let Some(&id) = self.cache.get(&key) {
            return id;
        }
        let id = TYPE_TABLE_START + self.table.len() as u32;
        self.table.push(DebugType { tag, extra });
        self.cache.insert(key, id);
        id
    }
}
