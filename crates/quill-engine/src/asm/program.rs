//! Front-end program model.
//!
//! The language front end produces one [`Program`] per compile: scripts,
//! functions with unresolved-label instruction lists, global-variable
//! initializer code, source files, and a scope graph for the debugger. The
//! assembler consumes the program exactly once.

use serde::{Deserialize, Serialize};

use super::instruction::{Instr, LabelId, RegId, SourceLoc};

/// Identifier of a function within its [`Program`].
pub type FuncId = usize;

/// Script type tag. Selects which implicit `this` value, if any, is pushed
/// before the entry function runs; the front end encodes that as the run
/// function's leading parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptKind {
    /// Global script; no implicit `this`.
    Global,
    /// Script bound to a host entity; `this` is the entity handle.
    Entity,
    /// Screen-overlay script; `this` is the overlay handle.
    Overlay,
    /// Untyped prototype; has no body and is never assembled.
    Untyped,
}

/// Free-form script metadata carried through to the run table consumer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptMeta {
    /// Author string from the script header.
    pub author: String,
    /// Run-parameter display names for the host's script editor.
    pub param_names: Vec<String>,
}

/// A named script: a type tag, metadata, and a designated entry function.
#[derive(Debug, Clone)]
pub struct Script {
    /// Unique script name; the run-table key.
    pub name: String,
    /// Type tag.
    pub kind: ScriptKind,
    /// Metadata record.
    pub meta: ScriptMeta,
    /// Entry ("run") function.
    pub run: FuncId,
    /// Global-init ordering weight. `Some` marks the script as part of the
    /// synthesized init sequence instead of the user run table.
    pub init_weight: Option<i32>,
}

/// Function attribute flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuncFlags {
    /// Inline-expanded at call sites by the front end.
    pub inline: bool,
    /// Binding to a host built-in; body is an invariant contract.
    pub binding: bool,
    /// Class member function.
    pub class_member: bool,
    /// Class constructor; also reachable through `alt_label`.
    pub constructor: bool,
    /// Class destructor.
    pub destructor: bool,
    /// Static member.
    pub is_static: bool,
    /// Variadic parameter list.
    pub variadic: bool,
    /// Never returns to the caller.
    pub never_returns: bool,
    /// Instantiated from a template.
    pub template_expanded: bool,
    /// Prototype only; has no body.
    pub prototype: bool,
}

/// An ordered instruction sequence with its entry labels.
#[derive(Debug, Clone)]
pub struct Function {
    /// Index in [`Program::functions`].
    pub id: FuncId,
    /// Function name (display only).
    pub name: String,
    /// Body with symbolic labels.
    pub code: Vec<Instr>,
    /// Attribute flags.
    pub flags: FuncFlags,
    /// Entry label; the id other code calls.
    pub label: LabelId,
    /// Alternate (constructor) entry label.
    pub alt_label: Option<LabelId>,
    /// First instruction after parameter/frame setup. The debugger uses it
    /// to distinguish "stepped into" from "about to execute user code".
    pub prologue_end_label: Option<LabelId>,
    /// Number of run parameters (the typed `this` first, when present).
    pub param_count: usize,
    /// Scope graph node for this function, if the front end emitted one.
    pub scope: Option<usize>,
    /// Declaration site, for output ordering and the line table.
    pub loc: SourceLoc,
}

/// Storage kind and location of a debug symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolStorage {
    /// Compile-time constant value.
    Constant(i32),
    /// Frame-relative stack slot.
    Stack(i32),
    /// Global register bank slot.
    Global(u32),
    /// Machine register.
    Register(RegId),
    /// Field index within a class instance.
    ClassMember(u32),
}

/// Reference to a type, as the front end describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    /// No value.
    Void,
    /// Dynamically typed.
    Untyped,
    /// Boolean (fixed-point 0 / FIXED_ONE).
    Bool,
    /// The language's `int`: a fixed-point number.
    Int,
    /// Unscaled 32-bit integer.
    Long,
    /// Character.
    Char,
    /// Immutable view of another type.
    Const(Box<TypeRef>),
    /// Array of another type.
    Array(Box<TypeRef>),
    /// A class, by scope-graph node index.
    Class(usize),
    /// An enum, by scope-graph node index.
    Enum(usize),
    /// A bitflags enum, by scope-graph node index.
    Bitflags(usize),
}

/// One symbol declaration inside a scope.
#[derive(Debug, Clone)]
pub struct SymbolDecl {
    /// Symbol name.
    pub name: String,
    /// Where the value lives at runtime.
    pub storage: SymbolStorage,
    /// Declared type.
    pub ty: TypeRef,
    /// 1-based declaration line.
    pub declaration_line: i32,
    /// Hidden from the debugger variables view.
    pub hidden: bool,
    /// Collects trailing variadic arguments.
    pub varargs: bool,
}

/// Scope graph node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    /// The single root node.
    Root,
    /// A source file.
    File,
    /// A namespace.
    Namespace,
    /// A script declaration.
    Script,
    /// A function body.
    Function,
    /// A class body.
    Class,
    /// An enum definition; symbols are its members as constants.
    Enum,
    /// A lexical block inside a function.
    Block,
}

/// One node of the front end's scope graph. Node 0 is the root.
#[derive(Debug, Clone)]
pub struct ScopeDecl {
    /// Node kind.
    pub kind: ScopeKind,
    /// Name; the file path for `File` nodes.
    pub name: String,
    /// Parent node index; `None` only for the root.
    pub parent: Option<usize>,
    /// Label on the first instruction covered by this scope.
    pub start_label: Option<LabelId>,
    /// Label on the last instruction covered by this scope.
    pub end_label: Option<LabelId>,
    /// Symbols declared directly in this scope.
    pub symbols: Vec<SymbolDecl>,
    /// Function return type / enum base type, when meaningful.
    pub type_of: Option<TypeRef>,
    /// Owning function for `Function` nodes.
    pub function: Option<FuncId>,
    /// Namespaces this scope imports (`using`), by node index.
    pub uses_namespaces: Vec<usize>,
    /// Base class node for `Class` nodes.
    pub base_class: Option<usize>,
    /// Deprecated declaration.
    pub deprecated: bool,
}

impl ScopeDecl {
    /// A bare node of the given kind.
    pub fn new(kind: ScopeKind, name: impl Into<String>, parent: Option<usize>) -> Self {
        ScopeDecl {
            kind,
            name: name.into(),
            parent,
            start_label: None,
            end_label: None,
            symbols: Vec::new(),
            type_of: None,
            function: None,
            uses_namespaces: Vec::new(),
            base_class: None,
            deprecated: false,
        }
    }
}

/// One source file the program was compiled from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFileDecl {
    /// Normalized path.
    pub path: String,
    /// Full contents, shipped to the debugger.
    pub contents: String,
}

/// The whole front-end output: produced once per compile, consumed once by
/// the assembler.
#[derive(Debug, Clone)]
pub struct Program {
    /// Source files, indexed by [`SourceLoc::file`].
    pub files: Vec<SourceFileDecl>,
    /// All scripts.
    pub scripts: Vec<Script>,
    /// All functions, indexed by [`FuncId`].
    pub functions: Vec<Function>,
    /// Global-variable initializer code, run before any init script.
    pub globals_init: Vec<Instr>,
    /// Scope graph; node 0 is the root.
    pub scopes: Vec<ScopeDecl>,
    /// Next unissued label id. The front end owns the monotonic counter;
    /// the assembler continues it when minting labels.
    pub next_label: LabelId,
}

impl Program {
    /// An empty program with just a root scope.
    pub fn new() -> Self {
        Program {
            files: Vec::new(),
            scripts: Vec::new(),
            functions: Vec::new(),
            globals_init: Vec::new(),
            scopes: vec![ScopeDecl::new(ScopeKind::Root, "", None)],
            next_label: 0,
        }
    }

    /// Mint a fresh, globally unique label id.
    pub fn fresh_label(&mut self) -> LabelId {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    /// Find a script by name.
    pub fn script_by_name(&self, name: &str) -> Option<usize> {
        self.scripts.iter().position(|s| s.name == name)
    }

    /// Register a function, assigning its id.
    pub fn add_function(&mut self, mut func: Function) -> FuncId {
        let id = self.functions.len();
        func.id = id;
        self.functions.push(func);
        id
    }
}

impl Default for Program {
    fn default() -> Self {
        Program::new()
    }
}
