//! Bytecode assembler, linker, and peephole optimizer.
//!
//! The front end hands over a [`Program`]: per-function instruction lists
//! with symbolic labels. [`Assembler::assemble`] turns that into an
//! [`Artifact`]: one linear instruction stream with every label resolved to
//! a program-counter address, a run table mapping script names to address
//! ranges, and a [`debug::DebugData`] bundle for the external debugger.

pub mod assembler;
pub mod debug;
pub mod instruction;
pub mod labels;
pub mod optimizer;
pub mod program;

pub use assembler::{Artifact, AssembleError, Assembler, RunRange};
pub use instruction::{
    Instr, LabelId, Op, Pc, RegId, SourceLoc, Target, CMP_BOOL, CMP_EQ, CMP_FLAGS, CMP_GE,
    CMP_GT, CMP_LE, CMP_LT, CMP_NE, CMP_SETI, FIXED_ONE,
};
pub use program::{Function, Program, ScopeDecl, ScopeKind, Script, ScriptKind, SymbolDecl};
