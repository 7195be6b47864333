//! Lazy block-level native compiler.
//!
//! Translates one basic block of the finalized instruction stream into
//! native machine code on first execution of that block's entry address,
//! caching the result per script. Anything the compiler does not
//! special-case is delegated to the reference interpreter in batched calls;
//! a compilation failure flips the whole script to interpretation.

pub mod analysis;
pub mod backend;
pub mod cache;
pub mod context;

pub use analysis::BlockMap;
pub use backend::{BlockCompiler, BlockFn};
pub use cache::CompiledScript;
pub use context::JitContext;

/// Native compilation failure. Never user-visible: the runtime recovers by
/// interpreting the script.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// Codegen backend failure.
    #[error("backend error: {0}")]
    Backend(String),
    /// Module-level declare/define/finalize failure.
    #[error("module error: {0}")]
    Module(#[from] cranelift_module::ModuleError),
    /// Native code may not write the stack-pointer pseudo-registers.
    #[error("write to read-only register {0}")]
    ReadOnlyRegister(u32),
    /// An unresolved label survived into the finalized stream.
    #[error("unresolved jump target at pc {0}")]
    UnresolvedTarget(u32),
    /// The requested entry address does not start a basic block.
    #[error("pc {0} is not a block start")]
    NotABlock(u32),
    /// The compiler for this script was already torn down.
    #[error("native compilation disabled for this script")]
    Disabled,
}
