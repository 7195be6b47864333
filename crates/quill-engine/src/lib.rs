//! Quill Scripting Engine
//!
//! This crate implements the back half of the Quill script pipeline:
//! - **asm**: bytecode assembler, linker, peephole optimizer, and debug-data
//!   emission (`asm` module). Consumes the [`asm::Program`] the language
//!   front end produces and yields one flat, fully resolved instruction
//!   stream plus a run table and a debugger bundle.
//! - **vm**: reference interpreter and the cooperative, tick-at-a-time
//!   execution runtime (`vm` module).
//! - **jit**: lazy per-basic-block native compiler built on Cranelift
//!   (`jit` module, behind the `jit` feature).
//!
//! # Example
//!
//! ```rust,ignore
//! use quill_engine::asm::{Assembler, Program};
//! use quill_engine::vm::{Runtime, RunStatus};
//!
//! let program: Program = front_end_output();
//! let artifact = Assembler::new(program).assemble()?;
//!
//! let mut runtime = Runtime::new(artifact.into());
//! let mut instance = runtime.spawn("main")?;
//! loop {
//!     match runtime.run_one_step(&mut instance) {
//!         RunStatus::Yielded => continue, // next host tick
//!         status => break,
//!     }
//! }
//! ```

#![warn(rust_2018_idioms)]

/// Assembler module: instruction model, linker, optimizer, debug data
pub mod asm;

/// VM module: reference interpreter and cooperative execution runtime
pub mod vm;

/// JIT compilation module (optional, behind "jit" feature)
#[cfg(feature = "jit")]
pub mod jit;
