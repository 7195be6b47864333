//! Shared VM state: the global register bank, trace sink, and host hooks.

use std::sync::Arc;

use crate::asm::instruction::{RegId, GLOBAL_COUNT};
use crate::asm::Artifact;

use super::VmError;

/// Callback reading a host-mapped register.
pub type HostReadFn = Box<dyn FnMut(RegId) -> i32>;
/// Callback writing a host-mapped register.
pub type HostWriteFn = Box<dyn FnMut(RegId, i32)>;

/// Hooks for register ids outside the engine's own banks. Absent hooks read
/// zero and swallow writes.
#[derive(Default)]
pub struct HostRegisters {
    /// Read hook.
    pub read: Option<HostReadFn>,
    /// Write hook.
    pub write: Option<HostWriteFn>,
}

/// State shared by every script instance of one assembled program.
pub struct VmState {
    /// The finalized program. Immutable after assembly.
    pub artifact: Arc<Artifact>,
    /// Global register bank.
    pub globals: Vec<i32>,
    /// Side-effect sink for trace instructions.
    pub trace: Vec<i32>,
    /// Host-mapped register hooks.
    pub host: HostRegisters,
    /// Detail of the last `RunStatus::Error`.
    pub last_error: Option<VmError>,
}

impl VmState {
    /// Fresh state for an assembled program.
    pub fn new(artifact: Arc<Artifact>) -> Self {
        VmState {
            artifact,
            globals: vec![0; GLOBAL_COUNT as usize],
            trace: Vec::new(),
            host: HostRegisters::default(),
            last_error: None,
        }
    }

    /// Drain the trace sink.
    pub fn take_trace(&mut self) -> Vec<i32> {
        std::mem::take(&mut self.trace)
    }
}
