//! Execution runtime: reference interpreter and the cooperative driver.
//!
//! One script instance executes strictly within the host's per-frame update
//! call. Suspension happens only at wait instructions; resumption only when
//! the host calls [`Runtime::run_one_step`] again for that instance.

pub mod instance;
pub mod interpreter;
pub mod state;

pub use instance::{InstanceState, Runtime, ScriptInstance};
pub use state::VmState;

use crate::asm::instruction::{Pc, RegId};

/// Terminal and progress statuses reported by the engines. The `i32`
/// representation crosses the native-code ABI unchanged.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Batch finished; keep executing.
    Ok = 0,
    /// Suspended at a wait instruction; call again next tick.
    Yielded = 1,
    /// Script ended by a quit instruction.
    Stopped = 2,
    /// Unrecoverable script error; see the VM state's last error.
    Error = 3,
}

impl RunStatus {
    /// Decode a status that crossed the C ABI.
    pub fn from_raw(raw: i32) -> RunStatus {
        match raw {
            0 => RunStatus::Ok,
            1 => RunStatus::Yielded,
            2 => RunStatus::Stopped,
            _ => RunStatus::Error,
        }
    }

    /// True for statuses that end the instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Stopped | RunStatus::Error)
    }
}

/// Runtime script failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    /// The bounded call-return array overflowed. Fatal for the instance.
    #[error("call-stack return overflow")]
    CallStackOverflow,
    /// A return executed with no call outstanding.
    #[error("call-stack return underflow")]
    CallStackUnderflow,
    /// A write targeted a read-only pseudo-register.
    #[error("write to read-only register {0}")]
    ReadOnlyRegister(RegId),
    /// Execution ran off the end of the instruction stream.
    #[error("program counter {0} out of bounds")]
    PcOutOfBounds(Pc),
    /// An unresolved label survived into execution.
    #[error("unresolved jump target at pc {0}")]
    UnresolvedTarget(Pc),
    /// No script with the requested name is in the run table.
    #[error("unknown script `{0}`")]
    UnknownScript(String),
}
