//! Script execution handles and the cooperative runtime driver.
//!
//! One [`ScriptInstance`] per running script: it owns the live register
//! file, its stack ring, and the bounded call-return array. The
//! [`Runtime`] drives an instance one "tick" at a time through either the
//! block-cached native code or the reference interpreter, falling back to
//! full interpretation for any script the native compiler rejects.

use std::sync::Arc;

use crate::asm::instruction::{
    Pc, CALL_STACK_DEPTH, REGISTER_FILE_SIZE, STACK_MASK, STACK_SIZE,
};
use crate::asm::Artifact;

use super::interpreter::{self, CmpPair, Machine};
use super::state::VmState;
use super::{RunStatus, VmError};

#[cfg(feature = "jit")]
use crate::jit::{
    analysis::BlockMap,
    cache::CompiledScript,
    context::{JitContext, ERROR_CALL_OVERFLOW, ERROR_CALL_UNDERFLOW, ERROR_NONE, STATUS_PENDING},
};
#[cfg(feature = "jit")]
use parking_lot::Mutex;
#[cfg(feature = "jit")]
use rustc_hash::FxHashMap;
#[cfg(feature = "jit")]
use tracing::warn;

/// Lifecycle of a script instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Created; the entry pc is seeded on the first step.
    NotStarted,
    /// Running or suspended awaiting the next tick.
    Ready,
    /// Ended; holds the terminal status.
    Terminated(RunStatus),
}

/// One running script instance. Created when the instance starts, destroyed
/// when it ends or is explicitly reset.
pub struct ScriptInstance {
    name: String,
    start_pc: Pc,
    regs: [i32; REGISTER_FILE_SIZE],
    stack: Vec<i32>,
    sp: u32,
    pc: Pc,
    wait_index: u32,
    switch_key: i32,
    call_rets: [u32; CALL_STACK_DEPTH],
    call_ret_index: u32,
    cmp: CmpPair,
    state: InstanceState,
    interp_only: bool,
    #[cfg(feature = "jit")]
    compiled: Option<Arc<Mutex<CompiledScript>>>,
}

impl ScriptInstance {
    fn new(
        name: String,
        start_pc: Pc,
        #[cfg(feature = "jit")] compiled: Option<Arc<Mutex<CompiledScript>>>,
    ) -> Self {
        ScriptInstance {
            name,
            start_pc,
            regs: [0; REGISTER_FILE_SIZE],
            stack: vec![0; STACK_SIZE],
            sp: STACK_MASK,
            pc: start_pc,
            wait_index: 0,
            switch_key: 0,
            call_rets: [0; CALL_STACK_DEPTH],
            call_ret_index: 0,
            cmp: CmpPair::default(),
            state: InstanceState::NotStarted,
            interp_only: false,
            #[cfg(feature = "jit")]
            compiled,
        }
    }

    /// Script name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current program counter (the debugger's "paused at" address).
    pub fn pc(&self) -> Pc {
        self.pc
    }

    /// Suspension points passed so far.
    pub fn wait_index(&self) -> u32 {
        self.wait_index
    }

    /// Lifecycle state.
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Read a data register (debugger access).
    pub fn register(&self, r: usize) -> i32 {
        self.regs[r]
    }

    /// Clear the call-return and wait indices for reuse, leaving the
    /// compiled-block cache intact for future runs of the same script.
    pub fn reset(&mut self) {
        self.call_ret_index = 0;
        self.wait_index = 0;
        self.state = InstanceState::NotStarted;
    }

    /// Force the instance into the terminated state.
    pub fn terminate(&mut self) {
        self.state = InstanceState::Terminated(RunStatus::Stopped);
    }
}

/// Drives script instances over one assembled program.
pub struct Runtime {
    state: VmState,
    #[cfg(feature = "jit")]
    jit_enabled: bool,
    #[cfg(feature = "jit")]
    blocks: BlockMap,
    #[cfg(feature = "jit")]
    compiled: FxHashMap<String, Arc<Mutex<CompiledScript>>>,
}

impl Runtime {
    /// Runtime with native block compilation enabled (when built with the
    /// `jit` feature).
    pub fn new(artifact: Arc<Artifact>) -> Self {
        #[cfg(feature = "jit")]
        let blocks = BlockMap::build(
            &artifact.code,
            artifact.run_table.values().map(|r| r.start),
        );
        Runtime {
            state: VmState::new(artifact),
            #[cfg(feature = "jit")]
            jit_enabled: true,
            #[cfg(feature = "jit")]
            blocks,
            #[cfg(feature = "jit")]
            compiled: FxHashMap::default(),
        }
    }

    /// Runtime that always interprets.
    pub fn new_interpreted(artifact: Arc<Artifact>) -> Self {
        #[allow(unused_mut)]
        let mut rt = Runtime::new(artifact);
        #[cfg(feature = "jit")]
        {
            rt.jit_enabled = false;
        }
        rt
    }

    /// Shared VM state.
    pub fn state(&self) -> &VmState {
        &self.state
    }

    /// Shared VM state, mutably (host hooks, globals).
    pub fn state_mut(&mut self) -> &mut VmState {
        &mut self.state
    }

    /// Drain the trace sink.
    pub fn take_trace(&mut self) -> Vec<i32> {
        self.state.take_trace()
    }

    /// Create a not-yet-started instance of a named script.
    pub fn spawn(&mut self, name: &str) -> Result<ScriptInstance, VmError> {
        let range = self
            .state
            .artifact
            .run_range(name)
            .ok_or_else(|| VmError::UnknownScript(name.to_string()))?;
        let start_pc = range.start;
        #[cfg(feature = "jit")]
        {
            let compiled = if self.jit_enabled {
                self.compiled_for(name)
            } else {
                None
            };
            let mut inst = ScriptInstance::new(name.to_string(), start_pc, compiled);
            if inst.compiled.is_none() {
                inst.interp_only = true;
            }
            return Ok(inst);
        }
        #[cfg(not(feature = "jit"))]
        Ok(ScriptInstance::new(name.to_string(), start_pc))
    }

    #[cfg(feature = "jit")]
    fn compiled_for(&mut self, name: &str) -> Option<Arc<Mutex<CompiledScript>>> {
        if let Some(existing) = self.compiled.get(name) {
            return Some(existing.clone());
        }
        match CompiledScript::new() {
            Ok(cache) => {
                let arc = Arc::new(Mutex::new(cache));
                self.compiled.insert(name.to_string(), arc.clone());
                Some(arc)
            }
            Err(e) => {
                warn!(script = name, error = %e, "native backend unavailable; interpreting");
                None
            }
        }
    }

    /// Run one instance until it yields at a wait instruction or
    /// terminates. `Yielded` means call again next tick.
    pub fn run_one_step(&mut self, inst: &mut ScriptInstance) -> RunStatus {
        match inst.state {
            InstanceState::Terminated(status) => return status,
            InstanceState::NotStarted => {
                inst.pc = inst.start_pc;
                inst.state = InstanceState::Ready;
            }
            InstanceState::Ready => {}
        }
        #[cfg(feature = "jit")]
        if self.jit_enabled && !inst.interp_only && inst.compiled.is_some() {
            return self.run_native(inst);
        }
        self.run_interpreted(inst)
    }

    fn run_interpreted(&mut self, inst: &mut ScriptInstance) -> RunStatus {
        let artifact = self.state.artifact.clone();
        let mut machine = Machine {
            regs: &mut inst.regs,
            stack: &mut inst.stack,
            sp: &mut inst.sp,
            pc: &mut inst.pc,
            wait_index: &mut inst.wait_index,
            switch_key: &mut inst.switch_key,
            call_rets: &mut inst.call_rets,
            call_ret_index: &mut inst.call_ret_index,
            cmp: &mut inst.cmp,
        };
        let status = interpreter::step(&mut self.state, &mut machine, &artifact.code, u64::MAX);
        if status.is_terminal() {
            inst.state = InstanceState::Terminated(status);
        }
        status
    }

    /// Drive block-cached native code: compile the current pc's block on
    /// demand, execute it, repeat until something other than "keep going"
    /// comes back.
    #[cfg(feature = "jit")]
    fn run_native(&mut self, inst: &mut ScriptInstance) -> RunStatus {
        let Some(compiled) = inst.compiled.clone() else {
            inst.interp_only = true;
            return self.run_interpreted(inst);
        };
        let artifact = self.state.artifact.clone();
        loop {
            let pc = inst.pc;
            let block = compiled
                .lock()
                .get_or_compile(pc, &artifact.code, &self.blocks);
            let block = match block {
                Ok(f) => f,
                Err(_) => {
                    // Whole-script fallback; never mixed per-block.
                    inst.interp_only = true;
                    return self.run_interpreted(inst);
                }
            };

            let mut ctx = JitContext {
                registers: inst.regs.as_mut_ptr(),
                globals: self.state.globals.as_mut_ptr(),
                stack: inst.stack.as_mut_ptr(),
                call_rets: inst.call_rets.as_mut_ptr(),
                vm: &mut self.state as *mut VmState,
                sp: inst.sp,
                pc: inst.pc,
                wait_index: inst.wait_index,
                call_ret_index: inst.call_ret_index,
                switch_key: inst.switch_key,
                status: STATUS_PENDING,
                error_code: ERROR_NONE,
            };
            unsafe { block(&mut ctx) };
            inst.sp = ctx.sp;
            inst.pc = ctx.pc;
            inst.wait_index = ctx.wait_index;
            inst.call_ret_index = ctx.call_ret_index;
            inst.switch_key = ctx.switch_key;

            if ctx.status == STATUS_PENDING {
                continue;
            }
            let status = RunStatus::from_raw(ctx.status);
            if status == RunStatus::Error && self.state.last_error.is_none() {
                self.state.last_error = Some(match ctx.error_code {
                    ERROR_CALL_OVERFLOW => VmError::CallStackOverflow,
                    ERROR_CALL_UNDERFLOW => VmError::CallStackUnderflow,
                    _ => VmError::PcOutOfBounds(inst.pc),
                });
            }
            if status.is_terminal() {
                inst.state = InstanceState::Terminated(status);
            }
            return status;
        }
    }
}
