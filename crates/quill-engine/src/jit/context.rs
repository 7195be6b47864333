//! Execution-context ABI between native blocks and the runtime.
//!
//! Compiled blocks receive one [`JitContext`] pointer: an explicit,
//! per-invocation view of the instance's machine state. There is no global
//! mutable state; everything native code touches goes through this struct
//! or the helper symbols below, which rebuild an interpreter
//! [`Machine`] view over the same pointers.

use crate::asm::instruction::{CALL_STACK_DEPTH, REGISTER_FILE_SIZE, STACK_SIZE};
use crate::vm::interpreter::{self, CmpPair, Machine};
use crate::vm::state::VmState;

/// Status value meaning "keep executing blocks".
pub const STATUS_PENDING: i32 = -1;

/// No error recorded.
pub const ERROR_NONE: i32 = 0;
/// The bounded call-return array overflowed.
pub const ERROR_CALL_OVERFLOW: i32 = 1;
/// A return executed with no call outstanding.
pub const ERROR_CALL_UNDERFLOW: i32 = 2;

/// Machine state threaded through every compiled-block entry point. One per
/// script instance invocation, never shared.
#[repr(C)]
pub struct JitContext {
    /// Instance register file base.
    pub registers: *mut i32,
    /// Global register bank base.
    pub globals: *mut i32,
    /// Instance stack base (`STACK_SIZE` slots).
    pub stack: *mut i32,
    /// Bounded call-return array base (`CALL_STACK_DEPTH` slots).
    pub call_rets: *mut u32,
    /// Shared VM state, for the runtime helpers.
    pub vm: *mut VmState,
    /// Stack pointer.
    pub sp: u32,
    /// Program counter.
    pub pc: u32,
    /// Suspension points passed.
    pub wait_index: u32,
    /// Live depth of the call-return array.
    pub call_ret_index: u32,
    /// Switch-dispatch scratch key.
    pub switch_key: i32,
    /// Execution status; [`STATUS_PENDING`] while blocks keep running.
    pub status: i32,
    /// `ERROR_*` detail when `status` reports an error raised in native
    /// code.
    pub error_code: i32,
}

/// Field offsets for the code generator.
pub mod offsets {
    use super::JitContext;
    use std::mem::offset_of;

    /// `registers` pointer.
    pub const REGISTERS: i32 = offset_of!(JitContext, registers) as i32;
    /// `globals` pointer.
    pub const GLOBALS: i32 = offset_of!(JitContext, globals) as i32;
    /// `stack` pointer.
    pub const STACK: i32 = offset_of!(JitContext, stack) as i32;
    /// `call_rets` pointer.
    pub const CALL_RETS: i32 = offset_of!(JitContext, call_rets) as i32;
    /// `sp` field.
    pub const SP: i32 = offset_of!(JitContext, sp) as i32;
    /// `pc` field.
    pub const PC: i32 = offset_of!(JitContext, pc) as i32;
    /// `wait_index` field.
    pub const WAIT_INDEX: i32 = offset_of!(JitContext, wait_index) as i32;
    /// `call_ret_index` field.
    pub const CALL_RET_INDEX: i32 = offset_of!(JitContext, call_ret_index) as i32;
    /// `switch_key` field.
    pub const SWITCH_KEY: i32 = offset_of!(JitContext, switch_key) as i32;
    /// `status` field.
    pub const STATUS: i32 = offset_of!(JitContext, status) as i32;
    /// `error_code` field.
    pub const ERROR_CODE: i32 = offset_of!(JitContext, error_code) as i32;
}

/// Build an interpreter machine view over a context.
///
/// # Safety
/// Every pointer in `ctx` must be live and exclusively owned for the
/// duration of the borrow; `cmp` receives the comparison scratch.
unsafe fn machine<'a>(ctx: &'a mut JitContext, cmp: &'a mut CmpPair) -> Machine<'a> {
    Machine {
        regs: &mut *(ctx.registers as *mut [i32; REGISTER_FILE_SIZE]),
        stack: core::slice::from_raw_parts_mut(ctx.stack, STACK_SIZE),
        sp: &mut ctx.sp,
        pc: &mut ctx.pc,
        wait_index: &mut ctx.wait_index,
        switch_key: &mut ctx.switch_key,
        call_rets: core::slice::from_raw_parts_mut(ctx.call_rets, CALL_STACK_DEPTH),
        call_ret_index: &mut ctx.call_ret_index,
        cmp,
    }
}

/// Run `count` operations through the reference interpreter, starting at the
/// context's pc. Returns the raw [`crate::vm::RunStatus`].
///
/// # Safety
/// `ctx` must point to a live, exclusively borrowed context whose pointers
/// are all valid; called only from compiled blocks.
pub unsafe extern "C" fn quill_step_batch(ctx: *mut JitContext, count: u32) -> i32 {
    let ctx = &mut *ctx;
    let state = &mut *ctx.vm;
    let artifact = state.artifact.clone();
    // Comparisons never span a batch boundary; scratch state suffices.
    let mut cmp = CmpPair::default();
    let mut m = machine(ctx, &mut cmp);
    interpreter::step(state, &mut m, &artifact.code, count as u64) as i32
}

/// Generic register read for ids native code does not map directly.
///
/// # Safety
/// Same contract as [`quill_step_batch`].
pub unsafe extern "C" fn quill_get_register(ctx: *mut JitContext, reg: u32) -> i32 {
    let ctx = &mut *ctx;
    let state = &mut *ctx.vm;
    let mut cmp = CmpPair::default();
    let mut m = machine(ctx, &mut cmp);
    interpreter::get_register(state, &mut m, reg)
}

/// Generic register write for ids native code does not map directly.
/// Writes to read-only pseudo-registers are ignored here; the compiler
/// rejects them before any code is emitted.
///
/// # Safety
/// Same contract as [`quill_step_batch`].
pub unsafe extern "C" fn quill_set_register(ctx: *mut JitContext, reg: u32, value: i32) {
    let ctx = &mut *ctx;
    let state = &mut *ctx.vm;
    let mut cmp = CmpPair::default();
    let mut m = machine(ctx, &mut cmp);
    let _ = interpreter::set_register(state, &mut m, reg, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_layout_keeps_pointers_first() {
        // The codegen hardcodes these offsets; pointer fields must stay
        // pointer-aligned at the front of the struct.
        assert_eq!(offsets::REGISTERS, 0);
        assert!(offsets::SP > offsets::CALL_RETS);
        assert_eq!(offsets::PC, offsets::SP + 4);
        assert_eq!(offsets::WAIT_INDEX, offsets::PC + 4);
        assert_eq!(offsets::CALL_RET_INDEX, offsets::WAIT_INDEX + 4);
        assert_eq!(offsets::SWITCH_KEY, offsets::CALL_RET_INDEX + 4);
        assert_eq!(offsets::STATUS, offsets::SWITCH_KEY + 4);
        assert_eq!(offsets::ERROR_CODE, offsets::STATUS + 4);
    }
}
