//! Reference interpreter.
//!
//! Executes the finalized instruction stream one operation at a time. The
//! native block compiler's output is defined against this interpreter: both
//! engines must agree bit-for-bit on every fixed-point result, including the
//! zero-divisor saturation policy.

use crate::asm::instruction::{
    Instr, Op, Pc, RegId, Target, CMP_BOOL, CMP_EQ, CMP_GT, CMP_LT, CMP_SETI, FIXED_ONE,
    GLOBAL_COUNT, REGISTER_FILE_SIZE, REG_FRAME, REG_GLOBAL_BASE, REG_SP_RAW, REG_SP_SCALED,
    REG_SWITCH_KEY, STACK_MASK,
};

use super::state::VmState;
use super::{RunStatus, VmError};

/// The shared "last comparison" operand pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct CmpPair {
    /// Left operand as recorded.
    pub a: i32,
    /// Right operand as recorded.
    pub b: i32,
}

/// Mutable view of one script instance's machine state. Built from safe
/// borrows by the interpreter driver and from the native-code context by the
/// runtime helpers.
pub struct Machine<'a> {
    /// Register file (`D0..D7`, frame, reserved slots).
    pub regs: &'a mut [i32; REGISTER_FILE_SIZE],
    /// The instance's stack ring.
    pub stack: &'a mut [i32],
    /// Stack pointer; masked on every adjustment.
    pub sp: &'a mut u32,
    /// Program counter.
    pub pc: &'a mut Pc,
    /// Suspension points passed so far.
    pub wait_index: &'a mut u32,
    /// Switch-dispatch scratch key.
    pub switch_key: &'a mut i32,
    /// Bounded call-return addresses.
    pub call_rets: &'a mut [u32],
    /// Live depth of `call_rets`.
    pub call_ret_index: &'a mut u32,
    /// Last comparison operands.
    pub cmp: &'a mut CmpPair,
}

#[inline]
fn slot(idx: u32) -> usize {
    (idx & STACK_MASK) as usize
}

/// Truncating descale (toward zero), matching the native lowering.
#[inline]
pub fn descale(v: i32) -> i32 {
    v / FIXED_ONE
}

/// Fixed-point multiply with a 64-bit intermediate.
#[inline]
pub fn fixed_mul(a: i32, b: i32) -> i32 {
    ((a as i64 * b as i64) / FIXED_ONE as i64) as i32
}

/// Fixed-point divide. A zero divisor saturates to signed max magnitude in
/// the dividend's sign direction rather than trapping.
#[inline]
pub fn fixed_div(a: i32, b: i32) -> i32 {
    if b == 0 {
        if a < 0 {
            -i32::MAX
        } else {
            i32::MAX
        }
    } else {
        ((a as i64 * FIXED_ONE as i64) / b as i64) as i32
    }
}

/// Remainder; zero divisor yields zero.
#[inline]
pub fn fixed_mod(a: i32, b: i32) -> i32 {
    if b == 0 {
        0
    } else {
        (a as i64 % b as i64) as i32
    }
}

/// Round down to a whole fixed-point value.
#[inline]
pub fn fixed_floor(v: i32) -> i32 {
    let mut d = v / FIXED_ONE;
    if v % FIXED_ONE != 0 && v < 0 {
        d -= 1;
    }
    d.wrapping_mul(FIXED_ONE)
}

/// Round up to a whole fixed-point value.
#[inline]
pub fn fixed_ceil(v: i32) -> i32 {
    let mut d = v / FIXED_ONE;
    if v % FIXED_ONE != 0 && v > 0 {
        d += 1;
    }
    d.wrapping_mul(FIXED_ONE)
}

/// Does the recorded comparison satisfy the outcome mask?
#[inline]
pub fn cmp_matches(cmp: CmpPair, mask: u8) -> bool {
    (mask & CMP_GT != 0 && cmp.a > cmp.b)
        || (mask & CMP_LT != 0 && cmp.a < cmp.b)
        || (mask & CMP_EQ != 0 && cmp.a == cmp.b)
}

/// Read any register id.
pub fn get_register(state: &mut VmState, m: &mut Machine<'_>, r: RegId) -> i32 {
    match r {
        0..=8 => m.regs[r as usize],
        REG_SWITCH_KEY => *m.switch_key,
        REG_SP_SCALED => (*m.sp as i32).wrapping_mul(FIXED_ONE),
        REG_SP_RAW => *m.sp as i32,
        r if (REG_GLOBAL_BASE..REG_GLOBAL_BASE + GLOBAL_COUNT).contains(&r) => {
            state.globals[(r - REG_GLOBAL_BASE) as usize]
        }
        other => match state.host.read.as_mut() {
            Some(read) => read(other),
            None => 0,
        },
    }
}

/// Write any register id. Writes to the stack-pointer pseudo-registers are
/// rejected.
pub fn set_register(
    state: &mut VmState,
    m: &mut Machine<'_>,
    r: RegId,
    value: i32,
) -> Result<(), VmError> {
    match r {
        0..=8 => m.regs[r as usize] = value,
        REG_SWITCH_KEY => *m.switch_key = value,
        REG_SP_SCALED | REG_SP_RAW => return Err(VmError::ReadOnlyRegister(r)),
        r if (REG_GLOBAL_BASE..REG_GLOBAL_BASE + GLOBAL_COUNT).contains(&r) => {
            state.globals[(r - REG_GLOBAL_BASE) as usize] = value
        }
        other => {
            if let Some(write) = state.host.write.as_mut() {
                write(other, value);
            }
        }
    }
    Ok(())
}

fn target_pc(t: Target) -> Result<Pc, VmError> {
    match t {
        Target::Pc(pc) => Ok(pc),
        Target::Label(_) => Err(VmError::UnresolvedTarget(0)),
    }
}

fn fail(state: &mut VmState, err: VmError) -> RunStatus {
    state.last_error = Some(err);
    RunStatus::Error
}

/// Execute up to `count` operations starting at the machine's pc. Returns
/// `Ok` when the budget runs out, otherwise the status that ended the run.
pub fn step(state: &mut VmState, m: &mut Machine<'_>, code: &[Instr], count: u64) -> RunStatus {
    let mut executed: u64 = 0;
    while executed < count {
        let pc = *m.pc;
        let Some(instr) = code.get(pc as usize) else {
            return fail(state, VmError::PcOutOfBounds(pc));
        };
        let mut next_pc = pc + 1;

        macro_rules! get {
            ($r:expr) => {
                get_register(state, m, $r)
            };
        }
        macro_rules! set {
            ($r:expr, $v:expr) => {
                if let Err(e) = set_register(state, m, $r, $v) {
                    return fail(state, e);
                }
            };
        }

        match instr.op {
            Op::Nop => {}
            Op::Quit => {
                *m.wait_index = 0;
                *m.pc = next_pc;
                return RunStatus::Stopped;
            }
            Op::WaitFrame => {
                *m.wait_index += 1;
                *m.pc = next_pc;
                return RunStatus::Yielded;
            }

            Op::Goto(t) => match target_pc(t) {
                Ok(p) => next_pc = p,
                Err(_) => return fail(state, VmError::UnresolvedTarget(pc)),
            },
            op @ (Op::GotoCmp(..)
            | Op::GotoTrue(_)
            | Op::GotoFalse(_)
            | Op::GotoMore(_)
            | Op::GotoLess(_)) => {
                let mask = op.consumer_mask().unwrap_or(0);
                if cmp_matches(*m.cmp, mask) {
                    let t = op.target().unwrap_or(Target::Pc(next_pc));
                    match target_pc(t) {
                        Ok(p) => next_pc = p,
                        Err(_) => return fail(state, VmError::UnresolvedTarget(pc)),
                    }
                }
            }
            Op::Call(t) => {
                let idx = *m.call_ret_index as usize;
                if idx >= m.call_rets.len() {
                    return fail(state, VmError::CallStackOverflow);
                }
                m.call_rets[idx] = next_pc;
                *m.call_ret_index += 1;
                match target_pc(t) {
                    Ok(p) => next_pc = p,
                    Err(_) => return fail(state, VmError::UnresolvedTarget(pc)),
                }
            }
            Op::Return => {
                if *m.call_ret_index == 0 {
                    return fail(state, VmError::CallStackUnderflow);
                }
                *m.call_ret_index -= 1;
                next_pc = m.call_rets[*m.call_ret_index as usize];
            }

            Op::PushReg(r) => {
                let v = get!(r);
                *m.sp = (m.sp.wrapping_sub(1)) & STACK_MASK;
                m.stack[slot(*m.sp)] = v;
            }
            Op::PushImm(v) => {
                *m.sp = (m.sp.wrapping_sub(1)) & STACK_MASK;
                m.stack[slot(*m.sp)] = v;
            }
            Op::PushArgsReg(r, n) => {
                let v = get!(r);
                for _ in 0..n {
                    *m.sp = (m.sp.wrapping_sub(1)) & STACK_MASK;
                    m.stack[slot(*m.sp)] = v;
                }
            }
            Op::PushArgsImm(v, n) => {
                for _ in 0..n {
                    *m.sp = (m.sp.wrapping_sub(1)) & STACK_MASK;
                    m.stack[slot(*m.sp)] = v;
                }
            }
            Op::Pop(r) => {
                let v = m.stack[slot(*m.sp)];
                *m.sp = (m.sp.wrapping_add(1)) & STACK_MASK;
                set!(r, v);
            }
            Op::PopArgs(r, n) => {
                *m.sp = (m.sp.wrapping_add(n)) & STACK_MASK;
                let read = (m.sp.wrapping_sub(1)) & STACK_MASK;
                let v = m.stack[read as usize];
                set!(r, v);
            }
            Op::Peek(r) => {
                let v = m.stack[slot(*m.sp)];
                set!(r, v);
            }
            Op::PeekAt(r, off) => {
                let v = m.stack[slot(m.sp.wrapping_add(off as u32))];
                set!(r, v);
            }

            Op::SetImm(r, v) => set!(r, v),
            Op::SetReg(dst, src) => {
                let v = get!(src);
                set!(dst, v);
            }
            Op::Load(r, off) => {
                let frame = m.regs[REG_FRAME as usize];
                let v = m.stack[slot((frame.wrapping_add(off)) as u32)];
                set!(r, v);
            }
            Op::Store(r, off) => {
                let frame = m.regs[REG_FRAME as usize];
                let v = get!(r);
                m.stack[slot((frame.wrapping_add(off)) as u32)] = v;
            }
            Op::StoreImm(v, off) => {
                let frame = m.regs[REG_FRAME as usize];
                m.stack[slot((frame.wrapping_add(off)) as u32)] = v;
            }
            Op::LoadIndirect(r, r_off) => {
                let idx = descale(get!(r_off));
                let v = m.stack[slot(idx as u32)];
                set!(r, v);
            }
            Op::StoreIndirect(r, r_off) => {
                let idx = descale(get!(r_off));
                let v = get!(r);
                m.stack[slot(idx as u32)] = v;
            }
            Op::StackWriteImm(v, off) => {
                m.stack[slot(m.sp.wrapping_add(off as u32))] = v;
            }

            Op::AddImm(r, v) => {
                let x = get!(r);
                set!(r, x.wrapping_add(v));
            }
            Op::AddReg(r, r2) => {
                let x = get!(r);
                let y = get!(r2);
                set!(r, x.wrapping_add(y));
            }
            Op::SubImm(r, v) => {
                let x = get!(r);
                set!(r, x.wrapping_sub(v));
            }
            Op::SubReg(r, r2) => {
                let x = get!(r);
                let y = get!(r2);
                set!(r, x.wrapping_sub(y));
            }
            Op::RSubImm(r, v) => {
                let x = get!(r);
                set!(r, v.wrapping_sub(x));
            }
            Op::MulImm(r, v) => {
                let x = get!(r);
                set!(r, fixed_mul(x, v));
            }
            Op::MulReg(r, r2) => {
                let x = get!(r);
                let y = get!(r2);
                set!(r, fixed_mul(x, y));
            }
            Op::DivImm(r, v) => {
                let x = get!(r);
                set!(r, fixed_div(x, v));
            }
            Op::DivReg(r, r2) => {
                let x = get!(r);
                let y = get!(r2);
                set!(r, fixed_div(x, y));
            }
            Op::ModImm(r, v) => {
                let x = get!(r);
                set!(r, fixed_mod(x, v));
            }
            Op::ModReg(r, r2) => {
                let x = get!(r);
                let y = get!(r2);
                set!(r, fixed_mod(x, y));
            }
            Op::MinImm(r, v) => {
                let x = get!(r);
                set!(r, x.min(v));
            }
            Op::MinReg(r, r2) => {
                let x = get!(r);
                let y = get!(r2);
                set!(r, x.min(y));
            }
            Op::MaxImm(r, v) => {
                let x = get!(r);
                set!(r, x.max(v));
            }
            Op::MaxReg(r, r2) => {
                let x = get!(r);
                let y = get!(r2);
                set!(r, x.max(y));
            }
            Op::AndImm(r, v) => {
                let x = get!(r);
                set!(r, (descale(x) & (v / FIXED_ONE)).wrapping_mul(FIXED_ONE));
            }
            Op::AndReg(r, r2) => {
                let x = get!(r);
                let y = get!(r2);
                set!(r, (descale(x) & descale(y)).wrapping_mul(FIXED_ONE));
            }
            Op::Abs(r) => {
                let x = get!(r);
                set!(r, x.wrapping_abs());
            }
            Op::Floor(r) => {
                let x = get!(r);
                set!(r, fixed_floor(x));
            }
            Op::Ceil(r) => {
                let x = get!(r);
                set!(r, fixed_ceil(x));
            }
            Op::CastBool(r) => {
                let x = get!(r);
                set!(r, (x != 0) as i32);
            }
            Op::CastBoolScaled(r) => {
                let x = get!(r);
                set!(r, (x != 0) as i32 * FIXED_ONE);
            }

            Op::CompareReg(ra, rb) => {
                let mut a = get!(ra);
                let mut b = get!(rb);
                if next_wants_bool(code, pc) {
                    a = (a != 0) as i32;
                    b = (b != 0) as i32;
                }
                *m.cmp = CmpPair { a, b };
            }
            Op::CompareImm(r, v) => {
                let mut a = get!(r);
                let mut b = v;
                if next_wants_bool(code, pc) {
                    a = (a != 0) as i32;
                    b = (b != 0) as i32;
                }
                *m.cmp = CmpPair { a, b };
            }
            Op::SetCmp(r, mask) => {
                let hit = cmp_matches(*m.cmp, mask);
                let on = if mask & CMP_SETI != 0 { FIXED_ONE } else { 1 };
                set!(r, if hit { on } else { 0 });
            }

            Op::TraceReg(r) => {
                let v = get!(r);
                state.trace.push(v);
                tracing::trace!(value = v, pc, "trace");
            }
            Op::TraceImm(v) => {
                state.trace.push(v);
                tracing::trace!(value = v, pc, "trace");
            }
        }

        *m.pc = next_pc;
        executed += 1;
    }
    RunStatus::Ok
}

/// Does the instruction after `pc` consume the comparison in boolean mode?
#[inline]
fn next_wants_bool(code: &[Instr], pc: Pc) -> bool {
    code.get(pc as usize + 1)
        .and_then(|i| i.op.consumer_mask())
        .is_some_and(|mask| mask & CMP_BOOL != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::instruction::{d, CMP_GE, CMP_NE};

    #[test]
    fn division_truncates_toward_zero() {
        // 7 / 2 = 3.5 exactly representable; -7/2 likewise.
        assert_eq!(fixed_div(70_000, 20_000), 35_000);
        assert_eq!(fixed_div(-70_000, 20_000), -35_000);
        // 1/3 truncates.
        assert_eq!(fixed_div(10_000, 30_000), 3_333);
        assert_eq!(fixed_div(-10_000, 30_000), -3_333);
    }

    #[test]
    fn division_by_zero_saturates_by_sign() {
        assert_eq!(fixed_div(5, 0), i32::MAX);
        assert_eq!(fixed_div(0, 0), i32::MAX);
        assert_eq!(fixed_div(-5, 0), -i32::MAX);
    }

    #[test]
    fn modulo_by_zero_is_zero() {
        assert_eq!(fixed_mod(12_345, 0), 0);
        assert_eq!(fixed_mod(i32::MIN, -1), 0); // would trap as raw i32 rem
        assert_eq!(fixed_mod(7, 3), 1);
        assert_eq!(fixed_mod(-7, 3), -1);
    }

    #[test]
    fn floor_and_ceil_are_integer_exact() {
        assert_eq!(fixed_floor(15_000), 10_000);
        assert_eq!(fixed_floor(-15_000), -20_000);
        assert_eq!(fixed_floor(20_000), 20_000);
        assert_eq!(fixed_ceil(15_000), 20_000);
        assert_eq!(fixed_ceil(-15_000), -10_000);
        assert_eq!(fixed_ceil(-20_000), -20_000);
    }

    #[test]
    fn cmp_masks_follow_recorded_pair() {
        let gt = CmpPair { a: 3, b: 1 };
        let lt = CmpPair { a: 1, b: 3 };
        let eq = CmpPair { a: 2, b: 2 };
        assert!(cmp_matches(gt, CMP_GT));
        assert!(!cmp_matches(gt, CMP_LT));
        assert!(cmp_matches(gt, CMP_GE));
        assert!(cmp_matches(eq, CMP_GE));
        assert!(!cmp_matches(eq, CMP_NE));
        assert!(cmp_matches(lt, CMP_NE));
    }

    struct Harness {
        state: VmState,
        regs: [i32; REGISTER_FILE_SIZE],
        stack: Vec<i32>,
        sp: u32,
        pc: u32,
        wait: u32,
        switch_key: i32,
        rets: Vec<u32>,
        ret_index: u32,
        cmp: CmpPair,
    }

    impl Harness {
        fn new(code: Vec<Instr>) -> (Self, Vec<Instr>) {
            use crate::asm::assembler::Artifact;
            use rustc_hash::FxHashMap;
            let artifact = Artifact {
                code: code.clone(),
                run_table: FxHashMap::default(),
                debug: Default::default(),
            };
            (
                Harness {
                    state: VmState::new(std::sync::Arc::new(artifact)),
                    regs: [0; REGISTER_FILE_SIZE],
                    stack: vec![0; crate::asm::instruction::STACK_SIZE],
                    sp: STACK_MASK,
                    pc: 0,
                    wait: 0,
                    switch_key: 0,
                    rets: vec![0; 4],
                    ret_index: 0,
                    cmp: CmpPair::default(),
                },
                code,
            )
        }

        fn run(&mut self, code: &[Instr]) -> RunStatus {
            let mut m = Machine {
                regs: &mut self.regs,
                stack: &mut self.stack,
                sp: &mut self.sp,
                pc: &mut self.pc,
                wait_index: &mut self.wait,
                switch_key: &mut self.switch_key,
                call_rets: &mut self.rets,
                call_ret_index: &mut self.ret_index,
                cmp: &mut self.cmp,
            };
            step(&mut self.state, &mut m, code, u64::MAX)
        }
    }

    #[test]
    fn push_pop_round_trip() {
        let (mut h, code) = Harness::new(vec![
            Instr::new(Op::SetImm(d(0), 42)),
            Instr::new(Op::PushReg(d(0))),
            Instr::new(Op::PushImm(7)),
            Instr::new(Op::Pop(d(1))),
            Instr::new(Op::Pop(d(2))),
            Instr::new(Op::Quit),
        ]);
        assert_eq!(h.run(&code), RunStatus::Stopped);
        assert_eq!(h.regs[1], 7);
        assert_eq!(h.regs[2], 42);
        assert_eq!(h.sp, STACK_MASK);
    }

    #[test]
    fn pop_args_reads_last_popped_slot() {
        let (mut h, code) = Harness::new(vec![
            Instr::new(Op::PushImm(10)),
            Instr::new(Op::PushImm(20)),
            Instr::new(Op::PushImm(30)),
            Instr::new(Op::PopArgs(d(3), 3)),
            Instr::new(Op::Quit),
        ]);
        assert_eq!(h.run(&code), RunStatus::Stopped);
        // The last slot dropped held the first value pushed.
        assert_eq!(h.regs[3], 10);
        assert_eq!(h.sp, STACK_MASK);
    }

    #[test]
    fn wait_yields_and_resumes() {
        let (mut h, code) = Harness::new(vec![
            Instr::new(Op::SetImm(d(0), 5)),
            Instr::new(Op::WaitFrame),
            Instr::new(Op::AddImm(d(0), 3)),
            Instr::new(Op::Quit),
        ]);
        assert_eq!(h.run(&code), RunStatus::Yielded);
        assert_eq!(h.wait, 1);
        assert_eq!(h.pc, 2);
        assert_eq!(h.run(&code), RunStatus::Stopped);
        assert_eq!(h.regs[0], 8);
        assert_eq!(h.wait, 0); // quit resets the wait index
    }

    #[test]
    fn call_overflow_is_fatal() {
        // A function that calls itself forever.
        let (mut h, code) = Harness::new(vec![
            Instr::new(Op::Call(Target::Pc(0))),
            Instr::new(Op::Quit),
        ]);
        assert_eq!(h.run(&code), RunStatus::Error);
        assert!(matches!(
            h.state.last_error,
            Some(VmError::CallStackOverflow)
        ));
        // The array never grew past its bound.
        assert_eq!(h.ret_index as usize, h.rets.len());
    }

    #[test]
    fn call_and_return_round_trip() {
        let (mut h, code) = Harness::new(vec![
            Instr::new(Op::Call(Target::Pc(3))),
            Instr::new(Op::TraceImm(2)),
            Instr::new(Op::Quit),
            Instr::new(Op::TraceImm(1)),
            Instr::new(Op::Return),
        ]);
        assert_eq!(h.run(&code), RunStatus::Stopped);
        assert_eq!(h.state.take_trace(), vec![1, 2]);
    }

    #[test]
    fn compare_bool_mode_peeks_consumer() {
        let (mut h, code) = Harness::new(vec![
            Instr::new(Op::SetImm(d(2), 5_0000)),
            // Bool-mode compare: 5.0 and 1 both cast to "true".
            Instr::new(Op::CompareImm(d(2), 1)),
            Instr::new(Op::SetCmp(d(3), CMP_EQ | CMP_BOOL | CMP_SETI)),
            Instr::new(Op::Quit),
        ]);
        assert_eq!(h.run(&code), RunStatus::Stopped);
        assert_eq!(h.regs[3], FIXED_ONE);
    }

    #[test]
    fn frame_relative_store_and_load() {
        let (mut h, code) = Harness::new(vec![
            Instr::new(Op::SetImm(REG_FRAME, 100)),
            Instr::new(Op::SetImm(d(0), 777)),
            Instr::new(Op::Store(d(0), 3)),
            Instr::new(Op::Load(d(1), 3)),
            Instr::new(Op::Quit),
        ]);
        assert_eq!(h.run(&code), RunStatus::Stopped);
        assert_eq!(h.stack[103], 777);
        assert_eq!(h.regs[1], 777);
    }

    #[test]
    fn indirect_access_descaled() {
        let (mut h, code) = Harness::new(vec![
            Instr::new(Op::SetImm(d(0), 555)),
            Instr::new(Op::SetImm(d(6), 50 * FIXED_ONE)),
            Instr::new(Op::StoreIndirect(d(0), d(6))),
            Instr::new(Op::LoadIndirect(d(1), d(6))),
            Instr::new(Op::Quit),
        ]);
        assert_eq!(h.run(&code), RunStatus::Stopped);
        assert_eq!(h.stack[50], 555);
        assert_eq!(h.regs[1], 555);
    }

    #[test]
    fn sp_pseudo_registers_are_read_only() {
        let (mut h, code) = Harness::new(vec![
            Instr::new(Op::SetImm(REG_SP_RAW, 5)),
            Instr::new(Op::Quit),
        ]);
        assert_eq!(h.run(&code), RunStatus::Error);
        assert!(matches!(
            h.state.last_error,
            Some(VmError::ReadOnlyRegister(REG_SP_RAW))
        ));
    }

    #[test]
    fn sp_scaled_reads_stack_pointer() {
        let (mut h, code) = Harness::new(vec![
            Instr::new(Op::PushImm(1)),
            Instr::new(Op::SetReg(d(0), REG_SP_SCALED)),
            Instr::new(Op::SetReg(d(1), REG_SP_RAW)),
            Instr::new(Op::Quit),
        ]);
        assert_eq!(h.run(&code), RunStatus::Stopped);
        let sp = (STACK_MASK - 1) as i32;
        assert_eq!(h.regs[0], sp * FIXED_ONE);
        assert_eq!(h.regs[1], sp);
    }
}
