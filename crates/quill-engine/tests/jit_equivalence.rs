//! Native/interpreted equivalence.
//!
//! Every script here runs twice — once through the block compiler, once
//! through the reference interpreter — and must produce identical traces,
//! including fixed-point rounding, zero-divisor saturation, and suspension
//! behavior.

#![cfg(feature = "jit")]

use std::sync::Arc;

use quill_engine::asm::instruction::{
    d, Instr, Op, SourceLoc, Target, CMP_BOOL, CMP_EQ, CMP_GT, CMP_SETI, FIXED_ONE, REG_FRAME,
};
use quill_engine::asm::program::{FuncFlags, Function, Program, Script, ScriptKind, ScriptMeta};
use quill_engine::asm::{Artifact, Assembler};
use quill_engine::vm::{RunStatus, Runtime, VmError};

fn assemble_single(code: Vec<Instr>) -> Arc<Artifact> {
    let mut p = Program::new();
    let label = p.fresh_label();
    let mut code = code;
    if let Some(first) = code.first_mut() {
        first.label = Some(label);
    }
    let run = p.add_function(Function {
        id: 0,
        name: "run".into(),
        code,
        flags: FuncFlags::default(),
        label,
        alt_label: None,
        prologue_end_label: None,
        param_count: 0,
        scope: None,
        loc: SourceLoc::NONE,
    });
    p.scripts.push(Script {
        name: "main".into(),
        kind: ScriptKind::Global,
        meta: ScriptMeta::default(),
        run,
        init_weight: None,
    });
    Arc::new(Assembler::new(p).assemble().expect("assembly"))
}

fn run_all(rt: &mut Runtime) -> (RunStatus, Vec<i32>) {
    let mut inst = rt.spawn("main").expect("spawn");
    let mut guard = 0;
    loop {
        guard += 1;
        assert!(guard < 10_000, "script never terminated");
        let status = rt.run_one_step(&mut inst);
        if status != RunStatus::Yielded {
            return (status, rt.take_trace());
        }
    }
}

/// Run the script natively and interpreted; assert identical results.
fn assert_equivalent(artifact: Arc<Artifact>) -> (RunStatus, Vec<i32>) {
    let mut native = Runtime::new(artifact.clone());
    let (native_status, native_trace) = run_all(&mut native);
    let mut interp = Runtime::new_interpreted(artifact);
    let (interp_status, interp_trace) = run_all(&mut interp);
    assert_eq!(native_status, interp_status, "status diverged");
    assert_eq!(native_trace, interp_trace, "trace diverged");
    (native_status, native_trace)
}

/// Operand pairs covering sign boundaries and the zero divisor.
fn boundary_pairs() -> Vec<(i32, i32)> {
    let interesting = [
        0,
        1,
        -1,
        7,
        -7,
        3_333,
        -3_333,
        FIXED_ONE,
        -FIXED_ONE,
        123_456,
        -123_456,
        i32::MAX,
        i32::MIN,
        i32::MAX - 1,
        i32::MIN + 1,
    ];
    let mut pairs = Vec::new();
    for &a in &interesting {
        for &b in &[0, 1, -1, 3, -3, FIXED_ONE, -FIXED_ONE, 99_999] {
            pairs.push((a, b));
        }
    }
    pairs
}

#[test]
fn arithmetic_matches_bit_for_bit() {
    let mut code = Vec::new();
    for (a, b) in boundary_pairs() {
        for op in [
            Op::DivReg(d(0), d(1)),
            Op::ModReg(d(0), d(1)),
            Op::MulReg(d(0), d(1)),
        ] {
            code.push(Instr::new(Op::SetImm(d(0), a)));
            code.push(Instr::new(Op::SetImm(d(1), b)));
            code.push(Instr::new(op));
            code.push(Instr::new(Op::TraceReg(d(0))));
        }
    }
    code.push(Instr::new(Op::Quit));
    let (status, trace) = assert_equivalent(assemble_single(code));
    assert_eq!(status, RunStatus::Stopped);
    // Spot-check the saturation policy: 7 / 0 == i32::MAX.
    let idx = boundary_pairs().iter().position(|&p| p == (7, 0)).unwrap();
    assert_eq!(trace[idx * 3], i32::MAX);
}

#[test]
fn immediate_arithmetic_matches() {
    let mut code = Vec::new();
    for a in [0, 1, -1, 15_000, -15_000, 123_456, i32::MAX, i32::MIN] {
        for op in [
            Op::DivImm(d(0), 0),
            Op::DivImm(d(0), 30_000),
            Op::DivImm(d(0), -30_000),
            Op::ModImm(d(0), 0),
            Op::ModImm(d(0), 7),
            Op::MulImm(d(0), 25_000),
            Op::Abs(d(0)),
            Op::Floor(d(0)),
            Op::Ceil(d(0)),
            Op::CastBoolScaled(d(0)),
            Op::AndImm(d(0), 7_0000),
            Op::MinImm(d(0), 5_0000),
            Op::MaxImm(d(0), -5_0000),
            Op::RSubImm(d(0), 100),
        ] {
            code.push(Instr::new(Op::SetImm(d(0), a)));
            code.push(Instr::new(op));
            code.push(Instr::new(Op::TraceReg(d(0))));
        }
    }
    code.push(Instr::new(Op::Quit));
    let (status, _) = assert_equivalent(assemble_single(code));
    assert_eq!(status, RunStatus::Stopped);
}

#[test]
fn comparison_protocol_matches() {
    let mut code = Vec::new();
    for (a, b) in [(1, 2), (2, 1), (5, 5), (-3, 3), (0, 0), (i32::MIN, i32::MAX)] {
        code.push(Instr::new(Op::SetImm(d(0), a)));
        code.push(Instr::new(Op::SetImm(d(1), b)));
        code.push(Instr::new(Op::CompareReg(d(0), d(1))));
        code.push(Instr::new(Op::SetCmp(d(2), CMP_GT | CMP_EQ | CMP_SETI)));
        code.push(Instr::new(Op::TraceReg(d(2))));
        // Boolean-cast compare: any non-zero equals any non-zero.
        code.push(Instr::new(Op::CompareImm(d(0), 1)));
        code.push(Instr::new(Op::SetCmp(d(2), CMP_EQ | CMP_BOOL)));
        code.push(Instr::new(Op::TraceReg(d(2))));
    }
    code.push(Instr::new(Op::Quit));
    let (status, _) = assert_equivalent(assemble_single(code));
    assert_eq!(status, RunStatus::Stopped);
}

#[test]
fn two_waits_resume_at_correct_blocks() {
    let code = vec![
        Instr::new(Op::SetImm(d(0), 5)),
        Instr::new(Op::SetImm(d(1), 6)),
        Instr::new(Op::WaitFrame),
        Instr::new(Op::AddReg(d(0), d(1))),
        Instr::new(Op::WaitFrame),
        Instr::new(Op::TraceReg(d(0))),
        Instr::new(Op::TraceReg(d(1))),
        Instr::new(Op::Quit),
    ];
    let artifact = assemble_single(code);

    // Tick-by-tick against the native engine specifically.
    let mut rt = Runtime::new(artifact.clone());
    let mut inst = rt.spawn("main").unwrap();
    assert_eq!(rt.run_one_step(&mut inst), RunStatus::Yielded);
    assert_eq!(inst.wait_index(), 1);
    assert_eq!(rt.run_one_step(&mut inst), RunStatus::Yielded);
    assert_eq!(inst.wait_index(), 2);
    assert_eq!(rt.run_one_step(&mut inst), RunStatus::Stopped);
    assert_eq!(rt.take_trace(), vec![11, 6]);

    assert_equivalent(artifact);
}

#[test]
fn loops_and_stack_traffic_match() {
    let mut p = Program::new();
    let loop_label = p.fresh_label();
    let done_label = p.fresh_label();
    let code = vec![
        Instr::new(Op::SetImm(d(0), 10)),
        Instr::new(Op::PushImm(0)),
        Instr::new(Op::Pop(d(2))).with_label(loop_label),
        Instr::new(Op::AddReg(d(2), d(0))),
        Instr::new(Op::PushReg(d(2))),
        Instr::new(Op::SubImm(d(0), 1)),
        Instr::new(Op::CompareImm(d(0), 0)),
        Instr::new(Op::GotoCmp(Target::Label(done_label), CMP_EQ)),
        Instr::new(Op::Goto(Target::Label(loop_label))),
        Instr::new(Op::Pop(d(3))).with_label(done_label),
        Instr::new(Op::TraceReg(d(3))),
        Instr::new(Op::Quit),
    ];
    let label = p.fresh_label();
    let mut code = code;
    code[0].label = Some(label);
    let run = p.add_function(Function {
        id: 0,
        name: "run".into(),
        code,
        flags: FuncFlags::default(),
        label,
        alt_label: None,
        prologue_end_label: None,
        param_count: 0,
        scope: None,
        loc: SourceLoc::NONE,
    });
    p.scripts.push(Script {
        name: "main".into(),
        kind: ScriptKind::Global,
        meta: ScriptMeta::default(),
        run,
        init_weight: None,
    });
    let artifact = Arc::new(Assembler::new(p).assemble().unwrap());

    let (status, trace) = assert_equivalent(artifact);
    assert_eq!(status, RunStatus::Stopped);
    // Sum of 10..=1.
    assert_eq!(trace, vec![55]);
}

#[test]
fn function_calls_match() {
    let mut p = Program::new();
    let fn_label = p.next_label;
    let scale_code = vec![
        Instr::new(Op::MulImm(d(0), 3_0000)),
        Instr::new(Op::Return),
    ];
    let scale_label = p.fresh_label();
    assert_eq!(fn_label, scale_label);
    let mut scale_code = scale_code;
    scale_code[0].label = Some(scale_label);
    p.add_function(Function {
        id: 0,
        name: "scale".into(),
        code: scale_code,
        flags: FuncFlags::default(),
        label: scale_label,
        alt_label: None,
        prologue_end_label: None,
        param_count: 0,
        scope: None,
        loc: SourceLoc::NONE,
    });

    let run_label = p.fresh_label();
    let mut run_code = vec![
        Instr::new(Op::SetImm(d(0), 7_0000)),
        Instr::new(Op::PushReg(REG_FRAME)),
        Instr::new(Op::Call(Target::Label(scale_label))),
        Instr::new(Op::Pop(REG_FRAME)),
        Instr::new(Op::Call(Target::Label(scale_label))),
        Instr::new(Op::TraceReg(d(0))),
        Instr::new(Op::Quit),
    ];
    run_code[0].label = Some(run_label);
    let run = p.add_function(Function {
        id: 0,
        name: "run".into(),
        code: run_code,
        flags: FuncFlags::default(),
        label: run_label,
        alt_label: None,
        prologue_end_label: None,
        param_count: 0,
        scope: None,
        loc: SourceLoc::NONE,
    });
    p.scripts.push(Script {
        name: "main".into(),
        kind: ScriptKind::Global,
        meta: ScriptMeta::default(),
        run,
        init_weight: None,
    });
    let artifact = Arc::new(Assembler::new(p).assemble().unwrap());

    let (status, trace) = assert_equivalent(artifact);
    assert_eq!(status, RunStatus::Stopped);
    // 7.0 * 3.0 * 3.0 = 63.0
    assert_eq!(trace, vec![63_0000]);
}

#[test]
fn native_call_overflow_terminates_cleanly() {
    let mut p = Program::new();
    let spin_label = p.fresh_label();
    let mut spin_code = vec![
        Instr::new(Op::Call(Target::Label(spin_label))),
        Instr::new(Op::Return),
    ];
    spin_code[0].label = Some(spin_label);
    p.add_function(Function {
        id: 0,
        name: "spin".into(),
        code: spin_code,
        flags: FuncFlags::default(),
        label: spin_label,
        alt_label: None,
        prologue_end_label: None,
        param_count: 0,
        scope: None,
        loc: SourceLoc::NONE,
    });
    let run_label = p.fresh_label();
    let mut run_code = vec![
        Instr::new(Op::Call(Target::Label(spin_label))),
        Instr::new(Op::Quit),
    ];
    run_code[0].label = Some(run_label);
    let run = p.add_function(Function {
        id: 0,
        name: "run".into(),
        code: run_code,
        flags: FuncFlags::default(),
        label: run_label,
        alt_label: None,
        prologue_end_label: None,
        param_count: 0,
        scope: None,
        loc: SourceLoc::NONE,
    });
    p.scripts.push(Script {
        name: "main".into(),
        kind: ScriptKind::Global,
        meta: ScriptMeta::default(),
        run,
        init_weight: None,
    });
    let artifact = Arc::new(Assembler::new(p).assemble().unwrap());

    let mut rt = Runtime::new(artifact);
    let mut inst = rt.spawn("main").unwrap();
    let status = rt.run_one_step(&mut inst);
    assert_eq!(status, RunStatus::Error);
    assert!(matches!(
        rt.state().last_error,
        Some(VmError::CallStackOverflow)
    ));
}

#[test]
fn block_cache_is_reused_across_instances() {
    let artifact = assemble_single(vec![
        Instr::new(Op::SetImm(d(0), 2_5000)),
        Instr::new(Op::MulImm(d(0), 2_0000)),
        Instr::new(Op::TraceReg(d(0))),
        Instr::new(Op::Quit),
    ]);
    let mut rt = Runtime::new(artifact);

    let mut first = rt.spawn("main").unwrap();
    while rt.run_one_step(&mut first) == RunStatus::Yielded {}
    // A second instance of the same script executes through the same
    // compiled-block cache.
    let mut second = rt.spawn("main").unwrap();
    while rt.run_one_step(&mut second) == RunStatus::Yielded {}

    assert_eq!(rt.take_trace(), vec![5_0000, 5_0000]);
}
