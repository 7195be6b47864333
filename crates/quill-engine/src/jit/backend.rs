//! Cranelift block compiler.
//!
//! Lowers one basic block of the finalized stream into a native function
//! with the `extern "C" fn(*mut JitContext)` entry ABI. The lowering mirrors
//! the reference interpreter operation by operation; fixed-point multiply
//! and divide widen to 64 bits and divide truncating toward zero, and a zero
//! divisor saturates to signed max magnitude exactly as the interpreter
//! does.
//!
//! The stack pointer and switch key live in Cranelift variables for the
//! whole block and are flushed in a single epilogue; the "last comparison"
//! operands live in two more variables that consuming instructions read
//! according to their outcome masks. Trace and other uncompiled operations
//! are delegated to the interpreter through `quill_step_batch` in contiguous
//! runs, with the returned status checked after every call.

use cranelift_codegen::ir::{self, condcodes::IntCC, types, AbiParam, InstBuilder, MemFlags, Value};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module};
use tracing::debug;

use crate::asm::instruction::{
    Instr, Op, Pc, RegId, Target, CMP_EQ, CMP_FLAGS, CMP_GE, CMP_GT, CMP_LE, CMP_LT, CMP_NE,
    CMP_SETI, FIXED_ONE, GLOBAL_COUNT, REG_FRAME, REG_GLOBAL_BASE, REG_SP_RAW, REG_SP_SCALED,
    REG_SWITCH_KEY, CALL_STACK_DEPTH, STACK_MASK,
};
use crate::vm::RunStatus;

use super::analysis::BlockMap;
use super::context::{
    offsets, quill_get_register, quill_set_register, quill_step_batch, JitContext,
    ERROR_CALL_OVERFLOW, ERROR_CALL_UNDERFLOW, STATUS_PENDING,
};
use super::CompileError;

/// Entry signature of a compiled block.
pub type BlockFn = unsafe extern "C" fn(*mut JitContext);

/// True for operations the compiler delegates to the interpreter.
fn is_batched(op: &Op) -> bool {
    matches!(op, Op::TraceReg(_) | Op::TraceImm(_))
}

/// Per-script native compiler: owns the JIT module holding every block
/// compiled for that script.
pub struct BlockCompiler {
    module: Option<JITModule>,
    builder_ctx: FunctionBuilderContext,
    get_register: FuncId,
    set_register: FuncId,
    step_batch: FuncId,
}

#[derive(Clone, Copy)]
struct HelperIds {
    get_register: FuncId,
    set_register: FuncId,
    step_batch: FuncId,
}

impl BlockCompiler {
    /// Create a compiler targeting the host machine.
    pub fn new() -> Result<Self, CompileError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(|e| CompileError::Backend(e.to_string()))?;
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| CompileError::Backend(e.to_string()))?;
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CompileError::Backend(e.to_string()))?;
        let isa = cranelift_native::builder()
            .map_err(|e| CompileError::Backend(e.to_string()))?
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| CompileError::Backend(e.to_string()))?;

        let mut jit_builder = JITBuilder::with_isa(isa, default_libcall_names());
        jit_builder.symbol("quill_step_batch", quill_step_batch as *const u8);
        jit_builder.symbol("quill_get_register", quill_get_register as *const u8);
        jit_builder.symbol("quill_set_register", quill_set_register as *const u8);
        let mut module = JITModule::new(jit_builder);
        let ptr_ty = module.target_config().pointer_type();

        let mut sig = module.make_signature();
        sig.params.push(AbiParam::new(ptr_ty));
        sig.params.push(AbiParam::new(types::I32));
        sig.returns.push(AbiParam::new(types::I32));
        let get_register = module.declare_function("quill_get_register", Linkage::Import, &sig)?;

        let mut sig = module.make_signature();
        sig.params.push(AbiParam::new(ptr_ty));
        sig.params.push(AbiParam::new(types::I32));
        sig.params.push(AbiParam::new(types::I32));
        let set_register = module.declare_function("quill_set_register", Linkage::Import, &sig)?;

        let mut sig = module.make_signature();
        sig.params.push(AbiParam::new(ptr_ty));
        sig.params.push(AbiParam::new(types::I32));
        sig.returns.push(AbiParam::new(types::I32));
        let step_batch = module.declare_function("quill_step_batch", Linkage::Import, &sig)?;

        Ok(BlockCompiler {
            module: Some(module),
            builder_ctx: FunctionBuilderContext::new(),
            get_register,
            set_register,
            step_batch,
        })
    }

    /// Compile the block whose entry address is `pc`.
    pub fn compile_block(
        &mut self,
        pc: Pc,
        code: &[Instr],
        blocks: &BlockMap,
    ) -> Result<BlockFn, CompileError> {
        let (start, last) = blocks.block_range(pc).ok_or(CompileError::NotABlock(pc))?;
        let started = std::time::Instant::now();
        let helpers = HelperIds {
            get_register: self.get_register,
            set_register: self.set_register,
            step_batch: self.step_batch,
        };
        let module = self.module.as_mut().ok_or(CompileError::Disabled)?;
        let ptr_ty = module.target_config().pointer_type();

        let mut ctx = module.make_context();
        ctx.func.signature.params.push(AbiParam::new(ptr_ty));
        let name = format!("quill_block_{start}");
        let func_id = module.declare_function(&name, Linkage::Export, &ctx.func.signature)?;

        {
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut self.builder_ctx);
            let mut lowering = Lowering::new(module, &mut builder, helpers, ptr_ty);
            lowering.lower(code, start, last)?;
            builder.finalize();
        }

        module.define_function(func_id, &mut ctx)?;
        module.clear_context(&mut ctx);
        module.finalize_definitions()?;
        let code_ptr = module.get_finalized_function(func_id);

        debug!(
            start,
            last,
            micros = started.elapsed().as_micros() as u64,
            "compiled native block"
        );
        // The module owns the code memory for as long as this compiler lives.
        Ok(unsafe { std::mem::transmute::<*const u8, BlockFn>(code_ptr) })
    }
}

impl Drop for BlockCompiler {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // Returned block pointers die with this compiler.
            unsafe { module.free_memory() };
        }
    }
}

struct Lowering<'a, 'b> {
    module: &'a mut JITModule,
    builder: &'a mut FunctionBuilder<'b>,
    ptr_ty: types::Type,
    helpers: HelperIds,
    get_ref: Option<ir::FuncRef>,
    set_ref: Option<ir::FuncRef>,
    batch_ref: Option<ir::FuncRef>,
    ctx_param: Value,
    regs_ptr: Value,
    globals_ptr: Value,
    stack_ptr: Value,
    rets_ptr: Value,
    sp: Variable,
    switch_key: Variable,
    cmp_a: Variable,
    cmp_b: Variable,
    epilogue: ir::Block,
}

impl<'a, 'b> Lowering<'a, 'b> {
    fn new(
        module: &'a mut JITModule,
        builder: &'a mut FunctionBuilder<'b>,
        helpers: HelperIds,
        ptr_ty: types::Type,
    ) -> Self {
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let ctx_param = builder.block_params(entry)[0];
        let epilogue = builder.create_block();

        let tr = MemFlags::trusted();
        let regs_ptr = builder.ins().load(ptr_ty, tr, ctx_param, offsets::REGISTERS);
        let globals_ptr = builder.ins().load(ptr_ty, tr, ctx_param, offsets::GLOBALS);
        let stack_ptr = builder.ins().load(ptr_ty, tr, ctx_param, offsets::STACK);
        let rets_ptr = builder.ins().load(ptr_ty, tr, ctx_param, offsets::CALL_RETS);

        let sp = builder.declare_var(types::I32);
        let sp0 = builder.ins().load(types::I32, tr, ctx_param, offsets::SP);
        builder.def_var(sp, sp0);
        let switch_key = builder.declare_var(types::I32);
        let sk0 = builder
            .ins()
            .load(types::I32, tr, ctx_param, offsets::SWITCH_KEY);
        builder.def_var(switch_key, sk0);
        let cmp_a = builder.declare_var(types::I32);
        let cmp_b = builder.declare_var(types::I32);
        let zero = builder.ins().iconst(types::I32, 0);
        builder.def_var(cmp_a, zero);
        builder.def_var(cmp_b, zero);

        Lowering {
            module,
            builder,
            ptr_ty,
            helpers,
            get_ref: None,
            set_ref: None,
            batch_ref: None,
            ctx_param,
            regs_ptr,
            globals_ptr,
            stack_ptr,
            rets_ptr,
            sp,
            switch_key,
            cmp_a,
            cmp_b,
            epilogue,
        }
    }

    fn lower(&mut self, code: &[Instr], start: Pc, last: Pc) -> Result<(), CompileError> {
        let last_i = last as usize;
        let mut i = start as usize;
        let mut open = true;
        while i <= last_i {
            let instr = &code[i];
            if is_batched(&instr.op) {
                let mut count = 1usize;
                while i + count <= last_i && is_batched(&code[i + count].op) {
                    count += 1;
                }
                self.emit_batch(i as u32, count as u32);
                i += count;
                continue;
            }
            if instr.op.is_control() {
                debug_assert_eq!(i, last_i, "control transfer inside a basic block");
                self.emit_control(&instr.op, i as u32)?;
                open = false;
                i += 1;
                continue;
            }
            self.emit_op(code, &instr.op, i as u32)?;
            i += 1;
        }
        if open {
            let next = self.iconst32((last_i + 1) as i64);
            self.store_ctx(next, offsets::PC);
            self.builder.ins().jump(self.epilogue, &[]);
        }

        // Single exit: flush the block-local machine state.
        self.builder.switch_to_block(self.epilogue);
        let sp = self.builder.use_var(self.sp);
        self.store_ctx(sp, offsets::SP);
        let sk = self.builder.use_var(self.switch_key);
        self.store_ctx(sk, offsets::SWITCH_KEY);
        self.builder.ins().return_(&[]);
        self.builder.seal_all_blocks();
        Ok(())
    }

    // ===== small helpers =====

    fn iconst32(&mut self, v: i64) -> Value {
        self.builder.ins().iconst(types::I32, v)
    }

    fn store_ctx(&mut self, val: Value, off: i32) {
        self.builder
            .ins()
            .store(MemFlags::trusted(), val, self.ctx_param, off);
    }

    fn load_ctx(&mut self, ty: types::Type, off: i32) -> Value {
        self.builder.ins().load(ty, MemFlags::trusted(), self.ctx_param, off)
    }

    fn mask_sp(&mut self, v: Value) -> Value {
        self.builder.ins().band_imm(v, STACK_MASK as i64)
    }

    /// Address of a stack slot from an already-masked index.
    fn stack_addr(&mut self, idx: Value) -> Value {
        let wide = self.builder.ins().uextend(self.ptr_ty, idx);
        let off = self.builder.ins().ishl_imm(wide, 2);
        self.builder.ins().iadd(self.stack_ptr, off)
    }

    fn stack_load(&mut self, idx: Value) -> Value {
        let addr = self.stack_addr(idx);
        self.builder.ins().load(types::I32, MemFlags::trusted(), addr, 0)
    }

    fn stack_store(&mut self, idx: Value, val: Value) {
        let addr = self.stack_addr(idx);
        self.builder.ins().store(MemFlags::trusted(), val, addr, 0);
    }

    fn rets_addr(&mut self, idx: Value) -> Value {
        let wide = self.builder.ins().uextend(self.ptr_ty, idx);
        let off = self.builder.ins().ishl_imm(wide, 2);
        self.builder.ins().iadd(self.rets_ptr, off)
    }

    fn get_helper_ref(&mut self, which: FuncId) -> ir::FuncRef {
        let cache = if which == self.helpers.get_register {
            &mut self.get_ref
        } else if which == self.helpers.set_register {
            &mut self.set_ref
        } else {
            &mut self.batch_ref
        };
        if let Some(r) = *cache {
            return r;
        }
        let r = self.module.declare_func_in_func(which, self.builder.func);
        *cache = Some(r);
        r
    }

    /// Read a register. Data registers and the global bank map straight to
    /// memory slots; the stack-pointer family and switch key come from the
    /// block-local variables; anything else calls the generic helper.
    fn get_reg(&mut self, r: RegId) -> Value {
        match r {
            0..=8 => {
                let off = (r * 4) as i32;
                self.builder
                    .ins()
                    .load(types::I32, MemFlags::trusted(), self.regs_ptr, off)
            }
            REG_SWITCH_KEY => self.builder.use_var(self.switch_key),
            REG_SP_SCALED => {
                let sp = self.builder.use_var(self.sp);
                self.builder.ins().imul_imm(sp, FIXED_ONE as i64)
            }
            REG_SP_RAW => self.builder.use_var(self.sp),
            r if (REG_GLOBAL_BASE..REG_GLOBAL_BASE + GLOBAL_COUNT).contains(&r) => {
                let off = ((r - REG_GLOBAL_BASE) * 4) as i32;
                self.builder
                    .ins()
                    .load(types::I32, MemFlags::trusted(), self.globals_ptr, off)
            }
            other => {
                let fref = self.get_helper_ref(self.helpers.get_register);
                let reg = self.iconst32(other as i64);
                let call = self.builder.ins().call(fref, &[self.ctx_param, reg]);
                self.builder.inst_results(call)[0]
            }
        }
    }

    fn get_reg64(&mut self, r: RegId) -> Value {
        let v = self.get_reg(r);
        self.builder.ins().sextend(types::I64, v)
    }

    fn set_reg(&mut self, r: RegId, val: Value) -> Result<(), CompileError> {
        match r {
            0..=8 => {
                let off = (r * 4) as i32;
                self.builder
                    .ins()
                    .store(MemFlags::trusted(), val, self.regs_ptr, off);
            }
            REG_SWITCH_KEY => self.builder.def_var(self.switch_key, val),
            REG_SP_SCALED | REG_SP_RAW => return Err(CompileError::ReadOnlyRegister(r)),
            r if (REG_GLOBAL_BASE..REG_GLOBAL_BASE + GLOBAL_COUNT).contains(&r) => {
                let off = ((r - REG_GLOBAL_BASE) * 4) as i32;
                self.builder
                    .ins()
                    .store(MemFlags::trusted(), val, self.globals_ptr, off);
            }
            other => {
                let fref = self.get_helper_ref(self.helpers.set_register);
                let reg = self.iconst32(other as i64);
                self.builder.ins().call(fref, &[self.ctx_param, reg, val]);
            }
        }
        Ok(())
    }

    fn push_value(&mut self, val: Value) {
        let sp = self.builder.use_var(self.sp);
        let dec = self.builder.ins().iadd_imm(sp, -1);
        let masked = self.mask_sp(dec);
        self.builder.def_var(self.sp, masked);
        self.stack_store(masked, val);
    }

    /// Boolean-cast: `(v != 0) as i32`.
    fn cast_bool(&mut self, v: Value) -> Value {
        let ne = self.builder.ins().icmp_imm(IntCC::NotEqual, v, 0);
        self.builder.ins().uextend(types::I32, ne)
    }

    /// Condition value for an outcome mask against the recorded comparison.
    fn mask_cond(&mut self, mask: u8) -> Value {
        let a = self.builder.use_var(self.cmp_a);
        let b = self.builder.use_var(self.cmp_b);
        let ins = self.builder.ins();
        match mask & CMP_FLAGS {
            0 => ins.iconst(types::I8, 0),
            CMP_GT => ins.icmp(IntCC::SignedGreaterThan, a, b),
            CMP_LT => ins.icmp(IntCC::SignedLessThan, a, b),
            CMP_NE => ins.icmp(IntCC::NotEqual, a, b),
            CMP_EQ => ins.icmp(IntCC::Equal, a, b),
            CMP_GE => ins.icmp(IntCC::SignedGreaterThanOrEqual, a, b),
            CMP_LE => ins.icmp(IntCC::SignedLessThanOrEqual, a, b),
            _ => ins.iconst(types::I8, 1),
        }
    }

    /// Flush block-local state and hand a run of instructions to the
    /// interpreter. On any status other than "continue" the block exits
    /// immediately with that status.
    fn emit_batch(&mut self, pc: u32, count: u32) {
        let sp = self.builder.use_var(self.sp);
        self.store_ctx(sp, offsets::SP);
        let sk = self.builder.use_var(self.switch_key);
        self.store_ctx(sk, offsets::SWITCH_KEY);
        let pcv = self.iconst32(pc as i64);
        self.store_ctx(pcv, offsets::PC);

        let fref = self.get_helper_ref(self.helpers.step_batch);
        let countv = self.iconst32(count as i64);
        let call = self.builder.ins().call(fref, &[self.ctx_param, countv]);
        let ret = self.builder.inst_results(call)[0];

        // The helper may have moved sp or the switch key.
        let sp1 = self.load_ctx(types::I32, offsets::SP);
        self.builder.def_var(self.sp, sp1);
        let sk1 = self.load_ctx(types::I32, offsets::SWITCH_KEY);
        self.builder.def_var(self.switch_key, sk1);

        let not_ok = self
            .builder
            .ins()
            .icmp_imm(IntCC::NotEqual, ret, RunStatus::Ok as i64);
        let pending = self.iconst32(STATUS_PENDING as i64);
        let status = self.builder.ins().select(not_ok, ret, pending);
        self.store_ctx(status, offsets::STATUS);

        let cont = self.builder.create_block();
        self.builder
            .ins()
            .brif(not_ok, self.epilogue, &[], cont, &[]);
        self.builder.switch_to_block(cont);
    }

    fn target_pc(&self, t: Target, at: u32) -> Result<Pc, CompileError> {
        match t {
            Target::Pc(pc) => Ok(pc),
            Target::Label(_) => Err(CompileError::UnresolvedTarget(at)),
        }
    }

    fn exit_with(&mut self, next_pc: Value, status: i32, error_code: i32) {
        self.store_ctx(next_pc, offsets::PC);
        let st = self.iconst32(status as i64);
        self.store_ctx(st, offsets::STATUS);
        if error_code != 0 {
            let ec = self.iconst32(error_code as i64);
            self.store_ctx(ec, offsets::ERROR_CODE);
        }
        self.builder.ins().jump(self.epilogue, &[]);
    }

    fn emit_control(&mut self, op: &Op, pc: u32) -> Result<(), CompileError> {
        match *op {
            Op::Goto(t) => {
                let target = self.target_pc(t, pc)?;
                let tv = self.iconst32(target as i64);
                self.store_ctx(tv, offsets::PC);
                self.builder.ins().jump(self.epilogue, &[]);
            }
            Op::GotoCmp(..) | Op::GotoTrue(_) | Op::GotoFalse(_) | Op::GotoMore(_)
            | Op::GotoLess(_) => {
                let mask = op.consumer_mask().unwrap_or(0);
                let t = op.target().ok_or(CompileError::UnresolvedTarget(pc))?;
                let target = self.target_pc(t, pc)?;
                let cond = self.mask_cond(mask);
                let tv = self.iconst32(target as i64);
                let fv = self.iconst32((pc + 1) as i64);
                let next = self.builder.ins().select(cond, tv, fv);
                self.store_ctx(next, offsets::PC);
                self.builder.ins().jump(self.epilogue, &[]);
            }
            Op::Call(t) => {
                let target = self.target_pc(t, pc)?;
                let idx = self.load_ctx(types::I32, offsets::CALL_RET_INDEX);
                let full = self.builder.ins().icmp_imm(
                    IntCC::UnsignedGreaterThanOrEqual,
                    idx,
                    CALL_STACK_DEPTH as i64,
                );
                let overflow = self.builder.create_block();
                let ok = self.builder.create_block();
                self.builder.ins().brif(full, overflow, &[], ok, &[]);

                self.builder.switch_to_block(overflow);
                let here = self.iconst32(pc as i64);
                self.exit_with(here, RunStatus::Error as i32, ERROR_CALL_OVERFLOW);

                self.builder.switch_to_block(ok);
                let resume = self.iconst32((pc + 1) as i64);
                let addr = self.rets_addr(idx);
                self.builder
                    .ins()
                    .store(MemFlags::trusted(), resume, addr, 0);
                let bumped = self.builder.ins().iadd_imm(idx, 1);
                self.store_ctx(bumped, offsets::CALL_RET_INDEX);
                let tv = self.iconst32(target as i64);
                self.store_ctx(tv, offsets::PC);
                self.builder.ins().jump(self.epilogue, &[]);
            }
            Op::Return => {
                let idx = self.load_ctx(types::I32, offsets::CALL_RET_INDEX);
                let empty = self.builder.ins().icmp_imm(IntCC::Equal, idx, 0);
                let underflow = self.builder.create_block();
                let ok = self.builder.create_block();
                self.builder.ins().brif(empty, underflow, &[], ok, &[]);

                self.builder.switch_to_block(underflow);
                let here = self.iconst32(pc as i64);
                self.exit_with(here, RunStatus::Error as i32, ERROR_CALL_UNDERFLOW);

                self.builder.switch_to_block(ok);
                let popped = self.builder.ins().iadd_imm(idx, -1);
                self.store_ctx(popped, offsets::CALL_RET_INDEX);
                let addr = self.rets_addr(popped);
                let resume = self
                    .builder
                    .ins()
                    .load(types::I32, MemFlags::trusted(), addr, 0);
                self.store_ctx(resume, offsets::PC);
                self.builder.ins().jump(self.epilogue, &[]);
            }
            Op::Quit => {
                let zero = self.iconst32(0);
                self.store_ctx(zero, offsets::WAIT_INDEX);
                let next = self.iconst32((pc + 1) as i64);
                self.exit_with(next, RunStatus::Stopped as i32, 0);
            }
            Op::WaitFrame => {
                // The interpreter performs the wait itself (advancing pc and
                // the wait index); anything other than "continue" already
                // exits through the batch status check.
                self.emit_batch(pc, 1);
                self.builder.ins().jump(self.epilogue, &[]);
            }
            _ => debug_assert!(false, "emit_control on non-control op"),
        }
        Ok(())
    }

    fn emit_op(&mut self, code: &[Instr], op: &Op, pc: u32) -> Result<(), CompileError> {
        match *op {
            Op::Nop => {}

            Op::PushReg(r) => {
                let v = self.get_reg(r);
                self.push_value(v);
            }
            Op::PushImm(v) => {
                let c = self.iconst32(v as i64);
                self.push_value(c);
            }
            Op::PushArgsReg(r, n) => {
                let v = self.get_reg(r);
                for _ in 0..n {
                    self.push_value(v);
                }
            }
            Op::PushArgsImm(v, n) => {
                let c = self.iconst32(v as i64);
                for _ in 0..n {
                    self.push_value(c);
                }
            }
            Op::Pop(r) => {
                let sp = self.builder.use_var(self.sp);
                let v = self.stack_load(sp);
                let inc = self.builder.ins().iadd_imm(sp, 1);
                let masked = self.mask_sp(inc);
                self.builder.def_var(self.sp, masked);
                self.set_reg(r, v)?;
            }
            Op::PopArgs(r, n) => {
                let sp = self.builder.use_var(self.sp);
                let inc = self.builder.ins().iadd_imm(sp, n as i64);
                let masked = self.mask_sp(inc);
                self.builder.def_var(self.sp, masked);
                let back = self.builder.ins().iadd_imm(masked, -1);
                let read = self.mask_sp(back);
                let v = self.stack_load(read);
                self.set_reg(r, v)?;
            }
            Op::Peek(r) => {
                let sp = self.builder.use_var(self.sp);
                let v = self.stack_load(sp);
                self.set_reg(r, v)?;
            }
            Op::PeekAt(r, off) => {
                let sp = self.builder.use_var(self.sp);
                let at = self.builder.ins().iadd_imm(sp, off as i64);
                let masked = self.mask_sp(at);
                let v = self.stack_load(masked);
                self.set_reg(r, v)?;
            }

            Op::SetImm(r, v) => {
                let c = self.iconst32(v as i64);
                self.set_reg(r, c)?;
            }
            Op::SetReg(dst, src) => {
                let v = self.get_reg(src);
                self.set_reg(dst, v)?;
            }
            Op::Load(r, off) => {
                let frame = self.get_reg(REG_FRAME);
                let at = self.builder.ins().iadd_imm(frame, off as i64);
                let masked = self.mask_sp(at);
                let v = self.stack_load(masked);
                self.set_reg(r, v)?;
            }
            Op::Store(r, off) => {
                let frame = self.get_reg(REG_FRAME);
                let at = self.builder.ins().iadd_imm(frame, off as i64);
                let masked = self.mask_sp(at);
                let v = self.get_reg(r);
                self.stack_store(masked, v);
            }
            Op::StoreImm(v, off) => {
                let frame = self.get_reg(REG_FRAME);
                let at = self.builder.ins().iadd_imm(frame, off as i64);
                let masked = self.mask_sp(at);
                let c = self.iconst32(v as i64);
                self.stack_store(masked, c);
            }
            Op::LoadIndirect(r, r_off) => {
                let raw = self.get_reg(r_off);
                let idx = self.builder.ins().sdiv_imm(raw, FIXED_ONE as i64);
                let masked = self.mask_sp(idx);
                let v = self.stack_load(masked);
                self.set_reg(r, v)?;
            }
            Op::StoreIndirect(r, r_off) => {
                let raw = self.get_reg(r_off);
                let idx = self.builder.ins().sdiv_imm(raw, FIXED_ONE as i64);
                let masked = self.mask_sp(idx);
                let v = self.get_reg(r);
                self.stack_store(masked, v);
            }
            Op::StackWriteImm(v, off) => {
                let sp = self.builder.use_var(self.sp);
                let at = self.builder.ins().iadd_imm(sp, off as i64);
                let masked = self.mask_sp(at);
                let c = self.iconst32(v as i64);
                self.stack_store(masked, c);
            }

            Op::AddImm(r, v) => {
                let x = self.get_reg(r);
                let y = self.builder.ins().iadd_imm(x, v as i64);
                self.set_reg(r, y)?;
            }
            Op::AddReg(r, r2) => {
                let x = self.get_reg(r);
                let y = self.get_reg(r2);
                let s = self.builder.ins().iadd(x, y);
                self.set_reg(r, s)?;
            }
            Op::SubImm(r, v) => {
                let x = self.get_reg(r);
                let c = self.iconst32(v as i64);
                let s = self.builder.ins().isub(x, c);
                self.set_reg(r, s)?;
            }
            Op::SubReg(r, r2) => {
                let x = self.get_reg(r);
                let y = self.get_reg(r2);
                let s = self.builder.ins().isub(x, y);
                self.set_reg(r, s)?;
            }
            Op::RSubImm(r, v) => {
                let x = self.get_reg(r);
                let s = self.builder.ins().irsub_imm(x, v as i64);
                self.set_reg(r, s)?;
            }
            Op::MulImm(r, v) => {
                let a = self.get_reg64(r);
                let prod = self.builder.ins().imul_imm(a, v as i64);
                let q = self.builder.ins().sdiv_imm(prod, FIXED_ONE as i64);
                let narrow = self.builder.ins().ireduce(types::I32, q);
                self.set_reg(r, narrow)?;
            }
            Op::MulReg(r, r2) => {
                let a = self.get_reg64(r);
                let b = self.get_reg64(r2);
                let prod = self.builder.ins().imul(a, b);
                let q = self.builder.ins().sdiv_imm(prod, FIXED_ONE as i64);
                let narrow = self.builder.ins().ireduce(types::I32, q);
                self.set_reg(r, narrow)?;
            }
            Op::DivImm(r, v) => {
                let res = if v == 0 {
                    let a = self.get_reg(r);
                    self.saturate_by_sign(a)
                } else {
                    let a = self.get_reg64(r);
                    let scaled = self.builder.ins().imul_imm(a, FIXED_ONE as i64);
                    let q = self.builder.ins().sdiv_imm(scaled, v as i64);
                    self.builder.ins().ireduce(types::I32, q)
                };
                self.set_reg(r, res)?;
            }
            Op::DivReg(r, r2) => {
                let a = self.get_reg64(r);
                let b = self.get_reg64(r2);
                let zero = self.builder.ins().icmp_imm(IntCC::Equal, b, 0);
                let one = self.builder.ins().iconst(types::I64, 1);
                let safe = self.builder.ins().select(zero, one, b);
                let scaled = self.builder.ins().imul_imm(a, FIXED_ONE as i64);
                let q = self.builder.ins().sdiv(scaled, safe);
                let narrow = self.builder.ins().ireduce(types::I32, q);
                let a32 = self.builder.ins().ireduce(types::I32, a);
                let sat = self.saturate_by_sign(a32);
                let res = self.builder.ins().select(zero, sat, narrow);
                self.set_reg(r, res)?;
            }
            Op::ModImm(r, v) => {
                let res = if v == 0 {
                    self.iconst32(0)
                } else {
                    let a = self.get_reg64(r);
                    let rem = self.builder.ins().srem_imm(a, v as i64);
                    self.builder.ins().ireduce(types::I32, rem)
                };
                self.set_reg(r, res)?;
            }
            Op::ModReg(r, r2) => {
                let a = self.get_reg64(r);
                let b = self.get_reg64(r2);
                let zero = self.builder.ins().icmp_imm(IntCC::Equal, b, 0);
                let one = self.builder.ins().iconst(types::I64, 1);
                let safe = self.builder.ins().select(zero, one, b);
                let rem = self.builder.ins().srem(a, safe);
                let narrow = self.builder.ins().ireduce(types::I32, rem);
                let zres = self.iconst32(0);
                let res = self.builder.ins().select(zero, zres, narrow);
                self.set_reg(r, res)?;
            }
            Op::MinImm(r, v) => {
                let x = self.get_reg(r);
                let y = self.iconst32(v as i64);
                let take_y = self
                    .builder
                    .ins()
                    .icmp(IntCC::SignedGreaterThanOrEqual, x, y);
                let res = self.builder.ins().select(take_y, y, x);
                self.set_reg(r, res)?;
            }
            Op::MinReg(r, r2) => {
                let x = self.get_reg(r);
                let y = self.get_reg(r2);
                let take_y = self
                    .builder
                    .ins()
                    .icmp(IntCC::SignedGreaterThanOrEqual, x, y);
                let res = self.builder.ins().select(take_y, y, x);
                self.set_reg(r, res)?;
            }
            Op::MaxImm(r, v) => {
                let x = self.get_reg(r);
                let y = self.iconst32(v as i64);
                let take_y = self
                    .builder
                    .ins()
                    .icmp(IntCC::SignedGreaterThanOrEqual, y, x);
                let res = self.builder.ins().select(take_y, y, x);
                self.set_reg(r, res)?;
            }
            Op::MaxReg(r, r2) => {
                let x = self.get_reg(r);
                let y = self.get_reg(r2);
                let take_y = self
                    .builder
                    .ins()
                    .icmp(IntCC::SignedGreaterThanOrEqual, y, x);
                let res = self.builder.ins().select(take_y, y, x);
                self.set_reg(r, res)?;
            }
            Op::AndImm(r, v) => {
                let x = self.get_reg(r);
                let d = self.builder.ins().sdiv_imm(x, FIXED_ONE as i64);
                let and = self.builder.ins().band_imm(d, (v / FIXED_ONE) as i64);
                let res = self.builder.ins().imul_imm(and, FIXED_ONE as i64);
                self.set_reg(r, res)?;
            }
            Op::AndReg(r, r2) => {
                let x = self.get_reg(r);
                let y = self.get_reg(r2);
                let dx = self.builder.ins().sdiv_imm(x, FIXED_ONE as i64);
                let dy = self.builder.ins().sdiv_imm(y, FIXED_ONE as i64);
                let and = self.builder.ins().band(dx, dy);
                let res = self.builder.ins().imul_imm(and, FIXED_ONE as i64);
                self.set_reg(r, res)?;
            }
            Op::Abs(r) => {
                let x = self.get_reg(r);
                let neg = self.builder.ins().ineg(x);
                let is_neg = self.builder.ins().icmp_imm(IntCC::SignedLessThan, x, 0);
                let res = self.builder.ins().select(is_neg, neg, x);
                self.set_reg(r, res)?;
            }
            Op::Floor(r) => {
                let res = self.emit_round(r, false);
                self.set_reg(r, res)?;
            }
            Op::Ceil(r) => {
                let res = self.emit_round(r, true);
                self.set_reg(r, res)?;
            }
            Op::CastBool(r) => {
                let x = self.get_reg(r);
                let res = self.cast_bool(x);
                self.set_reg(r, res)?;
            }
            Op::CastBoolScaled(r) => {
                let x = self.get_reg(r);
                let b = self.cast_bool(x);
                let res = self.builder.ins().imul_imm(b, FIXED_ONE as i64);
                self.set_reg(r, res)?;
            }

            Op::CompareReg(ra, rb) => {
                let mut a = self.get_reg(ra);
                let mut b = self.get_reg(rb);
                if next_wants_bool(code, pc) {
                    a = self.cast_bool(a);
                    b = self.cast_bool(b);
                }
                self.builder.def_var(self.cmp_a, a);
                self.builder.def_var(self.cmp_b, b);
            }
            Op::CompareImm(r, v) => {
                let mut a = self.get_reg(r);
                let b = if next_wants_bool(code, pc) {
                    a = self.cast_bool(a);
                    self.iconst32((v != 0) as i64)
                } else {
                    self.iconst32(v as i64)
                };
                self.builder.def_var(self.cmp_a, a);
                self.builder.def_var(self.cmp_b, b);
            }
            Op::SetCmp(r, mask) => {
                let cond = self.mask_cond(mask);
                let on = if mask & CMP_SETI != 0 { FIXED_ONE } else { 1 };
                let on = self.iconst32(on as i64);
                let off = self.iconst32(0);
                let res = self.builder.ins().select(cond, on, off);
                self.set_reg(r, res)?;
            }

            ref other => {
                debug_assert!(
                    !other.is_control() && !is_batched(other),
                    "emit_op on misclassified op {other:?}"
                );
            }
        }
        Ok(())
    }

    /// `sign(v) * i32::MAX` for the zero-divisor policy.
    fn saturate_by_sign(&mut self, v: Value) -> Value {
        let is_neg = self.builder.ins().icmp_imm(IntCC::SignedLessThan, v, 0);
        let maxn = self.iconst32(-(i32::MAX as i64));
        let maxp = self.iconst32(i32::MAX as i64);
        self.builder.ins().select(is_neg, maxn, maxp)
    }

    /// Integer-exact floor/ceil to a whole fixed-point value.
    fn emit_round(&mut self, r: RegId, ceil: bool) -> Value {
        let v = self.get_reg(r);
        let d = self.builder.ins().sdiv_imm(v, FIXED_ONE as i64);
        let rem = self.builder.ins().srem_imm(v, FIXED_ONE as i64);
        let has_rem = self.builder.ins().icmp_imm(IntCC::NotEqual, rem, 0);
        let directional = if ceil {
            self.builder.ins().icmp_imm(IntCC::SignedGreaterThan, v, 0)
        } else {
            self.builder.ins().icmp_imm(IntCC::SignedLessThan, v, 0)
        };
        let adjust = self.builder.ins().band(has_rem, directional);
        let adjust = self.builder.ins().uextend(types::I32, adjust);
        let adjusted = if ceil {
            self.builder.ins().iadd(d, adjust)
        } else {
            self.builder.ins().isub(d, adjust)
        };
        self.builder.ins().imul_imm(adjusted, FIXED_ONE as i64)
    }
}

/// Does the instruction after `pc` consume the comparison in boolean mode?
fn next_wants_bool(code: &[Instr], pc: u32) -> bool {
    code.get(pc as usize + 1)
        .and_then(|i| i.op.consumer_mask())
        .is_some_and(|mask| mask & crate::asm::instruction::CMP_BOOL != 0)
}
