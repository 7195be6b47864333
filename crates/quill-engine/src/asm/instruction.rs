//! Instruction model for the Quill virtual machine.
//!
//! Every value in the machine is a fixed-point integer: an `i32` holding the
//! real value scaled by [`FIXED_ONE`]. Instructions are a tagged enum with up
//! to three operand slots; jump and call operands hold a symbolic [`Target`]
//! that the assembler resolves to a program-counter address during label
//! finalization.

use serde::{Deserialize, Serialize};

/// Fixed-point scale: an `i32` of `12_3400` reads as `12.34`.
pub const FIXED_ONE: i32 = 10_000;

/// Symbolic label identifier, minted by the front end's monotonic counter.
pub type LabelId = i32;

/// Program-counter index into the final instruction stream.
pub type Pc = u32;

/// Register identifier. See the `REG_*` constants for the id ranges.
pub type RegId = u32;

/// Data registers `D0..D7`. `D2` is the front end's comparison scratch.
pub const fn d(n: u32) -> RegId {
    n
}

/// Stack-frame base register.
pub const REG_FRAME: RegId = 8;
/// Switch-dispatch scratch key. Compiler-local temporary in native code.
pub const REG_SWITCH_KEY: RegId = 9;
/// Reads as `sp * FIXED_ONE`. Read-only.
pub const REG_SP_SCALED: RegId = 10;
/// Reads as `sp`. Read-only.
pub const REG_SP_RAW: RegId = 11;

/// Number of slots in a script instance's register file (`D0..D7` + frame;
/// the remaining slots are reserved).
pub const REGISTER_FILE_SIZE: usize = 16;

/// First id of the global register bank.
pub const REG_GLOBAL_BASE: RegId = 256;
/// Size of the global register bank.
pub const GLOBAL_COUNT: u32 = 256;

/// Script stack depth in slots. Power of two; indices wrap with
/// [`STACK_MASK`] on every adjustment.
pub const STACK_SIZE: usize = 2048;
/// Mask applied to every stack index.
pub const STACK_MASK: u32 = (STACK_SIZE as u32) - 1;

/// Bounded depth of the call-return address array.
pub const CALL_STACK_DEPTH: usize = 100;

// Comparison outcome mask bits. A comparison instruction records its two
// operands; the consuming instruction's mask selects which relational
// outcomes fire.
/// Left operand strictly greater.
pub const CMP_GT: u8 = 1;
/// Left operand strictly less.
pub const CMP_LT: u8 = 2;
/// Operands equal.
pub const CMP_EQ: u8 = 4;
/// All relational outcome bits.
pub const CMP_FLAGS: u8 = CMP_GT | CMP_LT | CMP_EQ;
/// Greater-or-equal.
pub const CMP_GE: u8 = CMP_GT | CMP_EQ;
/// Less-or-equal.
pub const CMP_LE: u8 = CMP_LT | CMP_EQ;
/// Not-equal.
pub const CMP_NE: u8 = CMP_GT | CMP_LT;
/// Modifier: `SetCmp` writes `FIXED_ONE` instead of 1 on a match.
pub const CMP_SETI: u8 = 8;
/// Modifier: operands are boolean-cast before comparing.
pub const CMP_BOOL: u8 = 16;

/// Invert the relational outcome bits of a mask, preserving modifiers.
pub const fn invert_cmp(mask: u8) -> u8 {
    mask ^ CMP_FLAGS
}

/// A jump/call operand: symbolic before assembly, a resolved pc after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Unresolved symbolic label.
    Label(LabelId),
    /// Resolved program-counter address.
    Pc(Pc),
}

impl Target {
    /// The symbolic label id, if still unresolved.
    pub fn label(&self) -> Option<LabelId> {
        match self {
            Target::Label(l) => Some(*l),
            Target::Pc(_) => None,
        }
    }

    /// The resolved address. Panics in debug builds if unresolved.
    pub fn pc(&self) -> Pc {
        match self {
            Target::Pc(pc) => *pc,
            Target::Label(l) => {
                debug_assert!(false, "unresolved label {l} reached execution");
                0
            }
        }
    }
}

/// A single operation. Up to three operand slots; register/immediate pairs
/// follow the `...Imm`/`...Reg` naming of the source form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Does nothing. May survive solely as a label holder.
    Nop,
    /// Terminates the script instance.
    Quit,
    /// Suspends until the next host tick. The sole suspension point.
    WaitFrame,

    /// Unconditional jump.
    Goto(Target),
    /// Jump if the last comparison matches the outcome mask.
    GotoCmp(Target, u8),
    /// Legacy: jump if last comparison was equal. Canonicalized by the
    /// optimizer into `GotoCmp`.
    GotoTrue(Target),
    /// Legacy: jump if not equal.
    GotoFalse(Target),
    /// Legacy: jump if greater-or-equal.
    GotoMore(Target),
    /// Legacy: jump if less-or-equal.
    GotoLess(Target),
    /// Push the resume address and jump to a function entry.
    Call(Target),
    /// Pop the call-return array and jump back.
    Return,

    /// Push a register value.
    PushReg(RegId),
    /// Push an immediate.
    PushImm(i32),
    /// Push a register value `count` times.
    PushArgsReg(RegId, u32),
    /// Push an immediate `count` times.
    PushArgsImm(i32, u32),
    /// Pop into a register.
    Pop(RegId),
    /// Drop `count` slots, loading the last popped value into the register.
    PopArgs(RegId, u32),
    /// Read the top of stack without popping.
    Peek(RegId),
    /// Read `sp + offset` without popping.
    PeekAt(RegId, i32),

    /// Set register to immediate.
    SetImm(RegId, i32),
    /// Copy register to register (dest, src).
    SetReg(RegId, RegId),
    /// Load from `stack[frame + offset]`.
    Load(RegId, i32),
    /// Store to `stack[frame + offset]`.
    Store(RegId, i32),
    /// Store an immediate to `stack[frame + offset]`.
    StoreImm(i32, i32),
    /// Load from the absolute slot named by a register (descaled).
    LoadIndirect(RegId, RegId),
    /// Store to the absolute slot named by a register (descaled).
    StoreIndirect(RegId, RegId),
    /// Store an immediate to `stack[sp + offset]`.
    StackWriteImm(i32, i32),

    /// `reg += imm` (both already scaled).
    AddImm(RegId, i32),
    /// `reg += reg`.
    AddReg(RegId, RegId),
    /// `reg -= imm`.
    SubImm(RegId, i32),
    /// `reg -= reg`.
    SubReg(RegId, RegId),
    /// `reg = imm - reg`.
    RSubImm(RegId, i32),
    /// Fixed-point multiply by immediate.
    MulImm(RegId, i32),
    /// Fixed-point multiply by register.
    MulReg(RegId, RegId),
    /// Fixed-point divide by immediate.
    DivImm(RegId, i32),
    /// Fixed-point divide by register.
    DivReg(RegId, RegId),
    /// Remainder by immediate.
    ModImm(RegId, i32),
    /// Remainder by register.
    ModReg(RegId, RegId),
    /// `reg = min(reg, imm)`.
    MinImm(RegId, i32),
    /// `reg = min(reg, reg)`.
    MinReg(RegId, RegId),
    /// `reg = max(reg, imm)`.
    MaxImm(RegId, i32),
    /// `reg = max(reg, reg)`.
    MaxReg(RegId, RegId),
    /// Bitwise and on the descaled values, rescaled.
    AndImm(RegId, i32),
    /// Bitwise and on the descaled values, rescaled.
    AndReg(RegId, RegId),
    /// `reg = |reg|` (wrapping).
    Abs(RegId),
    /// Round down to a whole fixed-point value.
    Floor(RegId),
    /// Round up to a whole fixed-point value.
    Ceil(RegId),
    /// `reg = (reg != 0) as i32`.
    CastBool(RegId),
    /// `reg = (reg != 0) as i32 * FIXED_ONE`.
    CastBoolScaled(RegId),

    /// Record both register operands as the last comparison.
    CompareReg(RegId, RegId),
    /// Record a register and an immediate as the last comparison.
    CompareImm(RegId, i32),
    /// Set register to 1 (or `FIXED_ONE` with `CMP_SETI`) if the last
    /// comparison matches the mask, else 0.
    SetCmp(RegId, u8),

    /// Emit a register value to the trace sink. Side-effecting.
    TraceReg(RegId),
    /// Emit an immediate to the trace sink. Side-effecting.
    TraceImm(i32),
}

impl Op {
    /// The jump/call operand slot, if this operation has one.
    pub fn target(&self) -> Option<Target> {
        match self {
            Op::Goto(t)
            | Op::GotoCmp(t, _)
            | Op::GotoTrue(t)
            | Op::GotoFalse(t)
            | Op::GotoMore(t)
            | Op::GotoLess(t)
            | Op::Call(t) => Some(*t),
            _ => None,
        }
    }

    /// Mutable access to the jump/call operand slot.
    pub fn target_mut(&mut self) -> Option<&mut Target> {
        match self {
            Op::Goto(t)
            | Op::GotoCmp(t, _)
            | Op::GotoTrue(t)
            | Op::GotoFalse(t)
            | Op::GotoMore(t)
            | Op::GotoLess(t)
            | Op::Call(t) => Some(t),
            _ => None,
        }
    }

    /// True for operations that transfer control (end a basic block).
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Op::Goto(_)
                | Op::GotoCmp(..)
                | Op::GotoTrue(_)
                | Op::GotoFalse(_)
                | Op::GotoMore(_)
                | Op::GotoLess(_)
                | Op::Call(_)
                | Op::Return
                | Op::Quit
                | Op::WaitFrame
        )
    }

    /// True for the suspension instruction.
    pub fn is_wait(&self) -> bool {
        matches!(self, Op::WaitFrame)
    }

    /// Outcome mask of the consuming instruction, if this is a consumer of
    /// the comparison protocol.
    pub fn consumer_mask(&self) -> Option<u8> {
        match self {
            Op::GotoCmp(_, m) | Op::SetCmp(_, m) => Some(*m),
            Op::GotoTrue(_) => Some(CMP_EQ),
            Op::GotoFalse(_) => Some(CMP_NE),
            Op::GotoMore(_) => Some(CMP_GE),
            Op::GotoLess(_) => Some(CMP_LE),
            _ => None,
        }
    }
}

/// Source file/line pair. `-1` marks synthesized code with no location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    /// Index into the program's source file list, or -1.
    pub file: i32,
    /// 1-based source line, or -1.
    pub line: i32,
}

impl SourceLoc {
    /// A location pointing nowhere.
    pub const NONE: SourceLoc = SourceLoc { file: -1, line: -1 };

    /// A concrete location.
    pub fn new(file: i32, line: i32) -> Self {
        SourceLoc { file, line }
    }
}

impl Default for SourceLoc {
    fn default() -> Self {
        SourceLoc::NONE
    }
}

/// One instruction: an operation plus assembly metadata. At most one
/// canonical label id is attached to a live instruction; further ids may
/// alias it through the label index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instr {
    /// The operation.
    pub op: Op,
    /// Canonical label attached to this instruction, if any.
    pub label: Option<LabelId>,
    /// Free-text debug comment carried into the final stream.
    pub comment: String,
    /// Source location for the debugger line table.
    pub loc: SourceLoc,
}

impl Instr {
    /// An unlabeled instruction with no comment or location.
    pub fn new(op: Op) -> Self {
        Instr {
            op,
            label: None,
            comment: String::new(),
            loc: SourceLoc::NONE,
        }
    }

    /// Attach a label.
    pub fn with_label(mut self, label: LabelId) -> Self {
        self.label = Some(label);
        self
    }

    /// Attach a comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Attach a source location.
    pub fn with_loc(mut self, loc: SourceLoc) -> Self {
        self.loc = loc;
        self
    }

    /// Fold another comment into this instruction's, front or back.
    pub fn merge_comment(&mut self, other: &str, prepend: bool) {
        if other.is_empty() {
            return;
        }
        if self.comment.is_empty() {
            self.comment = other.to_string();
        } else if prepend {
            self.comment = format!("{other}; {}", self.comment);
        } else {
            self.comment = format!("{}; {other}", self.comment);
        }
    }
}
