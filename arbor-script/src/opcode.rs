//! The instruction table shared by the interpreter, the translated-code
//! substrate, the disassembly helpers and any external code generator.
//!
//! The stream is a sequence of fixed-width `u32` cells: one cell for the
//! opcode, one cell per operand. Two instructions have a variable operand
//! count computed from a prefix operand (`CallMulti`, `CoCreate`).

use strum::{Display, FromRepr, IntoStaticStr};

/// Operand arity of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(u32),
    /// Operand count is `prefix`-th operand cell plus the fixed head cells.
    /// See [`Opcode::operand_count`].
    Variable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u32)]
pub enum Opcode {
    Nop = 0,

    // stack / constants
    PushNil,
    PushInt,
    PushConst,
    PushStr,
    PushFun,
    PushVar,
    Dup,
    Pop,
    PopRef,

    // heap objects
    BoxNew,
    Unbox,
    NewVec,
    NewStruct,
    PushIdx,
    PushField,

    // control
    Jmp,
    Jz,
    Call,
    CallIndirect,
    CallMulti,
    ForeignCall,
    Ret,
    RetV,

    // value operations
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Not,
    And,
    Or,

    // lvalue compound assignment
    LvalVar,
    LvalIdx,
    LvalField,

    // coroutines
    CoCreate,
    CoResume,
    CoYield,
    CoEnd,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    pub fn arity(self) -> Arity {
        use Opcode::*;
        match self {
            Nop | PushNil | Dup | Pop | PopRef | BoxNew | Unbox | PushIdx | CallIndirect
            | Ret | RetV | Add | Sub | Mul | Div | Mod | Neg | Eq | Ne | Lt | Gt | Le | Ge
            | Not | And | Or | CoResume | CoYield | CoEnd => Arity::Fixed(0),
            PushInt | PushConst | PushStr | PushFun | PushVar | NewStruct | PushField | Jmp
            | Jz | Call | ForeignCall | LvalIdx => Arity::Fixed(1),
            NewVec | LvalVar | LvalField => Arity::Fixed(2),
            CallMulti | CoCreate => Arity::Variable,
        }
    }

    /// Total operand cells of the instruction starting at `ip`, including the
    /// variable tail. `cells` is the raw code stream. Returns `None` when the
    /// prefix operand lies outside the stream.
    pub fn operand_count(self, cells: &[u32], ip: usize) -> Option<u32> {
        match self.arity() {
            Arity::Fixed(n) => Some(n),
            Arity::Variable => match self {
                // call_multi <ncand> <cand>*
                Opcode::CallMulti => Some(1 + cells.get(ip + 1).copied()?),
                // co_create <body> <skip> <ncap> <var>*
                Opcode::CoCreate => Some(3 + cells.get(ip + 3).copied()?),
                _ => unreachable!(),
            },
        }
    }

    /// Net stack-height effect, where it is fixed for the opcode.
    /// `None` marks effects that depend on operands (calls, aggregate
    /// construction) or on the secondary lvalue-op code.
    pub fn stack_effect(self) -> Option<i32> {
        use Opcode::*;
        match self {
            Nop | Jmp | Neg | Not => Some(0),
            PushNil | PushInt | PushConst | PushStr | PushFun | PushVar | Dup => Some(1),
            Pop | PopRef | Jz | PushIdx | Add | Sub | Mul | Div | Mod | Eq | Ne | Lt | Gt
            | Le | Ge | And | Or => Some(-1),
            BoxNew | Unbox | PushField => Some(0),
            // pops the function value and/or arguments, final height restored
            // by the ret of the callee
            Call | CallIndirect | CallMulti | ForeignCall => None,
            Ret | RetV => None,
            NewVec | NewStruct => None,
            LvalVar | LvalIdx | LvalField => None,
            CoCreate | CoResume | CoYield | CoEnd => None,
        }
    }
}

/// Secondary operation code of the three `Lval*` opcodes, stored in the cell
/// right after the location operand.
///
/// The compound arithmetic family comes in three result flavors: discard,
/// push the new value (pre) and push the old value (post). Increment and
/// decrement keep the pre/post distinction for all four flavors the compiler
/// can emit, even though the two discarding ones behave identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u32)]
pub enum LvalOp {
    /// Plain overwrite; the previous value is known to be a scalar.
    Write = 0,
    /// Overwrite releasing the previous (possibly heap) value.
    WriteRef,

    Add,
    AddPushNew,
    AddPushOld,
    Sub,
    SubPushNew,
    SubPushOld,
    Mul,
    MulPushNew,
    MulPushOld,
    Div,
    DivPushNew,
    DivPushOld,
    Mod,
    ModPushNew,
    ModPushOld,

    IncrPushNew,
    IncrPushOld,
    IncrPre,
    IncrPost,
    DecrPushNew,
    DecrPushOld,
    DecrPre,
    DecrPost,
}

impl LvalOp {
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    /// Whether the operation consumes a right-hand value off the stack.
    pub fn takes_rhs(self) -> bool {
        use LvalOp::*;
        !matches!(
            self,
            IncrPushNew | IncrPushOld | IncrPre | IncrPost | DecrPushNew | DecrPushOld
                | DecrPre | DecrPost
        )
    }
}
