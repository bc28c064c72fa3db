//! Direct interpretation substrate: fetch, decode and dispatch one
//! instruction at a time straight from the cell stream.
//!
//! `vm.ip` is advanced past the whole instruction before dispatch, so the
//! control-flow primitives in [`ops`] transfer by overwriting it.

use smallvec::SmallVec;

use crate::host::Host;
use crate::opcode::Opcode;
use crate::vm::{coroutine, ops, Vm, VmError, VmResult};

pub(crate) fn step<H: Host>(vm: &mut Vm, host: &mut H) -> VmResult<()> {
    let at = vm.ip as usize;
    let len = vm.program.code.len() as u32;
    let &cell = vm
        .program
        .code
        .get(at)
        .ok_or(VmError::PcOutOfRange { ip: vm.ip, len })?;
    let op = Opcode::from_repr(cell).ok_or(VmError::InvalidOpcode { opcode: cell, ip: vm.ip })?;
    let n = op
        .operand_count(&vm.program.code, at)
        .ok_or(VmError::PcOutOfRange { ip: vm.ip, len })? as usize;
    if at + 1 + n > vm.program.code.len() {
        return Err(VmError::PcOutOfRange { ip: vm.ip, len });
    }
    let operands: SmallVec<[u32; 4]> =
        SmallVec::from_slice(&vm.program.code[at + 1..at + 1 + n]);
    vm.ip = (at + 1 + n) as u32;
    dispatch(vm, host, op, &operands)
}

fn dispatch<H: Host>(vm: &mut Vm, host: &mut H, op: Opcode, o: &[u32]) -> VmResult<()> {
    use Opcode::*;
    match op {
        Nop => Ok(()),

        PushNil => ops::push_nil(vm),
        PushInt => ops::push_int(vm, o[0]),
        PushConst => ops::push_const(vm, o[0]),
        PushStr => ops::push_str(vm, o[0]),
        PushFun => ops::push_fun(vm, o[0]),
        PushVar => ops::push_var(vm, o[0]),
        Dup => ops::dup(vm),
        Pop => ops::pop_discard(vm),
        PopRef => ops::pop_ref(vm),

        BoxNew => ops::box_new(vm),
        Unbox => ops::unbox(vm),
        NewVec => ops::new_vec(vm, o[0], o[1]),
        NewStruct => ops::new_struct(vm, o[0]),
        PushIdx => ops::push_idx(vm),
        PushField => ops::push_field(vm, o[0]),

        Jmp => ops::jmp(vm, o[0]),
        Jz => ops::jz(vm, o[0]),
        Call => ops::call(vm, o[0]),
        CallIndirect => ops::call_indirect(vm),
        CallMulti => ops::call_multi(vm, &o[1..]),
        ForeignCall => vm.foreign_call(host, o[0]),
        Ret => ops::ret(vm),
        RetV => ops::ret_v(vm),

        Add | Sub | Mul | Div | Mod => ops::binary(vm, op),
        Neg => ops::neg(vm),
        Eq | Ne | Lt | Gt | Le | Ge => ops::compare(vm, op),
        Not => ops::not(vm),
        And | Or => ops::logic(vm, op),

        LvalVar => ops::lval_var(vm, o[0], o[1]),
        LvalIdx => ops::lval_idx(vm, o[0]),
        LvalField => ops::lval_field(vm, o[0], o[1]),

        CoCreate => coroutine::co_create(vm, o[0], o[1], &o[3..]),
        CoResume => coroutine::co_resume(vm),
        CoYield => coroutine::co_yield(vm),
        CoEnd => coroutine::co_end(vm),
    }
}
