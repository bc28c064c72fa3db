//! Translated-code substrate.
//!
//! The cell stream is translated once into a table of thunks, each holding a
//! direct handler pointer and its decoded operands, so the hot loop does no
//! fetch/decode work. Malformed instructions are rejected at translation
//! time instead of mid-run.
//!
//! The executor writes the fall-through successor into `vm.ip` before
//! invoking the handler; control-flow handlers overwrite it, exactly as they
//! do under the direct interpreter. The two substrates share every primitive
//! in [`ops`] and are observationally identical.

use anyhow::Result;
use smallvec::SmallVec;

use crate::host::Host;
use crate::opcode::Opcode;
use crate::program::Program;
use crate::value::Value;
use crate::vm::{coroutine, ops, Vm, VmError, VmResult};

type ExecFn<H> = fn(&mut Vm, &mut H, &[u32]) -> VmResult<()>;

#[derive(Debug)]
struct Thunk<H> {
    exec: ExecFn<H>,
    operands: SmallVec<[u32; 4]>,
    /// Cell address of the fall-through successor.
    next: u32,
}

#[derive(Debug)]
pub struct ThreadedCode<H> {
    thunks: Vec<Thunk<H>>,
    /// Cell address to thunk index; `u32::MAX` marks operand cells, which are
    /// not valid transfer targets.
    index: Vec<u32>,
}

impl<H: Host> ThreadedCode<H> {
    /// Translate a whole program. Every instruction is decoded and its
    /// handler resolved up front.
    pub fn translate(program: &Program) -> VmResult<Self> {
        let code = &program.code;
        let len = code.len() as u32;
        let mut thunks = Vec::new();
        let mut index = vec![u32::MAX; code.len()];

        let mut at = 0usize;
        while at < code.len() {
            let cell = code[at];
            let ip = at as u32;
            let op =
                Opcode::from_repr(cell).ok_or(VmError::InvalidOpcode { opcode: cell, ip })?;
            let n = op
                .operand_count(code, at)
                .ok_or(VmError::PcOutOfRange { ip, len })? as usize;
            if at + 1 + n > code.len() {
                return Err(VmError::PcOutOfRange { ip, len });
            }
            index[at] = thunks.len() as u32;
            thunks.push(Thunk {
                exec: exec_for::<H>(op),
                operands: SmallVec::from_slice(&code[at + 1..at + 1 + n]),
                next: (at + 1 + n) as u32,
            });
            at += 1 + n;
        }
        Ok(Self { thunks, index })
    }

    /// Run `vm` to completion over the translated table. The program the
    /// table was built from must be the one loaded into `vm`.
    pub fn run(&self, vm: &mut Vm, host: &mut H) -> Result<Value> {
        vm.begin().map_err(|e| vm.fail(e))?;
        while !vm.halted {
            if let Err(e) = self.step(vm, host) {
                return Err(vm.fail(e));
            }
        }
        vm.finish()
    }

    fn step(&self, vm: &mut Vm, host: &mut H) -> VmResult<()> {
        let len = self.index.len() as u32;
        let ti = *self
            .index
            .get(vm.ip as usize)
            .ok_or(VmError::PcOutOfRange { ip: vm.ip, len })?;
        if ti == u32::MAX {
            return Err(VmError::Corrupt(format!(
                "transfer into the middle of an instruction at 0x{:x}",
                vm.ip
            )));
        }
        let t = &self.thunks[ti as usize];
        vm.ip = t.next;
        (t.exec)(vm, host, &t.operands)
    }
}

fn exec_for<H: Host>(op: Opcode) -> ExecFn<H> {
    use Opcode::*;
    match op {
        Nop => t_nop,

        PushNil => t_push_nil,
        PushInt => t_push_int,
        PushConst => t_push_const,
        PushStr => t_push_str,
        PushFun => t_push_fun,
        PushVar => t_push_var,
        Dup => t_dup,
        Pop => t_pop,
        PopRef => t_pop_ref,

        BoxNew => t_box_new,
        Unbox => t_unbox,
        NewVec => t_new_vec,
        NewStruct => t_new_struct,
        PushIdx => t_push_idx,
        PushField => t_push_field,

        Jmp => t_jmp,
        Jz => t_jz,
        Call => t_call,
        CallIndirect => t_call_indirect,
        CallMulti => t_call_multi,
        ForeignCall => t_foreign_call,
        Ret => t_ret,
        RetV => t_ret_v,

        Add => t_add,
        Sub => t_sub,
        Mul => t_mul,
        Div => t_div,
        Mod => t_mod,
        Neg => t_neg,
        Eq => t_eq,
        Ne => t_ne,
        Lt => t_lt,
        Gt => t_gt,
        Le => t_le,
        Ge => t_ge,
        Not => t_not,
        And => t_and,
        Or => t_or,

        LvalVar => t_lval_var,
        LvalIdx => t_lval_idx,
        LvalField => t_lval_field,

        CoCreate => t_co_create,
        CoResume => t_co_resume,
        CoYield => t_co_yield,
        CoEnd => t_co_end,
    }
}

fn t_nop<H: Host>(_vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    Ok(())
}

fn t_push_nil<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::push_nil(vm)
}

fn t_push_int<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::push_int(vm, o[0])
}

fn t_push_const<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::push_const(vm, o[0])
}

fn t_push_str<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::push_str(vm, o[0])
}

fn t_push_fun<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::push_fun(vm, o[0])
}

fn t_push_var<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::push_var(vm, o[0])
}

fn t_dup<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::dup(vm)
}

fn t_pop<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::pop_discard(vm)
}

fn t_pop_ref<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::pop_ref(vm)
}

fn t_box_new<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::box_new(vm)
}

fn t_unbox<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::unbox(vm)
}

fn t_new_vec<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::new_vec(vm, o[0], o[1])
}

fn t_new_struct<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::new_struct(vm, o[0])
}

fn t_push_idx<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::push_idx(vm)
}

fn t_push_field<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::push_field(vm, o[0])
}

fn t_jmp<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::jmp(vm, o[0])
}

fn t_jz<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::jz(vm, o[0])
}

fn t_call<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::call(vm, o[0])
}

fn t_call_indirect<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::call_indirect(vm)
}

fn t_call_multi<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::call_multi(vm, &o[1..])
}

fn t_foreign_call<H: Host>(vm: &mut Vm, h: &mut H, o: &[u32]) -> VmResult<()> {
    vm.foreign_call(h, o[0])
}

fn t_ret<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::ret(vm)
}

fn t_ret_v<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::ret_v(vm)
}

fn t_add<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::binary(vm, Opcode::Add)
}

fn t_sub<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::binary(vm, Opcode::Sub)
}

fn t_mul<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::binary(vm, Opcode::Mul)
}

fn t_div<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::binary(vm, Opcode::Div)
}

fn t_mod<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::binary(vm, Opcode::Mod)
}

fn t_neg<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::neg(vm)
}

fn t_eq<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::compare(vm, Opcode::Eq)
}

fn t_ne<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::compare(vm, Opcode::Ne)
}

fn t_lt<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::compare(vm, Opcode::Lt)
}

fn t_gt<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::compare(vm, Opcode::Gt)
}

fn t_le<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::compare(vm, Opcode::Le)
}

fn t_ge<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::compare(vm, Opcode::Ge)
}

fn t_not<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::not(vm)
}

fn t_and<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::logic(vm, Opcode::And)
}

fn t_or<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    ops::logic(vm, Opcode::Or)
}

fn t_lval_var<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::lval_var(vm, o[0], o[1])
}

fn t_lval_idx<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::lval_idx(vm, o[0])
}

fn t_lval_field<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    ops::lval_field(vm, o[0], o[1])
}

fn t_co_create<H: Host>(vm: &mut Vm, _h: &mut H, o: &[u32]) -> VmResult<()> {
    coroutine::co_create(vm, o[0], o[1], &o[3..])
}

fn t_co_resume<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    coroutine::co_resume(vm)
}

fn t_co_yield<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    coroutine::co_yield(vm)
}

fn t_co_end<H: Host>(vm: &mut Vm, _h: &mut H, _o: &[u32]) -> VmResult<()> {
    coroutine::co_end(vm)
}
