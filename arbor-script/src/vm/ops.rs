//! Opcode primitives shared by both execution substrates.
//!
//! Every function here implements exactly one instruction against the VM
//! context. The caller has already advanced `vm.ip` past the instruction, so
//! control-flow primitives transfer by overwriting `vm.ip`. Ownership rule:
//! a primitive that pops a value owns it and must either push it back, store
//! it, or release it on every path, including error paths.

use crate::heap::ObjBody;
use crate::opcode::{LvalOp, Opcode};
use crate::program::{TypeKind, TypeSel, TYPE_STR};
use crate::value::{ObjRef, Value};
use crate::vm::{coroutine, Vm, VmError, VmResult};

// ---- pushes ----

pub(crate) fn push_nil(vm: &mut Vm) -> VmResult<()> {
    vm.push(Value::Nil)
}

/// The operand cell is a sign-extended 32-bit immediate.
pub(crate) fn push_int(vm: &mut Vm, raw: u32) -> VmResult<()> {
    vm.push(Value::Int(raw as i32 as i64))
}

pub(crate) fn push_const(vm: &mut Vm, idx: u32) -> VmResult<()> {
    let f = *vm
        .program
        .floats
        .get(idx as usize)
        .ok_or_else(|| VmError::Corrupt(format!("float constant {idx} out of range")))?;
    vm.push(Value::Float(f))
}

/// Strings are heap objects; every `push_str` allocates a fresh one.
pub(crate) fn push_str(vm: &mut Vm, idx: u32) -> VmResult<()> {
    let s = vm
        .program
        .strings
        .get(idx as usize)
        .ok_or_else(|| VmError::Corrupt(format!("string constant {idx} out of range")))?
        .clone();
    let r = vm.heap.alloc(TYPE_STR, ObjBody::Str(s));
    vm.push(Value::Obj(r))
}

pub(crate) fn push_fun(vm: &mut Vm, fun: u32) -> VmResult<()> {
    if fun as usize >= vm.program.funcs.len() {
        return Err(VmError::Corrupt(format!("function constant {fun} out of range")));
    }
    vm.push(Value::Fun(fun))
}

pub(crate) fn push_var(vm: &mut Vm, var: u32) -> VmResult<()> {
    let v = *vm
        .vars
        .get(var as usize)
        .ok_or_else(|| VmError::Corrupt(format!("variable {var} out of range")))?;
    let v = vm.heap.retain_value(v);
    vm.push(v)
}

pub(crate) fn dup(vm: &mut Vm) -> VmResult<()> {
    let v = vm.peek(0)?;
    let v = vm.heap.retain_value(v);
    vm.push(v)
}

/// Discard a value known to be a scalar.
pub(crate) fn pop_discard(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop()?;
    debug_assert!(!v.is_obj(), "pop of a reference; compiler should emit pop_ref");
    Ok(())
}

/// Discard a value that may be a reference.
pub(crate) fn pop_ref(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop()?;
    vm.heap.release_value(v);
    Ok(())
}

// ---- heap objects ----

pub(crate) fn box_new(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop()?;
    let r = vm.heap.alloc(crate::program::TYPE_BOX, ObjBody::Boxed(v));
    vm.push(Value::Obj(r))
}

pub(crate) fn unbox(vm: &mut Vm) -> VmResult<()> {
    let b = vm.pop()?;
    let inner = match b.as_obj().and_then(|r| vm.heap.get(r)) {
        Some(obj) => match &obj.body {
            ObjBody::Boxed(v) => Some(*v),
            _ => None,
        },
        None => None,
    };
    let Some(inner) = inner else {
        let t = vm.type_name_of(&b);
        vm.heap.release_value(b);
        return Err(VmError::TypeMismatch { op: "unbox", operands: t });
    };
    let inner = vm.heap.retain_value(inner);
    vm.heap.release_value(b);
    vm.push(inner)
}

pub(crate) fn new_vec(vm: &mut Vm, type_idx: u32, count: u32) -> VmResult<()> {
    match vm.program.types.get(type_idx as usize).map(|t| &t.kind) {
        Some(TypeKind::Vector) => {}
        _ => return Err(VmError::Corrupt(format!("new_vec with non-vector type {type_idx}"))),
    }
    let count = count as usize;
    if vm.stack.len() < count {
        return Err(VmError::StackUnderflow);
    }
    // ownership of the popped elements transfers into the vector
    let elems = vm.stack.split_off(vm.stack.len() - count);
    let r = vm.heap.alloc(type_idx, ObjBody::Vector(elems));
    vm.push(Value::Obj(r))
}

pub(crate) fn new_struct(vm: &mut Vm, type_idx: u32) -> VmResult<()> {
    let nfields = match vm.program.types.get(type_idx as usize).map(|t| &t.kind) {
        Some(TypeKind::Struct { fields }) => fields.len(),
        _ => {
            return Err(VmError::Corrupt(format!("new_struct with non-struct type {type_idx}")))
        }
    };
    if vm.stack.len() < nfields {
        return Err(VmError::StackUnderflow);
    }
    let elems = vm.stack.split_off(vm.stack.len() - nfields);
    let r = vm.heap.alloc(type_idx, ObjBody::Struct(elems.into_boxed_slice()));
    vm.push(Value::Obj(r))
}

fn resolve_idx(vm: &Vm, container: Value, index: Value) -> VmResult<(ObjRef, usize)> {
    let Some(r) = container.as_obj() else {
        return Err(VmError::TypeMismatch {
            op: "index",
            operands: vm.type_name_of(&container),
        });
    };
    let len = match vm.obj(r)?.body {
        ObjBody::Vector(ref vs) => vs.len(),
        _ => {
            return Err(VmError::TypeMismatch {
                op: "index",
                operands: vm.type_name_of(&container),
            })
        }
    };
    let Some(idx) = index.as_int() else {
        return Err(VmError::TypeMismatch { op: "index", operands: vm.type_name_of(&index) });
    };
    if idx < 0 || idx as usize >= len {
        return Err(VmError::IndexOutOfRange { idx, len });
    }
    Ok((r, idx as usize))
}

pub(crate) fn push_idx(vm: &mut Vm) -> VmResult<()> {
    let index = vm.pop()?;
    let container = vm.pop()?;
    let (r, i) = match resolve_idx(vm, container, index) {
        Ok(x) => x,
        Err(e) => {
            vm.heap.release_value(index);
            vm.heap.release_value(container);
            return Err(e);
        }
    };
    let elem = match vm.obj(r)?.body {
        ObjBody::Vector(ref vs) => vs[i],
        _ => unreachable!("resolved above"),
    };
    let elem = vm.heap.retain_value(elem);
    vm.heap.release(r);
    vm.push(elem)
}

fn resolve_field(vm: &Vm, container: Value, field: u32) -> VmResult<(ObjRef, usize)> {
    let Some(r) = container.as_obj() else {
        return Err(VmError::UnknownField {
            field,
            type_name: vm.type_name_of(&container),
        });
    };
    let obj = vm.obj(r)?;
    let len = match obj.body {
        ObjBody::Struct(ref vs) => vs.len(),
        _ => {
            return Err(VmError::UnknownField { field, type_name: vm.type_name_of(&container) })
        }
    };
    if field as usize >= len {
        return Err(VmError::UnknownField { field, type_name: vm.type_name_of(&container) });
    }
    Ok((r, field as usize))
}

pub(crate) fn push_field(vm: &mut Vm, field: u32) -> VmResult<()> {
    let container = vm.pop()?;
    let (r, i) = match resolve_field(vm, container, field) {
        Ok(x) => x,
        Err(e) => {
            vm.heap.release_value(container);
            return Err(e);
        }
    };
    let elem = match vm.obj(r)?.body {
        ObjBody::Struct(ref vs) => vs[i],
        _ => unreachable!("resolved above"),
    };
    let elem = vm.heap.retain_value(elem);
    vm.heap.release(r);
    vm.push(elem)
}

// ---- control ----

pub(crate) fn jmp(vm: &mut Vm, target: u32) -> VmResult<()> {
    if target as usize >= vm.program.code.len() {
        return Err(VmError::PcOutOfRange { ip: target, len: vm.program.code.len() as u32 });
    }
    vm.ip = target;
    Ok(())
}

pub(crate) fn jz(vm: &mut Vm, target: u32) -> VmResult<()> {
    let c = vm.pop()?;
    let taken = !c.truthy();
    vm.heap.release_value(c);
    if taken {
        jmp(vm, target)?;
    }
    Ok(())
}

pub(crate) fn call(vm: &mut Vm, fun: u32) -> VmResult<()> {
    vm.enter_fun(fun, false)
}

pub(crate) fn call_indirect(vm: &mut Vm) -> VmResult<()> {
    let f = vm.pop()?;
    let Value::Fun(fun) = f else {
        let t = vm.type_name_of(&f);
        vm.heap.release_value(f);
        return Err(VmError::TypeMismatch { op: "call", operands: t });
    };
    vm.enter_fun(fun, true)
}

fn type_matches(vm: &Vm, v: &Value, sel: TypeSel) -> bool {
    match sel {
        TypeSel::Any => true,
        TypeSel::Int => matches!(v, Value::Int(_)),
        TypeSel::Float => matches!(v, Value::Float(_)),
        TypeSel::Obj(t) => v
            .as_obj()
            .and_then(|r| vm.heap.get(r))
            .is_some_and(|o| o.type_idx == t),
    }
}

/// First-match dispatch over an ordered candidate list. All candidates share
/// a name and an arity; the first one whose declared parameter types accept
/// the runtime argument types wins.
pub(crate) fn call_multi(vm: &mut Vm, cands: &[u32]) -> VmResult<()> {
    let first = *cands
        .first()
        .ok_or_else(|| VmError::Corrupt("call_multi with no candidates".into()))?;
    let argc = vm
        .program
        .funcs
        .get(first as usize)
        .ok_or_else(|| VmError::Corrupt(format!("call_multi candidate {first} out of range")))?
        .params
        .len();
    if vm.stack.len() < argc {
        return Err(VmError::StackUnderflow);
    }
    let floor = vm.stack.len() - argc;

    for &cand in cands {
        let def = vm
            .program
            .funcs
            .get(cand as usize)
            .ok_or_else(|| VmError::Corrupt(format!("call_multi candidate {cand} out of range")))?;
        if def.params.len() != argc {
            return Err(VmError::Corrupt(format!(
                "call_multi candidates of {} disagree on arity",
                def.name
            )));
        }
        let hit = def
            .param_types
            .iter()
            .enumerate()
            .all(|(i, &sel)| type_matches(vm, &vm.stack[floor + i], sel));
        if hit {
            return vm.enter_fun(cand, false);
        }
    }

    let args = vm.stack[floor..]
        .iter()
        .map(|v| vm.type_name_of(v))
        .collect::<Vec<_>>()
        .join(", ");
    Err(VmError::NoDispatchMatch {
        name: vm.program.funcs[first as usize].name.clone(),
        args,
    })
}

fn ret_common(vm: &mut Vm, v: Value) -> VmResult<()> {
    if let Some(r) = vm.active_coro {
        if vm.frames.len() <= coroutine::frame_floor(vm, r)? {
            vm.heap.release_value(v);
            return Err(VmError::Corrupt("return crosses a coroutine boundary".into()));
        }
    }
    if let Err(e) = vm.exit_frame() {
        vm.heap.release_value(v);
        return Err(e);
    }
    vm.push(v)
}

pub(crate) fn ret(vm: &mut Vm) -> VmResult<()> {
    ret_common(vm, Value::Nil)
}

pub(crate) fn ret_v(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop()?;
    ret_common(vm, v)
}

// ---- arithmetic and comparison ----

fn mismatch(vm: &Vm, op: Opcode, lhs: &Value, rhs: &Value) -> VmError {
    VmError::TypeMismatch {
        op: op.mnemonic(),
        operands: format!("{} and {}", vm.type_name_of(lhs), vm.type_name_of(rhs)),
    }
}

/// Scalar arithmetic. `Ok(None)` means the pair is not a scalar case; a zero
/// divisor is an error for both integer and float division and remainder.
fn arith_scalar(op: Opcode, a: Value, b: Value) -> VmResult<Option<Value>> {
    use Opcode::*;
    let out = match (a, b) {
        (Value::Int(x), Value::Int(y)) => match op {
            Add => Value::Int(x.wrapping_add(y)),
            Sub => Value::Int(x.wrapping_sub(y)),
            Mul => Value::Int(x.wrapping_mul(y)),
            Div => {
                if y == 0 {
                    return Err(VmError::DivisionByZero);
                }
                Value::Int(x.wrapping_div(y))
            }
            Mod => {
                if y == 0 {
                    return Err(VmError::DivisionByZero);
                }
                Value::Int(x.wrapping_rem(y))
            }
            _ => return Ok(None),
        },
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let x = a.as_float().unwrap_or_else(|| a.as_int().unwrap_or(0) as f64);
            let y = b.as_float().unwrap_or_else(|| b.as_int().unwrap_or(0) as f64);
            match op {
                Add => Value::Float(x + y),
                Sub => Value::Float(x - y),
                Mul => Value::Float(x * y),
                Div => {
                    if y == 0.0 {
                        return Err(VmError::DivisionByZero);
                    }
                    Value::Float(x / y)
                }
                Mod => {
                    if y == 0.0 {
                        return Err(VmError::DivisionByZero);
                    }
                    Value::Float(x % y)
                }
                _ => return Ok(None),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(out))
}

fn str_body(vm: &Vm, v: Value) -> Option<&str> {
    match v.as_obj().and_then(|r| vm.heap.get(r)).map(|o| &o.body) {
        Some(ObjBody::Str(s)) => Some(s),
        _ => None,
    }
}

/// Vector body as an owned snapshot, with its type index.
fn vec_body(vm: &Vm, v: Value) -> Option<(u32, Vec<Value>)> {
    let r = v.as_obj()?;
    let obj = vm.heap.get(r)?;
    match &obj.body {
        ObjBody::Vector(vs) => Some((obj.type_idx, vs.clone())),
        _ => None,
    }
}

/// Heap-typed arithmetic: string concatenation and vector element-wise forms.
/// Allocates the result; the caller releases both operands afterwards.
fn arith_heap(vm: &mut Vm, op: Opcode, lhs: Value, rhs: Value) -> VmResult<Value> {
    if op == Opcode::Add {
        let cat = match (str_body(vm, lhs), str_body(vm, rhs)) {
            (Some(a), Some(b)) => Some(format!("{a}{b}")),
            _ => None,
        };
        if let Some(s) = cat {
            return Ok(Value::Obj(vm.heap.alloc(TYPE_STR, ObjBody::Str(s))));
        }
    }

    let lv = vec_body(vm, lhs);
    let rv = vec_body(vm, rhs);
    let (type_idx, elems) = match (lv, rv) {
        (Some((lt, ls)), Some((rt, rs))) => {
            if lt != rt || ls.len() != rs.len() {
                return Err(mismatch(vm, op, &lhs, &rhs));
            }
            let mut out = Vec::with_capacity(ls.len());
            for (a, b) in ls.iter().zip(&rs) {
                match arith_scalar(op, *a, *b)? {
                    Some(v) => out.push(v),
                    None => return Err(mismatch(vm, op, &lhs, &rhs)),
                }
            }
            (lt, out)
        }
        (Some((lt, ls)), None) if matches!(rhs, Value::Int(_) | Value::Float(_)) => {
            let mut out = Vec::with_capacity(ls.len());
            for a in &ls {
                match arith_scalar(op, *a, rhs)? {
                    Some(v) => out.push(v),
                    None => return Err(mismatch(vm, op, &lhs, &rhs)),
                }
            }
            (lt, out)
        }
        (None, Some((rt, rs))) if matches!(lhs, Value::Int(_) | Value::Float(_)) => {
            let mut out = Vec::with_capacity(rs.len());
            for b in &rs {
                match arith_scalar(op, lhs, *b)? {
                    Some(v) => out.push(v),
                    None => return Err(mismatch(vm, op, &lhs, &rhs)),
                }
            }
            (rt, out)
        }
        _ => return Err(mismatch(vm, op, &lhs, &rhs)),
    };
    Ok(Value::Obj(vm.heap.alloc(type_idx, ObjBody::Vector(elems))))
}

/// Full arithmetic over two owned operands. Consumes both on every path,
/// including errors, so the caller never double-releases.
pub(crate) fn arith_values(vm: &mut Vm, op: Opcode, lhs: Value, rhs: Value) -> VmResult<Value> {
    match arith_scalar(op, lhs, rhs) {
        Ok(Some(v)) => return Ok(v),
        Ok(None) => {}
        Err(e) => {
            vm.heap.release_value(lhs);
            vm.heap.release_value(rhs);
            return Err(e);
        }
    }
    let out = arith_heap(vm, op, lhs, rhs);
    vm.heap.release_value(lhs);
    vm.heap.release_value(rhs);
    out
}

pub(crate) fn binary(vm: &mut Vm, op: Opcode) -> VmResult<()> {
    let rhs = vm.pop()?;
    let lhs = vm.pop()?;
    let out = arith_values(vm, op, lhs, rhs)?;
    vm.push(out)
}

pub(crate) fn neg(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop()?;
    let out = match v {
        Value::Int(x) => Value::Int(x.wrapping_neg()),
        Value::Float(x) => Value::Float(-x),
        _ => {
            let t = vm.type_name_of(&v);
            vm.heap.release_value(v);
            return Err(VmError::TypeMismatch { op: "neg", operands: t });
        }
    };
    vm.push(out)
}

pub(crate) fn not(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop()?;
    let out = Value::from_bool(!v.truthy());
    vm.heap.release_value(v);
    vm.push(out)
}

/// Eager logical ops over truthiness; the compiler lowers short-circuit forms
/// to jumps instead.
pub(crate) fn logic(vm: &mut Vm, op: Opcode) -> VmResult<()> {
    let rhs = vm.pop()?;
    let lhs = vm.pop()?;
    let out = match op {
        Opcode::And => lhs.truthy() && rhs.truthy(),
        Opcode::Or => lhs.truthy() || rhs.truthy(),
        _ => unreachable!("logic called with {op:?}"),
    };
    vm.heap.release_value(lhs);
    vm.heap.release_value(rhs);
    vm.push(Value::from_bool(out))
}

fn values_equal(vm: &Vm, a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => x as f64 == y,
        (Value::Fun(x), Value::Fun(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => match (str_body(vm, a), str_body(vm, b)) {
            // strings compare by content, everything else by identity
            (Some(s), Some(t)) => s == t,
            _ => x == y,
        },
        _ => false,
    }
}

fn cmp_values(vm: &Vm, op: Opcode, lhs: Value, rhs: Value) -> VmResult<bool> {
    use Opcode::*;
    if let (Some(a), Some(b)) = (str_body(vm, lhs), str_body(vm, rhs)) {
        return Ok(match op {
            Lt => a < b,
            Gt => a > b,
            Le => a <= b,
            Ge => a >= b,
            _ => unreachable!("cmp_values called with {op:?}"),
        });
    }
    let (a, b) = match (lhs, rhs) {
        (Value::Int(x), Value::Int(y)) => {
            return Ok(match op {
                Lt => x < y,
                Gt => x > y,
                Le => x <= y,
                Ge => x >= y,
                _ => unreachable!("cmp_values called with {op:?}"),
            })
        }
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let a = lhs.as_float().unwrap_or_else(|| lhs.as_int().unwrap_or(0) as f64);
            let b = rhs.as_float().unwrap_or_else(|| rhs.as_int().unwrap_or(0) as f64);
            (a, b)
        }
        _ => return Err(mismatch(vm, op, &lhs, &rhs)),
    };
    Ok(match op {
        Lt => a < b,
        Gt => a > b,
        Le => a <= b,
        Ge => a >= b,
        _ => unreachable!("cmp_values called with {op:?}"),
    })
}

pub(crate) fn compare(vm: &mut Vm, op: Opcode) -> VmResult<()> {
    let rhs = vm.pop()?;
    let lhs = vm.pop()?;
    let out = match op {
        Opcode::Eq => Ok(values_equal(vm, lhs, rhs)),
        Opcode::Ne => Ok(!values_equal(vm, lhs, rhs)),
        _ => cmp_values(vm, op, lhs, rhs),
    };
    vm.heap.release_value(lhs);
    vm.heap.release_value(rhs);
    vm.push(Value::from_bool(out?))
}

// ---- lvalue compound assignment ----

/// A resolved storage location. Containers referenced here keep their stack
/// reference count until the operation is applied.
#[derive(Debug, Clone, Copy)]
enum Loc {
    Var(u32),
    Idx { obj: ObjRef, idx: usize },
    Field { obj: ObjRef, idx: usize },
}

fn loc_read(vm: &Vm, loc: Loc) -> VmResult<Value> {
    match loc {
        Loc::Var(v) => Ok(vm.vars[v as usize]),
        Loc::Idx { obj, idx } | Loc::Field { obj, idx } => match vm.obj(obj)?.body {
            ObjBody::Vector(ref vs) => Ok(vs[idx]),
            ObjBody::Struct(ref vs) => Ok(vs[idx]),
            _ => Err(VmError::DanglingRef),
        },
    }
}

fn loc_write(vm: &mut Vm, loc: Loc, v: Value) -> VmResult<()> {
    match loc {
        Loc::Var(var) => {
            vm.vars[var as usize] = v;
            Ok(())
        }
        Loc::Idx { obj, idx } | Loc::Field { obj, idx } => match vm.obj_mut(obj)?.body {
            ObjBody::Vector(ref mut vs) => {
                vs[idx] = v;
                Ok(())
            }
            ObjBody::Struct(ref mut vs) => {
                vs[idx] = v;
                Ok(())
            }
            _ => Err(VmError::DanglingRef),
        },
    }
}

fn lval_arith_op(op: LvalOp) -> Opcode {
    use LvalOp::*;
    match op {
        Add | AddPushNew | AddPushOld => Opcode::Add,
        Sub | SubPushNew | SubPushOld => Opcode::Sub,
        Mul | MulPushNew | MulPushOld => Opcode::Mul,
        Div | DivPushNew | DivPushOld => Opcode::Div,
        Mod | ModPushNew | ModPushOld => Opcode::Mod,
        _ => unreachable!("no arithmetic for {op:?}"),
    }
}

fn lval_pushes_new(op: LvalOp) -> bool {
    use LvalOp::*;
    matches!(op, AddPushNew | SubPushNew | MulPushNew | DivPushNew | ModPushNew | IncrPushNew | DecrPushNew)
}

fn lval_pushes_old(op: LvalOp) -> bool {
    use LvalOp::*;
    matches!(op, AddPushOld | SubPushOld | MulPushOld | DivPushOld | ModPushOld | IncrPushOld | DecrPushOld)
}

/// Apply one lvalue operation to a resolved location. `rhs` is owned and
/// consumed. The location is parked at nil for the duration of a compound
/// arithmetic step so an error unwind never sees (and releases) a value the
/// arithmetic has already consumed.
fn apply(vm: &mut Vm, loc: Loc, op: LvalOp, rhs: Option<Value>) -> VmResult<()> {
    use LvalOp::*;
    match op {
        Write => {
            // the previous value is statically known to be a scalar
            let rhs = rhs.ok_or_else(|| VmError::Corrupt("write without a value".into()))?;
            let old = loc_read(vm, loc)?;
            debug_assert!(!old.is_obj(), "write over a reference; compiler should emit write_ref");
            loc_write(vm, loc, rhs)
        }
        WriteRef => {
            let rhs = rhs.ok_or_else(|| VmError::Corrupt("write without a value".into()))?;
            let old = loc_read(vm, loc)?;
            loc_write(vm, loc, rhs)?;
            vm.heap.release_value(old);
            Ok(())
        }
        IncrPushNew | IncrPushOld | IncrPre | IncrPost | DecrPushNew | DecrPushOld | DecrPre
        | DecrPost => {
            let old = loc_read(vm, loc)?;
            let delta = if matches!(op, IncrPushNew | IncrPushOld | IncrPre | IncrPost) {
                1
            } else {
                -1
            };
            let new = match old {
                Value::Int(x) => Value::Int(x.wrapping_add(delta)),
                Value::Float(x) => Value::Float(x + delta as f64),
                _ => {
                    return Err(VmError::TypeMismatch {
                        op: op.mnemonic(),
                        operands: vm.type_name_of(&old),
                    })
                }
            };
            loc_write(vm, loc, new)?;
            if lval_pushes_new(op) {
                vm.push(new)?;
            } else if lval_pushes_old(op) {
                vm.push(old)?;
            }
            Ok(())
        }
        _ => {
            let rhs =
                rhs.ok_or_else(|| VmError::Corrupt("compound assignment without a value".into()))?;
            let old = loc_read(vm, loc)?;
            let old_copy = if lval_pushes_old(op) {
                Some(vm.heap.retain_value(old))
            } else {
                None
            };
            loc_write(vm, loc, Value::Nil)?;
            let new = match arith_values(vm, lval_arith_op(op), old, rhs) {
                Ok(v) => v,
                Err(e) => {
                    if let Some(c) = old_copy {
                        vm.heap.release_value(c);
                    }
                    return Err(e);
                }
            };
            loc_write(vm, loc, new)?;
            if lval_pushes_new(op) {
                let c = vm.heap.retain_value(new);
                vm.push(c)?;
            } else if let Some(c) = old_copy {
                vm.push(c)?;
            }
            Ok(())
        }
    }
}

fn decode_lval(cell: u32) -> VmResult<LvalOp> {
    LvalOp::from_repr(cell).ok_or_else(|| VmError::Corrupt(format!("bad lvalue op code {cell}")))
}

pub(crate) fn lval_var(vm: &mut Vm, var: u32, opcell: u32) -> VmResult<()> {
    let op = decode_lval(opcell)?;
    if var as usize >= vm.vars.len() {
        return Err(VmError::Corrupt(format!("variable {var} out of range")));
    }
    let rhs = if op.takes_rhs() { Some(vm.pop()?) } else { None };
    apply(vm, Loc::Var(var), op, rhs)
}

pub(crate) fn lval_idx(vm: &mut Vm, opcell: u32) -> VmResult<()> {
    let op = decode_lval(opcell)?;
    let rhs = if op.takes_rhs() { Some(vm.pop()?) } else { None };
    let index = vm.pop()?;
    let container = vm.pop()?;
    let (r, i) = match resolve_idx(vm, container, index) {
        Ok(x) => x,
        Err(e) => {
            if let Some(v) = rhs {
                vm.heap.release_value(v);
            }
            vm.heap.release_value(index);
            vm.heap.release_value(container);
            return Err(e);
        }
    };
    let out = apply(vm, Loc::Idx { obj: r, idx: i }, op, rhs);
    vm.heap.release(r);
    out
}

pub(crate) fn lval_field(vm: &mut Vm, field: u32, opcell: u32) -> VmResult<()> {
    let op = decode_lval(opcell)?;
    let rhs = if op.takes_rhs() { Some(vm.pop()?) } else { None };
    let container = vm.pop()?;
    let (r, i) = match resolve_field(vm, container, field) {
        Ok(x) => x,
        Err(e) => {
            if let Some(v) = rhs {
                vm.heap.release_value(v);
            }
            vm.heap.release_value(container);
            return Err(e);
        }
    };
    let out = apply(vm, Loc::Field { obj: r, idx: i }, op, rhs);
    vm.heap.release(r);
    out
}
