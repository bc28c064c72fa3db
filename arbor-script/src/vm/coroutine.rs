//! Asymmetric coroutines.
//!
//! A coroutine is an ordinary heap object holding a saved execution segment:
//! a slice of operand stack, a slice of call frames and the values of its
//! captured variables. Resume splices the segment back onto the live stack;
//! yield carves it off again. Captured variables are context-switched by
//! swapping the saved values with the shared variable slots, so creator and
//! coroutine each observe their own timeline of the same variable ids while
//! the other is suspended.
//!
//! Ownership: while a coroutine runs, the VM holds one reference count for
//! it (taken over from the stack cell `co_resume` popped). The `parent` link
//! to the next coroutine down the chain is borrowed; the VM's count on that
//! one predates the resume and outlives it.

use crate::heap::ObjBody;
use crate::program::TYPE_CORO;
use crate::value::{ObjRef, Value};
use crate::vm::{Frame, Vm, VmError, VmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroStatus {
    /// Created, never resumed; the body has not started.
    Created,
    /// Currently on the active chain.
    Active,
    /// Yielded; holds a saved segment.
    Suspended,
    /// Body finished; resuming again is an error.
    Done,
}

#[derive(Debug)]
pub struct Coro {
    pub status: CoroStatus,
    /// Cell address execution continues at on the next resume.
    pub resume_ip: u32,
    /// Where the resumer continues when this coroutine yields.
    pub caller_ip: u32,
    /// Next coroutine down the active chain; borrowed, see module docs.
    pub parent: Option<ObjRef>,
    /// Captured variable ids, in capture order.
    pub capture: Vec<u32>,
    /// Saved values of the captured variables while suspended (owned), or of
    /// the creator's values while running.
    pub backup: Vec<Value>,
    /// Saved operand-stack segment while suspended (owned).
    pub stack_copy: Vec<Value>,
    /// Saved call frames while suspended; floors are segment-relative.
    pub frame_copy: Vec<Frame>,
    /// Live-stack height where this coroutine's segment starts, while active.
    pub floor: usize,
    /// Frame-list depth below this coroutine's own frames, while active.
    pub frame_floor: usize,
}

fn coro_mut<'a>(vm: &'a mut Vm, r: ObjRef) -> VmResult<&'a mut Coro> {
    match vm.obj_mut(r)?.body {
        ObjBody::Coroutine(ref mut co) => Ok(co),
        _ => Err(VmError::TypeMismatch {
            op: "co_resume",
            operands: "a non-coroutine object".into(),
        }),
    }
}

fn coro_ref<'a>(vm: &'a Vm, r: ObjRef) -> VmResult<&'a Coro> {
    match vm.obj(r)?.body {
        ObjBody::Coroutine(ref co) => Ok(co),
        _ => Err(VmError::TypeMismatch {
            op: "co_resume",
            operands: "a non-coroutine object".into(),
        }),
    }
}

pub(crate) fn frame_floor(vm: &Vm, r: ObjRef) -> VmResult<usize> {
    Ok(coro_ref(vm, r)?.frame_floor)
}

/// Detach and return the parent link, for chain teardown.
pub(crate) fn take_parent(vm: &mut Vm, r: ObjRef) -> Option<ObjRef> {
    match vm.heap.get_mut(r).map(|o| &mut o.body) {
        Some(ObjBody::Coroutine(co)) => co.parent.take(),
        _ => None,
    }
}

/// Swap the captured variable slots with the coroutine's saved values. The
/// same call performs both directions of the context switch.
fn swap_captured(vm: &mut Vm, r: ObjRef) -> VmResult<()> {
    // detach the save area to sidestep aliasing between heap and vars
    let (capture, mut backup) = {
        let co = coro_mut(vm, r)?;
        (co.capture.clone(), std::mem::take(&mut co.backup))
    };
    for (i, &vid) in capture.iter().enumerate() {
        std::mem::swap(&mut backup[i], &mut vm.vars[vid as usize]);
    }
    coro_mut(vm, r)?.backup = backup;
    Ok(())
}

/// `co_create <body> <skip> <ncap> <var>*`: allocate a suspended-at-birth
/// coroutine whose first resume starts at `body`, then continue at `skip`.
/// The captured variables' current values are retained into the save area so
/// the body starts from creation-time state.
pub(crate) fn co_create(vm: &mut Vm, body: u32, skip: u32, captures: &[u32]) -> VmResult<()> {
    if body as usize >= vm.program.code.len() || skip as usize >= vm.program.code.len() {
        return Err(VmError::Corrupt("co_create body or continuation out of range".into()));
    }
    let mut backup = Vec::with_capacity(captures.len());
    for &vid in captures {
        let v = *vm
            .vars
            .get(vid as usize)
            .ok_or_else(|| VmError::Corrupt(format!("captured variable {vid} out of range")))?;
        if !vm.program.captured[vid as usize] {
            return Err(VmError::Corrupt(format!(
                "variable {vid} captured without a capture flag"
            )));
        }
        backup.push(vm.heap.retain_value(v));
    }
    let co = Coro {
        status: CoroStatus::Created,
        resume_ip: body,
        caller_ip: 0,
        parent: None,
        capture: captures.to_vec(),
        backup,
        stack_copy: Vec::new(),
        frame_copy: Vec::new(),
        floor: 0,
        frame_floor: 0,
    };
    let r = vm.heap.alloc(TYPE_CORO, ObjBody::Coroutine(co));
    vm.push(Value::Obj(r))?;
    vm.ip = skip;
    Ok(())
}

/// `co_resume`: stack is `... coro arg`. Transfers control into the
/// coroutine; the resumer continues when it yields, with the yielded value
/// on the stack.
pub(crate) fn co_resume(vm: &mut Vm) -> VmResult<()> {
    let arg = vm.pop()?;
    let target = vm.pop()?;
    let Some(r) = target.as_obj() else {
        let t = vm.type_name_of(&target);
        vm.heap.release_value(arg);
        vm.heap.release_value(target);
        return Err(VmError::TypeMismatch { op: "co_resume", operands: t });
    };

    let status = match coro_ref(vm, r) {
        Ok(co) => co.status,
        Err(e) => {
            vm.heap.release_value(arg);
            vm.heap.release(r);
            return Err(e);
        }
    };
    match status {
        CoroStatus::Done => {
            vm.heap.release_value(arg);
            vm.heap.release(r);
            return Err(VmError::CoroutineFinished);
        }
        CoroStatus::Active => {
            vm.heap.release_value(arg);
            vm.heap.release(r);
            return Err(VmError::CoroutineActive);
        }
        CoroStatus::Created | CoroStatus::Suspended => {}
    }

    // the popped count now backs the VM's active-chain ownership of `r`
    let caller_ip = vm.ip;
    let floor = vm.stack.len();
    let frame_floor = vm.frames.len();
    let parent = vm.active_coro.take();

    let (resume_ip, stack_copy, frame_copy) = {
        let co = coro_mut(vm, r)?;
        co.status = CoroStatus::Active;
        co.caller_ip = caller_ip;
        co.floor = floor;
        co.frame_floor = frame_floor;
        co.parent = parent;
        (
            co.resume_ip,
            std::mem::take(&mut co.stack_copy),
            std::mem::take(&mut co.frame_copy),
        )
    };
    vm.active_coro = Some(r);

    // splice the saved segment back; frame floors were segment-relative
    if vm.stack.len() + stack_copy.len() >= vm.opts.max_stack {
        for v in stack_copy {
            vm.heap.release_value(v);
        }
        vm.heap.release_value(arg);
        return Err(VmError::StackOverflow { limit: vm.opts.max_stack });
    }
    vm.stack.extend(stack_copy);
    for mut f in frame_copy {
        f.floor += floor;
        vm.frames.push(f);
    }
    swap_captured(vm, r)?;

    // the resume argument becomes the value of the suspended yield (or the
    // body's initial stack value on first resume)
    vm.push(arg)?;
    vm.ip = resume_ip;
    Ok(())
}

/// `co_yield`: stack is `... value`. Suspends the innermost coroutine and
/// delivers the value to its resumer.
pub(crate) fn co_yield(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop()?;
    let Some(r) = vm.active_coro else {
        vm.heap.release_value(v);
        return Err(VmError::YieldOutsideCoroutine);
    };

    let (floor, frame_floor, caller_ip) = {
        let co = coro_ref(vm, r)?;
        (co.floor, co.frame_floor, co.caller_ip)
    };
    // the body must not have consumed stack it was resumed on top of
    if vm.stack.len() < floor || vm.frames.len() < frame_floor {
        vm.heap.release_value(v);
        return Err(VmError::Corrupt(
            "yield below the coroutine's resume floor".into(),
        ));
    }
    swap_captured(vm, r)?;
    let stack_copy = vm.stack.split_off(floor);
    let mut frame_copy = vm.frames.split_off(frame_floor);
    for f in &mut frame_copy {
        f.floor -= floor;
    }
    let resume_ip = vm.ip;
    let parent = {
        let co = coro_mut(vm, r)?;
        co.status = CoroStatus::Suspended;
        co.resume_ip = resume_ip;
        co.stack_copy = stack_copy;
        co.frame_copy = frame_copy;
        co.parent.take()
    };
    vm.active_coro = parent;
    // hand the active-chain count back
    vm.heap.release(r);

    vm.ip = caller_ip;
    vm.push(v)
}

/// `co_end`: stack is `... result`. Runs the body's implicit return: the
/// result and any segment leftovers are discarded, captured variables go
/// back to the creator's timeline and the coroutine transitions to `Done`.
/// The resume that ran the body to completion observes the
/// finished-coroutine error, the same one every later resume raises.
pub(crate) fn co_end(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop()?;
    let Some(r) = vm.active_coro else {
        vm.heap.release_value(v);
        return Err(VmError::YieldOutsideCoroutine);
    };
    vm.heap.release_value(v);

    let (floor, frame_floor) = {
        let co = coro_ref(vm, r)?;
        (co.floor, co.frame_floor)
    };
    if vm.frames.len() != frame_floor {
        return Err(VmError::Corrupt("co_end with live frames in the body".into()));
    }
    // discard whatever the body left on its segment
    while vm.stack.len() > floor {
        let leftover = vm.pop()?;
        vm.heap.release_value(leftover);
    }
    swap_captured(vm, r)?;
    let parent = {
        let co = coro_mut(vm, r)?;
        co.status = CoroStatus::Done;
        co.resume_ip = 0;
        co.parent.take()
    };
    vm.active_coro = parent;
    vm.heap.release(r);

    Err(VmError::CoroutineFinished)
}
