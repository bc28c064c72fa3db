//! Reference-counted heap object store.
//!
//! Objects are created by explicit `new` opcodes, retained/released around
//! every duplication and discard, and destroyed synchronously when the count
//! reaches zero. There is no collector; the mark phase in [`Heap::leak_report`]
//! is a diagnostic only and never reclaims anything.

use crate::value::{ObjRef, Value};
use crate::vm::coroutine::Coro;

#[derive(Debug)]
pub enum ObjBody {
    Str(String),
    Vector(Vec<Value>),
    Struct(Box<[Value]>),
    Boxed(Value),
    Coroutine(Coro),
}

/// Heap object header plus body. The count is signed: it is temporarily
/// negated while an object is marked during a leak sweep.
#[derive(Debug)]
pub struct Obj {
    pub refc: i64,
    pub type_idx: u32,
    pub body: ObjBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    pub obj: ObjRef,
    pub type_idx: u32,
    pub refc: i64,
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<Obj>>,
    free: Vec<ObjRef>,
    live: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, type_idx: u32, body: ObjBody) -> ObjRef {
        let obj = Obj { refc: 1, type_idx, body };
        match self.free.pop() {
            Some(r) => {
                debug_assert!(self.slots[r as usize].is_none());
                self.slots[r as usize] = Some(obj);
                self.live += 1;
                r
            }
            None => {
                let r = self.slots.len() as ObjRef;
                self.slots.push(Some(obj));
                self.live += 1;
                r
            }
        }
    }

    pub fn get(&self, r: ObjRef) -> Option<&Obj> {
        self.slots.get(r as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut Obj> {
        self.slots.get_mut(r as usize)?.as_mut()
    }

    pub fn retain(&mut self, r: ObjRef) {
        if let Some(obj) = self.get_mut(r) {
            obj.refc += 1;
        }
    }

    /// Retain the pointee if `v` is a reference; pass scalars through.
    pub fn retain_value(&mut self, v: Value) -> Value {
        if let Value::Obj(r) = v {
            self.retain(r);
        }
        v
    }

    /// Unconditional release: the caller knows `r` is a live reference.
    /// Destroys the object and recursively releases owned values when the
    /// count reaches zero.
    pub fn release(&mut self, r: ObjRef) {
        let mut pending = vec![r];
        while let Some(r) = pending.pop() {
            let Some(obj) = self.get_mut(r) else {
                debug_assert!(false, "release of dangling ref {r}");
                continue;
            };
            debug_assert!(obj.refc > 0, "release of dead object {r}");
            obj.refc -= 1;
            if obj.refc > 0 {
                continue;
            }
            let Some(obj) = self.slots[r as usize].take() else { continue };
            self.free.push(r);
            self.live -= 1;
            collect_children(&obj.body, &mut pending);
        }
    }

    /// Release-if-reference: no-op on scalars. Used wherever the static type
    /// of a slot is `any`.
    pub fn release_value(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            self.release(r);
        }
    }

    pub fn live_objects(&self) -> usize {
        self.live
    }

    /// Diagnostic mark/sweep. Marks everything reachable from `roots` by
    /// negating its count, reports live objects that were never reached,
    /// then restores the counts. Reported objects are allocations that no
    /// root can see any more: each one is a retain/release imbalance.
    pub fn leak_report(&mut self, roots: impl IntoIterator<Item = Value>) -> Vec<LeakReport> {
        let mut pending: Vec<ObjRef> =
            roots.into_iter().filter_map(|v| v.as_obj()).collect();
        while let Some(r) = pending.pop() {
            let Some(obj) = self.get_mut(r) else { continue };
            if obj.refc < 0 {
                continue; // already marked
            }
            obj.refc = -obj.refc;
            collect_children(&obj.body, &mut pending);
        }

        let mut leaks = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let Some(obj) = slot else { continue };
            if obj.refc > 0 {
                leaks.push(LeakReport { obj: i as ObjRef, type_idx: obj.type_idx, refc: obj.refc });
            } else {
                obj.refc = -obj.refc;
            }
        }
        if !leaks.is_empty() {
            log::warn!("leak sweep found {} unreachable live object(s)", leaks.len());
        }
        leaks
    }
}

/// Owned references embedded in a body. The parent link of a coroutine is a
/// borrowed slot (it only exists while the coroutine is running and the VM
/// holds the chain's counts), so it is deliberately not listed here.
fn collect_children(body: &ObjBody, out: &mut Vec<ObjRef>) {
    let mut push = |v: &Value| {
        if let Value::Obj(r) = v {
            out.push(*r);
        }
    };
    match body {
        ObjBody::Str(_) => {}
        ObjBody::Vector(vs) => vs.iter().for_each(&mut push),
        ObjBody::Struct(vs) => vs.iter().for_each(&mut push),
        ObjBody::Boxed(v) => push(v),
        ObjBody::Coroutine(co) => {
            co.stack_copy.iter().for_each(&mut push);
            co.backup.iter().for_each(&mut push);
        }
    }
}
