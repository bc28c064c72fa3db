//! Host embedding surface.
//!
//! The program's import table names foreign functions with declared arg
//! counts; [`Host::resolve`] turns each entry into an opaque handle once, at
//! load time, and `foreign_call` dispatches through [`Host::call`]
//! synchronously. Argument values are borrowed for the duration of the call;
//! the returned value must be owned by the host (freshly allocated through
//! [`HostCtx`] or retained explicitly).

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::heap::{Heap, ObjBody};
use crate::program::{Program, TYPE_STR};
use crate::value::{Value, ValueView};

pub trait Host {
    /// Resolve an imported foreign function (name + declared arg count) into
    /// a host handle. Failing here fails the whole load.
    fn resolve(&mut self, name: &str, arg_count: u8) -> Result<u32>;

    /// Call a previously resolved foreign function.
    fn call(&mut self, handle: u32, args: &[Value], ctx: &mut HostCtx<'_>) -> Result<Value>;
}

/// View/allocate helpers handed to [`Host::call`].
pub struct HostCtx<'a> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) program: &'a Program,
}

impl<'a> HostCtx<'a> {
    pub fn view<'v>(&'v self, v: &Value) -> ValueView<'v> {
        v.view(self.heap)
    }

    /// Allocate a VM string and return an owned reference to it.
    pub fn alloc_str(&mut self, s: impl Into<String>) -> Value {
        Value::Obj(self.heap.alloc(TYPE_STR, ObjBody::Str(s.into())))
    }

    /// Retain a value the host wants to hand back as its result.
    pub fn retain(&mut self, v: Value) -> Value {
        self.heap.retain_value(v)
    }

    pub fn type_name(&self, idx: u32) -> &str {
        self.program.type_name(idx)
    }
}

/// Host that resolves everything and answers every call with `nil`. Useful
/// for programs with no imports and for tests.
#[derive(Debug, Default)]
pub struct NullHost;

impl Host for NullHost {
    fn resolve(&mut self, _name: &str, _arg_count: u8) -> Result<u32> {
        Ok(0)
    }

    fn call(&mut self, _handle: u32, _args: &[Value], _ctx: &mut HostCtx<'_>) -> Result<Value> {
        Ok(Value::Nil)
    }
}

type HostFn = Box<dyn FnMut(&[Value], &mut HostCtx<'_>) -> Result<Value>>;

/// A simple name-keyed registry host, enough for tests and small embeddings.
/// A full host application will usually implement [`Host`] directly on its
/// own state instead.
#[derive(Default)]
pub struct RegistryHost {
    by_name: HashMap<String, (u8, u32)>,
    fns: Vec<HostFn>,
}

impl RegistryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, arg_count: u8, f: F)
    where
        F: FnMut(&[Value], &mut HostCtx<'_>) -> Result<Value> + 'static,
    {
        let handle = self.fns.len() as u32;
        self.fns.push(Box::new(f));
        self.by_name.insert(name.into(), (arg_count, handle));
    }
}

impl Host for RegistryHost {
    fn resolve(&mut self, name: &str, arg_count: u8) -> Result<u32> {
        let (argc, handle) = *self
            .by_name
            .get(name)
            .ok_or_else(|| anyhow!("unresolved foreign function: {name}"))?;
        if argc != arg_count {
            return Err(anyhow!(
                "foreign function {name} declared with {arg_count} argument(s), registered with {argc}"
            ));
        }
        Ok(handle)
    }

    fn call(&mut self, handle: u32, args: &[Value], ctx: &mut HostCtx<'_>) -> Result<Value> {
        let f = self
            .fns
            .get_mut(handle as usize)
            .ok_or_else(|| anyhow!("unknown foreign handle {handle}"))?;
        f(args, ctx)
    }
}
