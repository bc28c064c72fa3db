//! The execution context: value stack, frame list, variable table, heap and
//! the error/unwind plumbing. Opcode semantics live in [`ops`]; the two
//! execution substrates in [`interp`] and [`threaded`] drive those semantics
//! over the same context.

pub mod coroutine;
pub mod interp;
pub mod ops;
pub mod threaded;

use anyhow::Result;

use crate::heap::{Heap, LeakReport, Obj};
use crate::host::{Host, HostCtx};
use crate::program::Program;
use crate::value::{ObjRef, Value, ValueView};

#[derive(thiserror::Error, Debug)]
pub enum VmError {
    // malformed bytecode: always fatal
    #[error("invalid opcode 0x{opcode:08x} at ip=0x{ip:x}")]
    InvalidOpcode { opcode: u32, ip: u32 },
    #[error("instruction pointer out of range: ip=0x{ip:x}, code length 0x{len:x}")]
    PcOutOfRange { ip: u32, len: u32 },
    #[error("corrupt bytecode: {0}")]
    Corrupt(String),

    // dynamic errors: unwind with a call trace
    #[error("stack overflow (limit={limit})")]
    StackOverflow { limit: usize },
    #[error("call depth exceeded (limit={limit})")]
    CallDepthExceeded { limit: usize },
    #[error("stack underflow")]
    StackUnderflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("{op} not applicable to {operands}")]
    TypeMismatch { op: &'static str, operands: String },
    #[error("index {idx} out of range (length {len})")]
    IndexOutOfRange { idx: i64, len: usize },
    #[error("no field {field} in {type_name}")]
    UnknownField { field: u32, type_name: String },
    #[error("no matching overload for {name}({args})")]
    NoDispatchMatch { name: String, args: String },
    #[error("cannot resume finished coroutine")]
    CoroutineFinished,
    #[error("cannot resume an already-running coroutine")]
    CoroutineActive,
    #[error("yield outside any coroutine")]
    YieldOutsideCoroutine,
    #[error("foreign function {name} failed: {msg}")]
    ForeignCallFailed { name: String, msg: String },
    #[error("dangling heap reference")]
    DanglingRef,
}

pub type VmResult<T> = std::result::Result<T, VmError>;

#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    /// Hard cap on operand stack height; exceeding it is a reported VM error
    /// rather than unbounded growth.
    pub max_stack: usize,
    pub max_call_depth: usize,
    /// Initial operand stack capacity; growth past it is transparent.
    pub initial_stack: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self { max_stack: 1 << 16, max_call_depth: 1 << 10, initial_stack: 256 }
    }
}

/// One call record. The floor is the stack height right before the argument
/// backups; everything above `floor + nparams + nlocals` is temporaries.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub return_ip: u32,
    /// Function table index of the callee.
    pub fun: u32,
    /// Whether the callee address came off the value stack.
    pub indirect: bool,
    pub floor: usize,
    pub nparams: u32,
    pub nlocals: u32,
}

#[derive(Debug, Clone)]
struct ResolvedImport {
    handle: u32,
    arg_count: u8,
}

/// A single program run. Holds no global state: allocator, stack and tables
/// all live here and die with it.
#[derive(Debug)]
pub struct Vm {
    pub(crate) program: Program,
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) vars: Vec<Value>,
    pub(crate) ip: u32,
    /// Innermost running coroutine; the VM owns one reference count per link
    /// of the parent chain hanging off it.
    pub(crate) active_coro: Option<ObjRef>,
    imports: Vec<ResolvedImport>,
    opts: VmOptions,
    pub(crate) halted: bool,
    started: bool,
}

impl Vm {
    pub fn new<H: Host>(program: Program, host: &mut H) -> Result<Self> {
        Self::with_options(program, host, VmOptions::default())
    }

    pub fn with_options<H: Host>(program: Program, host: &mut H, opts: VmOptions) -> Result<Self> {
        use anyhow::Context;
        program.validate()?;
        let mut imports = Vec::with_capacity(program.imports.len());
        for imp in &program.imports {
            let handle = host
                .resolve(&imp.name, imp.arg_count)
                .with_context(|| format!("resolve foreign function {:?}", imp.name))?;
            log::debug!("resolved foreign function {} -> handle {}", imp.name, handle);
            imports.push(ResolvedImport { handle, arg_count: imp.arg_count });
        }
        let vars = vec![Value::Nil; program.var_count()];
        Ok(Self {
            heap: Heap::new(),
            stack: Vec::with_capacity(opts.initial_stack),
            frames: Vec::new(),
            vars,
            ip: 0,
            active_coro: None,
            imports,
            opts,
            halted: false,
            started: false,
            program,
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }

    /// Diagnostic leak sweep over everything the VM can currently reach.
    pub fn leak_report(&mut self) -> Vec<LeakReport> {
        let roots: Vec<Value> = self
            .stack
            .iter()
            .chain(self.vars.iter())
            .copied()
            .chain(self.active_coro.map(Value::Obj))
            .collect();
        self.heap.leak_report(roots)
    }

    pub fn view<'a>(&'a self, v: &Value) -> ValueView<'a> {
        v.view(&self.heap)
    }

    /// Run to completion on the direct-interpretation substrate.
    pub fn run<H: Host>(&mut self, host: &mut H) -> Result<Value> {
        self.begin().map_err(|e| self.fail(e))?;
        while !self.halted {
            if let Err(e) = interp::step(self, host) {
                return Err(self.fail(e));
            }
        }
        self.finish()
    }

    // ---- stack primitives ----

    /// Push an owned value. On overflow the value is released before the
    /// error returns, so the caller never has to.
    pub(crate) fn push(&mut self, v: Value) -> VmResult<()> {
        if self.stack.len() >= self.opts.max_stack {
            self.heap.release_value(v);
            return Err(VmError::StackOverflow { limit: self.opts.max_stack });
        }
        self.stack.push(v);
        Ok(())
    }

    /// Pop, transferring ownership of any reference to the caller.
    pub(crate) fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    pub(crate) fn peek(&self, depth: usize) -> VmResult<Value> {
        let len = self.stack.len();
        if depth >= len {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.stack[len - 1 - depth])
    }

    pub(crate) fn obj(&self, r: ObjRef) -> VmResult<&Obj> {
        self.heap.get(r).ok_or(VmError::DanglingRef)
    }

    pub(crate) fn obj_mut(&mut self, r: ObjRef) -> VmResult<&mut Obj> {
        self.heap.get_mut(r).ok_or(VmError::DanglingRef)
    }

    pub(crate) fn type_name_of(&self, v: &Value) -> String {
        match v {
            Value::Nil => "nil".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Fun(_) => "function".into(),
            Value::Obj(r) => match self.heap.get(*r) {
                Some(o) => self.program.type_name(o.type_idx).to_owned(),
                None => "<dangling>".into(),
            },
        }
    }

    // ---- frame protocol ----

    /// Function-entry prologue: bind the top `nparams` stack slots to the
    /// callee's parameter variables. Each slot is swapped with the variable,
    /// leaving the previous variable value on the stack as the re-entrancy
    /// backup; captured parameters go through the exact same swap so closures
    /// keep observing the shared slot. Declared locals then get backed up the
    /// same way with the slot reset to nil.
    pub(crate) fn enter_fun(&mut self, fun: u32, indirect: bool) -> VmResult<()> {
        if self.frames.len() >= self.opts.max_call_depth {
            return Err(VmError::CallDepthExceeded { limit: self.opts.max_call_depth });
        }
        let def = self
            .program
            .funcs
            .get(fun as usize)
            .ok_or_else(|| VmError::Corrupt(format!("call to unknown function {fun}")))?;
        let (params, locals, entry) = (def.params.clone(), def.locals.clone(), def.entry);

        let nparams = params.len();
        if self.stack.len() < nparams {
            return Err(VmError::Corrupt(format!(
                "call to {} with missing arguments",
                self.program.funcs[fun as usize].name
            )));
        }
        let floor = self.stack.len() - nparams;
        for (i, &vid) in params.iter().enumerate() {
            std::mem::swap(&mut self.stack[floor + i], &mut self.vars[vid as usize]);
        }
        for &vid in &locals {
            let old = std::mem::replace(&mut self.vars[vid as usize], Value::Nil);
            self.push(old)?;
        }

        self.frames.push(Frame {
            return_ip: self.ip,
            fun,
            indirect,
            floor,
            nparams: nparams as u32,
            nlocals: locals.len() as u32,
        });
        self.ip = entry;
        Ok(())
    }

    /// Frame-exit cleanup: release temporaries above the backup area, restore
    /// locals then parameters from their backups (releasing the outgoing
    /// values), and return to the caller. Exiting the bottom frame halts.
    pub(crate) fn exit_frame(&mut self) -> VmResult<()> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| VmError::Corrupt("return without a frame".into()))?;
        let backups = frame.floor + frame.nparams as usize + frame.nlocals as usize;
        while self.stack.len() > backups {
            let v = self.stack.pop().unwrap_or(Value::Nil);
            self.heap.release_value(v);
        }

        let def = &self.program.funcs[frame.fun as usize];
        let (params, locals) = (def.params.clone(), def.locals.clone());
        for &vid in locals.iter().rev() {
            let backup = self.pop()?;
            let out = std::mem::replace(&mut self.vars[vid as usize], backup);
            self.heap.release_value(out);
        }
        for &vid in params.iter().rev() {
            let backup = self.pop()?;
            let out = std::mem::replace(&mut self.vars[vid as usize], backup);
            self.heap.release_value(out);
        }
        debug_assert_eq!(self.stack.len(), frame.floor);

        self.ip = frame.return_ip;
        if self.frames.is_empty() {
            self.halted = true;
        }
        Ok(())
    }

    // ---- foreign calls ----

    pub(crate) fn foreign_call<H: Host>(&mut self, host: &mut H, import: u32) -> VmResult<()> {
        let imp = self
            .imports
            .get(import as usize)
            .cloned()
            .ok_or_else(|| VmError::Corrupt(format!("unknown import {import}")))?;
        let argc = imp.arg_count as usize;
        if self.stack.len() < argc {
            return Err(VmError::StackUnderflow);
        }
        let start = self.stack.len() - argc;
        let args: Vec<Value> = self.stack.split_off(start);

        let name = &self.program.imports[import as usize].name;
        let mut ctx = HostCtx { heap: &mut self.heap, program: &self.program };
        let ret = host.call(imp.handle, &args, &mut ctx);
        for v in args {
            self.heap.release_value(v);
        }
        let ret = ret.map_err(|e| VmError::ForeignCallFailed {
            name: name.clone(),
            msg: format!("{e:#}"),
        })?;
        self.push(ret)
    }

    // ---- run plumbing ----

    pub(crate) fn begin(&mut self) -> VmResult<()> {
        if self.started {
            return Err(VmError::Corrupt("vm has already run".into()));
        }
        self.started = true;
        self.enter_fun(self.program.entry_fun, false)
    }

    pub(crate) fn finish(&mut self) -> Result<Value> {
        let result = self.pop().map_err(|e| self.fail(e))?;
        self.release_run_state();
        Ok(result)
    }

    /// Compose the dynamic-error report (message + call trace), then unwind
    /// every live frame with normal exit cleanup.
    pub(crate) fn fail(&mut self, e: VmError) -> anyhow::Error {
        let trace = self.stack_trace();
        log::debug!("vm error at {}: {e}", self.program.disassemble_at(self.ip));
        self.unwind();
        let err = anyhow::Error::new(e);
        if trace.is_empty() {
            err
        } else {
            err.context(format!("call trace:\n{trace}"))
        }
    }

    /// Innermost-first function names and source locations.
    pub fn stack_trace(&self) -> String {
        let mut out = String::new();
        let mut ip = self.ip;
        for frame in self.frames.iter().rev() {
            let def = &self.program.funcs[frame.fun as usize];
            let loc = match self.program.line_for(ip) {
                Some(e) => format!(
                    "{}:{}",
                    self.program.files.get(e.file as usize).map(String::as_str).unwrap_or("?"),
                    e.line
                ),
                None => format!("ip=0x{ip:x}"),
            };
            let via = if frame.indirect { " (indirect)" } else { "" };
            out.push_str(&format!("  in {}{} at {}\n", def.name, via, loc));
            ip = frame.return_ip;
        }
        out
    }

    fn unwind(&mut self) {
        while !self.frames.is_empty() {
            if self.exit_frame().is_err() {
                break;
            }
        }
        self.halted = true;
        self.release_run_state();
    }

    /// Drop every count the run still holds: leftover temporaries, the
    /// variable table and the active-coroutine chain.
    fn release_run_state(&mut self) {
        while let Some(v) = self.stack.pop() {
            self.heap.release_value(v);
        }
        for i in 0..self.vars.len() {
            let v = std::mem::replace(&mut self.vars[i], Value::Nil);
            self.heap.release_value(v);
        }
        while let Some(r) = self.active_coro.take() {
            self.active_coro = coroutine::take_parent(self, r);
            self.heap.release(r);
        }
    }
}
