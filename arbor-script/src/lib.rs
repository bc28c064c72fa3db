//! Embeddable bytecode execution engine for arbor scripts.
//!
//! A [`Program`] (loaded from its binary form or built with
//! [`ProgramBuilder`]) runs inside a [`Vm`] against a [`Host`] that supplies
//! the foreign functions the script imports. Two execution substrates are
//! provided: direct interpretation via [`Vm::run`] and a pre-translated
//! thunk table via [`ThreadedCode`]; they share all instruction semantics.
//!
//! Memory is managed by manual reference counting on an explicit [`Heap`];
//! a finished run leaves no live objects behind other than the returned
//! result, and [`Vm::leak_report`] can verify that at any point.

pub mod builder;
pub mod heap;
pub mod host;
pub mod opcode;
pub mod program;
pub mod value;
pub mod vm;

pub use builder::ProgramBuilder;
pub use heap::{Heap, LeakReport};
pub use host::{Host, HostCtx, NullHost, RegistryHost};
pub use opcode::{LvalOp, Opcode};
pub use program::{Program, TypeSel, BYTECODE_VERSION};
pub use value::{ObjRef, Value, ValueView};
pub use vm::coroutine::CoroStatus;
pub use vm::threaded::ThreadedCode;
pub use vm::{Vm, VmError, VmOptions};
