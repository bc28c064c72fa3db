//! In-process program emission.
//!
//! The real compiler is an external producer; this builder exists for tests,
//! tooling and code generators that want to construct a [`Program`] without
//! going through the binary format. It performs the same structural checks as
//! the loader.

use anyhow::{bail, Result};

use crate::opcode::{LvalOp, Opcode};
use crate::program::{
    FuncDef, ImportEntry, LineEntry, Program, TypeDef, TypeKind, TypeSel,
};

/// A forward-patchable operand cell, returned by [`ProgramBuilder::emit_jump`].
#[derive(Debug, Clone, Copy)]
#[must_use = "an unpatched jump targets cell 0"]
pub struct Label(usize);

#[derive(Debug, Default)]
pub struct ProgramBuilder {
    code: Vec<u32>,
    floats: Vec<f64>,
    strings: Vec<String>,
    files: Vec<String>,
    funcs: Vec<FuncDef>,
    extra_types: Vec<TypeDef>,
    lines: Vec<LineEntry>,
    captured: Vec<bool>,
    imports: Vec<ImportEntry>,
    entry_fun: Option<u32>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh variable id.
    pub fn var(&mut self) -> u32 {
        self.captured.push(false);
        (self.captured.len() - 1) as u32
    }

    /// Allocate a variable flagged as captured by a closure or coroutine.
    pub fn captured_var(&mut self) -> u32 {
        self.captured.push(true);
        (self.captured.len() - 1) as u32
    }

    pub fn float_const(&mut self, f: f64) -> u32 {
        self.floats.push(f);
        (self.floats.len() - 1) as u32
    }

    pub fn str_const(&mut self, s: impl Into<String>) -> u32 {
        self.strings.push(s.into());
        (self.strings.len() - 1) as u32
    }

    pub fn file(&mut self, name: impl Into<String>) -> u16 {
        self.files.push(name.into());
        (self.files.len() - 1) as u16
    }

    pub fn import(&mut self, name: impl Into<String>, arg_count: u8) -> u32 {
        self.imports.push(ImportEntry { name: name.into(), arg_count });
        (self.imports.len() - 1) as u32
    }

    pub fn struct_type(&mut self, name: impl Into<String>, fields: &[&str]) -> u32 {
        self.extra_types.push(TypeDef {
            name: name.into(),
            kind: TypeKind::Struct { fields: fields.iter().map(|s| s.to_string()).collect() },
        });
        (TypeDef::builtins().len() + self.extra_types.len() - 1) as u32
    }

    pub fn vector_type(&mut self, name: impl Into<String>) -> u32 {
        self.extra_types.push(TypeDef { name: name.into(), kind: TypeKind::Vector });
        (TypeDef::builtins().len() + self.extra_types.len() - 1) as u32
    }

    /// Declare a function without placing its body, so it can be called
    /// before [`Self::define_fun`] positions the entry.
    pub fn declare_fun(
        &mut self,
        name: impl Into<String>,
        params: &[(u32, TypeSel)],
        locals: &[u32],
    ) -> u32 {
        self.funcs.push(FuncDef {
            name: name.into(),
            entry: u32::MAX,
            params: params.iter().map(|(v, _)| *v).collect(),
            param_types: params.iter().map(|(_, t)| *t).collect(),
            locals: locals.to_vec(),
        });
        (self.funcs.len() - 1) as u32
    }

    /// Set the entry of a declared function to the current emission point.
    pub fn define_fun(&mut self, fun: u32) {
        self.funcs[fun as usize].entry = self.code.len() as u32;
    }

    pub fn set_entry(&mut self, fun: u32) {
        self.entry_fun = Some(fun);
    }

    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn emit(&mut self, op: Opcode, operands: &[u32]) -> u32 {
        let at = self.here();
        self.code.push(op as u32);
        self.code.extend_from_slice(operands);
        at
    }

    /// Emit a jump whose target is patched later.
    pub fn emit_jump(&mut self, op: Opcode) -> Label {
        self.code.push(op as u32);
        self.code.push(0);
        Label(self.code.len() - 1)
    }

    /// Point `label` at the current emission point.
    pub fn patch(&mut self, label: Label) {
        self.code[label.0] = self.code.len() as u32;
    }

    pub fn emit_lval_var(&mut self, var: u32, op: LvalOp) -> u32 {
        self.emit(Opcode::LvalVar, &[var, op as u32])
    }

    pub fn emit_lval_idx(&mut self, op: LvalOp) -> u32 {
        self.emit(Opcode::LvalIdx, &[op as u32])
    }

    pub fn emit_lval_field(&mut self, field: u32, op: LvalOp) -> u32 {
        self.emit(Opcode::LvalField, &[field, op as u32])
    }

    /// Emit `co_create`; returns labels for the body entry and the
    /// continuation after the body.
    pub fn emit_co_create(&mut self, captures: &[u32]) -> (Label, Label) {
        self.code.push(Opcode::CoCreate as u32);
        self.code.push(0);
        let body = Label(self.code.len() - 1);
        self.code.push(0);
        let skip = Label(self.code.len() - 1);
        self.code.push(captures.len() as u32);
        self.code.extend_from_slice(captures);
        (body, skip)
    }

    /// Record a source position for instructions emitted from here on.
    pub fn line(&mut self, file: u16, line: u32) {
        self.lines.push(LineEntry { ip: self.here(), file, line });
    }

    pub fn finish(self) -> Result<Program> {
        let Some(entry_fun) = self.entry_fun else {
            bail!("no entry function set");
        };
        for f in &self.funcs {
            if f.entry == u32::MAX {
                bail!("function {} declared but never defined", f.name);
            }
        }
        let mut types = TypeDef::builtins();
        types.extend(self.extra_types);
        let prog = Program {
            code: self.code,
            entry_fun,
            floats: self.floats,
            strings: self.strings,
            files: self.files,
            funcs: self.funcs,
            types,
            lines: self.lines,
            captured: self.captured,
            imports: self.imports,
        };
        prog.validate()?;
        Ok(prog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_bytes() {
        let mut b = ProgramBuilder::new();
        let file = b.file("demo.ab");
        let x = b.var();
        let main = b.declare_fun("main", &[], &[x]);
        b.define_fun(main);
        b.line(file, 1);
        b.emit(Opcode::PushInt, &[41]);
        b.emit_lval_var(x, LvalOp::Write);
        b.line(file, 2);
        b.emit(Opcode::PushVar, &[x]);
        b.emit(Opcode::PushInt, &[1]);
        b.emit(Opcode::Add, &[]);
        b.emit(Opcode::RetV, &[]);
        b.set_entry(main);
        let prog = b.finish().unwrap();

        let bytes = prog.to_bytes();
        let back = Program::parse(&bytes).unwrap();
        assert_eq!(back.code, prog.code);
        assert_eq!(back.funcs.len(), 1);
        assert_eq!(back.funcs[0].name, "main");
        assert_eq!(back.line_for(0).map(|e| e.line), Some(1));
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let mut b = ProgramBuilder::new();
        let main = b.declare_fun("main", &[], &[]);
        b.define_fun(main);
        b.emit(Opcode::PushNil, &[]);
        b.emit(Opcode::RetV, &[]);
        b.set_entry(main);
        let mut bytes = b.finish().unwrap().to_bytes();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        let err = Program::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("version mismatch"), "{err:#}");
    }

    #[test]
    fn undefined_function_rejected() {
        let mut b = ProgramBuilder::new();
        let main = b.declare_fun("main", &[], &[]);
        b.set_entry(main);
        assert!(b.finish().is_err());
    }
}
