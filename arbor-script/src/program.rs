//! Compiler-produced, read-only program container: the instruction stream
//! plus its metadata tables, with a binary round-trip format shared with
//! external producers and backends.
//!
//! Layout (little-endian):
//! - u32 magic, u32 version (hard-checked, no compatibility mode)
//! - u32 entry function index
//! - code section: u32 count, count u32 cells
//! - float pool, string pool, file table
//! - function table, type table, line table
//! - capture flags, import table

use std::io::Cursor;

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::opcode::Opcode;

pub const BYTECODE_MAGIC: u32 = u32::from_le_bytes(*b"arbs");
pub const BYTECODE_VERSION: u32 = 3;

/// Builtin type-table slots; always present before compiler-declared types.
pub const TYPE_STR: u32 = 0;
pub const TYPE_BOX: u32 = 1;
pub const TYPE_CORO: u32 = 2;

/// Runtime type selector of a declared parameter, used by multi-dispatch.
/// `Obj` compares against the exact type-table entry of the live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSel {
    Any,
    Int,
    Float,
    Obj(u32),
}

#[derive(Debug, Clone)]
pub struct FuncDef {
    pub name: String,
    /// Entry cell address.
    pub entry: u32,
    /// Variable ids bound to arguments, in push order.
    pub params: Vec<u32>,
    pub param_types: Vec<TypeSel>,
    /// Variable ids of declared locals, backed up at frame entry.
    pub locals: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Str,
    Box,
    Coroutine,
    Vector,
    Struct { fields: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeKind,
}

impl TypeDef {
    pub fn builtins() -> Vec<TypeDef> {
        vec![
            TypeDef { name: "str".into(), kind: TypeKind::Str },
            TypeDef { name: "box".into(), kind: TypeKind::Box },
            TypeDef { name: "coroutine".into(), kind: TypeKind::Coroutine },
        ]
    }
}

/// One source-position record; the table is sorted ascending by `ip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub ip: u32,
    pub file: u16,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub name: String,
    pub arg_count: u8,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub code: Vec<u32>,
    pub entry_fun: u32,
    pub floats: Vec<f64>,
    pub strings: Vec<String>,
    pub files: Vec<String>,
    pub funcs: Vec<FuncDef>,
    pub types: Vec<TypeDef>,
    pub lines: Vec<LineEntry>,
    /// One flag per variable id: whether any closure or coroutine captures it.
    pub captured: Vec<bool>,
    pub imports: Vec<ImportEntry>,
}

impl Program {
    pub fn var_count(&self) -> usize {
        self.captured.len()
    }

    /// Source position of the instruction at `ip`: the last table entry at or
    /// before it (binary search).
    pub fn line_for(&self, ip: u32) -> Option<LineEntry> {
        let n = self.lines.partition_point(|e| e.ip <= ip);
        if n == 0 {
            None
        } else {
            Some(self.lines[n - 1])
        }
    }

    pub fn type_name(&self, idx: u32) -> &str {
        self.types.get(idx as usize).map(|t| t.name.as_str()).unwrap_or("<bad type>")
    }

    /// Render the instruction at cell `ip` for logs and error messages.
    pub fn disassemble_at(&self, ip: u32) -> String {
        let at = ip as usize;
        let Some(&cell) = self.code.get(at) else {
            return format!("0x{ip:x}: <end of code>");
        };
        let Some(op) = Opcode::from_repr(cell) else {
            return format!("0x{ip:x}: <bad opcode 0x{cell:x}>");
        };
        let n = op.operand_count(&self.code, at).unwrap_or(0) as usize;
        let mut out = format!("0x{ip:x}: {}", op.mnemonic());
        for i in 0..n {
            match self.code.get(at + 1 + i) {
                Some(v) => out.push_str(&format!(" {v}")),
                None => out.push_str(" <truncated>"),
            }
        }
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Vec::new();
        // infallible: writing to a Vec
        let _ = self.write(&mut w);
        w
    }

    fn write(&self, w: &mut Vec<u8>) -> std::io::Result<()> {
        w.write_u32::<LittleEndian>(BYTECODE_MAGIC)?;
        w.write_u32::<LittleEndian>(BYTECODE_VERSION)?;
        w.write_u32::<LittleEndian>(self.entry_fun)?;

        w.write_u32::<LittleEndian>(self.code.len() as u32)?;
        for &c in &self.code {
            w.write_u32::<LittleEndian>(c)?;
        }

        w.write_u32::<LittleEndian>(self.floats.len() as u32)?;
        for &f in &self.floats {
            w.write_f64::<LittleEndian>(f)?;
        }

        write_str_table(w, &self.strings)?;
        write_str_table(w, &self.files)?;

        w.write_u32::<LittleEndian>(self.funcs.len() as u32)?;
        for f in &self.funcs {
            write_str(w, &f.name)?;
            w.write_u32::<LittleEndian>(f.entry)?;
            w.write_u32::<LittleEndian>(f.params.len() as u32)?;
            for (i, &p) in f.params.iter().enumerate() {
                w.write_u32::<LittleEndian>(p)?;
                let (tag, arg) = match f.param_types[i] {
                    TypeSel::Any => (0u8, 0),
                    TypeSel::Int => (1, 0),
                    TypeSel::Float => (2, 0),
                    TypeSel::Obj(t) => (3, t),
                };
                w.write_u8(tag)?;
                w.write_u32::<LittleEndian>(arg)?;
            }
            w.write_u32::<LittleEndian>(f.locals.len() as u32)?;
            for &l in &f.locals {
                w.write_u32::<LittleEndian>(l)?;
            }
        }

        w.write_u32::<LittleEndian>(self.types.len() as u32)?;
        for t in &self.types {
            write_str(w, &t.name)?;
            match &t.kind {
                TypeKind::Str => w.write_u8(0)?,
                TypeKind::Box => w.write_u8(1)?,
                TypeKind::Coroutine => w.write_u8(2)?,
                TypeKind::Vector => w.write_u8(3)?,
                TypeKind::Struct { fields } => {
                    w.write_u8(4)?;
                    write_str_table(w, fields)?;
                }
            }
        }

        w.write_u32::<LittleEndian>(self.lines.len() as u32)?;
        for e in &self.lines {
            w.write_u32::<LittleEndian>(e.ip)?;
            w.write_u16::<LittleEndian>(e.file)?;
            w.write_u32::<LittleEndian>(e.line)?;
        }

        w.write_u32::<LittleEndian>(self.captured.len() as u32)?;
        for &c in &self.captured {
            w.write_u8(c as u8)?;
        }

        w.write_u32::<LittleEndian>(self.imports.len() as u32)?;
        for imp in &self.imports {
            write_str(w, &imp.name)?;
            w.write_u8(imp.arg_count)?;
        }
        Ok(())
    }

    /// Parse a serialized program. A version mismatch is a hard load failure.
    pub fn parse(bytes: &[u8]) -> Result<Program> {
        let mut r = Cursor::new(bytes);

        let magic = r.read_u32::<LittleEndian>().context("read magic")?;
        if magic != BYTECODE_MAGIC {
            bail!("not an arbor-script program (magic 0x{magic:08x})");
        }
        let version = r.read_u32::<LittleEndian>().context("read version")?;
        if version != BYTECODE_VERSION {
            bail!("bytecode version mismatch: file has {version}, engine expects {BYTECODE_VERSION}");
        }
        let entry_fun = r.read_u32::<LittleEndian>().context("read entry")?;

        let ncode = r.read_u32::<LittleEndian>().context("read code len")? as usize;
        let mut code = Vec::with_capacity(ncode.min(1 << 20));
        for _ in 0..ncode {
            code.push(r.read_u32::<LittleEndian>().context("read code cell")?);
        }

        let nfloats = r.read_u32::<LittleEndian>().context("read float pool len")? as usize;
        let mut floats = Vec::with_capacity(nfloats.min(1 << 16));
        for _ in 0..nfloats {
            floats.push(r.read_f64::<LittleEndian>().context("read float const")?);
        }

        let strings = read_str_table(&mut r).context("read string pool")?;
        let files = read_str_table(&mut r).context("read file table")?;

        let nfuncs = r.read_u32::<LittleEndian>().context("read function count")? as usize;
        let mut funcs = Vec::with_capacity(nfuncs.min(1 << 16));
        for _ in 0..nfuncs {
            let name = read_str(&mut r).context("read function name")?;
            let entry = r.read_u32::<LittleEndian>()?;
            let nparams = r.read_u32::<LittleEndian>()? as usize;
            let mut params = Vec::with_capacity(nparams.min(256));
            let mut param_types = Vec::with_capacity(nparams.min(256));
            for _ in 0..nparams {
                params.push(r.read_u32::<LittleEndian>()?);
                let tag = r.read_u8()?;
                let arg = r.read_u32::<LittleEndian>()?;
                param_types.push(match tag {
                    0 => TypeSel::Any,
                    1 => TypeSel::Int,
                    2 => TypeSel::Float,
                    3 => TypeSel::Obj(arg),
                    _ => bail!("bad type selector tag {tag} in function {name}"),
                });
            }
            let nlocals = r.read_u32::<LittleEndian>()? as usize;
            let mut locals = Vec::with_capacity(nlocals.min(256));
            for _ in 0..nlocals {
                locals.push(r.read_u32::<LittleEndian>()?);
            }
            funcs.push(FuncDef { name, entry, params, param_types, locals });
        }

        let ntypes = r.read_u32::<LittleEndian>().context("read type count")? as usize;
        let mut types = Vec::with_capacity(ntypes.min(1 << 16));
        for _ in 0..ntypes {
            let name = read_str(&mut r).context("read type name")?;
            let kind = match r.read_u8()? {
                0 => TypeKind::Str,
                1 => TypeKind::Box,
                2 => TypeKind::Coroutine,
                3 => TypeKind::Vector,
                4 => TypeKind::Struct { fields: read_str_table(&mut r)? },
                t => bail!("bad type kind tag {t} for type {name}"),
            };
            types.push(TypeDef { name, kind });
        }

        let nlines = r.read_u32::<LittleEndian>().context("read line count")? as usize;
        let mut lines = Vec::with_capacity(nlines.min(1 << 20));
        for _ in 0..nlines {
            let ip = r.read_u32::<LittleEndian>()?;
            let file = r.read_u16::<LittleEndian>()?;
            let line = r.read_u32::<LittleEndian>()?;
            lines.push(LineEntry { ip, file, line });
        }

        let nvars = r.read_u32::<LittleEndian>().context("read var count")? as usize;
        let mut captured = Vec::with_capacity(nvars.min(1 << 20));
        for _ in 0..nvars {
            captured.push(r.read_u8()? != 0);
        }

        let nimports = r.read_u32::<LittleEndian>().context("read import count")? as usize;
        let mut imports = Vec::with_capacity(nimports.min(1 << 16));
        for _ in 0..nimports {
            let name = read_str(&mut r).context("read import name")?;
            let arg_count = r.read_u8()?;
            imports.push(ImportEntry { name, arg_count });
        }

        let prog = Program {
            code,
            entry_fun,
            floats,
            strings,
            files,
            funcs,
            types,
            lines,
            captured,
            imports,
        };
        prog.validate()?;
        Ok(prog)
    }

    /// Structural checks shared by the loader and the builder.
    pub fn validate(&self) -> Result<()> {
        if self.entry_fun as usize >= self.funcs.len() {
            bail!("entry function {} out of range", self.entry_fun);
        }
        if self.types.len() < TypeDef::builtins().len() {
            bail!("type table is missing the builtin entries");
        }
        for f in &self.funcs {
            if f.entry as usize >= self.code.len() {
                bail!("function {} entry 0x{:x} out of range", f.name, f.entry);
            }
            if f.params.len() != f.param_types.len() {
                bail!("function {} has inconsistent parameter tables", f.name);
            }
            for &v in f.params.iter().chain(&f.locals) {
                if v as usize >= self.captured.len() {
                    bail!("function {} references unknown variable {v}", f.name);
                }
            }
        }
        if !self.lines.windows(2).all(|w| w[0].ip <= w[1].ip) {
            bail!("line table is not sorted by instruction offset");
        }
        Ok(())
    }
}

fn write_str(w: &mut Vec<u8>, s: &str) -> std::io::Result<()> {
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_str_table(w: &mut Vec<u8>, table: &[String]) -> std::io::Result<()> {
    w.write_u32::<LittleEndian>(table.len() as u32)?;
    for s in table {
        write_str(w, s)?;
    }
    Ok(())
}

fn read_str(r: &mut Cursor<&[u8]>) -> Result<String> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let start = r.position() as usize;
    let bytes = r.get_ref();
    if start + len > bytes.len() {
        bail!("string of length {len} overruns the buffer");
    }
    let s = std::str::from_utf8(&bytes[start..start + len])
        .context("non-utf8 string")?
        .to_owned();
    r.set_position((start + len) as u64);
    Ok(s)
}

fn read_str_table(r: &mut Cursor<&[u8]>) -> Result<Vec<String>> {
    let n = r.read_u32::<LittleEndian>()? as usize;
    let mut out = Vec::with_capacity(n.min(1 << 16));
    for _ in 0..n {
        out.push(read_str(r)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_lookup_is_last_at_or_before() {
        let prog = Program {
            code: vec![0; 32],
            entry_fun: 0,
            floats: vec![],
            strings: vec![],
            files: vec!["a.ab".into()],
            funcs: vec![FuncDef {
                name: "main".into(),
                entry: 0,
                params: vec![],
                param_types: vec![],
                locals: vec![],
            }],
            types: TypeDef::builtins(),
            lines: vec![
                LineEntry { ip: 0, file: 0, line: 1 },
                LineEntry { ip: 5, file: 0, line: 2 },
                LineEntry { ip: 9, file: 0, line: 4 },
            ],
            captured: vec![],
            imports: vec![],
        };
        assert_eq!(prog.line_for(0).map(|e| e.line), Some(1));
        assert_eq!(prog.line_for(4).map(|e| e.line), Some(1));
        assert_eq!(prog.line_for(5).map(|e| e.line), Some(2));
        assert_eq!(prog.line_for(100).map(|e| e.line), Some(4));
    }
}
