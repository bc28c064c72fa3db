//! The tagged value cell.
//!
//! A `Value` is copied freely on the operand stack; ownership semantics live
//! on the heap object it may point to, not on the cell itself. Every `Obj`
//! cell corresponds to exactly one retained reference count unless a slot is
//! explicitly documented as borrowed (e.g. arguments passed to a foreign
//! call, or the parent link of a running coroutine).

use crate::heap::{Heap, ObjBody};

/// Handle into the [`Heap`] object store.
pub type ObjRef = u32;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Int(i64),
    Float(f64),
    /// A first-class function value: index into the function table. Indirect
    /// calls resolve the entry address through the table at call time.
    Fun(u32),
    Obj(ObjRef),
}

impl Value {
    /// `nil`, integer zero and float zero are falsey; everything else is true.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            _ => true,
        }
    }

    pub fn from_bool(b: bool) -> Value {
        Value::Int(b as i64)
    }

    pub fn is_obj(&self) -> bool {
        matches!(self, Value::Obj(_))
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// A borrowed view of a value, resolved against the heap. This is what hosts
/// see; they never touch reference counts through it.
#[derive(Debug, Clone)]
pub enum ValueView<'a> {
    Nil,
    Int(i64),
    Float(f64),
    Fun(u32),
    Str(&'a str),
    Vector(&'a [Value]),
    Struct(&'a [Value]),
    Boxed(Value),
    Coroutine,
    /// The handle no longer points at a live object.
    Dangling,
}

impl Value {
    pub fn view<'a>(&self, heap: &'a Heap) -> ValueView<'a> {
        match self {
            Value::Nil => ValueView::Nil,
            Value::Int(v) => ValueView::Int(*v),
            Value::Float(v) => ValueView::Float(*v),
            Value::Fun(f) => ValueView::Fun(*f),
            Value::Obj(r) => match heap.get(*r).map(|o| &o.body) {
                Some(ObjBody::Str(s)) => ValueView::Str(s),
                Some(ObjBody::Vector(v)) => ValueView::Vector(v),
                Some(ObjBody::Struct(v)) => ValueView::Struct(v),
                Some(ObjBody::Boxed(v)) => ValueView::Boxed(*v),
                Some(ObjBody::Coroutine(_)) => ValueView::Coroutine,
                None => ValueView::Dangling,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::Float(0.0).truthy());
        assert!(Value::Int(-1).truthy());
        assert!(Value::Float(0.5).truthy());
        assert!(Value::Fun(0).truthy());
        assert!(Value::Obj(3).truthy());
    }
}
