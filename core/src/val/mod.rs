//! Runtime value model.
//!
//! `Val` is the tagged union every register, table slot, and global holds.
//! Primitive variants are stored inline; the five heap variants carry an
//! arena [`Handle`] into the owning VM instance's heap instead of a raw
//! pointer, so a stale reference can never dereference freed memory.

use std::sync::Arc;

use anyhow::Result;

mod intern;
mod objects;

pub use intern::intern;
pub use objects::{FuncValue, NativeDef, ObjectData, ResourceValue, TableData};

/// Function signature for native extension functions.
///
/// Natives read their arguments from the callee register window (the call
/// plumbing hands them over as a slice) and return their result, which the
/// VM writes into the callee's return slot.
pub type RustFunction = fn(args: &[Val], ctx: &mut crate::vm::VmCtx) -> Result<Val>;

/// Generation-tagged index into a [`crate::gc::Heap`].
///
/// The generation is bumped whenever the slot is reclaimed, so handles held
/// past an object's death simply fail to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Handle {
    #[inline]
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// A runtime value. `PartialEq` on heap variants is handle identity; content
/// equality for strings goes through [`crate::gc::Heap::vals_eq`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Val {
    #[default]
    Nil,
    Int(i64),
    Float(f64),
    Bool(bool),
    /// UTF-8 string object.
    Str(Handle),
    /// The language's array type, backed by a hash map with int/string keys.
    Table(Handle),
    /// Runtime object with a type name and named fields.
    Object(Handle),
    /// Callable: bytecode function or native extension function.
    Func(Handle),
    /// Opaque resource owned by an extension (socket, coroutine handle, ...).
    Resource(Handle),
}

impl Val {
    /// Only `Nil` and `false` are falsy.
    #[inline]
    pub fn truthy(&self) -> bool {
        !matches!(self, Val::Nil | Val::Bool(false))
    }

    /// The heap handle, if this is a heap variant.
    #[inline]
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Val::Str(h) | Val::Table(h) | Val::Object(h) | Val::Func(h) | Val::Resource(h) => Some(*h),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Nil => "nil",
            Val::Int(_) => "int",
            Val::Float(_) => "float",
            Val::Bool(_) => "bool",
            Val::Str(_) => "string",
            Val::Table(_) => "array",
            Val::Object(_) => "object",
            Val::Func(_) => "function",
            Val::Resource(_) => "resource",
        }
    }

    /// Numeric view used by the arithmetic ops: ints promote to float when
    /// mixed with a float operand.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Val::Int(i) => Some(*i as f64),
            Val::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Key type for table (array) values. Anything else used as a key is the
/// `InvalidKey` fault.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    Int(i64),
    Str(Arc<str>),
}

impl TableKey {
    pub fn type_name(&self) -> &'static str {
        match self {
            TableKey::Int(_) => "int",
            TableKey::Str(_) => "string",
        }
    }
}
