//! Payloads of heap-resident values.

use std::sync::Arc;

use crate::util::fast_map::FastHashMap;
use crate::val::{RustFunction, TableKey, Val};

/// Runtime object: a nominal type name plus named fields.
#[derive(Debug)]
pub struct ObjectData {
    pub type_name: Arc<str>,
    pub fields: FastHashMap<Arc<str>, Val>,
}

/// A callable value: either an index into the program's function table or a
/// registered native extension function.
#[derive(Debug, Clone, Copy)]
pub enum FuncValue {
    Proto(u16),
    Native(NativeDef),
}

/// Registration record for a native function. Arity is fixed: the VM copies
/// exactly `arity` values out of the callee register window.
#[derive(Clone, Copy)]
pub struct NativeDef {
    pub name: &'static str,
    pub arity: u8,
    pub func: RustFunction,
}

impl std::fmt::Debug for NativeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeDef")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Opaque resource owned by extension code. The core only knows the kind tag
/// and, for coroutine handles, the generation-tagged scheduler handle.
#[derive(Debug, Clone, Copy)]
pub struct ResourceValue {
    pub kind: &'static str,
    pub id: u64,
    pub co: Option<crate::co::CoHandle>,
}

impl ResourceValue {
    pub fn external(kind: &'static str, id: u64) -> Self {
        Self { kind, id, co: None }
    }

    pub fn coroutine(id: u64, co: crate::co::CoHandle) -> Self {
        Self {
            kind: "coroutine",
            id,
            co: Some(co),
        }
    }
}

/// Convenience alias for the table payload.
pub type TableData = FastHashMap<TableKey, Val>;
