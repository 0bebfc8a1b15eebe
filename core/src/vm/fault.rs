//! Runtime fault taxonomy.
//!
//! A fault never aborts the process. It unwinds through the faulting
//! function's catch regions; uncaught, it kills the faulting coroutine and
//! surfaces to whoever resumed it.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Operator applied to incompatible operand types.
    TypeError { op: &'static str, detail: String },
    /// Register stack growth would exceed the configured limit.
    StackOverflow { needed: usize, limit: usize },
    /// Array indexed with a key type other than int or string.
    InvalidKey { key_type: &'static str },
    /// Call of a value that is not a function.
    NotCallable { type_name: &'static str },
    /// Integer division or modulo by zero.
    DivisionByZero,
    UnknownOpcode { byte: u8, pc: usize },
    CodeOutOfBounds { pc: usize },
    BadRegister { slot: usize },
    BadConst { index: u16 },
    BadGlobal { index: u16 },
    BadProto { index: u16 },
    /// A coroutine or heap handle outlived its target.
    StaleHandle,
    /// Promotion found the old generation full even after a full collection.
    HeapExhausted { old_cap: usize },
    /// A native extension function returned an error.
    NativeError { name: &'static str, message: String },
    /// A thrown value crossed the outermost frame of its coroutine.
    Uncaught { rendered: String },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::TypeError { op, detail } => write!(f, "type error in '{op}': {detail}"),
            Fault::StackOverflow { needed, limit } => {
                write!(f, "stack overflow: {needed} slots needed, limit is {limit}")
            }
            Fault::InvalidKey { key_type } => {
                write!(f, "invalid array key type '{key_type}' (expected int or string)")
            }
            Fault::NotCallable { type_name } => write!(f, "value of type '{type_name}' is not callable"),
            Fault::DivisionByZero => write!(f, "integer division by zero"),
            Fault::UnknownOpcode { byte, pc } => write!(f, "unknown opcode {byte:#04x} at pc {pc}"),
            Fault::CodeOutOfBounds { pc } => write!(f, "program counter {pc} outside code"),
            Fault::BadRegister { slot } => write!(f, "register slot {slot} outside the stack"),
            Fault::BadConst { index } => write!(f, "constant index {index} out of range"),
            Fault::BadGlobal { index } => write!(f, "global index {index} out of range"),
            Fault::BadProto { index } => write!(f, "function index {index} out of range"),
            Fault::StaleHandle => write!(f, "handle refers to a reclaimed object"),
            Fault::HeapExhausted { old_cap } => {
                write!(f, "heap exhausted: old generation capacity {old_cap} reached")
            }
            Fault::NativeError { name, message } => write!(f, "native '{name}' failed: {message}"),
            Fault::Uncaught { rendered } => write!(f, "uncaught error: {rendered}"),
        }
    }
}

impl std::error::Error for Fault {}
