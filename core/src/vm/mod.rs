//! Bytecode virtual machine subsystem.
//!
//! Instruction words, program tables, the image container, and the dispatch
//! engine. The compiler that produces programs lives outside this crate;
//! [`ProgramBuilder`] is its emission interface.

mod fault;
mod image;
mod opcode;
mod program;
#[allow(clippy::module_inception)]
mod vm;
mod word;

pub use fault::Fault;
pub use image::{CURRENT_VERSION, ImageFlags, ImageMeta, ProgramImage};
pub use opcode::{EncForm, Opcode};
pub use program::{
    CatchRegion, Const, FIRST_ARG, FuncProto, MIN_STACK_SIZE, Program, ProgramBuilder, SLOT_BASE, SLOT_FUNC,
    SLOT_PC, SLOT_RET,
};
pub use vm::{Exit, Vm, VmConfig, VmCtx, register_native};
pub use word::{enc0, enc_a, enc_abc, enc_ad, enc_e, op_of, pa, pb, pc, pd, pe};

#[cfg(test)]
mod vm_test;
