use std::sync::Arc;

use crate::val::Val;

use super::*;

mod calls;
mod encoding;
mod exceptions;
mod semantics;

/// Run a program's entry function to completion on a fresh VM.
pub(crate) fn exec_main(program: Program) -> anyhow::Result<Val> {
    let mut vm = Vm::new(Arc::new(program));
    let main = vm.spawn_main(&[])?;
    vm.run(main)
}

/// Same, but keep the VM around for heap/echo/global inspection.
pub(crate) fn exec_main_keep(program: Program) -> (Vm, anyhow::Result<Val>) {
    let mut vm = Vm::new(Arc::new(program));
    let out = vm.spawn_main(&[]).and_then(|main| vm.run(main));
    (vm, out)
}
