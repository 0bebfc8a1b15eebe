//! Dispatch loop, register file, and call-stack management.
//!
//! One `Vm` owns one heap, one scheduler, and one global table; several VM
//! instances may run on separate OS threads sharing nothing but the
//! `Arc<Program>` (code and constant descriptors). The dispatch loop reads
//! one 32-bit word per step, mutates the current coroutine's register
//! window, and leans on [`Heap::store`] for every register write so the
//! reference counts stay exact.

use std::sync::Arc;

use anyhow::{Result, bail};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, warn};

use crate::co::{CoHandle, CoStatus, SchedEvent, Scheduler};
use crate::gc::{Heap, HeapConfig, HeapData, HeapStats, Roots};
use crate::rt::TimerHandle;
use crate::util::fast_map::{FastHashMap, fast_hash_map_new};
use crate::val::{FuncValue, NativeDef, ResourceValue, RustFunction, TableKey, Val, intern};

use super::fault::Fault;
use super::opcode::Opcode;
use super::program::{FIRST_ARG, Program, SLOT_BASE, SLOT_FUNC, SLOT_PC, SLOT_RET};
use super::word::{op_of, pa, pb, pc, pd, pe};

const TRACE_TARGET: &str = "rill::vm";

/// Process-wide native-function registry. Natives are registered once (by
/// the stdlib or the host) and looked up by `Const::Native` materialization;
/// the registry is immutable from the bytecode's point of view.
static NATIVES: Lazy<DashMap<&'static str, NativeDef>> = Lazy::new(DashMap::new);

pub fn register_native(name: &'static str, arity: u8, func: RustFunction) {
    NATIVES.insert(name, NativeDef { name, arity, func });
}

pub(crate) fn lookup_native(name: &str) -> Option<NativeDef> {
    NATIVES.get(name).map(|e| *e.value())
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VmConfig {
    /// Hard cap on one coroutine's register stack; growth past it is the
    /// StackOverflow fault.
    pub max_stack_slots: usize,
    pub heap: HeapConfig,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_stack_slots: 64 * 1024,
            heap: HeapConfig::default(),
        }
    }
}

/// Requested by a native through [`VmCtx`]; honored by the dispatch loop
/// after the native returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Switch {
    Yield,
    Suspend,
}

/// Why a coroutine stopped executing.
#[derive(Debug)]
pub enum Exit {
    Finished,
    Yielded,
    Suspended,
    Died(Fault),
}

enum Step {
    Continue,
    Finished,
}

enum Callee {
    Proto { index: u16, entry: usize, stack_size: usize, nparams: usize },
    Native(NativeDef),
}

pub struct Vm {
    program: Arc<Program>,
    pub(crate) heap: Heap,
    pub(crate) sched: Scheduler,
    globals: Vec<Val>,
    /// Per-instance materialized constants, indexed like the program's table.
    consts: Vec<Option<Val>>,
    /// Return values of finished coroutines, keyed by coroutine id.
    finished: FastHashMap<u64, Val>,
    echo: Vec<String>,
    pending: Option<Switch>,
    timer: Option<TimerHandle>,
    /// Raw snapshot of the most recently finished coroutine's registers.
    /// Handles in it may be stale; they resolve safely or not at all.
    last_frame: Vec<Val>,
    cfg: VmConfig,
}

impl Vm {
    pub fn new(program: Arc<Program>) -> Self {
        Self::with_config(program, VmConfig::default())
    }

    pub fn with_config(program: Arc<Program>, cfg: VmConfig) -> Self {
        let globals = vec![Val::Nil; program.globals_len()];
        let consts = vec![None; program.consts.len()];
        Self {
            heap: Heap::new(cfg.heap.clone()),
            sched: Scheduler::new(),
            globals,
            consts,
            finished: fast_hash_map_new(),
            echo: Vec::new(),
            pending: None,
            timer: None,
            last_frame: Vec::new(),
            cfg,
            program,
        }
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Subscribe to scheduler transitions (yield/suspend/died).
    pub fn event_stream(&mut self) -> UnboundedReceiver<SchedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sched.set_event_sink(tx);
        rx
    }

    pub fn set_timer(&mut self, timer: TimerHandle) {
        self.timer = Some(timer);
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub fn render(&self, v: Val) -> String {
        self.heap.render(v)
    }

    pub fn take_echo(&mut self) -> Vec<String> {
        std::mem::take(&mut self.echo)
    }

    pub fn co_status(&self, h: CoHandle) -> Option<CoStatus> {
        self.sched.get(h).map(|c| c.status)
    }

    pub fn co_id(&self, h: CoHandle) -> Option<u64> {
        self.sched.get(h).map(|c| c.id)
    }

    pub fn ready_len(&self) -> usize {
        self.sched.ready_len()
    }

    pub fn suspended_len(&self) -> usize {
        self.sched.suspended_len()
    }

    pub fn finished_value(&self, id: u64) -> Option<Val> {
        self.finished.get(&id).copied()
    }

    pub fn global(&self, index: u16) -> Option<Val> {
        self.globals.get(index as usize).copied()
    }

    /// Registers of the most recently finished coroutine (diagnostics).
    pub fn last_frame(&self) -> &[Val] {
        &self.last_frame
    }

    /// Register `r` of a live coroutine's current frame.
    pub fn peek_reg(&self, h: CoHandle, r: u8) -> Option<Val> {
        let co = self.sched.get(h)?;
        co.stack.get(co.base + r as usize).copied()
    }

    // ---- lifecycle ------------------------------------------------------

    /// Create a coroutine running the given function, seed its frame 0, and
    /// queue it READY.
    pub fn spawn(&mut self, proto_index: u16, args: &[Val]) -> Result<CoHandle> {
        let (entry, stack_size, nparams) = {
            let proto = self.program.proto(proto_index)?;
            (proto.entry as usize, proto.stack_size as usize, proto.nparams as usize)
        };
        if stack_size > self.cfg.max_stack_slots {
            return Err(Fault::StackOverflow {
                needed: stack_size,
                limit: self.cfg.max_stack_slots,
            }
            .into());
        }
        let h = self.sched.create(stack_size, None);
        let func = self.alloc_func(FuncValue::Proto(proto_index))?;
        self.set_abs(h, SLOT_FUNC, func)?;
        for (i, v) in args.iter().take(nparams).enumerate() {
            self.set_abs(h, FIRST_ARG + i, *v)?;
        }
        if let Some(co) = self.sched.get_mut(h) {
            co.pc = entry;
            co.base = 0;
        }
        Ok(h)
    }

    /// Spawn the program's entry function.
    pub fn spawn_main(&mut self, args: &[Val]) -> Result<CoHandle> {
        self.spawn(self.program.entry_proto, args)
    }

    /// Drain the ready queue once, FIFO. Coroutines that die with a fault
    /// are reported back; execution of the others continues regardless.
    pub fn run_pass(&mut self) -> Vec<(u64, Fault)> {
        let mut deaths = Vec::new();
        while let Some(h) = self.sched.pop_ready() {
            let id = self.co(h).id;
            self.sched.set_running(h);
            match self.run_coroutine(h) {
                Exit::Died(fault) => {
                    debug!(target: TRACE_TARGET, co = id, %fault, "coroutine died");
                    deaths.push((id, fault));
                }
                Exit::Finished => {
                    self.sched.clear_current();
                }
                Exit::Yielded | Exit::Suspended => {}
            }
        }
        deaths
    }

    /// Run until the ready queue drains. The main coroutine's fault becomes
    /// the error; sibling faults are logged and swallowed.
    pub fn run(&mut self, main: CoHandle) -> Result<Val> {
        let main_id = self.co_id(main).ok_or(Fault::StaleHandle)?;
        for (id, fault) in self.run_pass() {
            if id == main_id {
                return Err(fault.into());
            }
            warn!(target: TRACE_TARGET, co = id, %fault, "coroutine terminated by fault");
        }
        if let Some(v) = self.finished_value(main_id) {
            return Ok(v);
        }
        bail!(
            "main coroutine blocked: {} suspended, {} ready",
            self.sched.suspended_len(),
            self.sched.ready_len()
        )
    }

    /// External entry point for the event-loop collaborator: unpark one
    /// coroutine and run it until it stops. Stale handles fail safely.
    pub fn resume(&mut self, h: CoHandle) -> Result<Exit, Fault> {
        self.sched.resume_target(h)?;
        self.sched.set_running(h);
        Ok(self.run_coroutine(h))
    }

    // ---- coroutine execution -------------------------------------------

    fn run_coroutine(&mut self, h: CoHandle) -> Exit {
        loop {
            match self.step(h) {
                Ok(Step::Continue) => {
                    if let Some(switch) = self.pending.take() {
                        return match switch {
                            Switch::Yield => {
                                self.sched.yield_current();
                                Exit::Yielded
                            }
                            Switch::Suspend => {
                                self.sched.suspend_current();
                                Exit::Suspended
                            }
                        };
                    }
                }
                Ok(Step::Finished) => {
                    self.finish(h);
                    return Exit::Finished;
                }
                Err(fault) => {
                    let fatal = matches!(
                        fault,
                        Fault::StackOverflow { .. } | Fault::HeapExhausted { .. } | Fault::Uncaught { .. }
                    );
                    if fatal {
                        self.kill(h);
                        return Exit::Died(fault);
                    }
                    match self.unwind_fault(h, &fault) {
                        Ok(()) => continue,
                        Err(uncaught) => {
                            self.kill(h);
                            return Exit::Died(uncaught);
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self, h: CoHandle) {
        let (id, ret, snapshot) = {
            let co = self.co(h);
            (co.id, co.stack.get(SLOT_RET).copied().unwrap_or(Val::Nil), co.stack.clone())
        };
        // Pin the return value before the stack's references go away.
        self.heap.ref_add(ret);
        self.last_frame = snapshot;
        self.kill(h);
        if let Some(old) = self.finished.insert(id, ret) {
            self.heap.ref_del(old);
        }
    }

    fn kill(&mut self, h: CoHandle) {
        let stack = self.sched.kill(h);
        for v in stack {
            self.heap.ref_del(v);
        }
    }

    // ---- register access ------------------------------------------------

    #[inline]
    fn co(&self, h: CoHandle) -> &crate::co::Coroutine {
        self.sched.get(h).expect("running coroutine is live")
    }

    #[inline]
    fn co_mut(&mut self, h: CoHandle) -> &mut crate::co::Coroutine {
        self.sched.get_mut(h).expect("running coroutine is live")
    }

    #[inline]
    fn reg(&self, h: CoHandle, r: u8) -> Result<Val, Fault> {
        let co = self.co(h);
        let slot = co.base + r as usize;
        co.stack.get(slot).copied().ok_or(Fault::BadRegister { slot })
    }

    #[inline]
    fn abs(&self, h: CoHandle, slot: usize) -> Result<Val, Fault> {
        self.co(h).stack.get(slot).copied().ok_or(Fault::BadRegister { slot })
    }

    /// Register write; the single store primitive keeps refcounts exact.
    #[inline]
    fn set_reg(&mut self, h: CoHandle, r: u8, v: Val) -> Result<(), Fault> {
        let base = self.co(h).base;
        self.set_abs(h, base + r as usize, v)
    }

    #[inline]
    fn set_abs(&mut self, h: CoHandle, slot: usize, v: Val) -> Result<(), Fault> {
        let Vm { heap, sched, .. } = self;
        let co = sched.get_mut(h).expect("running coroutine is live");
        match co.stack.get_mut(slot) {
            Some(dst) => {
                heap.store(dst, v);
                Ok(())
            }
            None => Err(Fault::BadRegister { slot }),
        }
    }

    // ---- allocation (roots = all stacks + globals + consts + results) ---

    fn with_roots<R>(&mut self, f: impl FnOnce(&mut Heap, &Roots) -> R) -> R {
        let Vm {
            heap,
            sched,
            globals,
            consts,
            finished,
            ..
        } = self;
        let mut roots = Roots::new();
        roots.add_slice(globals.as_slice());
        for co in sched.iter_live() {
            roots.add_slice(co.stack.as_slice());
        }
        for c in consts.iter().flatten() {
            roots.add_val(*c);
        }
        for v in finished.values() {
            roots.add_val(*v);
        }
        f(heap, &roots)
    }

    pub(crate) fn alloc_str_val(&mut self, s: Arc<str>) -> Result<Val, Fault> {
        self.with_roots(|heap, roots| heap.alloc_str(s, roots)).map(Val::Str)
    }

    fn alloc_table(&mut self) -> Result<Val, Fault> {
        self.with_roots(|heap, roots| heap.alloc_table(roots)).map(Val::Table)
    }

    fn alloc_func(&mut self, f: FuncValue) -> Result<Val, Fault> {
        self.with_roots(|heap, roots| heap.alloc_func(f, roots)).map(Val::Func)
    }

    fn alloc_resource(&mut self, r: ResourceValue) -> Result<Val, Fault> {
        self.with_roots(|heap, roots| heap.alloc_resource(r, roots))
            .map(Val::Resource)
    }

    /// Materialize a constant into this instance's heap; cached per index,
    /// and the cache itself counts as a reference.
    fn load_const(&mut self, index: u16) -> Result<Val, Fault> {
        if let Some(Some(v)) = self.consts.get(index as usize) {
            return Ok(*v);
        }
        let c = self.program.konst(index)?.clone();
        let v = match c {
            super::program::Const::Nil => Val::Nil,
            super::program::Const::Int(i) => Val::Int(i),
            super::program::Const::Float(f) => Val::Float(f),
            super::program::Const::Bool(b) => Val::Bool(b),
            super::program::Const::Str(s) => self.alloc_str_val(intern(&s))?,
            super::program::Const::Func(p) => {
                self.program.proto(p)?;
                self.alloc_func(FuncValue::Proto(p))?
            }
            super::program::Const::Native(name) => {
                let def = lookup_native(&name).ok_or_else(|| Fault::NativeError {
                    name: "registry",
                    message: format!("native '{name}' is not registered"),
                })?;
                self.alloc_func(FuncValue::Native(def))?
            }
        };
        self.heap.ref_add(v);
        self.consts[index as usize] = Some(v);
        Ok(v)
    }

    // ---- call plumbing --------------------------------------------------

    fn callee_of(&self, v: Val) -> Result<Callee, Fault> {
        let Val::Func(handle) = v else {
            return Err(Fault::NotCallable {
                type_name: v.type_name(),
            });
        };
        match self.heap.get(handle) {
            Some(HeapData::Func(FuncValue::Proto(p))) => {
                let proto = self.program.proto(*p)?;
                Ok(Callee::Proto {
                    index: *p,
                    entry: proto.entry as usize,
                    stack_size: proto.stack_size as usize,
                    nparams: proto.nparams as usize,
                })
            }
            Some(HeapData::Func(FuncValue::Native(def))) => Ok(Callee::Native(*def)),
            Some(_) => Err(Fault::NotCallable { type_name: "resource" }),
            None => Err(Fault::StaleHandle),
        }
    }

    /// Frame size of the currently executing function (slot 0's callee).
    fn frame_size(&self, h: CoHandle) -> Result<usize, Fault> {
        let base = self.co(h).base;
        let func = self.abs(h, base + SLOT_FUNC)?;
        match self.callee_of(func)? {
            Callee::Proto { stack_size, .. } => Ok(stack_size),
            // Native frames are never committed, so slot 0 of a live frame
            // always names a bytecode function.
            Callee::Native(def) => Ok(FIRST_ARG + def.arity as usize),
        }
    }

    fn grow_stack(&mut self, h: CoHandle, new_len: usize) -> Result<(), Fault> {
        if new_len > self.cfg.max_stack_slots {
            return Err(Fault::StackOverflow {
                needed: new_len,
                limit: self.cfg.max_stack_slots,
            });
        }
        let co = self.co_mut(h);
        if co.stack.len() < new_len {
            co.stack.resize(new_len, Val::Nil);
        }
        Ok(())
    }

    fn call_native(&mut self, h: CoHandle, def: NativeDef, frame_base: usize) -> Result<(), Fault> {
        let args: Vec<Val> = {
            let co = self.co(h);
            (0..def.arity as usize)
                .map(|i| co.stack.get(frame_base + FIRST_ARG + i).copied().unwrap_or(Val::Nil))
                .collect()
        };
        let result = {
            let Vm {
                heap,
                sched,
                globals,
                consts,
                finished,
                echo,
                pending,
                timer,
                ..
            } = self;
            let mut ctx = VmCtx {
                heap,
                sched,
                globals,
                consts,
                finished,
                echo,
                pending,
                timer,
                current: h,
            };
            (def.func)(&args, &mut ctx)
        };
        match result {
            Ok(v) => self.set_abs(h, frame_base + SLOT_RET, v),
            Err(err) => Err(match err.downcast::<Fault>() {
                Ok(fault) => fault,
                Err(other) => Fault::NativeError {
                    name: def.name,
                    message: other.to_string(),
                },
            }),
        }
    }

    /// Shared RET path: restore pc and base from the current frame, or
    /// finish the coroutine when frame 0 returns.
    fn do_return(&mut self, h: CoHandle) -> Result<Step, Fault> {
        let base = self.co(h).base;
        let size = self.frame_size(h)?;
        let saved_pc = self.abs(h, base + SLOT_PC)?;
        let saved_base = self.abs(h, base + SLOT_BASE)?;
        match (saved_pc, saved_base) {
            (Val::Int(p), Val::Int(b)) if p >= 0 && b >= 0 => {
                // Release the dead frame's registers, keeping the return
                // value for the caller.
                for i in 0..size {
                    if i != SLOT_RET {
                        self.set_abs(h, base + i, Val::Nil)?;
                    }
                }
                let co = self.co_mut(h);
                co.pc = p as usize;
                co.base = b as usize;
                Ok(Step::Continue)
            }
            _ => Ok(Step::Finished),
        }
    }

    // ---- unwinding ------------------------------------------------------

    fn frame_proto(&self, h: CoHandle) -> Result<u16, Fault> {
        let base = self.co(h).base;
        let func = self.abs(h, base + SLOT_FUNC)?;
        match self.callee_of(func)? {
            Callee::Proto { index, .. } => Ok(index),
            Callee::Native(_) => Err(Fault::StaleHandle),
        }
    }

    fn unwind_fault(&mut self, h: CoHandle, fault: &Fault) -> Result<(), Fault> {
        let ipc = self.co(h).pc.saturating_sub(1);
        let thrown = self
            .alloc_str_val(intern(&fault.to_string()))
            .map_err(|_| fault.clone())?;
        self.unwind_value(h, thrown, ipc)
    }

    /// Search catch regions innermost-first, walking the saved frame-base
    /// chain. `Ok` means control transferred to a handler.
    fn unwind_value(&mut self, h: CoHandle, thrown: Val, mut ipc: usize) -> Result<(), Fault> {
        // Pin the thrown value across frame release.
        self.heap.ref_add(thrown);
        loop {
            let base = self.co(h).base;
            let proto_index = self.frame_proto(h)?;
            let region = {
                let proto = self.program.proto(proto_index)?;
                proto
                    .catches
                    .iter()
                    .filter(|c| (c.start as usize) <= ipc && ipc < (c.end as usize))
                    .min_by_key(|c| c.end - c.start)
                    .copied()
            };
            if let Some(r) = region {
                self.set_abs(h, base + r.reg as usize, thrown)?;
                self.heap.ref_del(thrown);
                self.co_mut(h).pc = r.target as usize;
                return Ok(());
            }
            let saved_pc = self.abs(h, base + SLOT_PC)?;
            let saved_base = self.abs(h, base + SLOT_BASE)?;
            match (saved_pc, saved_base) {
                (Val::Int(p), Val::Int(b)) if p >= 0 && b >= 0 => {
                    let size = self.frame_size(h)?;
                    for i in 0..size {
                        self.set_abs(h, base + i, Val::Nil)?;
                    }
                    let co = self.co_mut(h);
                    co.base = b as usize;
                    co.pc = p as usize;
                    // Fault position in the caller is its CALL instruction.
                    ipc = (p as usize).saturating_sub(1);
                }
                _ => {
                    let rendered = self.heap.render(thrown);
                    self.heap.ref_del(thrown);
                    return Err(Fault::Uncaught { rendered });
                }
            }
        }
    }

    // ---- dispatch -------------------------------------------------------

    fn step(&mut self, h: CoHandle) -> Result<Step, Fault> {
        let ipc = self.co(h).pc;
        let w = *self
            .program
            .code
            .get(ipc)
            .ok_or(Fault::CodeOutOfBounds { pc: ipc })?;
        let op = Opcode::from_u8(op_of(w)).ok_or(Fault::UnknownOpcode {
            byte: op_of(w),
            pc: ipc,
        })?;
        self.co_mut(h).pc = ipc + 1;

        match op {
            Opcode::Nop => {}
            Opcode::Hlt => return Ok(Step::Finished),

            // data movement
            Opcode::Mov => {
                let v = self.reg(h, pb(w))?;
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Movi => {
                self.set_reg(h, pa(w), Val::Int(pd(w) as i16 as i64))?;
            }
            Opcode::Load => {
                let v = self.load_const(pd(w))?;
                self.set_reg(h, pa(w), v)?;
            }

            // arithmetic
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                let a = self.reg(h, pb(w))?;
                let b = self.reg(h, pc(w))?;
                let v = num_binop(num_op_of(op), a, b)?;
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Addi | Opcode::Subi | Opcode::Muli | Opcode::Divi => {
                let a = self.reg(h, pa(w))?;
                let imm = Val::Int(pd(w) as i16 as i64);
                let v = num_binop(num_op_of(op), a, imm)?;
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Neg => {
                let v = match self.reg(h, pb(w))? {
                    Val::Int(i) => Val::Int(i.wrapping_neg()),
                    Val::Float(f) => Val::Float(-f),
                    other => {
                        return Err(Fault::TypeError {
                            op: "neg",
                            detail: other.type_name().to_string(),
                        });
                    }
                };
                self.set_reg(h, pa(w), v)?;
            }

            // bitwise
            Opcode::Shl => {
                let v = self.int_binop("shl", h, pb(w), pc(w), |x, y| x.wrapping_shl((y & 63) as u32))?;
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Shr => {
                let v = self.int_binop("shr", h, pb(w), pc(w), |x, y| x.wrapping_shr((y & 63) as u32))?;
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Shli => {
                let x = self.int_reg("shl", h, pa(w))?;
                self.set_reg(h, pa(w), Val::Int(x.wrapping_shl((pd(w) & 63) as u32)))?;
            }
            Opcode::Shri => {
                let x = self.int_reg("shr", h, pa(w))?;
                self.set_reg(h, pa(w), Val::Int(x.wrapping_shr((pd(w) & 63) as u32)))?;
            }
            Opcode::And => {
                let v = self.int_binop("and", h, pb(w), pc(w), |x, y| x & y)?;
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Or => {
                let v = self.int_binop("or", h, pb(w), pc(w), |x, y| x | y)?;
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Xor => {
                let v = self.int_binop("xor", h, pb(w), pc(w), |x, y| x ^ y)?;
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Not => {
                let x = self.int_reg("not", h, pb(w))?;
                self.set_reg(h, pa(w), Val::Int(!x))?;
            }

            // comparisons
            Opcode::Eq => {
                let a = self.reg(h, pb(w))?;
                let b = self.reg(h, pc(w))?;
                let v = Val::Bool(self.heap.vals_eq(a, b));
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Lt => {
                let a = self.reg(h, pb(w))?;
                let b = self.reg(h, pc(w))?;
                let v = Val::Bool(cmp_lt(&self.heap, a, b)?);
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Le => {
                let a = self.reg(h, pb(w))?;
                let b = self.reg(h, pc(w))?;
                let v = Val::Bool(cmp_le(&self.heap, a, b)?);
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Eqi => {
                let a = self.reg(h, pa(w))?;
                let v = Val::Bool(self.heap.vals_eq(a, Val::Int(pd(w) as i16 as i64)));
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Lti => {
                let a = self.reg(h, pa(w))?;
                let v = Val::Bool(cmp_lt(&self.heap, a, Val::Int(pd(w) as i16 as i64))?);
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Lei => {
                let a = self.reg(h, pa(w))?;
                let v = Val::Bool(cmp_le(&self.heap, a, Val::Int(pd(w) as i16 as i64))?);
                self.set_reg(h, pa(w), v)?;
            }
            // `>=`/`>` exist only in immediate form, synthesized by swapping
            // the operands of `<=`/`<`.
            Opcode::Gei => {
                let a = self.reg(h, pa(w))?;
                let v = Val::Bool(cmp_le(&self.heap, Val::Int(pd(w) as i16 as i64), a)?);
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::Gti => {
                let a = self.reg(h, pa(w))?;
                let v = Val::Bool(cmp_lt(&self.heap, Val::Int(pd(w) as i16 as i64), a)?);
                self.set_reg(h, pa(w), v)?;
            }

            // logical
            Opcode::Land => {
                let a = self.reg(h, pb(w))?;
                let b = self.reg(h, pc(w))?;
                self.set_reg(h, pa(w), Val::Bool(a.truthy() && b.truthy()))?;
            }
            Opcode::Lor => {
                let a = self.reg(h, pb(w))?;
                let b = self.reg(h, pc(w))?;
                self.set_reg(h, pa(w), Val::Bool(a.truthy() || b.truthy()))?;
            }
            Opcode::Lnot => {
                let a = self.reg(h, pb(w))?;
                self.set_reg(h, pa(w), Val::Bool(!a.truthy()))?;
            }

            Opcode::Typeof => {
                let name = self.reg(h, pb(w))?.type_name();
                let v = self.alloc_str_val(intern(name))?;
                self.set_reg(h, pa(w), v)?;
            }

            // control flow
            Opcode::Test => {
                if !self.reg(h, pa(w))?.truthy() {
                    self.co_mut(h).pc += pd(w) as usize;
                }
            }
            Opcode::Jmp => match self.reg(h, pa(w))? {
                Val::Int(p) if p >= 0 => self.co_mut(h).pc = p as usize,
                Val::Int(_) => return Err(Fault::CodeOutOfBounds { pc: ipc }),
                other => {
                    return Err(Fault::TypeError {
                        op: "jmp",
                        detail: other.type_name().to_string(),
                    });
                }
            },
            Opcode::Jmpi => {
                self.co_mut(h).pc = pe(w) as usize;
            }

            // call group
            Opcode::CallNew => {
                let callee = self.reg(h, pa(w))?;
                let need = match self.callee_of(callee)? {
                    Callee::Proto { stack_size, .. } => stack_size,
                    Callee::Native(def) => FIRST_ARG + def.arity as usize,
                };
                let base = self.co(h).base;
                let size = self.frame_size(h)?;
                self.grow_stack(h, base + size + need)?;
            }
            Opcode::CallSet => {
                let v = self.reg(h, pb(w))?;
                let base = self.co(h).base;
                let size = self.frame_size(h)?;
                self.set_abs(h, base + size + pa(w) as usize, v)?;
            }
            Opcode::Call => {
                let callee = self.reg(h, pa(w))?;
                let base = self.co(h).base;
                let size = self.frame_size(h)?;
                let frame_base = base + size;
                match self.callee_of(callee)? {
                    Callee::Proto { entry, stack_size, .. } => {
                        let top = frame_base + stack_size;
                        if self.co(h).stack.len() < top {
                            // CALL_NEW was skipped or under-sized.
                            return Err(Fault::StackOverflow {
                                needed: top,
                                limit: self.co(h).stack.len(),
                            });
                        }
                        let ret_pc = self.co(h).pc;
                        self.set_abs(h, frame_base + SLOT_FUNC, callee)?;
                        self.set_abs(h, frame_base + SLOT_RET, Val::Nil)?;
                        self.set_abs(h, frame_base + SLOT_PC, Val::Int(ret_pc as i64))?;
                        self.set_abs(h, frame_base + SLOT_BASE, Val::Int(base as i64))?;
                        let co = self.co_mut(h);
                        co.base = frame_base;
                        co.pc = entry;
                    }
                    Callee::Native(def) => {
                        // Natives run inline; their frame is never committed.
                        self.call_native(h, def, frame_base)?;
                    }
                }
            }
            Opcode::TailCall => {
                let callee = self.reg(h, pa(w))?;
                let base = self.co(h).base;
                match self.callee_of(callee)? {
                    Callee::Proto { entry, stack_size, .. } => {
                        // Reuse the current frame: the caller's return slots
                        // (2 and 3) stay, so RET skips this frame entirely.
                        // Arguments are staged in this frame's param slots by
                        // the compiler.
                        self.grow_stack(h, base + stack_size)?;
                        self.set_abs(h, base + SLOT_FUNC, callee)?;
                        self.set_abs(h, base + SLOT_RET, Val::Nil)?;
                        self.co_mut(h).pc = entry;
                    }
                    Callee::Native(def) => {
                        // Degenerate tail call: run the native, then return
                        // its result to the caller.
                        let size = self.frame_size(h)?;
                        let frame_base = base + size;
                        self.grow_stack(h, frame_base + FIRST_ARG + def.arity as usize)?;
                        self.call_native(h, def, frame_base)?;
                        let v = self.abs(h, frame_base + SLOT_RET)?;
                        self.set_abs(h, base + SLOT_RET, v)?;
                        self.set_abs(h, frame_base + SLOT_RET, Val::Nil)?;
                        return self.do_return(h);
                    }
                }
            }
            Opcode::CoCall => {
                let callee = self.reg(h, pa(w))?;
                let base = self.co(h).base;
                let size = self.frame_size(h)?;
                let frame_base = base + size;
                match self.callee_of(callee)? {
                    Callee::Proto {
                        entry,
                        stack_size,
                        nparams,
                        ..
                    } => {
                        let args: Vec<Val> = {
                            let co = self.co(h);
                            (0..nparams)
                                .map(|i| co.stack.get(frame_base + FIRST_ARG + i).copied().unwrap_or(Val::Nil))
                                .collect()
                        };
                        let child = self.sched.create(stack_size, Some(h));
                        let id = self.sched.get(child).map(|c| c.id).unwrap_or(0);
                        self.set_abs(child, SLOT_FUNC, callee)?;
                        for (i, v) in args.iter().enumerate() {
                            self.set_abs(child, FIRST_ARG + i, *v)?;
                        }
                        if let Some(co) = self.sched.get_mut(child) {
                            co.pc = entry;
                            co.base = 0;
                        }
                        // Release the staged copies in the caller's window.
                        for i in 0..nparams {
                            self.set_abs(h, frame_base + FIRST_ARG + i, Val::Nil)?;
                        }
                        let res = self.alloc_resource(ResourceValue::coroutine(id, child))?;
                        self.set_reg(h, pa(w), res)?;
                    }
                    Callee::Native(_) => {
                        return Err(Fault::TypeError {
                            op: "co_call",
                            detail: "native functions cannot seed a coroutine".to_string(),
                        });
                    }
                }
            }
            Opcode::Ret => {
                let r = pa(w);
                if r != 0 {
                    let v = self.reg(h, r)?;
                    let base = self.co(h).base;
                    self.set_abs(h, base + SLOT_RET, v)?;
                }
                return self.do_return(h);
            }

            // arrays
            Opcode::ArrayNew => {
                let v = self.alloc_table()?;
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::ArrayGet => {
                let table = self.table_reg(h, pb(w))?;
                let key = self.table_key(h, pc(w))?;
                let v = self.heap.table_get(table, &key)?;
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::ArraySet => {
                let table = self.table_reg(h, pa(w))?;
                let key = self.table_key(h, pb(w))?;
                let v = self.reg(h, pc(w))?;
                self.heap.table_set(table, key, v)?;
            }
            Opcode::ArrayAdd => {
                let table = self.table_reg(h, pa(w))?;
                let v = self.reg(h, pb(w))?;
                self.heap.table_add(table, v)?;
            }

            // globals
            Opcode::GlobalGet => {
                let index = pd(w);
                let v = *self
                    .globals
                    .get(index as usize)
                    .ok_or(Fault::BadGlobal { index })?;
                self.set_reg(h, pa(w), v)?;
            }
            Opcode::GlobalSet => {
                let index = pd(w);
                let v = self.reg(h, pa(w))?;
                let Vm { heap, globals, .. } = self;
                match globals.get_mut(index as usize) {
                    Some(dst) => heap.store(dst, v),
                    None => return Err(Fault::BadGlobal { index }),
                }
            }

            Opcode::Throw => {
                let thrown = self.reg(h, pa(w))?;
                self.unwind_value(h, thrown, ipc)?;
            }
            Opcode::Echo => {
                let line = self.heap.render(self.reg(h, pa(w))?);
                debug!(target: "rill::vm::echo", "{line}");
                self.echo.push(line);
            }
        }
        Ok(Step::Continue)
    }

    // ---- operand helpers ------------------------------------------------

    fn int_reg(&self, op: &'static str, h: CoHandle, r: u8) -> Result<i64, Fault> {
        match self.reg(h, r)? {
            Val::Int(i) => Ok(i),
            other => Err(Fault::TypeError {
                op,
                detail: other.type_name().to_string(),
            }),
        }
    }

    fn int_binop(
        &self,
        op: &'static str,
        h: CoHandle,
        rb: u8,
        rc: u8,
        f: impl Fn(i64, i64) -> i64,
    ) -> Result<Val, Fault> {
        let x = self.int_reg(op, h, rb)?;
        let y = self.int_reg(op, h, rc)?;
        Ok(Val::Int(f(x, y)))
    }

    fn table_reg(&self, h: CoHandle, r: u8) -> Result<crate::val::Handle, Fault> {
        match self.reg(h, r)? {
            Val::Table(t) => Ok(t),
            other => Err(Fault::TypeError {
                op: "array",
                detail: other.type_name().to_string(),
            }),
        }
    }

    fn table_key(&self, h: CoHandle, r: u8) -> Result<TableKey, Fault> {
        match self.reg(h, r)? {
            Val::Int(i) => Ok(TableKey::Int(i)),
            Val::Str(s) => match self.heap.str_content(s) {
                Some(content) => Ok(TableKey::Str(content.clone())),
                None => Err(Fault::StaleHandle),
            },
            other => Err(Fault::InvalidKey {
                key_type: other.type_name(),
            }),
        }
    }
}

// ---- pure operator helpers ----------------------------------------------

#[derive(Clone, Copy)]
enum NumOp {
    Add,
    Sub,
    Mul,
    Div,
}

fn num_op_of(op: Opcode) -> NumOp {
    match op {
        Opcode::Add | Opcode::Addi => NumOp::Add,
        Opcode::Sub | Opcode::Subi => NumOp::Sub,
        Opcode::Mul | Opcode::Muli => NumOp::Mul,
        _ => NumOp::Div,
    }
}

fn num_name(op: NumOp) -> &'static str {
    match op {
        NumOp::Add => "add",
        NumOp::Sub => "sub",
        NumOp::Mul => "mul",
        NumOp::Div => "div",
    }
}

/// Integer ops wrap; mixed int/float promotes to float; integer division
/// truncates toward zero and faults on a zero divisor.
fn num_binop(op: NumOp, a: Val, b: Val) -> Result<Val, Fault> {
    if let (Val::Int(x), Val::Int(y)) = (a, b) {
        return Ok(match op {
            NumOp::Add => Val::Int(x.wrapping_add(y)),
            NumOp::Sub => Val::Int(x.wrapping_sub(y)),
            NumOp::Mul => Val::Int(x.wrapping_mul(y)),
            NumOp::Div => {
                if y == 0 {
                    return Err(Fault::DivisionByZero);
                }
                Val::Int(x.wrapping_div(y))
            }
        });
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(Val::Float(match op {
            NumOp::Add => x + y,
            NumOp::Sub => x - y,
            NumOp::Mul => x * y,
            NumOp::Div => x / y,
        })),
        _ => Err(Fault::TypeError {
            op: num_name(op),
            detail: format!("{} and {}", a.type_name(), b.type_name()),
        }),
    }
}

fn cmp_lt(heap: &Heap, a: Val, b: Val) -> Result<bool, Fault> {
    if let (Val::Int(x), Val::Int(y)) = (a, b) {
        return Ok(x < y);
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return Ok(x < y);
    }
    if let (Val::Str(ha), Val::Str(hb)) = (a, b) {
        return match (heap.str_content(ha), heap.str_content(hb)) {
            (Some(x), Some(y)) => Ok(x < y),
            _ => Err(Fault::StaleHandle),
        };
    }
    Err(Fault::TypeError {
        op: "lt",
        detail: format!("{} and {}", a.type_name(), b.type_name()),
    })
}

fn cmp_le(heap: &Heap, a: Val, b: Val) -> Result<bool, Fault> {
    if let (Val::Int(x), Val::Int(y)) = (a, b) {
        return Ok(x <= y);
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return Ok(x <= y);
    }
    if let (Val::Str(ha), Val::Str(hb)) = (a, b) {
        return match (heap.str_content(ha), heap.str_content(hb)) {
            (Some(x), Some(y)) => Ok(x <= y),
            _ => Err(Fault::StaleHandle),
        };
    }
    Err(Fault::TypeError {
        op: "le",
        detail: format!("{} and {}", a.type_name(), b.type_name()),
    })
}

// ---- native-function context ---------------------------------------------

/// What a native function sees of the VM. Field borrows are split so a
/// native can allocate (which walks every stack as a GC root) while holding
/// the context.
pub struct VmCtx<'a> {
    heap: &'a mut Heap,
    sched: &'a mut Scheduler,
    globals: &'a mut Vec<Val>,
    consts: &'a Vec<Option<Val>>,
    finished: &'a FastHashMap<u64, Val>,
    echo: &'a mut Vec<String>,
    pending: &'a mut Option<Switch>,
    timer: &'a Option<TimerHandle>,
    current: CoHandle,
}

impl VmCtx<'_> {
    pub fn heap(&self) -> &Heap {
        self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        self.heap
    }

    pub fn current_co(&self) -> CoHandle {
        self.current
    }

    pub fn co_id(&self) -> u64 {
        self.sched.get(self.current).map(|c| c.id).unwrap_or(0)
    }

    pub fn global(&self, index: u16) -> Option<Val> {
        self.globals.get(index as usize).copied()
    }

    pub fn render(&self, v: Val) -> String {
        self.heap.render(v)
    }

    pub fn echo_line(&mut self, line: String) {
        self.echo.push(line);
    }

    /// Whether a coroutine-handle resource still names a live coroutine.
    /// A handle whose target died (even if its slot was recycled) reads as
    /// dead; the generation tag absorbs the race.
    pub fn co_alive(&self, v: Val) -> Result<bool> {
        let Val::Resource(h) = v else {
            bail!("expected a coroutine handle, got {}", v.type_name());
        };
        match self.heap.get(h) {
            Some(HeapData::Resource(r)) => Ok(r.co.is_some_and(|co| self.sched.get(co).is_some())),
            Some(_) => bail!("resource handle does not name a resource"),
            None => Ok(false),
        }
    }

    fn with_roots<R>(&mut self, f: impl FnOnce(&mut Heap, &Roots) -> R) -> R {
        let VmCtx {
            heap,
            sched,
            globals,
            consts,
            finished,
            ..
        } = self;
        let mut roots = Roots::new();
        roots.add_slice(globals.as_slice());
        for co in sched.iter_live() {
            roots.add_slice(co.stack.as_slice());
        }
        for c in consts.iter().flatten() {
            roots.add_val(*c);
        }
        for v in finished.values() {
            roots.add_val(*v);
        }
        f(heap, &roots)
    }

    /// Allocate a string in the instance heap, with full roots.
    pub fn alloc_str(&mut self, s: &str) -> Result<Val> {
        let interned = intern(s);
        Ok(self.with_roots(|heap, roots| heap.alloc_str(interned, roots)).map(Val::Str)?)
    }

    /// Allocate an empty array value.
    pub fn alloc_table(&mut self) -> Result<Val> {
        Ok(self.with_roots(|heap, roots| heap.alloc_table(roots)).map(Val::Table)?)
    }

    /// Ask the dispatch loop to move this coroutine RUNNING -> READY once
    /// the native returns.
    pub fn request_yield(&mut self) {
        *self.pending = Some(Switch::Yield);
    }

    /// Ask the dispatch loop to park this coroutine; an external `resume`
    /// wakes it later.
    pub fn request_suspend(&mut self) {
        *self.pending = Some(Switch::Suspend);
    }

    /// Suspend and arm a timer wake through the driver.
    pub fn sleep_wake(&mut self, ms: u64) -> Result<()> {
        let Some(timer) = self.timer else {
            bail!("no async driver installed; sleep is unavailable");
        };
        timer.wake_after(self.current, ms);
        self.request_suspend();
        Ok(())
    }
}
