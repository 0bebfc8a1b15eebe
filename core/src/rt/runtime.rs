//! Async driver boundary.
//!
//! The OS-level readiness/timer multiplexer is an external collaborator;
//! the core only exposes `suspend` (a native parks its coroutine) and
//! `resume` (the collaborator unparks it). `Driver` is the minimal tokio
//! incarnation of that collaborator: it owns the wake channel and alternates
//! ready-queue passes with waiting for wake events. Extension code arms
//! wakes through a [`TimerHandle`]; a wake for a coroutine that died in the
//! meantime resolves to a stale handle and is dropped on the floor.

use anyhow::{Context, Result, anyhow, bail};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{trace, warn};

use crate::co::CoHandle;
use crate::val::Val;
use crate::vm::{Fault, Vm};

const TRACE_TARGET: &str = "rill::rt";

#[derive(Debug, Clone, Copy)]
pub enum Wake {
    Resume(CoHandle),
}

/// Cloneable capability handed to the VM (and through it to natives) for
/// arming wake-ups.
#[derive(Clone)]
pub struct TimerHandle {
    tx: UnboundedSender<Wake>,
    rt: tokio::runtime::Handle,
}

impl TimerHandle {
    /// Wake `co` after `ms` milliseconds.
    pub fn wake_after(&self, co: CoHandle, ms: u64) {
        let tx = self.tx.clone();
        self.rt.spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            let _ = tx.send(Wake::Resume(co));
        });
    }

    /// Queue an immediate wake (used by I/O callbacks).
    pub fn wake_now(&self, co: CoHandle) {
        let _ = self.tx.send(Wake::Resume(co));
    }
}

pub struct Driver {
    rt: tokio::runtime::Runtime,
    tx: UnboundedSender<Wake>,
    rx: UnboundedReceiver<Wake>,
}

impl Driver {
    pub fn new_multi_thread() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| anyhow!("Failed to create tokio runtime: {}", e))?;
        Ok(Self::with_runtime(rt))
    }

    pub fn new_current_thread() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| anyhow!("Failed to create tokio runtime: {}", e))?;
        Ok(Self::with_runtime(rt))
    }

    /// Multi-thread runtime, honoring `RILL_SINGLE_THREAD` and falling back
    /// to a current-thread runtime when the multi-thread one is unavailable.
    pub fn new() -> Result<Self> {
        if std::env::var("RILL_SINGLE_THREAD").is_ok() {
            return Self::new_current_thread();
        }
        match Self::new_multi_thread() {
            Ok(driver) => Ok(driver),
            Err(err) => {
                let err_msg = err.to_string();
                Self::new_current_thread().map_err(|fallback_err| {
                    anyhow!(
                        "Failed to create multi-thread runtime ({}) and fallback to current-thread runtime failed ({})",
                        err_msg,
                        fallback_err
                    )
                })
            }
        }
    }

    fn with_runtime(rt: tokio::runtime::Runtime) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { rt, tx, rx }
    }

    pub fn timer(&self) -> TimerHandle {
        TimerHandle {
            tx: self.tx.clone(),
            rt: self.rt.handle().clone(),
        }
    }

    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: std::future::Future,
    {
        self.rt.block_on(future)
    }

    /// Drive a VM until its main coroutine finishes: drain the ready queue,
    /// then sleep until an external wake arrives and resume its target.
    pub fn run_program(&mut self, vm: &mut Vm, main: CoHandle) -> Result<Val> {
        vm.set_timer(self.timer());
        let main_id = vm.co_id(main).context("stale main coroutine")?;
        loop {
            for (id, fault) in vm.run_pass() {
                if id == main_id {
                    return Err(fault.into());
                }
                warn!(target: TRACE_TARGET, co = id, %fault, "coroutine terminated by fault");
            }
            if let Some(v) = vm.finished_value(main_id) {
                return Ok(v);
            }
            if vm.suspended_len() == 0 && vm.ready_len() == 0 {
                bail!("main coroutine blocked with nothing runnable and nothing suspended");
            }

            let wake = self
                .rt
                .block_on(self.rx.recv())
                .context("wake channel closed while coroutines were parked")?;
            match wake {
                Wake::Resume(h) => {
                    let woken_id = vm.co_id(h);
                    match vm.resume(h) {
                        Ok(crate::vm::Exit::Died(fault)) => {
                            if woken_id == Some(main_id) {
                                return Err(fault.into());
                            }
                            warn!(target: TRACE_TARGET, co = ?woken_id, %fault, "resumed coroutine died");
                        }
                        Ok(_) => {}
                        Err(Fault::StaleHandle) => {
                            // The coroutine died while its wake was in
                            // flight; the generation tag absorbs the race.
                            trace!(target: TRACE_TARGET, "stale wake dropped");
                        }
                        Err(fault) => {
                            warn!(target: TRACE_TARGET, %fault, "resume failed");
                        }
                    }
                }
            }
        }
    }
}
