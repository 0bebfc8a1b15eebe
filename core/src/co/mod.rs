//! Cooperative coroutine scheduler.
//!
//! Exactly one coroutine executes bytecode at any instant within a VM
//! instance. Non-running coroutines are READY (queued, strict FIFO),
//! SUSPEND (parked, owned by the external event loop until it calls
//! `resume`), or DIED. Coroutines live in a generation-tagged slot map;
//! a [`CoHandle`] held after death simply fails to resolve, which is what
//! lets a late async callback fire without racing a freed stack.
//!
//! State transitions are reported as [`SchedEvent`]s on an optional channel
//! rather than through a callback captured in the coroutine itself.

use std::collections::VecDeque;

use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::val::Val;
use crate::vm::Fault;

const TRACE_TARGET: &str = "rill::co";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    Ready,
    Running,
    Suspend,
    Died,
}

/// Generation-tagged scheduler handle; the only public coroutine identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoEventKind {
    Yielded,
    Suspended,
    Died,
}

/// Emitted to the owning collaborator on every scheduler-visible transition.
#[derive(Debug, Clone, Copy)]
pub struct SchedEvent {
    pub co: CoHandle,
    pub id: u64,
    pub kind: CoEventKind,
}

#[derive(Debug)]
pub struct Coroutine {
    pub id: u64,
    pub status: CoStatus,
    /// Private register stack; the VM points its register file here while
    /// the coroutine runs.
    pub stack: Vec<Val>,
    pub pc: usize,
    pub base: usize,
    pub parent: Option<CoHandle>,
}

struct CoSlot {
    generation: u32,
    co: Option<Coroutine>,
}

pub struct Scheduler {
    slots: Vec<CoSlot>,
    free: Vec<u32>,
    ready: VecDeque<CoHandle>,
    current: Option<CoHandle>,
    suspended: usize,
    next_id: u64,
    events: Option<UnboundedSender<SchedEvent>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            ready: VecDeque::new(),
            current: None,
            suspended: 0,
            next_id: 1,
            events: None,
        }
    }

    pub fn set_event_sink(&mut self, tx: UnboundedSender<SchedEvent>) {
        self.events = Some(tx);
    }

    fn emit(&self, co: CoHandle, id: u64, kind: CoEventKind) {
        if let Some(tx) = &self.events {
            // The collaborator may be gone; transitions must not care.
            let _ = tx.send(SchedEvent { co, id, kind });
        }
    }

    /// Allocate a coroutine with a private stack of `stack_size` slots and
    /// queue it READY.
    pub fn create(&mut self, stack_size: usize, parent: Option<CoHandle>) -> CoHandle {
        let id = self.next_id;
        self.next_id += 1;
        let co = Coroutine {
            id,
            status: CoStatus::Ready,
            stack: vec![Val::Nil; stack_size],
            pc: 0,
            base: 0,
            parent,
        };
        let handle = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.co = Some(co);
                CoHandle {
                    index: idx,
                    generation: slot.generation,
                }
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(CoSlot { generation: 0, co: Some(co) });
                CoHandle { index: idx, generation: 0 }
            }
        };
        self.ready.push_back(handle);
        trace!(target: TRACE_TARGET, id, stack_size, "co.create");
        handle
    }

    pub fn get(&self, h: CoHandle) -> Option<&Coroutine> {
        let slot = self.slots.get(h.index as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.co.as_ref()
    }

    pub fn get_mut(&mut self, h: CoHandle) -> Option<&mut Coroutine> {
        let slot = self.slots.get_mut(h.index as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.co.as_mut()
    }

    pub fn iter_live(&self) -> impl Iterator<Item = &Coroutine> {
        self.slots.iter().filter_map(|s| s.co.as_ref())
    }

    pub fn current(&self) -> Option<CoHandle> {
        self.current
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn suspended_len(&self) -> usize {
        self.suspended
    }

    pub fn live_len(&self) -> usize {
        self.slots.iter().filter(|s| s.co.is_some()).count()
    }

    /// Pop the ready-queue head (strict FIFO). Entries whose coroutine died
    /// or was resumed out of band are skipped.
    pub fn pop_ready(&mut self) -> Option<CoHandle> {
        while let Some(h) = self.ready.pop_front() {
            if self.get(h).is_some_and(|co| co.status == CoStatus::Ready) {
                return Some(h);
            }
        }
        None
    }

    pub(crate) fn set_running(&mut self, h: CoHandle) {
        if let Some(co) = self.get_mut(h) {
            co.status = CoStatus::Running;
        }
        self.current = Some(h);
    }

    /// RUNNING -> READY (tail of the queue).
    pub(crate) fn yield_current(&mut self) {
        if let Some(h) = self.current.take()
            && let Some(co) = self.get_mut(h)
        {
            co.status = CoStatus::Ready;
            let id = co.id;
            self.ready.push_back(h);
            self.emit(h, id, CoEventKind::Yielded);
        }
    }

    /// RUNNING -> SUSPEND. The coroutine is now owned by the event-loop
    /// collaborator; only `resume_target` brings it back.
    pub(crate) fn suspend_current(&mut self) {
        if let Some(h) = self.current.take()
            && let Some(co) = self.get_mut(h)
        {
            co.status = CoStatus::Suspend;
            let id = co.id;
            self.suspended += 1;
            self.emit(h, id, CoEventKind::Suspended);
        }
    }

    pub(crate) fn clear_current(&mut self) {
        self.current = None;
    }

    /// Make `h` the next coroutine to run, re-queueing whatever was running.
    /// Resuming a stale handle fails safely.
    pub fn resume_target(&mut self, h: CoHandle) -> Result<(), Fault> {
        let Some(co) = self.get(h) else {
            return Err(Fault::StaleHandle);
        };
        if co.status == CoStatus::Died {
            return Err(Fault::StaleHandle);
        }
        if self.current.is_some() && self.current != Some(h) {
            self.yield_current();
        }
        let was = self.get(h).map(|c| c.status);
        if was == Some(CoStatus::Suspend) {
            self.suspended -= 1;
        }
        if let Some(co) = self.get_mut(h) {
            co.status = CoStatus::Ready;
        }
        // Drop any queued entry so the coroutine cannot be scheduled twice.
        self.ready.retain(|&queued| queued != h);
        Ok(())
    }

    /// Terminal transition: tombstone the slot and hand the stack back so
    /// the VM can release the references it holds.
    pub(crate) fn kill(&mut self, h: CoHandle) -> Vec<Val> {
        if self.current == Some(h) {
            self.current = None;
        }
        let Some(slot) = self.slots.get_mut(h.index as usize) else {
            return Vec::new();
        };
        if slot.generation != h.generation {
            return Vec::new();
        }
        let Some(mut co) = slot.co.take() else {
            return Vec::new();
        };
        if co.status == CoStatus::Suspend {
            self.suspended -= 1;
        }
        co.status = CoStatus::Died;
        let id = co.id;
        let stack = std::mem::take(&mut co.stack);
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(h.index);
        self.emit(h, id, CoEventKind::Died);
        trace!(target: TRACE_TARGET, id, "co.died");
        stack
    }
}
