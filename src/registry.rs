//! Fixed-capacity task registry.
//!
//! The registry owns every TCB. Slot `n` holds task id `n` (ids start at 1). Tasks are also
//! threaded into the dispatch list: each new task is pushed in front of the previous head, so the
//! last task created is the first one the dispatcher considers.
//!
//! Behaviours only interact with other tasks through [`Registry::lookup`],
//! [`Registry::enqueue_to`] and [`Registry::release`], plus the two helpers acting on the task
//! currently being dispatched.

use crate::error::SchedError;
use crate::packet::Packet;
use crate::scheduler::DispatchContext;
use crate::task::{TaskId, Tcb};

/// Slot count used when a scenario does not ask for a different size.
pub const DEFAULT_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct Registry {
    slots: Vec<Option<Tcb>>,
    head: Option<TaskId>,
    created: Vec<TaskId>,
}

impl Registry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: None,
            created: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot_index(&self, id: TaskId) -> Option<usize> {
        let index = (id.0 as usize).checked_sub(1)?;
        (index < self.slots.len()).then_some(index)
    }

    /// Register `tcb` and push it in front of the dispatch list.
    pub fn create_task(&mut self, mut tcb: Tcb) -> Result<TaskId, SchedError> {
        let id = tcb.id;
        let capacity = self.capacity();
        let index = self
            .slot_index(id)
            .ok_or(SchedError::CapacityExceeded { id, capacity })?;
        if self.slots[index].is_some() {
            return Err(SchedError::DuplicateTask { id });
        }
        tcb.link = self.head;
        self.slots[index] = Some(tcb);
        self.head = Some(id);
        self.created.push(id);
        Ok(id)
    }

    /// First task of the dispatch list.
    pub fn head(&self) -> Option<TaskId> {
        self.head
    }

    pub fn lookup(&self, id: TaskId) -> Result<&Tcb, SchedError> {
        self.slot_index(id)
            .and_then(|index| self.slots[index].as_ref())
            .ok_or(SchedError::UnknownTask { id })
    }

    pub fn lookup_mut(&mut self, id: TaskId) -> Result<&mut Tcb, SchedError> {
        match self.slot_index(id) {
            Some(index) => self.slots[index]
                .as_mut()
                .ok_or(SchedError::UnknownTask { id }),
            None => Err(SchedError::UnknownTask { id }),
        }
    }

    /// Registered tasks in creation order.
    pub fn tasks(&self) -> impl Iterator<Item = &Tcb> {
        self.created.iter().filter_map(|&id| self.lookup(id).ok())
    }

    pub fn len(&self) -> usize {
        self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }

    /// Every packet owned by a registered task.
    ///
    /// Packets moved into the dispatch context are not visible while a dispatch is in progress.
    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.tasks().flat_map(Tcb::packets)
    }

    /// Clear the hold flag of task `id`.
    ///
    /// Returns the released task when it outranks the current one, the current task otherwise,
    /// and `None` when `id` is unknown.
    pub fn release(&mut self, ctx: &mut DispatchContext, id: TaskId) -> Option<TaskId> {
        let tcb = match self.lookup_mut(id) {
            Ok(tcb) => tcb,
            Err(err) => {
                ctx.record_fault(err);
                return None;
            }
        };
        tcb.state = tcb.state.without_hold();
        if tcb.priority > ctx.priority {
            Some(id)
        } else {
            Some(ctx.task)
        }
    }

    /// Move `packet` onto the queue of task `dest`, re-tagging it with the sender.
    ///
    /// A packet landing on an empty queue flags the destination as having work and hands control
    /// over when the destination outranks the sender. Unknown destinations drop the packet and
    /// return `None`.
    pub fn enqueue_to(
        &mut self,
        ctx: &mut DispatchContext,
        dest: TaskId,
        mut packet: Packet,
    ) -> Option<TaskId> {
        let tcb = match self.lookup_mut(dest) {
            Ok(tcb) => tcb,
            Err(err) => {
                ctx.record_fault(err);
                return None;
            }
        };
        ctx.counters.queued_packets += 1;
        packet.origin = ctx.task;
        if tcb.queue.is_empty() {
            tcb.queue.append(packet);
            tcb.state = tcb.state.with_packet();
            if tcb.priority > ctx.priority {
                return Some(dest);
            }
        } else {
            tcb.queue.append(packet);
        }
        Some(ctx.task)
    }

    /// Put the current task to sleep until a packet arrives; it stays the next candidate.
    pub fn wait_current(&mut self, ctx: &mut DispatchContext) -> Option<TaskId> {
        match self.lookup_mut(ctx.task) {
            Ok(tcb) => {
                tcb.state = tcb.state.with_wait();
                Some(ctx.task)
            }
            Err(err) => {
                ctx.record_fault(err);
                None
            }
        }
    }

    /// Hold the current task and continue with its list successor.
    pub fn hold_current(&mut self, ctx: &mut DispatchContext) -> Option<TaskId> {
        match self.lookup_mut(ctx.task) {
            Ok(tcb) => {
                ctx.counters.holds += 1;
                tcb.state = tcb.state.with_hold();
                tcb.link
            }
            Err(err) => {
                ctx.record_fault(err);
                None
            }
        }
    }

    /// Release every task and packet, leaving an empty registry of the same capacity.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = None;
        self.created.clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}
