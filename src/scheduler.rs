//! Cooperative dispatcher.
//!
//! Starting from the head of the dispatch list, the dispatcher inspects the current task:
//! 1. Waiting with a packet: pop the head packet, mark the task runnable and dispatch it
//! 2. Runnable: move its scratch state into the [`DispatchContext`], run its step function, move
//!    the scratch state back and continue with whatever task the step named
//! 3. Waiting or held: skip to the next task in list order
//!
//! The loop ends once a step (or the end of the list) names no task. Because steps return the
//! task to consider next, a higher-priority task released or fed by the current one runs
//! immediately, ahead of list order.

use crate::behavior;
use crate::error::SchedError;
use crate::registry::Registry;
use crate::task::{Scratch, TaskId, TaskState, Tcb};
use serde::Serialize;
use std::mem;

/// Characters per line in a rendered trace.
const TRACE_LINE_WIDTH: usize = 50;

/// The two externally observable counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Successful sends through [`Registry::enqueue_to`].
    pub queued_packets: u64,
    /// Tasks that held themselves.
    pub holds: u64,
}

/// State threaded through every dispatch of a run.
///
/// `task`, `priority` and `scratch` describe the task being dispatched and are only meaningful
/// while its step function runs. `counters` and `faults` accumulate over the whole run.
#[derive(Debug, Default)]
pub struct DispatchContext {
    pub task: TaskId,
    pub priority: i32,
    pub scratch: Scratch,
    pub counters: Counters,
    pub faults: Vec<SchedError>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log a non-fatal fault and keep it for the run report.
    pub fn record_fault(&mut self, err: SchedError) {
        log::warn!("task {}: {err}", self.task);
        self.faults.push(err);
    }

    fn enter(&mut self, tcb: &mut Tcb) {
        self.task = tcb.id;
        self.priority = tcb.priority;
        self.scratch = mem::take(&mut tcb.scratch);
    }

    fn leave(&mut self, tcb: &mut Tcb) {
        tcb.scratch = mem::take(&mut self.scratch);
    }

    /// Forget everything, ready for a fresh run.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum StopReason {
    /// No task was left to consider.
    Quiesced,
    /// A task could not be dispatched in the state it was in.
    InconsistentState { task: TaskId, state: TaskState },
}

/// One dispatch, with the counters as they stood right after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchEvent {
    pub task: TaskId,
    pub next: Option<TaskId>,
    #[serde(flatten)]
    pub counters: Counters,
}

/// Ordered record of every dispatch in a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchTrace {
    events: Vec<DispatchEvent>,
}

impl DispatchTrace {
    pub fn events(&self) -> &[DispatchEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Dispatched task ids in order.
    pub fn tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.events.iter().map(|event| event.task)
    }

    /// One character per dispatch, wrapped every fifty characters.
    pub fn render(&self) -> String {
        let len = self.events.len();
        let mut out = String::with_capacity(len + len / TRACE_LINE_WIDTH);
        for (i, event) in self.events.iter().enumerate() {
            if i > 0 && i % TRACE_LINE_WIDTH == 0 {
                out.push('\n');
            }
            out.push(event.task.trace_char());
        }
        out
    }
}

/// Drives tasks of a [`Registry`] until none is left to run.
#[derive(Debug, Default)]
pub struct Dispatcher {
    dispatches: u64,
    trace: Option<DispatchTrace>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher that records a [`DispatchTrace`].
    pub fn with_trace() -> Self {
        Self {
            dispatches: 0,
            trace: Some(DispatchTrace::default()),
        }
    }

    /// Number of step functions run so far.
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    pub fn trace(&self) -> Option<&DispatchTrace> {
        self.trace.as_ref()
    }

    pub fn take_trace(&mut self) -> Option<DispatchTrace> {
        self.trace.take()
    }

    /// Run from the head of the dispatch list until no task is left to consider.
    pub fn run(&mut self, registry: &mut Registry, ctx: &mut DispatchContext) -> StopReason {
        let head = registry.head();
        log::debug!("dispatch loop starting at task {head:?}");
        let stop = self.run_from(registry, ctx, head);
        log::debug!(
            "dispatch loop stopped ({stop:?}) after {} dispatches, counters {:?}",
            self.dispatches,
            ctx.counters
        );
        stop
    }

    fn run_from(
        &mut self,
        registry: &mut Registry,
        ctx: &mut DispatchContext,
        mut current: Option<TaskId>,
    ) -> StopReason {
        while let Some(id) = current {
            let tcb = match registry.lookup_mut(id) {
                Ok(tcb) => tcb,
                Err(err) => {
                    ctx.record_fault(err);
                    break;
                }
            };

            let packet = match tcb.state {
                TaskState::WaitingWithPacket => match tcb.queue.pop() {
                    Some(packet) => {
                        tcb.state = if tcb.queue.is_empty() {
                            TaskState::Runnable
                        } else {
                            TaskState::RunnableWithPacket
                        };
                        Some(packet)
                    }
                    None => {
                        let state = tcb.state;
                        log::error!("task {id} is waiting with a packet but its queue is empty");
                        return StopReason::InconsistentState { task: id, state };
                    }
                },
                TaskState::Runnable | TaskState::RunnableWithPacket => None,
                TaskState::Waiting
                | TaskState::Held
                | TaskState::HeldWithPacket
                | TaskState::HeldWaiting
                | TaskState::HeldWaitingWithPacket => {
                    current = tcb.link;
                    continue;
                }
            };

            let behavior = tcb.behavior;
            ctx.enter(tcb);
            let next = behavior::step(behavior, registry, ctx, packet);
            if let Ok(tcb) = registry.lookup_mut(id) {
                ctx.leave(tcb);
            }

            self.dispatches += 1;
            log::trace!("dispatched task {id}, next {next:?}");
            if let Some(trace) = self.trace.as_mut() {
                trace.events.push(DispatchEvent {
                    task: id,
                    next,
                    counters: ctx.counters,
                });
            }
            current = next;
        }
        StopReason::Quiesced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketQueue;
    use crate::task::Behavior;

    /// Build a registry from `(id, priority, state, behavior, a, b)` rows in creation order.
    fn registry_of(rows: &[(TaskId, i32, TaskState, Behavior, i64, i64)]) -> Registry {
        let mut registry = Registry::default();
        for &(id, priority, state, behavior, a, b) in rows {
            let scratch = Scratch::with_values(a, b);
            registry
                .create_task(Tcb::new(id, priority, PacketQueue::new(), state, behavior, scratch))
                .unwrap();
        }
        registry
    }

    #[test]
    fn released_higher_priority_task_runs_next() {
        // List order: idle -> work -> device A.
        let mut registry = registry_of(&[
            (TaskId::DEVICE_A, 4000, TaskState::Held, Behavior::Device, 0, 0),
            (TaskId::WORK, 1000, TaskState::Waiting, Behavior::Work, 0, 0),
            (TaskId::IDLE, 0, TaskState::Runnable, Behavior::Idle, 0, 2),
        ]);

        let mut ctx = DispatchContext::new();
        let mut dispatcher = Dispatcher::with_trace();
        assert_eq!(dispatcher.run(&mut registry, &mut ctx), StopReason::Quiesced);

        let order: Vec<TaskId> = dispatcher.trace().unwrap().tasks().collect();
        assert_eq!(order, vec![TaskId::IDLE, TaskId::DEVICE_A]);
        assert_eq!(dispatcher.dispatches(), 2);
    }

    #[test]
    fn lower_priority_release_keeps_list_order() {
        let mut registry = registry_of(&[
            (TaskId::DEVICE_A, 4000, TaskState::Held, Behavior::Device, 0, 0),
            (TaskId::WORK, 1000, TaskState::Waiting, Behavior::Work, 0, 0),
            (TaskId::IDLE, 5000, TaskState::Runnable, Behavior::Idle, 0, 2),
        ]);

        let mut ctx = DispatchContext::new();
        let mut dispatcher = Dispatcher::with_trace();
        dispatcher.run(&mut registry, &mut ctx);

        let order: Vec<TaskId> = dispatcher.trace().unwrap().tasks().collect();
        assert_eq!(order, vec![TaskId::IDLE, TaskId::IDLE, TaskId::DEVICE_A]);
        assert_eq!(ctx.counters.holds, 1);
    }

    #[test]
    fn scratch_state_survives_suspension() {
        let mut registry = registry_of(&[
            (TaskId::IDLE, 0, TaskState::Runnable, Behavior::Idle, 0, 3),
            (TaskId::DEVICE_A, -1, TaskState::Waiting, Behavior::Device, 0, 0),
        ]);

        let mut ctx = DispatchContext::new();
        Dispatcher::new().run(&mut registry, &mut ctx);
        let idle = registry.lookup(TaskId::IDLE).unwrap();
        assert_eq!(idle.scratch.b, 0);
        assert_eq!(idle.state, TaskState::Held);
    }

    #[test]
    fn waiting_with_empty_queue_stops_the_run() {
        let mut registry = registry_of(&[(
            TaskId::WORK,
            1000,
            TaskState::WaitingWithPacket,
            Behavior::Work,
            0,
            0,
        )]);
        let mut ctx = DispatchContext::new();
        let mut dispatcher = Dispatcher::new();
        assert_eq!(
            dispatcher.run(&mut registry, &mut ctx),
            StopReason::InconsistentState {
                task: TaskId::WORK,
                state: TaskState::WaitingWithPacket
            }
        );
        assert_eq!(dispatcher.dispatches(), 0);
    }

    #[test]
    fn empty_registry_quiesces_immediately() {
        let mut registry = Registry::default();
        let mut ctx = DispatchContext::new();
        assert_eq!(Dispatcher::new().run(&mut registry, &mut ctx), StopReason::Quiesced);
        assert_eq!(ctx.counters, Counters::default());
    }

    #[test]
    fn render_wraps_every_fifty_dispatches() {
        let event = DispatchEvent {
            task: TaskId::IDLE,
            next: None,
            counters: Counters::default(),
        };
        let trace = DispatchTrace {
            events: vec![event; 120],
        };
        let rendered = trace.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), 50);
        assert_eq!(lines[2], "1".repeat(20));
    }
}
