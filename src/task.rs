//! Task control blocks and the closed state machine they move through.

use crate::packet::{Packet, PacketQueue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Task identity, doubling as the registry slot index (slots start at 1).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub u32);

impl TaskId {
    pub const IDLE: TaskId = TaskId(1);
    pub const WORK: TaskId = TaskId(2);
    pub const HANDLER_A: TaskId = TaskId(3);
    pub const HANDLER_B: TaskId = TaskId(4);
    pub const DEVICE_A: TaskId = TaskId(5);
    pub const DEVICE_B: TaskId = TaskId(6);

    /// One-character label used by the dispatch trace.
    pub fn trace_char(self) -> char {
        char::from_digit(self.0 % 36, 36).unwrap_or('?')
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const PACKET_BIT: u8 = 1;
const WAIT_BIT: u8 = 2;
const HOLD_BIT: u8 = 4;

/// Every combination of the packet, wait and hold flags a task can be in.
///
/// Transitions are expressed as flag updates (`with_wait`, `with_hold`, ...) so behaviours never
/// build a state from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Runnable,
    RunnableWithPacket,
    Waiting,
    WaitingWithPacket,
    Held,
    HeldWithPacket,
    HeldWaiting,
    HeldWaitingWithPacket,
}

impl TaskState {
    const fn bits(self) -> u8 {
        match self {
            TaskState::Runnable => 0,
            TaskState::RunnableWithPacket => PACKET_BIT,
            TaskState::Waiting => WAIT_BIT,
            TaskState::WaitingWithPacket => WAIT_BIT | PACKET_BIT,
            TaskState::Held => HOLD_BIT,
            TaskState::HeldWithPacket => HOLD_BIT | PACKET_BIT,
            TaskState::HeldWaiting => HOLD_BIT | WAIT_BIT,
            TaskState::HeldWaitingWithPacket => HOLD_BIT | WAIT_BIT | PACKET_BIT,
        }
    }

    const fn from_bits(bits: u8) -> TaskState {
        match bits & (HOLD_BIT | WAIT_BIT | PACKET_BIT) {
            0 => TaskState::Runnable,
            PACKET_BIT => TaskState::RunnableWithPacket,
            WAIT_BIT => TaskState::Waiting,
            3 => TaskState::WaitingWithPacket,
            HOLD_BIT => TaskState::Held,
            5 => TaskState::HeldWithPacket,
            6 => TaskState::HeldWaiting,
            _ => TaskState::HeldWaitingWithPacket,
        }
    }

    /// Suspend until a packet arrives.
    pub const fn with_wait(self) -> TaskState {
        TaskState::from_bits(self.bits() | WAIT_BIT)
    }

    /// Suspend until another task releases this one.
    pub const fn with_hold(self) -> TaskState {
        TaskState::from_bits(self.bits() | HOLD_BIT)
    }

    pub const fn without_hold(self) -> TaskState {
        TaskState::from_bits(self.bits() & !HOLD_BIT)
    }

    /// Mark pending work on the task's queue.
    pub const fn with_packet(self) -> TaskState {
        TaskState::from_bits(self.bits() | PACKET_BIT)
    }

    pub const fn is_held(self) -> bool {
        self.bits() & HOLD_BIT != 0
    }

    pub const fn is_waiting(self) -> bool {
        self.bits() & WAIT_BIT != 0
    }
}

/// Step function a task runs when dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    /// Burns an iteration budget, alternately releasing the two devices.
    Idle,
    /// Fills packets and sends them alternately to the two handlers.
    Work,
    /// Pairs work-packet bytes into device packets.
    Handler,
    /// Parks one device packet per cycle and sends it back to its handler.
    Device,
}

/// Private state a task carries across suspensions.
///
/// Moved into the dispatch context for the duration of a dispatch and moved back afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scratch {
    pub a: i64,
    pub b: i64,
    /// Handler backlog of work packets.
    pub work_chain: PacketQueue,
    /// Handler backlog of device packets.
    pub device_chain: PacketQueue,
    /// Packet a device holds between two dispatches.
    pub parked: Option<Packet>,
}

impl Scratch {
    pub fn with_values(a: i64, b: i64) -> Scratch {
        Scratch {
            a,
            b,
            ..Scratch::default()
        }
    }

    /// Every packet the scratch state currently owns.
    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.work_chain
            .iter()
            .chain(self.device_chain.iter())
            .chain(self.parked.iter())
    }
}

/// Task control block.
#[derive(Debug, Clone)]
pub struct Tcb {
    pub id: TaskId,
    /// Higher runs first when a release or send hands control over.
    pub priority: i32,
    pub queue: PacketQueue,
    pub state: TaskState,
    pub behavior: Behavior,
    pub scratch: Scratch,
    /// Next task in the dispatch list.
    pub link: Option<TaskId>,
}

impl Tcb {
    pub fn new(
        id: TaskId,
        priority: i32,
        queue: PacketQueue,
        state: TaskState,
        behavior: Behavior,
        scratch: Scratch,
    ) -> Tcb {
        Tcb {
            id,
            priority,
            queue,
            state,
            behavior,
            scratch,
            link: None,
        }
    }

    /// Every packet owned by this task, queued or in scratch state.
    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.queue.iter().chain(self.scratch.packets())
    }
}
