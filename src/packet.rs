//! Packet representation and the owned FIFO queues packets travel through.

use crate::task::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of payload bytes carried by every packet.
pub const PAYLOAD_SIZE: usize = 4;

/// Queue a packet belongs to once it reaches a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    /// Produced by the work task, consumed byte by byte by a handler.
    Work,
    /// Shuttled between a handler and its device.
    Device,
}

/// Fixed-shape message unit handed between tasks.
///
/// `origin` is the task that most recently queued the packet, which is also where the next hop
/// sends it back to. On device packets `cursor` carries the last byte paired in by a handler; on
/// work packets it counts the payload bytes already consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Packet {
    /// Allocation order inside its scenario, stable for the packet's whole life.
    pub serial: u32,
    pub origin: TaskId,
    pub kind: PacketKind,
    pub cursor: u32,
    pub payload: [u8; PAYLOAD_SIZE],
}

impl Packet {
    /// Create a zeroed packet tagged with `origin`.
    pub fn new(serial: u32, origin: TaskId, kind: PacketKind) -> Packet {
        Packet {
            serial,
            origin,
            kind,
            cursor: 0,
            payload: [0; PAYLOAD_SIZE],
        }
    }

    /// Payload byte at the current cursor, `None` once every byte was consumed.
    pub fn current_byte(&self) -> Option<u8> {
        self.payload.get(self.cursor as usize).copied()
    }
}

/// Singly-owned FIFO of packets.
///
/// Appending moves the packet into the queue, so a packet is reachable from at most one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketQueue {
    packets: VecDeque<Packet>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link `packet` at the tail.
    pub fn append(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    /// Unlink and return the head packet.
    pub fn pop(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    pub fn front(&self) -> Option<&Packet> {
        self.packets.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut Packet> {
        self.packets.front_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    /// Release every packet held by the queue.
    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

impl FromIterator<Packet> for PacketQueue {
    fn from_iter<I: IntoIterator<Item = Packet>>(iter: I) -> Self {
        PacketQueue {
            packets: iter.into_iter().collect(),
        }
    }
}
