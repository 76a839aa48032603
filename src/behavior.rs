//! Step functions run by dispatched tasks.
//!
//! Each step consumes at most one packet and names the task the dispatcher should consider next.
//! Steps only see their own scratch state (through the [`DispatchContext`]) and the collaborator
//! operations of the [`Registry`].

use crate::packet::{Packet, PacketKind};
use crate::registry::Registry;
use crate::scheduler::DispatchContext;
use crate::task::{Behavior, TaskId};

/// Letters stamped into work payloads; index 0 is never used.
const ALPHABET: &[u8; 27] = b"0ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Mask keeping the idle task's rotating value within 15 bits.
const ROTATION_MASK: i64 = 0x7fff;
/// Feedback applied to the rotating value when its low bit is set.
const ROTATION_FEEDBACK: i64 = 0xd008;

/// Run the step function for `behavior`.
pub fn step(
    behavior: Behavior,
    registry: &mut Registry,
    ctx: &mut DispatchContext,
    packet: Option<Packet>,
) -> Option<TaskId> {
    match behavior {
        Behavior::Idle => idle(registry, ctx, packet),
        Behavior::Work => work(registry, ctx, packet),
        Behavior::Handler => handler(registry, ctx, packet),
        Behavior::Device => device(registry, ctx, packet),
    }
}

/// Scratch `b` is the remaining budget, scratch `a` the rotating value choosing the device.
///
/// Packets sent to the idle task are kept unprocessed in its work chain.
fn idle(
    registry: &mut Registry,
    ctx: &mut DispatchContext,
    packet: Option<Packet>,
) -> Option<TaskId> {
    if let Some(packet) = packet {
        log::warn!("idle task {} ignoring packet {}", ctx.task, packet.serial);
        ctx.scratch.work_chain.append(packet);
    }

    ctx.scratch.b -= 1;
    if ctx.scratch.b <= 0 {
        return registry.hold_current(ctx);
    }

    let value = ctx.scratch.a;
    if value & 1 == 0 {
        ctx.scratch.a = (value >> 1) & ROTATION_MASK;
        registry.release(ctx, TaskId::DEVICE_A)
    } else {
        ctx.scratch.a = ((value >> 1) & ROTATION_MASK) ^ ROTATION_FEEDBACK;
        registry.release(ctx, TaskId::DEVICE_B)
    }
}

/// Scratch `a` is the last handler served, scratch `b` the position in the alphabet.
fn work(
    registry: &mut Registry,
    ctx: &mut DispatchContext,
    packet: Option<Packet>,
) -> Option<TaskId> {
    let Some(mut packet) = packet else {
        return registry.wait_current(ctx);
    };

    ctx.scratch.a = i64::from(TaskId::HANDLER_A.0 + TaskId::HANDLER_B.0) - ctx.scratch.a;
    let dest = scratch_task_id(ctx.scratch.a);
    packet.origin = dest;
    packet.cursor = 0;
    for byte in packet.payload.iter_mut() {
        ctx.scratch.b = if (0..26).contains(&ctx.scratch.b) {
            ctx.scratch.b + 1
        } else {
            1
        };
        *byte = ALPHABET[ctx.scratch.b as usize];
    }
    registry.enqueue_to(ctx, dest, packet)
}

/// Backlogs live in the scratch work and device chains.
fn handler(
    registry: &mut Registry,
    ctx: &mut DispatchContext,
    packet: Option<Packet>,
) -> Option<TaskId> {
    if let Some(packet) = packet {
        match packet.kind {
            PacketKind::Work => ctx.scratch.work_chain.append(packet),
            PacketKind::Device => ctx.scratch.device_chain.append(packet),
        }
    }

    let next_byte = match ctx.scratch.work_chain.front() {
        Some(work) => work.current_byte(),
        None => return registry.wait_current(ctx),
    };

    match next_byte {
        // Every byte consumed: the work packet goes back to its producer.
        None => {
            if let Some(work) = ctx.scratch.work_chain.pop() {
                let dest = work.origin;
                return registry.enqueue_to(ctx, dest, work);
            }
        }
        Some(byte) => {
            if let Some(mut device) = ctx.scratch.device_chain.pop() {
                device.cursor = u32::from(byte);
                if let Some(work) = ctx.scratch.work_chain.front_mut() {
                    work.cursor += 1;
                }
                let dest = device.origin;
                return registry.enqueue_to(ctx, dest, device);
            }
        }
    }
    registry.wait_current(ctx)
}

/// A device keeps one packet parked across a hold before returning it.
fn device(
    registry: &mut Registry,
    ctx: &mut DispatchContext,
    packet: Option<Packet>,
) -> Option<TaskId> {
    match packet {
        None => match ctx.scratch.parked.take() {
            Some(parked) => {
                let dest = parked.origin;
                registry.enqueue_to(ctx, dest, parked)
            }
            None => registry.wait_current(ctx),
        },
        Some(packet) => {
            if let Some(previous) = ctx.scratch.parked.replace(packet) {
                log::warn!(
                    "device {} replaced parked packet {}",
                    ctx.task,
                    previous.serial
                );
            }
            registry.hold_current(ctx)
        }
    }
}

/// Scratch values name handlers by id; anything outside `u32` maps to the never-registered id 0.
fn scratch_task_id(value: i64) -> TaskId {
    TaskId(u32::try_from(value).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketQueue;
    use crate::task::{Scratch, TaskState, Tcb};

    fn registry_with(tasks: &[(TaskId, i32, TaskState, Behavior)]) -> Registry {
        let mut registry = Registry::default();
        for &(id, priority, state, behavior) in tasks {
            registry
                .create_task(Tcb::new(
                    id,
                    priority,
                    PacketQueue::new(),
                    state,
                    behavior,
                    Scratch::default(),
                ))
                .unwrap();
        }
        registry
    }

    fn context(task: TaskId, priority: i32, scratch: Scratch) -> DispatchContext {
        let mut ctx = DispatchContext::default();
        ctx.task = task;
        ctx.priority = priority;
        ctx.scratch = scratch;
        ctx
    }

    #[test]
    fn idle_alternates_devices_by_low_bit() {
        let mut registry = registry_with(&[
            (TaskId::IDLE, 0, TaskState::Runnable, Behavior::Idle),
            (TaskId::DEVICE_A, 4000, TaskState::Held, Behavior::Device),
            (TaskId::DEVICE_B, 5000, TaskState::Held, Behavior::Device),
        ]);
        let mut ctx = context(TaskId::IDLE, 0, Scratch::with_values(1, 10));

        // 1 is odd: rotate with feedback and release device B.
        assert_eq!(step(Behavior::Idle, &mut registry, &mut ctx, None), Some(TaskId::DEVICE_B));
        assert_eq!(ctx.scratch.a, 0xd008);
        assert_eq!(ctx.scratch.b, 9);
        assert_eq!(registry.lookup(TaskId::DEVICE_B).unwrap().state, TaskState::Runnable);

        // 0xd008 is even: plain shift and release device A.
        assert_eq!(step(Behavior::Idle, &mut registry, &mut ctx, None), Some(TaskId::DEVICE_A));
        assert_eq!(ctx.scratch.a, (0xd008 >> 1) & 0x7fff);
    }

    #[test]
    fn idle_holds_itself_when_budget_runs_out() {
        let mut registry = registry_with(&[
            (TaskId::IDLE, 0, TaskState::Runnable, Behavior::Idle),
            (TaskId::WORK, 1000, TaskState::Waiting, Behavior::Work),
        ]);
        let mut ctx = context(TaskId::IDLE, 0, Scratch::with_values(1, 1));
        assert_eq!(step(Behavior::Idle, &mut registry, &mut ctx, None), None);
        assert_eq!(ctx.counters.holds, 1);
        assert_eq!(registry.lookup(TaskId::IDLE).unwrap().state, TaskState::Held);
    }

    #[test]
    fn idle_keeps_stray_packets() {
        let mut registry =
            registry_with(&[(TaskId::IDLE, 0, TaskState::Runnable, Behavior::Idle)]);
        let mut ctx = context(TaskId::IDLE, 0, Scratch::with_values(1, 1));
        let packet = Packet::new(7, TaskId::WORK, PacketKind::Work);
        assert_eq!(step(Behavior::Idle, &mut registry, &mut ctx, Some(packet)), None);
        assert_eq!(ctx.counters.holds, 1);
        let kept: Vec<u32> = ctx.scratch.packets().map(|p| p.serial).collect();
        assert_eq!(kept, vec![7]);
    }

    #[test]
    fn work_without_packet_waits() {
        let mut registry =
            registry_with(&[(TaskId::WORK, 1000, TaskState::Runnable, Behavior::Work)]);
        let mut ctx = context(TaskId::WORK, 1000, Scratch::with_values(3, 0));
        assert_eq!(step(Behavior::Work, &mut registry, &mut ctx, None), Some(TaskId::WORK));
        assert_eq!(registry.lookup(TaskId::WORK).unwrap().state, TaskState::Waiting);
    }

    #[test]
    fn work_fills_payload_and_alternates_handlers() {
        let mut registry = registry_with(&[
            (TaskId::WORK, 1000, TaskState::Runnable, Behavior::Work),
            (TaskId::HANDLER_A, 2000, TaskState::Waiting, Behavior::Handler),
            (TaskId::HANDLER_B, 3000, TaskState::Waiting, Behavior::Handler),
        ]);
        let mut ctx = context(TaskId::WORK, 1000, Scratch::with_values(3, 24));

        let packet = Packet::new(0, TaskId(0), PacketKind::Work);
        let next = step(Behavior::Work, &mut registry, &mut ctx, Some(packet));
        assert_eq!(next, Some(TaskId::HANDLER_B));
        let queued = registry.lookup(TaskId::HANDLER_B).unwrap().queue.front().unwrap();
        assert_eq!(&queued.payload, b"YZAB");
        assert_eq!(queued.origin, TaskId::WORK);
        assert_eq!(ctx.scratch.b, 2);

        let packet = Packet::new(1, TaskId(0), PacketKind::Work);
        let next = step(Behavior::Work, &mut registry, &mut ctx, Some(packet));
        assert_eq!(next, Some(TaskId::HANDLER_A));
        let queued = registry.lookup(TaskId::HANDLER_A).unwrap().queue.front().unwrap();
        assert_eq!(&queued.payload, b"CDEF");
        assert_eq!(ctx.counters.queued_packets, 2);
    }

    #[test]
    fn handler_pairs_work_bytes_into_device_packets() {
        let mut registry = registry_with(&[
            (TaskId::HANDLER_A, 2000, TaskState::Runnable, Behavior::Handler),
            (TaskId::DEVICE_A, 4000, TaskState::Waiting, Behavior::Device),
        ]);
        let mut ctx = context(TaskId::HANDLER_A, 2000, Scratch::default());

        let device = Packet::new(0, TaskId::DEVICE_A, PacketKind::Device);
        // Only a device packet: nothing to pair yet.
        assert_eq!(
            step(Behavior::Handler, &mut registry, &mut ctx, Some(device)),
            Some(TaskId::HANDLER_A)
        );
        assert_eq!(ctx.scratch.device_chain.len(), 1);

        let mut work = Packet::new(1, TaskId::WORK, PacketKind::Work);
        work.payload = *b"QRST";
        let next = step(Behavior::Handler, &mut registry, &mut ctx, Some(work));
        assert_eq!(next, Some(TaskId::DEVICE_A));
        assert_eq!(ctx.scratch.work_chain.front().unwrap().cursor, 1);
        let sent = registry.lookup(TaskId::DEVICE_A).unwrap().queue.front().unwrap();
        assert_eq!(sent.cursor, u32::from(b'Q'));
        assert_eq!(sent.origin, TaskId::HANDLER_A);
    }

    #[test]
    fn handler_returns_exhausted_work_to_producer() {
        let mut registry = registry_with(&[
            (TaskId::WORK, 1000, TaskState::Waiting, Behavior::Work),
            (TaskId::HANDLER_A, 2000, TaskState::Runnable, Behavior::Handler),
        ]);
        let mut scratch = Scratch::default();
        let mut work = Packet::new(1, TaskId::WORK, PacketKind::Work);
        work.cursor = 4;
        scratch.work_chain.append(work);
        let mut ctx = context(TaskId::HANDLER_A, 2000, scratch);

        let next = step(Behavior::Handler, &mut registry, &mut ctx, None);
        assert_eq!(next, Some(TaskId::HANDLER_A));
        assert!(ctx.scratch.work_chain.is_empty());
        let producer = registry.lookup(TaskId::WORK).unwrap();
        assert_eq!(producer.state, TaskState::WaitingWithPacket);
        assert_eq!(producer.queue.front().unwrap().serial, 1);
    }

    #[test]
    fn device_parks_then_returns_packet() {
        let mut registry = registry_with(&[
            (TaskId::HANDLER_A, 2000, TaskState::Waiting, Behavior::Handler),
            (TaskId::IDLE, 0, TaskState::Runnable, Behavior::Idle),
            (TaskId::DEVICE_A, 4000, TaskState::Runnable, Behavior::Device),
        ]);
        let mut ctx = context(TaskId::DEVICE_A, 4000, Scratch::default());

        let packet = Packet::new(0, TaskId::HANDLER_A, PacketKind::Device);
        let next = step(Behavior::Device, &mut registry, &mut ctx, Some(packet));
        assert_eq!(next, Some(TaskId::IDLE));
        assert_eq!(ctx.counters.holds, 1);
        assert!(ctx.scratch.parked.is_some());

        let next = step(Behavior::Device, &mut registry, &mut ctx, None);
        assert_eq!(next, Some(TaskId::DEVICE_A));
        assert!(ctx.scratch.parked.is_none());
        assert_eq!(registry.lookup(TaskId::HANDLER_A).unwrap().queue.len(), 1);

        let next = step(Behavior::Device, &mut registry, &mut ctx, None);
        assert_eq!(next, Some(TaskId::DEVICE_A));
        assert!(registry.lookup(TaskId::DEVICE_A).unwrap().state.is_waiting());
    }

    #[test]
    fn out_of_range_scratch_values_map_to_unknown_id() {
        assert_eq!(scratch_task_id(-1), TaskId(0));
        assert_eq!(scratch_task_id(4), TaskId::HANDLER_B);
    }
}
