//! Deterministic cooperative task scheduler.
//!
//! Tasks sit in a fixed dispatch list, pass fixed-size packets to each other through per-task
//! queues, and hand control back to the dispatcher after every step. A run ends once no task is
//! left to consider; the number of packets queued and the number of self-holds are its observable
//! result.

pub mod behavior;
pub mod error;
pub mod logger;
pub mod packet;
pub mod registry;
pub mod runner;
pub mod scenario;
pub mod scheduler;
pub mod task;

// Re-export for easier testing
pub use error::SchedError;
pub use packet::{Packet, PacketKind, PacketQueue};
pub use registry::Registry;
pub use runner::{run_repetitions, RepetitionSummary};
pub use scenario::{ExpectedCounters, RunReport, Scenario, ScenarioConfig};
pub use scheduler::{Counters, DispatchContext, DispatchTrace, Dispatcher, StopReason};
pub use task::{Behavior, TaskId, TaskState, Tcb};
