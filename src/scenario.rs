//! Scenario configuration and lifecycle.
//!
//! A scenario builds a task graph from a [`ScenarioConfig`], runs the dispatcher until it
//! quiesces, and tears everything down again so the same scenario can be rerun from a pristine
//! registry any number of times.

use crate::error::SchedError;
use crate::packet::{Packet, PacketKind, PacketQueue};
use crate::registry::{Registry, DEFAULT_CAPACITY};
use crate::scheduler::{Counters, DispatchContext, DispatchTrace, Dispatcher, StopReason};
use crate::task::{Behavior, Scratch, TaskId, TaskState, Tcb};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Idle iterations of the reference scenario.
pub const STANDARD_IDLE_BUDGET: i64 = 10_000;

/// Counters the reference scenario must end with.
pub const STANDARD_EXPECTED: ExpectedCounters = ExpectedCounters {
    queued_packets: 23_246,
    holds: 9_297,
};

/// Totals a run is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedCounters {
    pub queued_packets: u64,
    pub holds: u64,
}

/// One packet preloaded on a task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketConfig {
    /// Initial tag; handlers send device packets back to it.
    #[serde(default)]
    pub origin: TaskId,
    pub kind: PacketKind,
}

/// Initial shape of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: TaskId,
    pub priority: i32,
    pub behavior: Behavior,
    pub state: TaskState,
    #[serde(default)]
    pub scratch_a: i64,
    #[serde(default)]
    pub scratch_b: i64,
    /// Preloaded queue, head first.
    #[serde(default)]
    pub packets: Vec<PacketConfig>,
}

/// Complete description of a scenario.
///
/// Tasks are created in the listed order, so the last one listed heads the dispatch list. Fields
/// missing from a configuration file fall back to the standard layout, except `expected`, which
/// stays unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Number of registry slots; ids `1..=registry_capacity` are addressable.
    pub registry_capacity: usize,
    pub tasks: Vec<TaskConfig>,
    /// Counters a run must produce, when known.
    #[serde(default)]
    pub expected: Option<ExpectedCounters>,
    /// Record a dispatch trace for each run.
    pub trace: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig::standard(STANDARD_IDLE_BUDGET)
    }
}

impl ScenarioConfig {
    /// The reference layout: idle, work, two handlers, two devices.
    ///
    /// Expected counters are only attached for the reference budget.
    pub fn standard(idle_budget: i64) -> Self {
        let devices_for = |origin: TaskId| {
            vec![
                PacketConfig {
                    origin,
                    kind: PacketKind::Device,
                };
                3
            ]
        };
        let work_packets = vec![
            PacketConfig {
                origin: TaskId::default(),
                kind: PacketKind::Work,
            };
            2
        ];

        let tasks = vec![
            TaskConfig {
                id: TaskId::IDLE,
                priority: 0,
                behavior: Behavior::Idle,
                state: TaskState::Runnable,
                scratch_a: 1,
                scratch_b: idle_budget,
                packets: Vec::new(),
            },
            TaskConfig {
                id: TaskId::WORK,
                priority: 1000,
                behavior: Behavior::Work,
                state: TaskState::WaitingWithPacket,
                scratch_a: i64::from(TaskId::HANDLER_A.0),
                scratch_b: 0,
                packets: work_packets,
            },
            TaskConfig {
                id: TaskId::HANDLER_A,
                priority: 2000,
                behavior: Behavior::Handler,
                state: TaskState::WaitingWithPacket,
                scratch_a: 0,
                scratch_b: 0,
                packets: devices_for(TaskId::DEVICE_A),
            },
            TaskConfig {
                id: TaskId::HANDLER_B,
                priority: 3000,
                behavior: Behavior::Handler,
                state: TaskState::WaitingWithPacket,
                scratch_a: 0,
                scratch_b: 0,
                packets: devices_for(TaskId::DEVICE_B),
            },
            TaskConfig {
                id: TaskId::DEVICE_A,
                priority: 4000,
                behavior: Behavior::Device,
                state: TaskState::Waiting,
                scratch_a: 0,
                scratch_b: 0,
                packets: Vec::new(),
            },
            TaskConfig {
                id: TaskId::DEVICE_B,
                priority: 5000,
                behavior: Behavior::Device,
                state: TaskState::Waiting,
                scratch_a: 0,
                scratch_b: 0,
                packets: Vec::new(),
            },
        ];

        ScenarioConfig {
            registry_capacity: DEFAULT_CAPACITY,
            tasks,
            expected: (idle_budget == STANDARD_IDLE_BUDGET).then_some(STANDARD_EXPECTED),
            trace: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, SchedError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchedError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Override the budget of every idle task.
    ///
    /// Expected counters no longer apply once the budget changes and are dropped.
    pub fn with_idle_budget(mut self, budget: i64) -> Self {
        let mut changed = false;
        for task in self
            .tasks
            .iter_mut()
            .filter(|task| task.behavior == Behavior::Idle)
        {
            changed |= task.scratch_b != budget;
            task.scratch_b = budget;
        }
        if changed {
            self.expected = None;
        }
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Number of packets the scenario allocates.
    pub fn packet_count(&self) -> usize {
        self.tasks.iter().map(|task| task.packets.len()).sum()
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    #[serde(flatten)]
    pub counters: Counters,
    /// Step functions executed.
    pub dispatches: u64,
    pub stop: StopReason,
    /// Non-fatal faults, in the order they happened.
    pub faults: Vec<SchedError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<DispatchTrace>,
}

impl RunReport {
    /// Compare the final counters with `expected`.
    pub fn verify(&self, expected: &ExpectedCounters) -> Result<(), SchedError> {
        if self.counters.queued_packets == expected.queued_packets
            && self.counters.holds == expected.holds
        {
            Ok(())
        } else {
            Err(SchedError::CounterMismatch {
                expected: (expected.queued_packets, expected.holds),
                actual: (self.counters.queued_packets, self.counters.holds),
            })
        }
    }

    /// Same report, ignoring the trace.
    pub fn same_outcome(&self, other: &RunReport) -> bool {
        self.counters == other.counters
            && self.dispatches == other.dispatches
            && self.stop == other.stop
            && self.faults == other.faults
    }
}

/// A configured task graph plus the state of its current run.
#[derive(Debug)]
pub struct Scenario {
    config: ScenarioConfig,
    registry: Registry,
    ctx: DispatchContext,
}

impl Scenario {
    pub fn new(config: ScenarioConfig) -> Self {
        let registry = Registry::with_capacity(config.registry_capacity);
        Self {
            config,
            registry,
            ctx: DispatchContext::new(),
        }
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Allocate packets and tasks from the configuration.
    ///
    /// Anything left from a previous run is torn down first.
    pub fn setup(&mut self) -> Result<(), SchedError> {
        self.teardown();
        let mut serial = 0u32;
        for task in &self.config.tasks {
            let queue: PacketQueue = task
                .packets
                .iter()
                .map(|packet| {
                    let p = Packet::new(serial, packet.origin, packet.kind);
                    serial += 1;
                    p
                })
                .collect();
            let tcb = Tcb::new(
                task.id,
                task.priority,
                queue,
                task.state,
                task.behavior,
                Scratch::with_values(task.scratch_a, task.scratch_b),
            );
            if let Err(err) = self.registry.create_task(tcb) {
                self.registry.clear();
                return Err(err);
            }
        }
        log::debug!(
            "scenario ready: {} tasks, {} packets",
            self.registry.len(),
            serial
        );
        Ok(())
    }

    /// Dispatch until quiescence and report the counters.
    pub fn run(&mut self) -> RunReport {
        let mut dispatcher = if self.config.trace {
            Dispatcher::with_trace()
        } else {
            Dispatcher::new()
        };
        let stop = dispatcher.run(&mut self.registry, &mut self.ctx);
        let report = RunReport {
            counters: self.ctx.counters,
            dispatches: dispatcher.dispatches(),
            stop,
            faults: self.ctx.faults.clone(),
            trace: dispatcher.take_trace(),
        };
        log::info!(
            "run finished: queued packets {}, holds {}, dispatches {}",
            report.counters.queued_packets,
            report.counters.holds,
            report.dispatches
        );
        report
    }

    /// Every packet currently owned by a task.
    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.registry.packets()
    }

    /// Release all tasks and packets and zero the counters.
    pub fn teardown(&mut self) {
        self.registry.clear();
        self.ctx.reset();
    }

    /// Setup, run, verify against the configured expectation, teardown.
    ///
    /// A counter mismatch is returned as an error only after teardown has happened.
    pub fn run_once(&mut self) -> Result<RunReport, SchedError> {
        self.setup()?;
        let report = self.run();
        self.teardown();
        if let Some(expected) = &self.config.expected {
            report.verify(expected)?;
        }
        Ok(report)
    }
}
