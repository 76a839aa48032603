//! Repeated, benchmark-style execution of a scenario.
//!
//! Repetitions are independent: every worker thread owns its own [`Scenario`] and runs
//! setup → run → teardown for each repetition index it pulls from a shared job channel. Reports
//! flow back over a second channel and are folded into a [`RepetitionSummary`] in repetition
//! order.

use crate::error::SchedError;
use crate::scenario::{RunReport, Scenario, ScenarioConfig};
use crossbeam_channel::unbounded;
use serde::Serialize;
use std::thread;

/// Aggregate of a batch of repetitions.
#[derive(Debug, Clone, Serialize)]
pub struct RepetitionSummary {
    pub runs: usize,
    /// Runs whose counters matched the expectation (all runs when none is configured).
    pub passed: usize,
    /// Counter mismatches, one entry per failing run.
    pub mismatches: Vec<SchedError>,
    /// Whether every run produced the same outcome as the first one.
    pub deterministic: bool,
    /// Report of the first repetition.
    pub first: Option<RunReport>,
}

impl RepetitionSummary {
    pub fn all_passed(&self) -> bool {
        self.mismatches.is_empty() && self.deterministic
    }
}

/// Run `reps` repetitions of `config` spread over `workers` threads.
///
/// Fails only when the configuration cannot be set up; counter mismatches are reported in the
/// summary. When tracing is enabled only the first repetition records a trace.
pub fn run_repetitions(
    config: &ScenarioConfig,
    reps: usize,
    workers: usize,
) -> Result<RepetitionSummary, SchedError> {
    let reports = run_reports(config, reps, workers)?;
    Ok(summarize(config, reports))
}

fn run_reports(
    config: &ScenarioConfig,
    reps: usize,
    workers: usize,
) -> Result<Vec<RunReport>, SchedError> {
    let workers = workers.clamp(1, reps.max(1));
    let (job_tx, job_rx) = unbounded::<usize>();
    let (result_tx, result_rx) = unbounded::<(usize, Result<RunReport, SchedError>)>();

    for rep in 0..reps {
        job_tx.send(rep).ok();
    }
    drop(job_tx);

    log::debug!("running {reps} repetitions on {workers} workers");
    thread::scope(|scope| {
        for _ in 0..workers {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let config = config.clone();
            scope.spawn(move || {
                let mut scenario = Scenario::new(config.clone().with_trace(false));
                for rep in jobs.iter() {
                    let outcome = if rep == 0 && config.trace {
                        run_one(&mut Scenario::new(config.clone()))
                    } else {
                        run_one(&mut scenario)
                    };
                    if results.send((rep, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut outcomes: Vec<(usize, Result<RunReport, SchedError>)> = result_rx.iter().collect();
    outcomes.sort_by_key(|(rep, _)| *rep);
    outcomes.into_iter().map(|(_, outcome)| outcome).collect()
}

/// Setup, run and teardown, leaving verification to the summary.
fn run_one(scenario: &mut Scenario) -> Result<RunReport, SchedError> {
    scenario.setup()?;
    let report = scenario.run();
    scenario.teardown();
    Ok(report)
}

fn summarize(config: &ScenarioConfig, reports: Vec<RunReport>) -> RepetitionSummary {
    let mismatches: Vec<SchedError> = match &config.expected {
        Some(expected) => reports
            .iter()
            .filter_map(|report| report.verify(expected).err())
            .collect(),
        None => Vec::new(),
    };
    let deterministic = match reports.first() {
        Some(first) => reports.iter().all(|report| report.same_outcome(first)),
        None => true,
    };
    let summary = RepetitionSummary {
        runs: reports.len(),
        passed: reports.len() - mismatches.len(),
        mismatches,
        deterministic,
        first: reports.into_iter().next(),
    };
    if summary.all_passed() {
        log::info!("{} repetitions passed", summary.runs);
    } else {
        log::warn!(
            "{} of {} repetitions failed (deterministic: {})",
            summary.mismatches.len(),
            summary.runs,
            summary.deterministic
        );
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Counters, StopReason};

    fn report(queued_packets: u64, holds: u64) -> RunReport {
        RunReport {
            counters: Counters {
                queued_packets,
                holds,
            },
            dispatches: 10,
            stop: StopReason::Quiesced,
            faults: Vec::new(),
            trace: None,
        }
    }

    #[test]
    fn summary_counts_mismatches_and_nondeterminism() {
        let config = ScenarioConfig::default();
        let summary = summarize(&config, vec![report(23_246, 9_297), report(1, 1)]);
        assert_eq!(summary.runs, 2);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.mismatches.len(), 1);
        assert!(!summary.deterministic);
        assert!(!summary.all_passed());
    }

    #[test]
    fn empty_batch_is_trivially_fine() {
        let summary = run_repetitions(&ScenarioConfig::standard(5), 0, 4).unwrap();
        assert_eq!(summary.runs, 0);
        assert!(summary.first.is_none());
        assert!(summary.all_passed());
    }

    #[test]
    fn setup_errors_abort_the_batch() {
        let mut config = ScenarioConfig::standard(5);
        config.registry_capacity = 2;
        assert!(matches!(
            run_repetitions(&config, 3, 2),
            Err(SchedError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn only_the_first_repetition_keeps_a_trace() {
        let config = ScenarioConfig::standard(200).with_trace(true);
        let reports = run_reports(&config, 5, 2).unwrap();
        assert_eq!(reports.len(), 5);
        assert!(reports[0].trace.as_ref().is_some_and(|trace| !trace.is_empty()));
        assert!(reports[1..].iter().all(|report| report.trace.is_none()));

        let summary = run_repetitions(&config, 5, 2).unwrap();
        assert!(summary.first.as_ref().is_some_and(|first| first.trace.is_some()));
        assert!(summary.deterministic);
    }

    #[test]
    fn untraced_batches_record_nothing() {
        let reports = run_reports(&ScenarioConfig::standard(50), 3, 1).unwrap();
        assert!(reports.iter().all(|report| report.trace.is_none()));
    }

    #[test]
    fn small_batches_agree() {
        let summary = run_repetitions(&ScenarioConfig::standard(200), 6, 3).unwrap();
        assert_eq!(summary.runs, 6);
        assert!(summary.deterministic);
        assert!(summary.all_passed());
    }
}
