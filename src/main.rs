// Benchmark driver - runs the cooperative scheduler scenario repeatedly
//
// The binary loads (or builds) a scenario configuration, runs it the requested number of times,
// prints the counters and exits with an error when any run misses the expected totals.

use coopsched::logger;
use coopsched::{run_repetitions, RepetitionSummary, ScenarioConfig, SchedError};
use log::LevelFilter;
use std::error::Error;

/// Repetitions of the original benchmark driver.
const DEFAULT_REPS: usize = 100;

/// Command-line options parsed from program arguments.
struct CliOptions {
    /// JSON scenario file; the standard layout when absent
    config: Option<String>,
    /// Idle budget override
    count: Option<i64>,
    /// Number of independent repetitions
    reps: usize,
    /// Worker threads sharing the repetitions
    workers: usize,
    /// Print the dispatch trace of the first repetition
    trace: bool,
    /// Print the summary as JSON instead of text
    json: bool,
    log_level: LevelFilter,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            config: None,
            count: None,
            reps: DEFAULT_REPS,
            workers: 1,
            trace: false,
            json: false,
            log_level: LevelFilter::Warn,
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{key} expects a number, got '{value}'"))
}

/// Apply one `--key value` pair.
fn apply_option(options: &mut CliOptions, key: &str, value: &str) -> Result<(), String> {
    match key {
        "--config" => options.config = Some(value.to_string()),
        "--count" => options.count = Some(parse_number(key, value)?),
        "--reps" => options.reps = parse_number(key, value)?,
        "--workers" => options.workers = parse_number(key, value)?,
        "--log-level" => {
            options.log_level = logger::parse_level(value)
                .ok_or_else(|| format!("unknown log level '{value}'"))?;
        }
        _ => return Err(format!("unknown option '{key}'")),
    }
    Ok(())
}

/// Parse command-line arguments into `CliOptions`.
///
/// Value options accept both `--key=value` and `--key value`:
/// - `--config <path>`: load the scenario from a JSON file
/// - `--count <n>`: idle iteration budget (drops the expected counters unless 10000)
/// - `--reps <n>`: number of repetitions (default 100)
/// - `--workers <n>`: threads sharing the repetitions (default 1)
/// - `--log-level <level>`: off, error, warn, info, debug or trace
///
/// Flags: `--trace`, `--json`.
fn parse_cli_options(args: impl IntoIterator<Item = String>) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--trace" => options.trace = true,
            "--json" => options.json = true,
            _ => {
                if let Some((key, value)) = arg.split_once('=') {
                    apply_option(&mut options, key, value)?;
                } else {
                    let value = args
                        .next()
                        .ok_or_else(|| format!("{arg} expects a value"))?;
                    apply_option(&mut options, &arg, &value)?;
                }
            }
        }
    }
    Ok(options)
}

/// Build the scenario to run: the file (or the standard layout) with the flags given on top.
fn resolve_config(options: &CliOptions) -> Result<ScenarioConfig, SchedError> {
    let mut config = match &options.config {
        Some(path) => ScenarioConfig::load(path)?,
        None => ScenarioConfig::default(),
    };
    if let Some(count) = options.count {
        config = config.with_idle_budget(count);
    }
    if options.trace {
        config = config.with_trace(true);
    }
    Ok(config)
}

fn print_summary(summary: &RepetitionSummary, trace: bool) {
    if let Some(first) = &summary.first {
        if trace {
            if let Some(rendered) = first.trace.as_ref().map(|t| t.render()) {
                println!("{rendered}");
            }
        }
        println!(
            "qpkt count = {}  holdcount = {}  dispatches = {}",
            first.counters.queued_packets, first.counters.holds, first.dispatches
        );
        for fault in &first.faults {
            println!("fault: {fault}");
        }
    }
    println!(
        "{} runs, {} passed, deterministic: {}",
        summary.runs, summary.passed, summary.deterministic
    );
}

fn main() -> Result<(), Box<dyn Error>> {
    let options = parse_cli_options(std::env::args().skip(1))?;
    logger::init(options.log_level);

    let config = resolve_config(&options)?;
    let summary = run_repetitions(&config, options.reps, options.workers)?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, config.trace);
    }

    if let Some(mismatch) = summary.mismatches.first() {
        return Err(mismatch.clone().into());
    }
    if !summary.deterministic {
        return Err("repetitions disagreed with each other".into());
    }
    Ok(())
}
