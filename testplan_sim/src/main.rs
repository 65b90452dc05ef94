//! Test plan simulator CLI
//!
//! Runs push, pull and profile-exchange scenarios with fault injection.

use clap::Parser;
use testplan_sim::scenarios::ScenarioId;
use testplan_sim::{ScenarioResult, ScenarioRunner, SimExport};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Parses `a:b` into a node pair.
fn parse_pair(s: &str) -> Result<(usize, usize), String> {
    let (a, b) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <a>:<b>, got {s:?}"))?;
    let a = a.trim().parse().map_err(|_| format!("invalid node index {a:?}"))?;
    let b = b.trim().parse().map_err(|_| format!("invalid node index {b:?}"))?;
    Ok((a, b))
}

/// Parses `a:b:rate` into a lossy link.
fn parse_loss(s: &str) -> Result<(usize, usize, f64), String> {
    let (pair, rate) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected <a>:<b>:<rate>, got {s:?}"))?;
    let (a, b) = parse_pair(pair)?;
    let rate: f64 = rate.trim().parse().map_err(|_| format!("invalid loss rate {rate:?}"))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(format!("loss rate {rate} is outside 0..=1"));
    }
    Ok((a, b, rate))
}

/// Test plan simulation CLI
#[derive(Parser, Debug)]
#[command(name = "testplan-sim")]
#[command(about = "Run dataset transfer test plans in one process", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of nodes per run
    #[arg(short, long, default_value = "4")]
    nodes: usize,

    /// Scenario to run (push, pull, profile_exchange, partitioned_push, rejecting_remote, slow_links, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Role ratio (initiators per responder)
    #[arg(short, long)]
    ratio: Option<u64>,

    /// Rows in each generated dataset
    #[arg(long)]
    dataset_size: Option<usize>,

    /// Run timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Per-scenario wait timeout in seconds
    #[arg(long)]
    scenario_timeout: Option<u64>,

    /// Link latency in milliseconds, applied during network setup
    #[arg(long)]
    latency: Option<u64>,

    /// Partition node a from node b (repeatable, `a:b`)
    #[arg(long, value_parser = parse_pair)]
    partition: Vec<(usize, usize)>,

    /// Drop messages from node a to node b at a rate in 0..=1 (repeatable, `a:b:rate`)
    #[arg(long, value_parser = parse_loss)]
    loss: Vec<(usize, usize, f64)>,

    /// Make a node reject every transfer it serves (repeatable)
    #[arg(long)]
    reject_transfers: Vec<usize>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export every run to a JSON file
    #[arg(long)]
    export: Option<String>,
}

impl Args {
    fn runner(&self, seed: u64) -> ScenarioRunner {
        let mut runner = ScenarioRunner::new(seed, self.nodes);
        if let Some(ratio) = self.ratio {
            runner = runner.with_ratio(ratio);
        }
        if let Some(rows) = self.dataset_size {
            runner = runner.with_dataset_size(rows);
        }
        if let Some(secs) = self.timeout {
            runner = runner.with_timeout(secs);
        }
        if let Some(secs) = self.scenario_timeout {
            runner = runner.with_scenario_timeout(secs);
        }
        if let Some(ms) = self.latency {
            runner = runner.with_latency(ms);
        }
        for &(a, b) in &self.partition {
            runner = runner.with_partition(a, b);
        }
        for &(a, b, rate) in &self.loss {
            runner = runner.with_loss(a, b, rate);
        }
        for &index in &self.reject_transfers {
            runner = runner.with_rejecting(index);
        }
        runner
    }
}

fn report(result: &ScenarioResult) {
    if result.passed {
        info!(
            "✓ {} (seed={}) PASSED in {}ms",
            result.scenario.name(),
            result.seed,
            result.elapsed_ms
        );
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }

    for node in &result.nodes {
        info!(
            "    node {} {:<24} seq={:<4} role={:<9} state={:<12} peers={} profiles={} logs={}",
            node.index,
            node.peername,
            node.seq.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            node.role.as_deref().unwrap_or("-"),
            node.state,
            node.peers,
            node.profiles,
            node.foreign_logs
        );
        for failure in &node.failures {
            info!("      failure: {}", failure);
        }
        if let Some(fatal) = &node.fatal {
            error!("      fatal: {}", fatal);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error: failed to set tracing subscriber: {}", e);
        std::process::exit(1);
    }

    if !args.json {
        info!("Test plan simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<_> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                std::process::exit(1);
            }
        }
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    let mut export = SimExport::new(base_seed, args.nodes);

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = args.runner(seed);

        for scenario in &scenarios {
            let result = runner.run(*scenario).await;
            if !args.json {
                report(&result);
            }
            export.add_result(result);
        }
    }

    if let Some(path) = &args.export {
        match export.write_to_file(path) {
            Ok(()) => info!("Exported {} runs to {}", export.total(), path),
            Err(e) => error!("Failed to write export: {:?}", e),
        }
    }

    if args.json {
        // JSON output for CI parsing
        let summary = serde_json::json!({
            "total": export.total(),
            "passed": export.passed,
            "failed": export.failed,
            "results": export.results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "elapsed_ms": r.elapsed_ms,
                    "failures": r.failure_count(),
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to render summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if export.failed == 0 {
            info!("✅ All {} scenario runs passed!", export.total());
        } else {
            error!("❌ {}/{} scenario runs failed!", export.failed, export.total());

            // List failed seeds
            for result in export.results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if export.failed > 0 {
        std::process::exit(1);
    }
}
