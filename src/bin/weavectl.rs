use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weave_runtime::runtime::Configuration;
use weave_runtime::strategy::StrategyKind;
use weave_runtime::{RuntimeHandle, Signal, TestRunner};

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Explore a bundled demo workload under systematic scheduling
    Explore {
        /// Workload name (see `weavectl list`)
        workload: String,
        /// Number of iterations to explore
        #[clap(long, default_value_t = 100u32)]
        iterations: u32,
        /// Scheduling-step budget per iteration
        #[clap(long, default_value_t = 10_000u32)]
        steps: u32,
        /// Strategy seed for deterministic replay
        #[clap(long, default_value_t = 0u64)]
        seed: u64,
        /// Scheduling strategy
        #[clap(long, default_value = "random")]
        strategy: String,
        /// Per-iteration deadline in milliseconds
        #[clap(long, default_value_t = 10_000u64)]
        timeout_ms: u64,
    },
    /// List the bundled demo workloads
    List,
}

type Workload = fn(RuntimeHandle);

const WORKLOADS: &[(&str, &str, Workload)] = &[
    (
        "racy-counter",
        "two workers race a read-modify-write on a shared counter",
        racy_counter,
    ),
    (
        "deadlock",
        "two workers each wait for a signal only the other would set",
        deadlock,
    ),
    (
        "handoff",
        "producer publishes a value and signals a waiting consumer",
        handoff,
    ),
];

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Explore {
            workload,
            iterations,
            steps,
            seed,
            strategy,
            timeout_ms,
        } => explore_command(&workload, iterations, steps, seed, &strategy, timeout_ms),
        Command::List => {
            for (name, description, _) in WORKLOADS {
                println!("{:<14} {}", name, description);
            }
            Ok(())
        }
    }
}

fn explore_command(
    workload_name: &str,
    iterations: u32,
    steps: u32,
    seed: u64,
    strategy: &str,
    timeout_ms: u64,
) -> Result<()> {
    let (_, _, workload) = WORKLOADS
        .iter()
        .find(|(name, _, _)| *name == workload_name)
        .ok_or_else(|| anyhow!("unknown workload {:?}; try `weavectl list`", workload_name))?;
    let strategy_kind: StrategyKind = strategy
        .parse()
        .map_err(|e: String| anyhow!(e))?;

    let config = Configuration {
        iteration_count: iterations,
        max_scheduling_steps: steps,
        timeout: Duration::from_millis(timeout_ms),
        seed,
        strategy_kind,
        is_coverage_enabled: true,
    };
    println!(
        "weavectl: exploring {} ({} iterations, strategy={}, seed={})",
        workload_name, iterations, strategy, seed
    );

    let mut runner = TestRunner::new(config)?;
    let report = runner.run(*workload)?;

    let out_dir = report.write_artifacts(&std::env::current_dir()?)?;
    println!(
        "Explored {} iterations, {} transitions covered. Artifacts written to: {}",
        report.iterations.len(),
        report.coverage.transition_count(),
        out_dir.display()
    );

    if let Some(bug) = report.first_bug() {
        println!(
            "Bug found in iteration {} after {} steps: {:?}",
            bug.iteration, bug.steps, bug.outcome
        );
        std::process::exit(1);
    }
    println!("No bugs found.");
    Ok(())
}

/// Two workers race a read-modify-write on a shared counter; the final
/// assertion fails on the lost-update interleaving.
fn racy_counter(handle: RuntimeHandle) {
    let cell = Arc::new(Mutex::new(0i64));
    let mut done = Vec::new();
    for _ in 0..2 {
        let cell = Arc::clone(&cell);
        let signal = Signal::new();
        done.push(signal.clone());
        handle.spawn("RacyCounter::spawn", move |child| {
            child.read("counter", "Worker::load");
            let snapshot = *cell.lock().unwrap();
            child.yield_now("Worker::compute");
            child.write("counter", "Worker::store");
            *cell.lock().unwrap() = snapshot + 1;
            signal.set(&child, "Worker::done");
        });
    }
    for signal in &done {
        signal.wait(&handle, "RacyCounter::join");
    }
    let total = *cell.lock().unwrap();
    assert_eq!(total, 2, "lost update: counter is {}", total);
}

/// Classic wait-cycle: each worker waits for the signal the other one
/// would set afterwards.
fn deadlock(handle: RuntimeHandle) {
    let a = Signal::new();
    let b = Signal::new();

    let (wait_a, set_b) = (a.clone(), b.clone());
    handle.spawn("Deadlock::spawn_left", move |child| {
        wait_a.wait(&child, "Left::wait_a");
        set_b.set(&child, "Left::set_b");
    });

    let (wait_b, set_a) = (b, a);
    handle.spawn("Deadlock::spawn_right", move |child| {
        wait_b.wait(&child, "Right::wait_b");
        set_a.set(&child, "Right::set_a");
    });
}

/// Producer publishes into a mailbox and signals the consumer; always
/// passes, exercising the signal handoff path.
fn handoff(handle: RuntimeHandle) {
    let ready = Signal::new();
    let cell = Arc::new(Mutex::new(None));

    let producer_ready = ready.clone();
    let producer_cell = Arc::clone(&cell);
    handle.spawn("Handoff::spawn_producer", move |child| {
        child.write("mailbox", "Producer::publish");
        *producer_cell.lock().unwrap() = Some(42);
        producer_ready.set(&child, "Producer::ready");
    });

    ready.wait(&handle, "Consumer::wait");
    handle.read("mailbox", "Consumer::take");
    let value = cell.lock().unwrap().take();
    assert_eq!(value, Some(42));
}
