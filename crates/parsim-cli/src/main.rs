//! CLI for parsim — run benchmark models on the simulation kernel.

use std::fs;

use clap::{Parser, Subcommand};

use parsim_core::{BarrierKind, Interface, SimConfig, SyncPolicy};
use parsim_models::{PholdParams, build_clique};

#[derive(Parser)]
#[command(name = "parsim")]
#[command(about = "parsim — conservative parallel discrete-event simulation")]
#[command(version = parsim_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the PHOLD clique benchmark and report runtime measurements.
    Phold {
        /// Number of clique nodes
        #[arg(long, default_value = "8")]
        nodes: usize,

        /// Number of worker timelines
        #[arg(long, default_value = "2")]
        timelines: usize,

        /// Total simulated time, in ticks (microsecond clock)
        #[arg(long, default_value = "100000")]
        stop: i64,

        /// Number of epochs the run is divided into
        #[arg(long, default_value = "10")]
        epochs: i64,

        /// RNG seed for the exponential holding times
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Synchronization regime: global barrier windows, or composite
        /// with pairwise appointments
        #[arg(long, default_value = "global", value_parser = ["global", "composite"])]
        sync: String,

        /// Barrier implementation
        #[arg(long, default_value = "mutex", value_parser = ["mutex", "spin"])]
        barrier: String,

        /// Write the measurement report as JSON
        #[arg(long)]
        output: Option<String>,
    },

    /// Compare synchronization regimes and barrier flavors on the same
    /// workload: runs PHOLD under every configuration and tabulates
    /// throughput.
    Bench {
        /// Number of clique nodes
        #[arg(long, default_value = "8")]
        nodes: usize,

        /// Number of worker timelines
        #[arg(long, default_value = "2")]
        timelines: usize,

        /// Total simulated time per run, in ticks
        #[arg(long, default_value = "100000")]
        stop: i64,

        /// RNG seed for the exponential holding times
        #[arg(long, default_value = "1")]
        seed: u64,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Phold {
            nodes,
            timelines,
            stop,
            epochs,
            seed,
            sync,
            barrier,
            output,
        } => run_phold(nodes, timelines, stop, epochs, seed, &sync, &barrier, output),
        Commands::Bench {
            nodes,
            timelines,
            stop,
            seed,
        } => run_bench(nodes, timelines, stop, seed),
    }
}

fn run_bench(nodes: usize, timelines: usize, stop: i64, seed: u64) {
    assert!(stop > 0, "--stop must be positive");
    println!(
        "PHOLD {nodes} nodes, {timelines} timelines, {stop} ticks, seed {seed}"
    );
    println!(
        "{:<10} {:<8} {:>12} {:>12} {:>10} {:>12}",
        "sync", "barrier", "work evts", "sync evts", "windows", "work/s"
    );
    for (sync, sync_name) in [
        (SyncPolicy::Global, "global"),
        (SyncPolicy::Composite, "composite"),
    ] {
        for (barrier, barrier_name) in [
            (BarrierKind::Mutex, "mutex"),
            (BarrierKind::Spin, "spin"),
        ] {
            let mut sim = Interface::with_config(timelines, 6, SimConfig { sync, barrier });
            build_clique(
                &mut sim,
                PholdParams {
                    nodes,
                    seed,
                    ..PholdParams::default()
                },
            );
            sim.init_model();
            sim.advance(stop);
            let m = sim.runtime_measurements();
            println!(
                "{:<10} {:<8} {:>12} {:>12} {:>10} {:>12.0}",
                sync_name,
                barrier_name,
                m.work_events,
                m.sync_events,
                m.windows,
                m.work_event_rate
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_phold(
    nodes: usize,
    timelines: usize,
    stop: i64,
    epochs: i64,
    seed: u64,
    sync: &str,
    barrier: &str,
    output: Option<String>,
) {
    assert!(stop > 0 && epochs > 0, "--stop and --epochs must be positive");
    let config = SimConfig {
        sync: match sync {
            "composite" => SyncPolicy::Composite,
            _ => SyncPolicy::Global,
        },
        barrier: match barrier {
            "spin" => BarrierKind::Spin,
            _ => BarrierKind::Mutex,
        },
    };

    // Microsecond clock, like the reference PHOLD runs.
    let mut sim = Interface::with_config(timelines, 6, config);
    let clique = build_clique(
        &mut sim,
        PholdParams {
            nodes,
            seed,
            ..PholdParams::default()
        },
    );
    sim.init_model();

    let span = (stop / epochs).max(1);
    while sim.clock() < stop {
        let reached = sim.advance(span.min(stop - sim.clock()));
        log::info!("advanced to {reached}");
    }

    let report = sim.runtime_measurements();
    println!("{report}");
    println!("clique activations received: {}", clique.total_received());

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&report).expect("report serializes");
        fs::write(&path, json).unwrap_or_else(|e| panic!("cannot write {path}: {e}"));
        println!("wrote {path}");
    }
}
