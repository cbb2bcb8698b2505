//! devflow command line: build filter chains from chain files and run them

mod service;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use devflow_core::{EventKind, SignalId};
use devflow_engine::configuration_to_json;
use devflow_simulation::{GeneratorConfig, SignalPattern, StreamConfig};
use service::{ChainService, RunSummary, Source};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "devflow", version, about = "Plugin-extensible device event pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run events through the chain of a chain file
    Run(RunArgs),
    /// Build the chain of a chain file and tear it down again
    Check(ChainArgs),
    /// Print the resolved chain configuration as JSON
    Export(ChainArgs),
    /// List every filter type the registry can build
    Filters {
        /// Directory of filter plugin libraries
        #[arg(long, value_name = "DIR")]
        plugins: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ChainArgs {
    /// TOML chain file
    #[arg(short, long, value_name = "FILE")]
    chain: PathBuf,

    /// Directory of filter plugin libraries, overriding the chain file
    #[arg(long, value_name = "DIR")]
    plugins: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    chain: ChainArgs,

    /// Number of generated levels
    #[arg(short = 'n', long, default_value_t = 288)]
    events: usize,

    /// Seed for reproducible generated levels
    #[arg(short, long)]
    seed: Option<u64>,

    /// Activation pattern preset for generated levels
    #[arg(short, long, value_name = "NAME")]
    pattern: Option<String>,

    /// Signal id of generated levels
    #[arg(long, value_name = "UUID")]
    signal: Option<Uuid>,

    /// Replay a JSON-lines event log instead of generating levels
    #[arg(long, value_name = "FILE", conflicts_with = "realtime")]
    replay: Option<PathBuf>,

    /// Record the chain output as a JSON-lines event log
    #[arg(long, value_name = "FILE")]
    record: Option<PathBuf>,

    /// Generate in real time for this many seconds
    #[arg(long, value_name = "SECS")]
    realtime: Option<f64>,

    /// Real-time ticks per second
    #[arg(long, default_value_t = 10.0)]
    rate: f64,
}

impl RunArgs {
    fn source(&self) -> Result<Source> {
        if let Some(path) = &self.replay {
            return Ok(Source::Replay(path.clone()));
        }

        let mut generator = GeneratorConfig {
            seed: self.seed,
            ..GeneratorConfig::default()
        };
        if let Some(signal) = self.signal {
            generator.signal_id = SignalId(signal);
        }
        if let Some(name) = &self.pattern {
            generator.pattern = SignalPattern::preset(name).with_context(|| {
                let known: Vec<&str> = SignalPattern::presets().into_iter().map(|(n, _)| n).collect();
                format!("unknown pattern '{}' (known: {})", name, known.join(", "))
            })?;
        }

        match self.realtime {
            Some(seconds) => {
                anyhow::ensure!(seconds.is_finite() && seconds > 0.0, "--realtime must be positive");
                Ok(Source::RealTime {
                    config: StreamConfig {
                        generator,
                        update_rate: self.rate,
                        ..StreamConfig::default()
                    },
                    duration: Duration::from_secs_f64(seconds),
                })
            }
            None => Ok(Source::Generated {
                count: self.events,
                config: generator,
            }),
        }
    }
}

fn setup_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,devflow=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_summary(summary: &RunSummary) {
    println!("Sent {} events in {:.2?} ({:?})", summary.sent, summary.elapsed, summary.stop);
    println!("Received:");
    for kind in EventKind::ALL {
        let count = summary.received_of(kind);
        if count > 0 {
            println!("  {:<20} {}", kind.to_string(), count);
        }
    }
    println!("Stages:");
    for (name, stats) in &summary.stages {
        println!("  {:<20} processed={} failed={}", name, stats.processed, stats.failed);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            let service = ChainService::from_chain_file(&args.chain.chain, args.chain.plugins.clone())?;
            let source = args.source()?;
            let summary = service.run(source, args.record.clone()).await?;
            print_summary(&summary);
        }
        Command::Check(args) => {
            let service = ChainService::from_chain_file(&args.chain, args.plugins)?;
            let stages = service.check()?;
            println!("{}: {} stages", args.chain.display(), stages.len());
            for stage in stages {
                println!("  {}", stage);
            }
        }
        Command::Export(args) => {
            let service = ChainService::from_chain_file(&args.chain, args.plugins)?;
            println!("{}", configuration_to_json(service.configuration())?);
        }
        Command::Filters { plugins } => {
            let service = ChainService::without_chain(plugins)?;
            for descriptor in service.describe_filters() {
                println!(
                    "{}  {:<20} {:?}{}",
                    descriptor.id,
                    descriptor.name,
                    descriptor.scheduling,
                    if descriptor.feedback_receiver { "  feedback receiver" } else { "" }
                );
            }
        }
    }
    Ok(())
}
