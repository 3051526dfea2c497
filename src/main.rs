use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};
use traffic_rank::{
    render_ranking, AppConfig, Coordinator, LocalCluster, ParsePolicy, PartitionStrategy,
    PipelineMetrics, RecordFormat, RunOutcome, SampleGenerator, StreamingPipeline, TcpTransport,
    WorkerAggregator,
};

/// Traffic light congestion ranking.
#[derive(Parser)]
#[command(name = "traffic-rank", about)]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream readings through a bounded queue, ranking after every event.
    Stream {
        input: PathBuf,
        #[arg(long)]
        capacity: Option<usize>,
        #[arg(long)]
        top: Option<usize>,
        /// Pause between records, in milliseconds.
        #[arg(long)]
        delay_ms: Option<u64>,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
        /// Fail on the first malformed record instead of skipping it.
        #[arg(long)]
        strict: bool,
    },
    /// Run coordinator and workers in this process.
    Distributed {
        input: PathBuf,
        /// Process group size, coordinator included.
        #[arg(short, long)]
        processes: Option<usize>,
        #[arg(long)]
        top: Option<usize>,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
        #[arg(long, value_enum)]
        partition: Option<PartitionArg>,
        #[arg(long)]
        strict: bool,
    },
    /// Run rank 0 and wait for TCP workers.
    Coordinator {
        input: PathBuf,
        #[arg(long)]
        listen: String,
        #[arg(short, long)]
        processes: usize,
        /// Ranking size printed in the report header; start the workers with
        /// the same `--top`.
        #[arg(long)]
        top: Option<usize>,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
        #[arg(long, value_enum)]
        partition: Option<PartitionArg>,
        #[arg(long)]
        strict: bool,
    },
    /// Run one worker rank against a TCP coordinator.
    Worker {
        #[arg(long)]
        connect: String,
        #[arg(long)]
        rank: usize,
        /// Entries per hour; must match the coordinator's `--top`.
        #[arg(long)]
        top: Option<usize>,
    },
    /// Write random sample readings.
    Generate {
        output: PathBuf,
        #[arg(long)]
        events: usize,
        #[arg(long, default_value_t = 10)]
        lights: u32,
        #[arg(long, value_enum, default_value = "comma")]
        format: FormatArg,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print version information and exit.
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Comma,
    Whitespace,
    Auto,
}

impl From<FormatArg> for RecordFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Comma => RecordFormat::CommaSpace,
            FormatArg::Whitespace => RecordFormat::Whitespace,
            FormatArg::Auto => RecordFormat::Auto,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PartitionArg {
    HourModulo,
    RoundRobin,
}

impl From<PartitionArg> for PartitionStrategy {
    fn from(arg: PartitionArg) -> Self {
        match arg {
            PartitionArg::HourModulo => PartitionStrategy::HourModulo,
            PartitionArg::RoundRobin => PartitionStrategy::RoundRobin,
        }
    }
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("traffic-rank {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let app_config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AppConfig::default(),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cli.command, app_config))
}

fn policy(strict: bool, configured: ParsePolicy) -> ParsePolicy {
    if strict {
        ParsePolicy::Abort
    } else {
        configured
    }
}

async fn run(command: Command, app_config: AppConfig) -> Result<()> {
    match command {
        Command::Stream {
            input,
            capacity,
            top,
            delay_ms,
            format,
            strict,
        } => {
            let mut config = app_config.streaming;
            if let Some(capacity) = capacity {
                config.queue_capacity = capacity;
            }
            if let Some(top) = top {
                config.top_n = top;
            }
            if let Some(delay_ms) = delay_ms {
                config.ingest_delay = Duration::from_millis(delay_ms);
            }
            if let Some(format) = format {
                config.format = format.into();
            }
            config.parse_policy = policy(strict, config.parse_policy);
            stream(&input, config).await
        }
        Command::Distributed {
            input,
            processes,
            top,
            format,
            partition,
            strict,
        } => {
            let mut config = app_config.distributed;
            if let Some(processes) = processes {
                config.total_processes = processes;
            }
            if let Some(top) = top {
                config.top_n = top;
            }
            if let Some(format) = format {
                config.format = format.into();
            }
            if let Some(partition) = partition {
                config.partition = partition.into();
            }
            config.parse_policy = policy(strict, config.parse_policy);

            let top_n = config.top_n;
            let metrics = PipelineMetrics::local();
            let outcome = LocalCluster::new(config)
                .with_metrics(metrics.clone())
                .run_file(&input)
                .await
                .with_context(|| format!("distributed run over {}", input.display()))?;
            print_report(&outcome, top_n)?;
            log_metrics(&metrics).await;
            Ok(())
        }
        Command::Coordinator {
            input,
            listen,
            processes,
            top,
            format,
            partition,
            strict,
        } => {
            let mut config = app_config.distributed;
            config.total_processes = processes;
            if let Some(top) = top {
                config.top_n = top;
            }
            if let Some(format) = format {
                config.format = format.into();
            }
            if let Some(partition) = partition {
                config.partition = partition.into();
            }
            config.parse_policy = policy(strict, config.parse_policy);
            config.validate()?;

            let top_n = config.top_n;
            let transport = TcpTransport::listen(&listen, processes)
                .await
                .with_context(|| format!("accepting workers on {}", listen))?;
            let outcome = Coordinator::new(config)
                .run_file(&transport, &input)
                .await
                .with_context(|| format!("coordinating run over {}", input.display()))?;
            print_report(&outcome, top_n)
        }
        Command::Worker { connect, rank, top } => {
            let config = app_config.distributed;
            let top_n = top.unwrap_or(config.top_n);
            let transport = TcpTransport::connect(&connect, rank, &config.connect_retry)
                .await
                .with_context(|| format!("connecting to coordinator at {}", connect))?;
            let summary = WorkerAggregator::new(top_n)
                .run(&transport)
                .await
                .with_context(|| format!("worker {}", rank))?;
            tracing::info!(
                rank,
                buckets = summary.buckets(),
                records = summary.records,
                "worker done"
            );
            Ok(())
        }
        Command::Generate {
            output,
            events,
            lights,
            format,
            seed,
        } => {
            let mut generator = SampleGenerator::new(events, lights);
            if let Some(seed) = seed {
                generator = generator.with_seed(seed);
            }
            let written = generator
                .write_to(&output, format.into())
                .await
                .with_context(|| format!("generating {}", output.display()))?;
            println!("wrote {} readings to {}", written, output.display());
            Ok(())
        }
        Command::Version => Ok(()),
    }
}

async fn stream(input: &Path, config: traffic_rank::StreamingConfig) -> Result<()> {
    let top_n = config.top_n;
    let metrics = PipelineMetrics::local();
    let stdout = std::io::stdout();
    let mut write_error = None;

    let summary = StreamingPipeline::new(config)
        .with_metrics(metrics.clone())
        .run(input, |_, ranking| {
            if write_error.is_none() {
                let mut out = stdout.lock();
                if let Err(e) = out.write_all(render_ranking(ranking, top_n).as_bytes()) {
                    write_error = Some(e);
                }
            }
        })
        .await
        .with_context(|| format!("streaming {}", input.display()))?;
    if let Some(e) = write_error {
        return Err(e).context("writing ranking to stdout");
    }

    tracing::info!(
        ingested = summary.ingest.ingested,
        skipped = summary.ingest.skipped,
        peak_queue_len = summary.queue.peak_len,
        "stream complete"
    );
    log_metrics(&metrics).await;
    Ok(())
}

fn print_report(outcome: &RunOutcome, top_n: usize) -> Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(outcome.report.render(top_n).as_bytes())
        .context("writing report to stdout")?;
    tracing::info!(
        run_id = %outcome.run_id,
        skipped = outcome.skipped,
        dropped = outcome.dispatch.dropped,
        lines = outcome.report.len(),
        "report printed"
    );
    Ok(())
}

async fn log_metrics(metrics: &PipelineMetrics) {
    let snapshot = metrics.snapshot().await;
    let mut counters: Vec<_> = snapshot.counters.into_iter().collect();
    counters.sort();
    for (name, value) in counters {
        tracing::debug!(metric = %name, value, "counter");
    }
}
