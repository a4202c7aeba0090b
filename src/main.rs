//! CLI entry point for the NTAS poller.
//!
//! Provides subcommands for running poll cycles over every subway station,
//! checking a single station, and listing the station registry.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use ntas_poller::fetch::{BasicClient, DEFAULT_BASE_URL, HttpTransport, Transport};
use ntas_poller::orchestrator::Orchestrator;
use ntas_poller::poller::{FetchOutcome, RetryPolicy, StationPoller};
use ntas_poller::registry::{LineId, Registry, StationId};
use ntas_poller::store::{CsvStore, MemoryStore, PgStore, Store};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

type NtasTransport = HttpTransport<BasicClient>;

/// Polls a dry run keeps in memory.
const DRY_RUN_RETAINED_POLLS: usize = 1;

#[derive(Parser)]
#[command(name = "ntas_poller")]
#[command(about = "Polls TTC subway arrival boards and stores them", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run poll cycles over every station in the registry
    Poll {
        #[command(flatten)]
        endpoint: EndpointArgs,

        #[command(flatten)]
        retry: RetryArgs,

        /// Seconds to wait between cycles
        #[arg(short, long, default_value_t = 60)]
        interval: u64,

        /// Number of cycles to run (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 1)]
        cycles: usize,

        /// Fetch stations one at a time instead of concurrently
        #[arg(long, default_value_t = false)]
        sequential: bool,

        /// Maximum number of stations fetched at once (unbounded if unset)
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Write CSV files to this directory instead of Postgres
        #[arg(short, long)]
        output_dir: Option<String>,

        /// Keep results in memory only
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Poll a single station once and log what came back
    Check {
        #[command(flatten)]
        endpoint: EndpointArgs,

        #[command(flatten)]
        retry: RetryArgs,

        /// Line number (1, 2 or 4)
        #[arg(short, long)]
        line: u8,

        /// Station id
        #[arg(short, long)]
        station: StationId,
    },
    /// List the stations that would be polled
    Stations {
        /// Registry JSON file (defaults to the TTC layout)
        #[arg(long)]
        registry: Option<String>,
    },
}

#[derive(Args)]
struct EndpointArgs {
    /// NTAS endpoint URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Registry JSON file (defaults to the TTC layout)
    #[arg(long)]
    registry: Option<String>,
}

#[derive(Args)]
struct RetryArgs {
    /// Attempts per station (default 4, or 3 with --sequential)
    #[arg(long)]
    attempts: Option<u32>,

    /// Seconds to wait between failed attempts
    #[arg(long)]
    retry_delay: Option<u64>,

    /// Per-attempt timeout in seconds (default 5, or 10 with --sequential)
    #[arg(long)]
    timeout: Option<u64>,
}

impl RetryArgs {
    fn apply(&self, mut policy: RetryPolicy) -> RetryPolicy {
        if let Some(n) = self.attempts {
            policy = policy.with_max_attempts(n);
        }
        if let Some(secs) = self.retry_delay {
            policy = policy.with_retry_delay(Duration::from_secs(secs));
        }
        if let Some(secs) = self.timeout {
            policy = policy.with_timeout(Duration::from_secs(secs));
        }
        policy
    }
}

/// Everything a run of poll cycles needs apart from the store.
struct PollSetup {
    registry: Arc<Registry>,
    transport: Arc<NtasTransport>,
    concurrent: RetryPolicy,
    sequential: RetryPolicy,
    concurrency: Option<usize>,
    interval: u64,
    cycles: usize,
    sequential_mode: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/ntas_poller.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("ntas_poller.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Poll {
            endpoint,
            retry,
            interval,
            cycles,
            sequential,
            concurrency,
            output_dir,
            dry_run,
        } => {
            let setup = PollSetup {
                registry: Arc::new(load_registry(endpoint.registry.as_deref())?),
                transport: Arc::new(HttpTransport::new(BasicClient::new(), &endpoint.base_url)?),
                concurrent: retry.apply(RetryPolicy::concurrent()),
                sequential: retry.apply(RetryPolicy::sequential()),
                concurrency,
                interval,
                cycles,
                sequential_mode: sequential,
            };

            if dry_run {
                info!("Dry run, results are kept in memory only");
                run_cycles(&setup, MemoryStore::with_retention(DRY_RUN_RETAINED_POLLS)).await?;
            } else if let Some(dir) = output_dir {
                info!(output_dir = %dir, "Writing CSV output");
                run_cycles(&setup, CsvStore::open(&dir)?).await?;
            } else {
                let database_url = std::env::var("DATABASE_URL")
                    .context("DATABASE_URL must be set unless --output-dir or --dry-run is given")?;
                let store = PgStore::connect(&database_url).await?;
                store.ensure_schema().await?;
                run_cycles(&setup, store).await?;
            }
        }
        Commands::Check {
            endpoint,
            retry,
            line,
            station,
        } => {
            let Some(line) = LineId::from_number(line) else {
                bail!("unknown line {line}, expected 1, 2 or 4");
            };
            let registry = Arc::new(load_registry(endpoint.registry.as_deref())?);
            let transport = Arc::new(HttpTransport::new(BasicClient::new(), &endpoint.base_url)?);
            check_station(registry, transport, retry.apply(RetryPolicy::concurrent()), line, station)
                .await?;
        }
        Commands::Stations { registry } => {
            let registry = load_registry(registry.as_deref())?;
            for line in registry.lines() {
                let stations = registry.stations(line);
                let interchanges: Vec<_> = stations
                    .iter()
                    .filter(|s| registry.is_interchange(**s))
                    .collect();
                info!(
                    line = %line,
                    code = line.code(),
                    stations = stations.len(),
                    first = ?stations.first(),
                    last = ?stations.last(),
                    interchanges = ?interchanges,
                    "Line"
                );
            }
            info!(pairs = registry.len(), "Registry summary");
        }
    }

    Ok(())
}

fn load_registry(path: Option<&str>) -> Result<Registry> {
    match path {
        Some(path) => {
            let registry = Registry::load(path)?;
            info!(path, pairs = registry.len(), "Loaded station registry");
            Ok(registry)
        }
        None => Ok(Registry::ttc()),
    }
}

/// Runs the configured number of poll cycles against `store`.
///
/// An aborted cycle is logged and the next one still runs; the result of the
/// last cycle decides the return value.
#[tracing::instrument(
    skip(setup, store),
    fields(cycles = setup.cycles, interval = setup.interval, sequential = setup.sequential_mode)
)]
async fn run_cycles<S: Store>(setup: &PollSetup, store: S) -> Result<()> {
    let orchestrator = Orchestrator::new(
        Arc::clone(&setup.registry),
        Arc::clone(&setup.transport),
        store,
    )
    .with_concurrent_policy(setup.concurrent)
    .with_sequential_policy(setup.sequential)
    .with_max_concurrency(setup.concurrency);

    if setup.cycles == 0 {
        info!(interval = setup.interval, "Polling infinitely. Press Ctrl+C to stop.");
    } else {
        info!(cycles = setup.cycles, interval = setup.interval, "Starting poll cycles");
    }

    let mut cycle = 0;
    let mut last = Ok(());

    loop {
        if setup.cycles > 0 && cycle >= setup.cycles {
            break;
        }
        cycle += 1;

        info!(
            cycle,
            total = if setup.cycles == 0 { None } else { Some(setup.cycles) },
            "Starting poll cycle"
        );

        let result = if setup.sequential_mode {
            orchestrator.run_poll_cycle_sequential().await
        } else {
            orchestrator.run_poll_cycle().await
        };

        last = match result {
            Ok(summary) => {
                debug!("{}", serde_json::to_string(&summary)?);
                Ok(())
            }
            Err(e) => {
                error!(error = ?e, "Poll cycle aborted, poll left without an end time");
                Err(e)
            }
        };

        if setup.cycles == 0 || cycle < setup.cycles {
            info!(interval = setup.interval, "Waiting before next cycle");
            tokio::time::sleep(Duration::from_secs(setup.interval)).await;
        }
    }

    last
}

/// Runs one station poller and logs the outcome without storing anything.
///
/// Fails when the station is still missing after every attempt.
async fn check_station<T: Transport>(
    registry: Arc<Registry>,
    transport: Arc<T>,
    policy: RetryPolicy,
    line: LineId,
    station: StationId,
) -> Result<usize> {
    let interchange = registry.is_interchange(station);
    let poller = StationPoller::new(transport, registry, policy);

    match poller.poll(line, station).await {
        FetchOutcome::Fetched(fetched) => {
            let records = fetched.response.records();
            info!(
                line = %line,
                station,
                interchange,
                received_at = %fetched.received_at,
                created_at = ?fetched.response.created_at(),
                all_stations = fetched.response.all_stations,
                records = records.len(),
                "Board received"
            );
            for record in records {
                info!(
                    id = record.id,
                    subway_line = %record.subway_line,
                    direction = %record.train_direction,
                    train_id = record.train_id,
                    time_int = record.time_int,
                    message = %record.train_message,
                    stored = record.is_final(),
                    "Train"
                );
            }
            Ok(records.len())
        }
        FetchOutcome::Missing => {
            error!(line = %line, station, "No data for line {line}, station {station}");
            bail!("no data for line {line}, station {station}");
        }
    }
}
