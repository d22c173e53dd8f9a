use clap::{Parser, Subcommand};
use sessionbus_cli::{
    config::CliSettings,
    demo::{DemoOptions, DemoReport, run_demo},
};
use sessionbus_core::{
    Error, ScheduledEventRecord,
    storage::{EventStore, local_fs::LocalFileEventStore},
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (JSON)
    #[arg(short, long, default_value = "sessionbus.json", global = true)]
    config: PathBuf,

    /// Path to the pending event store, overriding the config file
    #[arg(short, long, env = "SESSIONBUS_STORE", global = true)]
    store: Option<PathBuf>,

    /// Enable debug mode
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted session against a local bus
    Demo(DemoArgs),

    /// List scheduled events persisted in the store
    Pending,

    /// Remove persisted events from the store and print them
    Drain,
}

#[derive(Parser)]
struct DemoArgs {
    /// Name to greet
    #[arg(short, long, default_value = "world")]
    name: String,

    /// Delay of the scheduled reminder in seconds
    #[arg(long, default_value_t = 2)]
    schedule_secs: u64,

    /// Seconds before the approval request expires
    #[arg(long, default_value_t = 5)]
    approval_timeout_secs: u64,

    /// Seconds to wait for the reminder before persisting it
    /// (defaults to the reminder delay plus one)
    #[arg(long)]
    wait_secs: Option<u64>,

    /// Write every event as JSON Lines into this directory
    #[arg(long)]
    event_log: Option<PathBuf>,
}

fn print_records(records: &[ScheduledEventRecord]) {
    if records.is_empty() {
        println!("No pending events");
        return;
    }
    for record in records {
        println!(
            "{}  {}  session={}  due={}  payload={}",
            record.type_name,
            record.event_id,
            record.session_id,
            record.scheduled_time.to_rfc3339(),
            record.payload
        );
    }
}

fn print_report(report: &DemoReport) {
    if report.restored > 0 {
        println!("Restored: {} pending events", report.restored);
    }
    match (&report.greeting.result, &report.greeting.error) {
        (Some(result), _) => println!("Greeting: {}", result.as_str().unwrap_or_default()),
        (None, Some(error)) => println!("Greeting failed: {}", error),
        (None, None) => println!("Greeting: <empty>"),
    }
    for line in &report.delivered {
        println!("Delivered: {}", line);
    }
    match &report.approval.error {
        Some(error) => println!("Approval: {} ({})", report.approval.status, error),
        None => println!("Approval: {}", report.approval.status),
    }
    println!("Flushed: {}", report.flushed);
    if let Some(path) = &report.event_log {
        println!("Event log: {}", path.display());
    }
    println!(
        "Events: {}  Commands: {} ({} failed)  Avg: {:?}",
        report.metrics.total_events,
        report.metrics.commands_completed,
        report.metrics.commands_failed,
        report.metrics.average_execution_time
    );
}

async fn run_demo_command(args: &DemoArgs, mut settings: CliSettings) -> Result<(), Error> {
    if let Some(dir) = &args.event_log {
        settings.bus.event_log.enabled = true;
        settings.bus.event_log.directory = dir.clone();
    }
    let schedule = Duration::from_secs(args.schedule_secs);
    let options = DemoOptions {
        name: args.name.clone(),
        schedule,
        approval_timeout: Duration::from_secs(args.approval_timeout_secs),
        wait: args
            .wait_secs
            .map(Duration::from_secs)
            .unwrap_or(schedule + Duration::from_secs(1)),
    };
    debug!("demo options: {:?}", options);

    let report = run_demo(settings.bus, options).await?;
    print_report(&report);
    Ok(())
}

async fn run(cli: &Cli) -> Result<(), Error> {
    let settings = CliSettings::load(&cli.config, cli.store.as_deref())
        .map_err(|e| Error::Internal(e.to_string()))?;

    match &cli.command {
        Commands::Demo(args) => run_demo_command(args, settings).await,
        Commands::Pending => {
            let store = LocalFileEventStore::from_config(&settings.bus.store);
            print_records(&store.peek().await?);
            Ok(())
        }
        Commands::Drain => {
            let store = LocalFileEventStore::from_config(&settings.bus.store);
            let records = store.load_unfinished_events().await?;
            print_records(&records);
            if !records.is_empty() {
                println!("Drained {} events from {}", records.len(), settings.store_path().display());
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
