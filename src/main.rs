//! Endpoint agent entrypoint: runs the telemetry pipeline until Ctrl+C, performs a
//! single on-demand collection, or runs the indicator scanner over stored events.

use clap::{Parser, Subcommand};
use endpoint_agent::{
    config::AgentConfig,
    logging::{StructuredLogger, SummaryLine},
    orchestrator::{CollectTarget, Orchestrator},
    publish::{publisher_from_config, Publisher},
    scanner::IndicatorScanner,
    shutdown::shutdown_channel,
    storage::{EventRepository, SecureStore},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CONFIG_ENV: &str = "ENDPOINT_AGENT_CONFIG";
const PLACEHOLDER_SECRET: &[u8] = b"endpoint-agent-device-secret";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "endpoint-agent", version, about = "Endpoint telemetry agent")]
struct Cli {
    /// Config file (defaults to $ENDPOINT_AGENT_CONFIG, then config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the telemetry pipeline until interrupted (default)
    Run,
    /// Collect once: processes, system, performance, files, network or all
    Collect { target: String },
    /// Match stored events against indicator lists
    Scan {
        /// JSON file with `hashes` and `ips` lists to import first
        #[arg(long)]
        import: Option<PathBuf>,
        /// Keep scanning every SECS seconds until interrupted
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.json"))
}

fn store_secret(config: &AgentConfig) -> Vec<u8> {
    match std::env::var(&config.store.secret_env) {
        Ok(s) if !s.is_empty() => s.into_bytes(),
        _ => {
            warn!(env = %config.store.secret_env, "store secret not set, using device placeholder");
            PLACEHOLDER_SECRET.to_vec()
        }
    }
}

fn print_summary(line: &impl serde::Serialize) {
    if let Err(e) = StructuredLogger::emit_json(line, &mut std::io::stdout()) {
        warn!(error = %e, "failed to write summary");
    }
}

async fn run_pipeline(config: AgentConfig, store: Arc<SecureStore>) -> Result<(), BoxError> {
    let publisher: Arc<dyn Publisher> = Arc::from(publisher_from_config(&config.bus)?);
    let repo: Arc<dyn EventRepository> = store;
    let agent_id = config.agent.id.clone();
    let orchestrator = Orchestrator::new(config, repo, publisher);
    orchestrator.start()?;

    let (trigger, mut interrupted) = shutdown_channel();
    ctrlc::set_handler(move || trigger.trigger())?;
    info!(agent_id = %agent_id, "running (Ctrl+C to stop)");
    interrupted.wait().await;

    info!("stopping");
    let report = orchestrator.stop().await?;
    if !report.clean {
        warn!("some tasks did not finish before the shutdown deadline");
    }
    print_summary(&SummaryLine::new(&agent_id, "run", &report));
    Ok(())
}

async fn collect_once(config: AgentConfig, store: Arc<SecureStore>, target: &str) -> Result<(), BoxError> {
    let target: CollectTarget = target.parse()?;
    let publisher: Arc<dyn Publisher> = Arc::from(publisher_from_config(&config.bus)?);
    let repo: Arc<dyn EventRepository> = store;
    let agent_id = config.agent.id.clone();
    let orchestrator = Orchestrator::new(config, Arc::clone(&repo), Arc::clone(&publisher));

    let persisted = orchestrator.collect_now(target).await?;
    publisher.close().await?;
    repo.close()?;
    print_summary(&SummaryLine::new(&agent_id, "collect", persisted).with_target(target.as_str()));
    Ok(())
}

async fn scan(
    config: AgentConfig,
    store: Arc<SecureStore>,
    import: Option<PathBuf>,
    interval: Option<u64>,
) -> Result<(), BoxError> {
    let scanner = Arc::new(IndicatorScanner::new(Arc::clone(&store)));
    let agent_id = config.agent.id.as_str();
    if let Some(path) = import {
        let imported = scanner.import_indicators(&path)?;
        print_summary(&SummaryLine::new(agent_id, "import", imported));
    }

    match interval {
        Some(secs) => {
            let secs = if secs == 0 { config.scanner.interval_secs } else { secs };
            let period = Duration::from_secs(secs.max(1));
            let (trigger, stop) = shutdown_channel();
            ctrlc::set_handler(move || trigger.trigger())?;
            Arc::clone(&scanner).run(period, stop).await;
        }
        None => {
            let report = scanner.scan_once()?;
            print_summary(&SummaryLine::new(agent_id, "scan", report));
        }
    }
    store.close()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let config = AgentConfig::load(&config_path(&cli));

    StructuredLogger::init(config.log.json, &config.log.level);
    info!(agent_id = %config.agent.id, data_dir = ?config.data_dir, "endpoint agent starting");

    let store = Arc::new(SecureStore::open(&config.store_path(), &store_secret(&config))?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_pipeline(config, store).await,
        Command::Collect { target } => collect_once(config, store, &target).await,
        Command::Scan { import, interval } => scan(config, store, import, interval).await,
    }
}
