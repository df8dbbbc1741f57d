//! # Avisos: per-tenant WhatsApp notification scheduler
//!
//! Usage:
//!   avisos run                                   # Start the scheduler loop
//!   avisos trigger --tenant acme --rule daily_agents [--to 5491155550001]
//!   avisos status --tenant acme                  # Dedup state as JSON
//!   avisos import tenants.json                   # Load configuration documents
//!   avisos clear --tenant acme daily-agent-rule  # Administrative field clears

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use avisos_channels::WhatsAppChannel;
use avisos_core::{AvisosConfig, ConfigField, ConfigStore};
use avisos_scheduler::{
    ControlHandle, DedupTracker, SchedulerEngine, SqliteStore, spawn_scheduler,
};

#[derive(Parser)]
#[command(
    name = "avisos",
    version,
    about = "📣 Avisos — WhatsApp reminders, digests and confirmations per tenant"
)]
struct Cli {
    /// Config file (default: ~/.avisos/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Send one rule now, bypassing its schedule
    Trigger {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        rule: String,
        /// Only this recipient (id or phone number)
        #[arg(long)]
        to: Option<String>,
    },
    /// Print a tenant's dedup state
    Status {
        #[arg(long)]
        tenant: String,
    },
    /// Import configuration documents (one object or an array)
    Import { file: PathBuf },
    /// Clear a field of a tenant's stored configuration
    Clear {
        #[arg(long)]
        tenant: String,
        field: ClearTarget,
        /// Rule id, for `rule-text`
        #[arg(long)]
        rule: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ClearTarget {
    DailyAgentRule,
    SenderId,
    RuleText,
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "avisos=debug,avisos_scheduler=debug,avisos_channels=debug,avisos_core=debug"
    } else {
        "avisos=info,avisos_scheduler=info,avisos_channels=info,avisos_core=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

fn load_config(path: Option<&str>) -> Result<AvisosConfig> {
    let config = match path {
        Some(p) => AvisosConfig::load_from(Path::new(&shellexpand::tilde(p).to_string()))?,
        None => AvisosConfig::load()?,
    };
    Ok(config)
}

fn open_store(config: &AvisosConfig) -> Result<Arc<SqliteStore>> {
    let path = config.store.resolved_path();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("opening store at {}", path.display()))?;
    tracing::info!("💾 Store: {}", path.display());
    Ok(Arc::new(store))
}

fn build_engine(config: &AvisosConfig, store: Arc<SqliteStore>) -> Result<Arc<SchedulerEngine>> {
    let whatsapp = WhatsAppChannel::new(config.whatsapp.clone())?
        .with_request_timeout(config.scheduler.dispatch_timeout());
    let whatsapp = Arc::new(whatsapp);
    let engine = SchedulerEngine::new(
        &config.scheduler,
        store.clone(),
        store,
        whatsapp.clone(),
        whatsapp,
    )?;
    Ok(Arc::new(engine))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let config = load_config(cli.config.as_deref())?;
    let store = open_store(&config)?;

    match cli.command {
        Command::Run => {
            let engine = build_engine(&config, store)?;
            let control = ControlHandle::new(Arc::clone(&engine), config.scheduler.tick_period());
            let scheduler = spawn_scheduler(engine, &control);

            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Shutting down");
            drop(control);
            scheduler.await?;
        }
        Command::Trigger { tenant, rule, to } => {
            let engine = build_engine(&config, store)?;
            let control = ControlHandle::new(engine, config.scheduler.tick_period());
            let report = control.trigger(&tenant, &rule, to.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Status { tenant } => {
            // Read-only: no WhatsApp credentials needed.
            let tracker = DedupTracker::new(config.scheduler.claim_ttl());
            let state = tracker
                .tenant_snapshot(&*store, &tenant, config.scheduler.timezone()?, Utc::now())
                .await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Import { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let docs = match serde_json::from_str::<Value>(&content)? {
                Value::Array(docs) => docs,
                doc => vec![doc],
            };
            for doc in &docs {
                let tenant = store.put_document(doc).await?;
                println!("✅ Imported configuration for '{tenant}'");
            }
        }
        Command::Clear {
            tenant,
            field,
            rule,
        } => {
            let field = match field {
                ClearTarget::DailyAgentRule => ConfigField::DailyAgentRule,
                ClearTarget::SenderId => ConfigField::SenderId,
                ClearTarget::RuleText => ConfigField::RuleMessageText {
                    rule_id: rule.context("--rule is required for rule-text")?,
                },
            };
            store.clear_field(&tenant, &field).await?;
            println!("✅ Cleared {field:?} for '{tenant}'");
        }
    }
    Ok(())
}
