use std::fs;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sdx_store_api::{StoreApi, StoreConfig};
use sdx_store_core::{SearchParams, TxId};
use sdx_store_notify::Publisher;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "sdx-store")]
#[command(about = "Admin CLI for the SDX Store")]
struct Cli {
    #[arg(long, default_value = "./sdx_store.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ensure the storage tables exist.
    Schema,
    Response {
        #[command(subcommand)]
        command: ResponseCommand,
    },
    /// Filtered, paginated listing of stored responses.
    Search(SearchArgs),
    /// Delete responses older than the retention window.
    Purge(PurgeArgs),
    /// Re-announce a stored document on its routed queue.
    Queue(QueueArgs),
}

#[derive(Debug, Subcommand)]
enum ResponseCommand {
    Save(SaveArgs),
    Get(GetArgs),
}

#[derive(Debug, Args)]
struct SaveArgs {
    /// File holding the submission JSON; `-` reads standard input.
    #[arg(long)]
    file: PathBuf,
    /// Announce the transaction id on the routed queue after saving.
    /// Off by default: admin backfills should not ping downstream consumers.
    #[arg(long, default_value_t = false)]
    notify: bool,
}

#[derive(Debug, Args)]
struct GetArgs {
    tx_id: String,
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[arg(long)]
    survey_id: Option<String>,
    #[arg(long)]
    form: Option<String>,
    #[arg(long)]
    ru_ref: Option<String>,
    #[arg(long)]
    period: Option<String>,
    #[arg(long)]
    added_ms: Option<i64>,
    #[arg(long)]
    page: Option<u32>,
    #[arg(long)]
    per_page: Option<u32>,
}

#[derive(Debug, Args)]
struct PurgeArgs {
    /// Retention window override; falls back to SDX_STORE_RETENTION_DAYS.
    #[arg(long)]
    days: Option<u32>,
}

#[derive(Debug, Args)]
struct QueueArgs {
    tx_id: String,
}

/// Accepts every notification without sending anything; the default for
/// admin invocations so a backfill cannot spam downstream queues.
struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&self, _queue: &str, _message: &str, _tx_id: &TxId) -> bool {
        true
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = StoreConfig::from_env()?;
    config.db_path = cli.db;

    match cli.command {
        Command::Schema => {
            let api = offline_api(&config);
            api.ensure_schema()?;
            print_json(&json!({"schema": "ok"}))
        }
        Command::Response { command } => match command {
            ResponseCommand::Save(args) => save(&config, &args),
            ResponseCommand::Get(args) => get(&config, &args),
        },
        Command::Search(args) => search(&config, args),
        Command::Purge(args) => purge(&mut config, &args),
        Command::Queue(args) => queue(&config, &args),
    }
}

fn offline_api(config: &StoreConfig) -> StoreApi {
    StoreApi::with_publisher(config, Box::new(NullPublisher))
}

fn save(config: &StoreConfig, args: &SaveArgs) -> Result<()> {
    let raw = if args.file.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer).context("failed to read stdin")?;
        buffer
    } else {
        fs::read_to_string(&args.file)
            .with_context(|| format!("failed to read {}", args.file.display()))?
    };
    let payload: Value = serde_json::from_str(&raw).context("submission is not valid JSON")?;

    let api = if args.notify { StoreApi::new(config) } else { offline_api(config) };
    api.ensure_schema()?;
    let outcome = api.save_response(payload)?;
    print_json(&outcome)
}

fn get(config: &StoreConfig, args: &GetArgs) -> Result<()> {
    let api = offline_api(config);
    api.ensure_schema()?;
    match api.get_response(&args.tx_id)? {
        Some(row) => print_json(&row),
        None => anyhow::bail!("no response stored for {}", args.tx_id),
    }
}

fn search(config: &StoreConfig, args: SearchArgs) -> Result<()> {
    let api = offline_api(config);
    api.ensure_schema()?;
    let page = api.search(SearchParams {
        survey_id: args.survey_id,
        form: args.form,
        ru_ref: args.ru_ref,
        period: args.period,
        added_ms: args.added_ms,
        page: args.page,
        per_page: args.per_page,
    })?;
    print_json(&page)
}

fn purge(config: &mut StoreConfig, args: &PurgeArgs) -> Result<()> {
    if args.days.is_some() {
        config.retention_days = args.days;
    }
    let api = offline_api(config);
    api.ensure_schema()?;
    let deleted = api.delete_old_responses()?;
    print_json(&json!({"deleted": deleted}))
}

fn queue(config: &StoreConfig, args: &QueueArgs) -> Result<()> {
    let api = StoreApi::new(config);
    api.ensure_schema()?;
    match api.requeue(&args.tx_id)? {
        Some(queued) => print_json(&json!({"queued": queued})),
        None => anyhow::bail!("no response stored for {}", args.tx_id),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
