use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use memory_profile_api::ProfileApi;
use memory_profile_core::{fields, MemoryEntry, PERSONAL_ASSISTANT};
use memory_profile_store_sqlite::SqliteStore;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "MP_LOG";

#[derive(Debug, Parser)]
#[command(name = "mp")]
#[command(about = "Memory profile reconciliation CLI")]
struct Cli {
    #[arg(long, env = "MP_DB", default_value = "./memory_profile.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ProfileCommand {
    Run(RunArgs),
    Reapply(ProfileArgs),
    Upgrade(TargetArgs),
    Diff(TargetArgs),
    Versions(ProfileArgs),
    Status(ProfileArgs),
}

#[derive(Debug, Args)]
struct ProfileArgs {
    #[arg(long, default_value = PERSONAL_ASSISTANT)]
    profile: String,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    profile: ProfileArgs,
    #[arg(long)]
    version: Option<String>,
}

#[derive(Debug, Args)]
struct TargetArgs {
    #[command(flatten)]
    profile: ProfileArgs,
    #[arg(long)]
    target: Option<String>,
}

#[derive(Debug, Subcommand)]
enum MemoryCommand {
    List(MemoryListArgs),
    Add(MemoryAddArgs),
    Edit(MemoryEditArgs),
}

#[derive(Debug, Args)]
struct MemoryListArgs {
    /// Show every log row instead of the folded view.
    #[arg(long, default_value_t = false)]
    raw: bool,
}

#[derive(Debug, Args)]
struct MemoryAddArgs {
    #[arg(long = "type")]
    entry_type: String,
    #[arg(long)]
    text: Option<String>,
    #[arg(long)]
    key: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    value: Option<String>,
    /// Extra `field=value` pairs; values that parse as JSON are stored as JSON.
    #[arg(long = "set")]
    set: Vec<String>,
}

#[derive(Debug, Args)]
struct MemoryEditArgs {
    #[arg(long)]
    id: String,
    #[arg(long = "set", required = true)]
    set: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    List(AuditListArgs),
}

#[derive(Debug, Args)]
struct AuditListArgs {
    #[arg(long)]
    operation_id: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn to_json(value: &impl serde::Serialize, what: &str) -> Result<Value> {
    serde_json::to_value(value).with_context(|| format!("failed to serialize {what}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    tracing::debug!(db = %cli.db.display(), "using memory profile database");
    match cli.command {
        Command::Profile { command } => run_profile(command, &ProfileApi::new(cli.db)),
        Command::Memory { command } => run_memory(command, &ProfileApi::new(cli.db)),
        Command::Audit { command } => run_audit(command, &ProfileApi::new(cli.db)),
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
    }
}

fn run_profile(command: ProfileCommand, api: &ProfileApi) -> Result<()> {
    match command {
        ProfileCommand::Run(args) => {
            let report = api.run(&args.profile.profile, args.version.as_deref())?;
            emit_json(to_json(&report, "run report")?)
        }
        ProfileCommand::Reapply(args) => {
            let report = api.reapply(&args.profile)?;
            emit_json(to_json(&report, "reapply report")?)
        }
        ProfileCommand::Upgrade(args) => {
            let report = api.upgrade(&args.profile.profile, args.target.as_deref())?;
            emit_json(to_json(&report, "upgrade report")?)
        }
        ProfileCommand::Diff(args) => {
            let report = api.diff(&args.profile.profile, args.target.as_deref())?;
            emit_json(to_json(&report, "diff report")?)
        }
        ProfileCommand::Versions(args) => {
            let report = api.versions(&args.profile)?;
            emit_json(to_json(&report, "versions report")?)
        }
        ProfileCommand::Status(args) => {
            let report = api.status(&args.profile)?;
            emit_json(to_json(&report, "status report")?)
        }
    }
}

fn run_memory(command: MemoryCommand, api: &ProfileApi) -> Result<()> {
    match command {
        MemoryCommand::List(args) => {
            if args.raw {
                let log = api.list_log()?;
                return emit_json(serde_json::json!({
                    "count": log.len(),
                    "records": to_json(&log, "memory log")?
                }));
            }
            let entries = api.list_entries()?;
            emit_json(serde_json::json!({
                "count": entries.len(),
                "entries": to_json(&entries, "memory entries")?
            }))
        }
        MemoryCommand::Add(args) => {
            let mut entry = MemoryEntry::new().with(fields::TYPE, args.entry_type);
            for (field, value) in [
                (fields::TEXT, args.text),
                (fields::KEY, args.key),
                (fields::CATEGORY, args.category),
                ("value", args.value),
            ] {
                if let Some(value) = value {
                    entry.set(field, value);
                }
            }
            for (field, value) in parse_assignments(&args.set)? {
                entry.set(&field, value);
            }
            let entry = api.add_entry(entry)?;
            emit_json(serde_json::json!({ "entry": to_json(&entry, "memory entry")? }))
        }
        MemoryCommand::Edit(args) => {
            let changes = parse_assignments(&args.set)?;
            let result = api.edit_entry(&args.id, &changes)?;
            emit_json(to_json(&result, "edit result")?)
        }
    }
}

fn run_audit(command: AuditCommand, api: &ProfileApi) -> Result<()> {
    match command {
        AuditCommand::List(args) => {
            let events = api.audit_events(args.operation_id.as_deref())?;
            emit_json(serde_json::json!({
                "count": events.len(),
                "events": to_json(&events, "audit events")?
            }))
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }
            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "target_version": after.target_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::IntegrityCheck => {
            store.migrate()?;
            let report = store.integrity_check()?;
            emit_json(to_json(&report, "integrity report")?)
        }
    }
}

/// Parse `field=value` pairs. Values that are valid JSON keep their JSON type;
/// anything else is stored as a string.
fn parse_assignments(raw: &[String]) -> Result<Vec<(String, Value)>> {
    raw.iter()
        .map(|assignment| {
            let (field, value) = assignment
                .split_once('=')
                .ok_or_else(|| anyhow!("expected field=value, got {assignment}"))?;
            let field = field.trim();
            if field.is_empty() {
                return Err(anyhow!("empty field name in {assignment}"));
            }
            let value = serde_json::from_str::<Value>(value)
                .ok()
                .filter(|parsed| !parsed.is_string())
                .unwrap_or_else(|| Value::String(value.to_string()));
            Ok((field.to_string(), value))
        })
        .collect()
}
