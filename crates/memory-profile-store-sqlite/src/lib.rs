use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
pub use memory_profile_core::fold_entries;
use memory_profile_core::{fields, ActionCounts, MemoryEntry};
use rusqlite::{params, Connection, DatabaseName, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS memory_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT,
  entry_type TEXT,
  managed_key TEXT,
  appended_at TEXT NOT NULL,
  entry_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS profile_audit (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  operation_id TEXT NOT NULL,
  operation TEXT NOT NULL CHECK (operation IN ('run','reapply','upgrade','diff')),
  phase TEXT NOT NULL CHECK (phase IN ('start','plan','apply','complete','fail')),
  profile_id TEXT NOT NULL,
  version TEXT,
  counts_json TEXT,
  message TEXT,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memory_log_entry_id ON memory_log(entry_id);
CREATE INDEX IF NOT EXISTS idx_memory_log_managed_key ON memory_log(managed_key);
CREATE INDEX IF NOT EXISTS idx_profile_audit_operation_id ON profile_audit(operation_id);
";

pub struct SqliteStore {
    conn: Connection,
}

/// One open write transaction. Holding it serializes read-plan-apply-persist
/// against every other writer of the same database file.
pub struct StoreTx<'conn> {
    tx: Transaction<'conn>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogRecord {
    pub seq: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub appended_at: OffsetDateTime,
    pub entry: MemoryEntry,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Run,
    Reapply,
    Upgrade,
    Diff,
}

impl AuditOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Reapply => "reapply",
            Self::Upgrade => "upgrade",
            Self::Diff => "diff",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run" => Some(Self::Run),
            "reapply" => Some(Self::Reapply),
            "upgrade" => Some(Self::Upgrade),
            "diff" => Some(Self::Diff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    Start,
    Plan,
    Apply,
    Complete,
    Fail,
}

impl AuditPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Complete => "complete",
            Self::Fail => "fail",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Self::Start),
            "plan" => Some(Self::Plan),
            "apply" => Some(Self::Apply),
            "complete" => Some(Self::Complete),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// One lifecycle marker of a profile operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEvent {
    pub operation_id: String,
    pub operation: AuditOperation,
    pub phase: AuditPhase,
    pub profile_id: String,
    pub version: Option<String>,
    pub counts: Option<ActionCounts>,
    pub message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub log_records: usize,
    pub unreadable_log_records: Vec<i64>,
    pub materialized_entries: usize,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed memory log and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer
    /// than this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::debug!(version = 1, "applied memory log migration");
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Start an `IMMEDIATE` transaction that takes the write lock up front.
    ///
    /// # Errors
    /// Returns an error when the lock cannot be acquired within the busy timeout.
    pub fn begin(&mut self) -> Result<StoreTx<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start immediate transaction")?;
        Ok(StoreTx { tx })
    }

    /// Append entries to the log in one transaction; returns how many were written.
    ///
    /// # Errors
    /// Returns an error when serialization or any insert fails.
    pub fn append_entries(&mut self, entries: &[MemoryEntry]) -> Result<usize> {
        let tx = self.begin()?;
        let appended = tx.append_entries(entries)?;
        tx.commit()?;
        Ok(appended)
    }

    /// Every readable log row in append order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn list_log(&self) -> Result<Vec<LogRecord>> {
        Ok(read_log(&self.conn)?.0)
    }

    /// Raw log entries in append order, duplicates included.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn list_raw(&self) -> Result<Vec<MemoryEntry>> {
        Ok(self.list_log()?.into_iter().map(|record| record.entry).collect())
    }

    /// The deduplicated view of the log (see [`fold_entries`]).
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn materialize(&self) -> Result<Vec<MemoryEntry>> {
        Ok(fold_entries(&self.list_raw()?))
    }

    /// Persist one audit event outside any caller transaction.
    ///
    /// # Errors
    /// Returns an error when the event cannot be serialized or inserted.
    pub fn record_audit(&mut self, event: &AuditEvent) -> Result<()> {
        insert_audit(&self.conn, event)
    }

    /// Audit events in insertion order, optionally for one operation id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_audit(&self, operation_id: Option<&str>) -> Result<Vec<AuditEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT operation_id, operation, phase, profile_id, version, counts_json, message,
                    recorded_at
             FROM profile_audit
             WHERE (?1 IS NULL OR operation_id = ?1)
             ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![operation_id])?;
        let mut events = Vec::new();

        while let Some(row) = rows.next()? {
            let operation_raw: String = row.get(1)?;
            let phase_raw: String = row.get(2)?;
            let counts_json: Option<String> = row.get(5)?;
            events.push(AuditEvent {
                operation_id: row.get(0)?,
                operation: AuditOperation::parse(&operation_raw)
                    .ok_or_else(|| anyhow!("unknown audit operation: {operation_raw}"))?,
                phase: AuditPhase::parse(&phase_raw)
                    .ok_or_else(|| anyhow!("unknown audit phase: {phase_raw}"))?,
                profile_id: row.get(3)?,
                version: row.get(4)?,
                counts: counts_json
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()
                    .context("failed to deserialize audit counts")?,
                message: row.get(6)?,
                recorded_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
            });
        }

        Ok(events)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check plus log readability probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let (records, unreadable_log_records) = read_log(&self.conn)?;
        let entries = records.into_iter().map(|record| record.entry).collect::<Vec<_>>();
        let schema_status = self.schema_status()?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            log_records: entries.len() + unreadable_log_records.len(),
            unreadable_log_records,
            materialized_entries: fold_entries(&entries).len(),
            schema_status,
        })
    }
}

impl StoreTx<'_> {
    /// Folded view as seen inside this transaction.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn materialize(&self) -> Result<Vec<MemoryEntry>> {
        let (records, _) = read_log(&self.tx)?;
        let entries = records.into_iter().map(|record| record.entry).collect::<Vec<_>>();
        Ok(fold_entries(&entries))
    }

    /// # Errors
    /// Returns an error when serialization or any insert fails.
    pub fn append_entries(&self, entries: &[MemoryEntry]) -> Result<usize> {
        let appended_at = now_rfc3339()?;
        let mut stmt = self
            .tx
            .prepare(
                "INSERT INTO memory_log(entry_id, entry_type, managed_key, appended_at, entry_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .context("failed to prepare memory log insert")?;

        for entry in entries {
            let managed_key = entry.non_empty_str(fields::MANAGED_KEY);
            stmt.execute(params![
                entry.id(),
                entry.entry_type(),
                managed_key,
                appended_at,
                serde_json::to_string(entry).context("failed to serialize memory entry")?,
            ])
            .context("failed to append memory entry")?;
        }

        tracing::debug!(appended = entries.len(), "appended entries to memory log");
        Ok(entries.len())
    }

    /// # Errors
    /// Returns an error when the event cannot be serialized or inserted.
    pub fn record_audit(&self, event: &AuditEvent) -> Result<()> {
        insert_audit(&self.tx, event)
    }

    /// # Errors
    /// Returns an error when the commit fails.
    pub fn commit(self) -> Result<()> {
        self.tx.commit().context("failed to commit transaction")
    }
}

/// Readable log rows plus the `seq` of rows whose JSON is not an object.
fn read_log(conn: &Connection) -> Result<(Vec<LogRecord>, Vec<i64>)> {
    let mut stmt = conn.prepare(
        "SELECT seq, appended_at, entry_json
         FROM memory_log
         ORDER BY seq ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut records = Vec::new();
    let mut unreadable = Vec::new();

    while let Some(row) = rows.next()? {
        let seq: i64 = row.get(0)?;
        let entry_json: String = row.get(2)?;
        let entry =
            serde_json::from_str::<Value>(&entry_json).ok().and_then(MemoryEntry::from_value);
        let Some(entry) = entry else {
            tracing::warn!(seq, "skipping memory log row that is not a JSON object");
            unreadable.push(seq);
            continue;
        };
        records.push(LogRecord {
            seq,
            appended_at: parse_rfc3339(&row.get::<_, String>(1)?)?,
            entry,
        });
    }

    Ok((records, unreadable))
}

fn insert_audit(conn: &Connection, event: &AuditEvent) -> Result<()> {
    let counts_json = event
        .counts
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize audit counts")?;
    conn.execute(
        "INSERT INTO profile_audit(
            operation_id, operation, phase, profile_id, version, counts_json, message, recorded_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.operation_id,
            event.operation.as_str(),
            event.phase.as_str(),
            event.profile_id,
            event.version,
            counts_json,
            event.message,
            rfc3339(event.recorded_at)?,
        ],
    )
    .context("failed to insert audit event")?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
