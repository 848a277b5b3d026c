use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use memory_profile_core::{
    apply_profile_plan, content_hash, fields, format_timestamp, installed_version, plan_profile,
    ActionCounts, MemoryEntry, PackRegistry, PlanAction, PlanMode,
};
use memory_profile_store_sqlite::{
    AuditEvent, AuditOperation, AuditPhase, LogRecord, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

/// Outcome of one profile operation. `applied_counts` is absent for `diff`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationReport {
    pub operation_id: String,
    pub operation: AuditOperation,
    pub profile_id: String,
    pub version: String,
    pub mode: PlanMode,
    pub installed_version: Option<String>,
    pub plan_counts: ActionCounts,
    pub applied_counts: Option<ActionCounts>,
    pub appended_records: usize,
    pub actions: Vec<PlanAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    pub profile_id: String,
    pub installed_version: Option<String>,
    pub latest_version: Option<String>,
    pub upgrade_available: bool,
    pub managed_entries: usize,
    pub user_edited_entries: usize,
    pub total_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionsReport {
    pub profile_id: String,
    pub versions: Vec<String>,
    pub latest_version: Option<String>,
    pub installed_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditResult {
    pub previous: MemoryEntry,
    pub entry: MemoryEntry,
    pub user_edited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionChoice<'a> {
    Requested(Option<&'a str>),
    InstalledOrLatest,
}

#[derive(Debug, Clone)]
pub struct ProfileApi {
    db_path: PathBuf,
    registry: PackRegistry,
}

impl ProfileApi {
    /// API over the builtin profile packs.
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_registry(db_path, PackRegistry::builtin().clone())
    }

    #[must_use]
    pub fn with_registry(db_path: PathBuf, registry: PackRegistry) -> Self {
        Self { db_path, registry }
    }

    #[must_use]
    pub fn registry(&self) -> &PackRegistry {
        &self.registry
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Install `profile_id` at `version`, or at its latest version.
    ///
    /// # Errors
    /// Returns an error when the pack is unknown or persistence fails. The
    /// failure is audited and the memory log is left unchanged.
    pub fn run(&self, profile_id: &str, version: Option<&str>) -> Result<OperationReport> {
        self.execute(AuditOperation::Run, profile_id, VersionChoice::Requested(version))
    }

    /// Re-apply the installed version, falling back to the latest one.
    ///
    /// # Errors
    /// See [`ProfileApi::run`].
    pub fn reapply(&self, profile_id: &str) -> Result<OperationReport> {
        self.execute(AuditOperation::Reapply, profile_id, VersionChoice::InstalledOrLatest)
    }

    /// Move to `target`, or to the latest version.
    ///
    /// # Errors
    /// See [`ProfileApi::run`].
    pub fn upgrade(&self, profile_id: &str, target: Option<&str>) -> Result<OperationReport> {
        self.execute(AuditOperation::Upgrade, profile_id, VersionChoice::Requested(target))
    }

    /// Plan against `target` (or the latest version) without writing entries.
    ///
    /// # Errors
    /// See [`ProfileApi::run`].
    pub fn diff(&self, profile_id: &str, target: Option<&str>) -> Result<OperationReport> {
        self.execute(AuditOperation::Diff, profile_id, VersionChoice::Requested(target))
    }

    /// # Errors
    /// Returns an error when the memory log cannot be read.
    pub fn status(&self, profile_id: &str) -> Result<StatusReport> {
        let store = self.open_store()?;
        let current = store.materialize()?;
        let installed = installed_version(&current, profile_id);
        let latest = self.registry.latest_version(profile_id);
        let managed = current.iter().filter(|entry| entry.is_managed()).collect::<Vec<_>>();

        Ok(StatusReport {
            profile_id: profile_id.to_string(),
            upgrade_available: matches!(
                (&installed, &latest),
                (Some(installed), Some(latest)) if installed != latest
            ),
            installed_version: installed,
            latest_version: latest,
            managed_entries: managed.len(),
            user_edited_entries: managed.iter().filter(|entry| entry.is_user_edited()).count(),
            total_entries: current.len(),
        })
    }

    /// # Errors
    /// Returns an error when the memory log cannot be read.
    pub fn versions(&self, profile_id: &str) -> Result<VersionsReport> {
        let store = self.open_store()?;
        let current = store.materialize()?;
        Ok(VersionsReport {
            profile_id: profile_id.to_string(),
            versions: self.registry.list_versions(profile_id),
            latest_version: self.registry.latest_version(profile_id),
            installed_version: installed_version(&current, profile_id),
        })
    }

    /// The folded memory view.
    ///
    /// # Errors
    /// Returns an error when the memory log cannot be read.
    pub fn list_entries(&self) -> Result<Vec<MemoryEntry>> {
        self.open_store()?.materialize()
    }

    /// The raw memory log, one row per append.
    ///
    /// # Errors
    /// Returns an error when the memory log cannot be read.
    pub fn list_log(&self) -> Result<Vec<LogRecord>> {
        self.open_store()?.list_log()
    }

    /// Append one user-authored entry. A missing `id` gets a fresh ULID.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_entry(&self, mut entry: MemoryEntry) -> Result<MemoryEntry> {
        let mut store = self.open_store()?;
        if entry.id().is_none() {
            entry.set(fields::ID, Ulid::new().to_string());
        }
        if entry.non_empty_str(fields::CREATED).is_none() {
            entry.set(fields::CREATED, format_timestamp(OffsetDateTime::now_utc()));
        }
        store.append_entries(std::slice::from_ref(&entry))?;
        tracing::info!(id = entry.id().unwrap_or_default(), "memory entry added");
        Ok(entry)
    }

    /// Append a new version of entry `id` with `changes` applied.
    ///
    /// The content hash is recomputed and the baseline is kept, so editing a
    /// managed entry makes it user-edited.
    ///
    /// # Errors
    /// Returns an error when `id` is not in the folded view, when a change
    /// targets `id`, or when persistence fails.
    pub fn edit_entry(&self, id: &str, changes: &[(String, Value)]) -> Result<EditResult> {
        let mut store = self.open_store()?;
        let tx = store.begin()?;
        let previous = tx
            .materialize()?
            .into_iter()
            .find(|entry| entry.id() == Some(id))
            .ok_or_else(|| anyhow!("memory entry not found: {id}"))?;

        let mut entry = previous.clone();
        for (field, value) in changes {
            if field == fields::ID {
                return Err(anyhow!("refusing to change the id of memory entry {id}"));
            }
            entry.set(field, value.clone());
        }
        entry.set(fields::CONTENT_HASH, content_hash(&entry));

        tx.append_entries(std::slice::from_ref(&entry))?;
        tx.commit()?;
        tracing::info!(id, fields = changes.len(), "memory entry edited");

        Ok(EditResult { user_edited: entry.is_user_edited(), previous, entry })
    }

    /// # Errors
    /// Returns an error when audit rows cannot be read.
    pub fn audit_events(&self, operation_id: Option<&str>) -> Result<Vec<AuditEvent>> {
        self.open_store()?.list_audit(operation_id)
    }

    fn execute(
        &self,
        operation: AuditOperation,
        profile_id: &str,
        choice: VersionChoice<'_>,
    ) -> Result<OperationReport> {
        let mut store = self.open_store()?;
        let operation_id = Ulid::new().to_string();
        let requested = match choice {
            VersionChoice::Requested(version) => version.map(str::to_string),
            VersionChoice::InstalledOrLatest => None,
        };

        store
            .record_audit(&event(&operation_id, operation, AuditPhase::Start, profile_id))
            .context("failed to record start event")?;
        tracing::info!(
            %operation_id,
            operation = operation.as_str(),
            profile_id,
            "profile operation started"
        );

        let outcome =
            self.execute_in_transaction(&mut store, &operation_id, operation, profile_id, choice);
        match outcome {
            Ok(report) => {
                store
                    .record_audit(&AuditEvent {
                        version: Some(report.version.clone()),
                        counts: Some(report.applied_counts.unwrap_or(report.plan_counts)),
                        ..event(&operation_id, operation, AuditPhase::Complete, profile_id)
                    })
                    .context("failed to record complete event")?;
                tracing::info!(
                    %operation_id,
                    version = %report.version,
                    appended = report.appended_records,
                    "profile operation completed"
                );
                Ok(report)
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(
                    %operation_id,
                    profile_id,
                    error = %message,
                    "profile operation failed"
                );
                let failed = AuditEvent {
                    version: requested,
                    message: Some(message),
                    ..event(&operation_id, operation, AuditPhase::Fail, profile_id)
                };
                if let Err(audit_err) = store.record_audit(&failed) {
                    tracing::warn!(
                        %operation_id,
                        error = %format!("{audit_err:#}"),
                        "failed to record fail event"
                    );
                }
                Err(err)
            }
        }
    }

    fn execute_in_transaction(
        &self,
        store: &mut SqliteStore,
        operation_id: &str,
        operation: AuditOperation,
        profile_id: &str,
        choice: VersionChoice<'_>,
    ) -> Result<OperationReport> {
        let tx = store.begin()?;
        let current = tx.materialize()?;
        let installed = installed_version(&current, profile_id);

        let version = match choice {
            VersionChoice::Requested(Some(version)) => version.to_string(),
            VersionChoice::Requested(None) => self.registry.resolve_version(profile_id, None)?,
            VersionChoice::InstalledOrLatest => match installed.clone() {
                Some(version) => version,
                None => self.registry.resolve_version(profile_id, None)?,
            },
        };
        let mode = match operation {
            AuditOperation::Run => PlanMode::Run,
            AuditOperation::Reapply => PlanMode::Reapply,
            AuditOperation::Upgrade => PlanMode::Upgrade,
            AuditOperation::Diff => match installed.as_deref() {
                Some(installed) if installed != version => PlanMode::Upgrade,
                _ => PlanMode::Reapply,
            },
        };

        let planned = plan_profile(&self.registry, &current, profile_id, &version, mode)?;
        tx.record_audit(&AuditEvent {
            version: Some(version.clone()),
            counts: Some(planned.plan.counts),
            ..event(operation_id, operation, AuditPhase::Plan, profile_id)
        })?;

        if operation == AuditOperation::Diff {
            tx.commit()?;
            return Ok(OperationReport {
                operation_id: operation_id.to_string(),
                operation,
                profile_id: profile_id.to_string(),
                version,
                mode,
                installed_version: installed,
                plan_counts: planned.plan.counts,
                applied_counts: None,
                appended_records: 0,
                actions: planned.plan.actions,
            });
        }

        let applied = apply_profile_plan(&current, &planned.plan, OffsetDateTime::now_utc());
        let appended_records = tx.append_entries(applied.new_records(current.len()))?;
        tx.record_audit(&AuditEvent {
            version: Some(version.clone()),
            counts: Some(applied.applied_counts),
            ..event(operation_id, operation, AuditPhase::Apply, profile_id)
        })?;
        tx.commit()?;

        Ok(OperationReport {
            operation_id: operation_id.to_string(),
            operation,
            profile_id: profile_id.to_string(),
            version,
            mode,
            installed_version: installed,
            plan_counts: planned.plan.counts,
            applied_counts: Some(applied.applied_counts),
            appended_records,
            actions: applied.applied_actions,
        })
    }
}

fn event(
    operation_id: &str,
    operation: AuditOperation,
    phase: AuditPhase,
    profile_id: &str,
) -> AuditEvent {
    AuditEvent {
        operation_id: operation_id.to_string(),
        operation,
        phase,
        profile_id: profile_id.to_string(),
        version: None,
        counts: None,
        message: None,
        recorded_at: OffsetDateTime::now_utc(),
    }
}
