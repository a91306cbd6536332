//! Schema migration engine
//!
//! Migration scripts live in `<dir>/<dialect>/*.sql` and are applied in
//! filename order. Every file is checksummed (SHA-256) and compared with the
//! record in `cm_migrations`; state-changing decisions are appended to
//! `cm_migration_log` before the record is upserted.
//!
//! A script may declare what to do when its checksum drifts from the recorded
//! one with a leading comment:
//!
//! ```sql
//! --@meta onChecksumMismatch=reinstall
//! ```
//!
//! Accepted values are `fail` (default), `skip` and `reinstall`.

use super::connection::ConnectionManager;
use super::dialect::Dialect;
use super::executor::{try_get_nullable, DbExecutor};
use super::transaction::TransactionManager;
use super::types::{MigrationLogEntry, MigrationRecord, MigrationStatus};
use crate::tool::current_time::{parse_db_time, CurrentTime};
use crate::tool::error::DbError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Current-state table, one row per accepted file
pub const MIGRATIONS_TABLE: &str = "cm_migrations";

/// Append-only audit table
pub const MIGRATION_LOG_TABLE: &str = "cm_migration_log";

/// Error text a script raises to abort without failing the run
pub const ABORT_SENTINEL: &str = "MIGRATION_ABORTED";

const META_PREFIX: &str = "--@meta";

/// What to do when a registered file's checksum changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MismatchPolicy {
    #[default]
    Fail,
    Skip,
    Reinstall,
}

impl MismatchPolicy {
    fn parse(filename: &str, value: &str) -> Result<Self, DbError> {
        match value {
            "fail" => Ok(MismatchPolicy::Fail),
            "skip" => Ok(MismatchPolicy::Skip),
            "reinstall" => Ok(MismatchPolicy::Reinstall),
            _ => Err(DbError::InvalidPolicy {
                filename: filename.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// A discovered migration script
#[derive(Debug, Clone)]
pub struct MigrationFile {
    pub filename: String,
    pub path: PathBuf,
    pub script: String,
    pub checksum: String,
    pub policy: MismatchPolicy,
}

/// Decision taken for one file during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationOutcome {
    Installed,
    Reinstalled,
    Skipped,
    UpToDate,
}

/// Summary of one migration run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationReport {
    pub decisions: Vec<(String, MigrationOutcome)>,
    pub seeded: bool,
}

impl MigrationReport {
    pub fn count(&self, outcome: MigrationOutcome) -> usize {
        self.decisions.iter().filter(|(_, o)| *o == outcome).count()
    }

    /// Whether any file was executed or its record touched
    pub fn changed_anything(&self) -> bool {
        self.decisions
            .iter()
            .any(|(_, o)| matches!(o, MigrationOutcome::Installed | MigrationOutcome::Reinstalled))
    }
}

/// Hex-encoded SHA-256 of a script's raw bytes
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Reads the leading `--@meta key=value` directives of a script.
///
/// Only the comment block at the top of the file is inspected; the first
/// line that is neither blank nor a comment ends it.
pub fn parse_policy(filename: &str, script: &str) -> Result<MismatchPolicy, DbError> {
    let mut policy = MismatchPolicy::default();

    for line in script.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with("--") {
            break;
        }
        let Some(meta) = line.strip_prefix(META_PREFIX) else {
            continue;
        };
        for pair in meta.split_whitespace() {
            match pair.split_once('=') {
                Some(("onChecksumMismatch", value)) => {
                    policy = MismatchPolicy::parse(filename, value)?;
                }
                Some((key, _)) => {
                    warn!("{}: ignoring unknown migration metadata key '{}'", filename, key);
                }
                None => {
                    warn!("{}: malformed migration metadata '{}'", filename, pair);
                }
            }
        }
    }

    Ok(policy)
}

fn tracking_ddl(dialect: Dialect) -> String {
    let id_column = match dialect {
        Dialect::Postgres => "id BIGSERIAL PRIMARY KEY",
        Dialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (\
            filename TEXT NOT NULL PRIMARY KEY, \
            installed_at TEXT NOT NULL, \
            checksum TEXT NOT NULL\
        );\n\
        CREATE TABLE IF NOT EXISTS {MIGRATION_LOG_TABLE} (\
            {id_column}, \
            filename TEXT NOT NULL, \
            created_at TEXT NOT NULL, \
            checksum_expected TEXT, \
            checksum_actual TEXT NOT NULL, \
            status TEXT NOT NULL, \
            error_text TEXT\
        );"
    )
}

fn is_graceful_abort(err: &DbError) -> bool {
    err.to_string().contains(ABORT_SENTINEL)
}

/// Applies migration scripts and the optional seed script
pub struct MigrationEngine {
    connection: ConnectionManager,
    transactions: TransactionManager,
    dir: PathBuf,
}

impl MigrationEngine {
    pub fn new(connection: ConnectionManager, dir: impl Into<PathBuf>) -> Self {
        let transactions = TransactionManager::new(connection.clone());
        Self {
            connection,
            transactions,
            dir: dir.into(),
        }
    }

    fn dialect(&self) -> Dialect {
        self.connection.dialect()
    }

    /// Directory holding this dialect's scripts
    pub fn dialect_dir(&self) -> PathBuf {
        self.dir.join(self.dialect().dir_name())
    }

    /// Lists and reads the dialect's scripts in apply order.
    pub async fn discover(&self) -> Result<Vec<MigrationFile>, DbError> {
        let dir = self.dialect_dir();
        let io_err = |source| DbError::MigrationIo {
            path: dir.display().to_string(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_err)?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("sql") && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(read_migration(path).await?);
        }
        debug!("Discovered {} migration file(s) in {}", files.len(), dir.display());
        Ok(files)
    }

    /// Accepted migration records; empty on a virgin schema
    pub async fn applied(&self) -> Result<Vec<MigrationRecord>, DbError> {
        let db = &self.connection;
        if !db.table_exists(MIGRATIONS_TABLE).await? {
            return Ok(Vec::new());
        }
        let stmt = db
            .select_from(MIGRATIONS_TABLE)
            .columns(&["filename", "installed_at", "checksum"])
            .order_by("filename")
            .build();
        let rows = db.fetch_all(&stmt).await?;
        rows.iter()
            .map(|row| -> Result<MigrationRecord, DbError> {
                let installed_at: String = row.try_get("installed_at")?;
                Ok(MigrationRecord {
                    filename: row.try_get("filename")?,
                    installed_at: parse_db_time(&installed_at),
                    checksum: row.try_get("checksum")?,
                })
            })
            .collect()
    }

    /// Audit trail in insertion order; empty on a virgin schema
    pub async fn log_entries(&self) -> Result<Vec<MigrationLogEntry>, DbError> {
        let db = &self.connection;
        if !db.table_exists(MIGRATION_LOG_TABLE).await? {
            return Ok(Vec::new());
        }
        let stmt = db
            .select_from(MIGRATION_LOG_TABLE)
            .columns(&[
                "filename",
                "created_at",
                "checksum_expected",
                "checksum_actual",
                "status",
                "error_text",
            ])
            .order_by("id")
            .build();
        let rows = db.fetch_all(&stmt).await?;
        rows.iter()
            .map(|row| -> Result<MigrationLogEntry, DbError> {
                let created_at: String = row.try_get("created_at")?;
                let status: String = row.try_get("status")?;
                Ok(MigrationLogEntry {
                    filename: row.try_get("filename")?,
                    created_at: parse_db_time(&created_at),
                    checksum_expected: try_get_nullable(row, "checksum_expected")?,
                    checksum_actual: row.try_get("checksum_actual")?,
                    status: MigrationStatus::parse(&status).unwrap_or(MigrationStatus::Failed),
                    error_text: try_get_nullable(row, "error_text")?,
                })
            })
            .collect()
    }

    /// Applies pending scripts, then runs `seed` if given.
    ///
    /// Any error is meant to be fatal to startup.
    pub async fn migrate(&self, seed: Option<&Path>) -> Result<MigrationReport, DbError> {
        let started = Instant::now();
        let files = self.discover().await?;
        let applied: HashMap<String, String> = self
            .applied()
            .await?
            .into_iter()
            .map(|r| (r.filename, r.checksum))
            .collect();

        self.connection
            .execute_script(&tracking_ddl(self.dialect()))
            .await?;

        let mut report = MigrationReport::default();
        for file in &files {
            let outcome = match applied.get(&file.filename) {
                None => {
                    self.apply(file, None, MigrationStatus::Installed).await?;
                    MigrationOutcome::Installed
                }
                Some(recorded) if *recorded == file.checksum => {
                    debug!("Migration {} is up to date", file.filename);
                    MigrationOutcome::UpToDate
                }
                Some(recorded) => self.on_mismatch(file, recorded).await?,
            };
            report.decisions.push((file.filename.clone(), outcome));
        }

        if let Some(seed) = seed {
            self.seed(seed).await?;
            report.seeded = true;
        }

        info!(
            "Migrations done in {:?}: {} installed, {} reinstalled, {} skipped, {} up to date",
            started.elapsed(),
            report.count(MigrationOutcome::Installed),
            report.count(MigrationOutcome::Reinstalled),
            report.count(MigrationOutcome::Skipped),
            report.count(MigrationOutcome::UpToDate),
        );
        Ok(report)
    }

    async fn on_mismatch(
        &self,
        file: &MigrationFile,
        recorded: &str,
    ) -> Result<MigrationOutcome, DbError> {
        match file.policy {
            MismatchPolicy::Fail => {
                error!(
                    "Checksum mismatch for {}: recorded {}, found {}",
                    file.filename, recorded, file.checksum
                );
                let err = DbError::ChecksumMismatch {
                    filename: file.filename.clone(),
                    expected: recorded.to_string(),
                    actual: file.checksum.clone(),
                };
                let message = err.to_string();
                self.log_decision(file, Some(recorded), MigrationStatus::Failed, Some(&message))
                    .await?;
                Err(err)
            }
            MismatchPolicy::Skip => {
                if self.skip_logged(file).await? {
                    debug!("Migration {} still skipped", file.filename);
                } else {
                    warn!("Checksum mismatch for {}, skipping as declared", file.filename);
                    self.log_decision(file, Some(recorded), MigrationStatus::Skipped, None)
                        .await?;
                }
                Ok(MigrationOutcome::Skipped)
            }
            MismatchPolicy::Reinstall => {
                warn!("Checksum mismatch for {}, reinstalling as declared", file.filename);
                self.apply(file, Some(recorded), MigrationStatus::Reinstalled)
                    .await?;
                Ok(MigrationOutcome::Reinstalled)
            }
        }
    }

    /// Executes one script in its own transaction, then records the outcome.
    async fn apply(
        &self,
        file: &MigrationFile,
        recorded: Option<&str>,
        status: MigrationStatus,
    ) -> Result<(), DbError> {
        info!("Applying migration {} ({})", file.filename, status);
        let started = Instant::now();
        let script = file.script.as_str();

        let result = self
            .transactions
            .with_transaction(|tx| async move { tx.execute_script(script).await })
            .await;

        match result {
            Ok(()) => {
                debug!("Migration {} executed in {:?}", file.filename, started.elapsed());
            }
            Err(err) if is_graceful_abort(&err) => {
                info!("Migration {} aborted gracefully: {}", file.filename, err);
            }
            Err(err) => {
                error!("Migration {} failed: {}", file.filename, err);
                let message = err.to_string();
                self.log_decision(file, recorded, MigrationStatus::Failed, Some(&message))
                    .await?;
                return Err(DbError::Migration {
                    filename: file.filename.clone(),
                    message,
                });
            }
        }

        self.log_decision(file, recorded, status, None).await?;
        self.record(file).await
    }

    /// Whether this exact script content was already logged as skipped
    async fn skip_logged(&self, file: &MigrationFile) -> Result<bool, DbError> {
        let db = &self.connection;
        let stmt = db
            .select_from(MIGRATION_LOG_TABLE)
            .columns(&["id"])
            .filter_eq("filename", file.filename.as_str())
            .filter_eq("checksum_actual", file.checksum.as_str())
            .filter_eq("status", MigrationStatus::Skipped.as_str())
            .build();
        Ok(db.fetch_optional(&stmt).await?.is_some())
    }

    async fn log_decision(
        &self,
        file: &MigrationFile,
        expected: Option<&str>,
        status: MigrationStatus,
        error_text: Option<&str>,
    ) -> Result<(), DbError> {
        let db = &self.connection;
        let stmt = db
            .insert_into(MIGRATION_LOG_TABLE)
            .columns(&[
                "filename",
                "created_at",
                "checksum_expected",
                "checksum_actual",
                "status",
                "error_text",
            ])
            .row(vec![
                file.filename.as_str().into(),
                CurrentTime::new().to_db_string().into(),
                expected.into(),
                file.checksum.as_str().into(),
                status.as_str().into(),
                error_text.into(),
            ])
            .build();
        db.execute_one(&stmt).await
    }

    async fn record(&self, file: &MigrationFile) -> Result<(), DbError> {
        let db = &self.connection;
        let stmt = db
            .insert_into(MIGRATIONS_TABLE)
            .columns(&["filename", "installed_at", "checksum"])
            .row(vec![
                file.filename.as_str().into(),
                CurrentTime::new().to_db_string().into(),
                file.checksum.as_str().into(),
            ])
            .on_conflict_update(&["filename"], &["installed_at", "checksum"])
            .build();
        db.execute(&stmt).await?;
        Ok(())
    }

    /// Runs a seed script after rewriting the dialect macros.
    pub async fn seed(&self, path: &Path) -> Result<(), DbError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DbError::MigrationIo {
                path: path.display().to_string(),
                source,
            })?;
        let script = self.dialect().rewrite_seed(&raw);

        info!("Running seed script {}", path.display());
        let script = script.as_str();
        self.transactions
            .with_transaction(|tx| async move { tx.execute_script(script).await })
            .await
            .map_err(|err| DbError::Migration {
                filename: path.display().to_string(),
                message: err.to_string(),
            })
    }
}

async fn read_migration(path: PathBuf) -> Result<MigrationFile, DbError> {
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|source| DbError::MigrationIo {
            path: path.display().to_string(),
            source,
        })?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let checksum = checksum(&bytes);
    let script = String::from_utf8(bytes).map_err(|_| DbError::Migration {
        filename: filename.clone(),
        message: "script is not valid UTF-8".to_string(),
    })?;
    let policy = parse_policy(&filename, &script)?;

    Ok(MigrationFile {
        filename,
        path,
        script,
        checksum,
        policy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(checksum(b"CREATE TABLE a (x INT);"), checksum(b"CREATE TABLE a (y INT);"));
    }

    #[test]
    fn test_policy_defaults_to_fail() {
        let script = "-- plain comment\nCREATE TABLE t (id INT);";
        assert_eq!(parse_policy("0001.sql", script).unwrap(), MismatchPolicy::Fail);
    }

    #[test]
    fn test_policy_from_leading_meta() {
        let script = "\n-- adds users\n--@meta onChecksumMismatch=reinstall\nCREATE TABLE t (id INT);";
        assert_eq!(
            parse_policy("0002.sql", script).unwrap(),
            MismatchPolicy::Reinstall
        );

        let script = "--@meta author=me onChecksumMismatch=skip\nSELECT 1;";
        assert_eq!(parse_policy("0003.sql", script).unwrap(), MismatchPolicy::Skip);
    }

    #[test]
    fn test_meta_after_body_is_ignored() {
        let script = "SELECT 1;\n--@meta onChecksumMismatch=skip\n";
        assert_eq!(parse_policy("0004.sql", script).unwrap(), MismatchPolicy::Fail);
    }

    #[test]
    fn test_invalid_policy_is_fatal() {
        let script = "--@meta onChecksumMismatch=ignore\nSELECT 1;";
        match parse_policy("0005.sql", script) {
            Err(DbError::InvalidPolicy { filename, value }) => {
                assert_eq!(filename, "0005.sql");
                assert_eq!(value, "ignore");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_graceful_abort_detection() {
        let err = DbError::Migration {
            filename: "x.sql".to_string(),
            message: format!("error returned from database: {ABORT_SENTINEL}"),
        };
        assert!(is_graceful_abort(&err));
        assert!(!is_graceful_abort(&DbError::Interrupted));
    }

    #[test]
    fn test_report_counts() {
        let report = MigrationReport {
            decisions: vec![
                ("a.sql".to_string(), MigrationOutcome::UpToDate),
                ("b.sql".to_string(), MigrationOutcome::Skipped),
            ],
            seeded: false,
        };
        assert_eq!(report.count(MigrationOutcome::UpToDate), 1);
        assert!(!report.changed_anything());
    }
}
