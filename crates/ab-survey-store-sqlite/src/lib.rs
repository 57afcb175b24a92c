use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ab_survey_core::{
    parse_preferred_variant, preferred_variant_str, Confidence, ItemId, Preference, Response,
    TesterId, Variant,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod csv;

pub use crate::csv::{
    read_responses_csv, render_responses, stage_responses_csv, write_responses_csv, StagedCsv,
    RESPONSE_COLUMNS,
};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS responses (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id TEXT NOT NULL,
  tester_id TEXT NOT NULL CHECK (length(trim(tester_id)) > 0),
  item_id TEXT NOT NULL,
  left_variant TEXT NOT NULL CHECK (left_variant IN ('A','B')),
  right_variant TEXT NOT NULL CHECK (right_variant IN ('A','B')),
  preferred_side TEXT NOT NULL CHECK (preferred_side IN ('Left','Right','No preference')),
  preferred_variant TEXT NOT NULL CHECK (preferred_variant IN ('A','B','None')),
  confidence INTEGER NOT NULL CHECK (confidence BETWEEN 1 AND 5),
  comment TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  CHECK (left_variant <> right_variant),
  FOREIGN KEY (session_id) REFERENCES finalized_sessions(session_id)
);

CREATE TABLE IF NOT EXISTS finalized_sessions (
  session_id TEXT PRIMARY KEY,
  tester_id TEXT,
  response_count INTEGER NOT NULL CHECK (response_count >= 0),
  finalized_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_responses_tester ON responses(tester_id);
CREATE INDEX IF NOT EXISTS idx_responses_session ON responses(session_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS published_exports (
  sha256 TEXT PRIMARY KEY,
  path TEXT NOT NULL,
  published_at TEXT NOT NULL
);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: usize,
    pub response_rows: usize,
    pub finalized_sessions: usize,
    pub schema_status: SchemaStatus,
}

/// Result of handing one batch of responses to the durable log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Recorded { responses: usize },
    AlreadyRecorded,
}

/// CSV files regenerated from the log inside the same write transaction as a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsvExport {
    /// Every row in the log.
    All(PathBuf),
    /// Only rows for one tester.
    Tester(TesterId, PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub source: String,
    pub batch_id: String,
    pub rows_in_file: usize,
    pub outcome: BatchOutcome,
}

impl SqliteStore {
    /// Open a SQLite-backed response log and configure required runtime pragmas.
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

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version < 1 {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
        }

        let version = current_schema_version(&self.conn)?;
        if version < 2 {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration v2 transaction")?;
            tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
            record_schema_version(&tx, 2)?;
            tx.commit().context("failed to commit migration v2")?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Append one batch of responses under an exclusive write lock.
    ///
    /// A batch id is recorded once; handing the same id in again appends nothing and reports
    /// [`BatchOutcome::AlreadyRecorded`].
    ///
    /// Before the batch goes in, an existing [`CsvExport::All`] target this store did not write
    /// itself is read, and any rows it holds that the log lacks are appended first, so
    /// regenerating the file never drops them. The requested CSV files are staged inside the
    /// transaction and only renamed into place after it commits.
    ///
    /// # Errors
    /// Returns an error when a response fails validation, an existing results file cannot be
    /// read, or any write or export fails. A failure before commit leaves the log and the CSV
    /// targets untouched.
    pub fn append_batch(
        &mut self,
        batch_id: &str,
        tester: Option<&TesterId>,
        responses: &[Response],
        exports: &[CsvExport],
    ) -> Result<BatchOutcome> {
        for response in responses {
            response.validate().map_err(|err| anyhow!("response validation failed: {err}"))?;
            if let Some(tester) = tester {
                if &response.tester_id != tester {
                    return Err(anyhow!(
                        "batch for tester {tester} contains a response from {}",
                        response.tester_id
                    ));
                }
            }
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start append transaction")?;

        if batch_recorded(&tx, batch_id)? {
            tracing::info!(batch = batch_id, "batch already recorded; nothing appended");
            return Ok(BatchOutcome::AlreadyRecorded);
        }

        let now = now_rfc3339()?;
        for export in exports {
            if let CsvExport::All(path) = export {
                adopt_unlogged_rows(&tx, path, batch_id, &now)?;
            }
        }
        insert_batch(&tx, batch_id, tester, responses, &now)?;

        let mut staged = Vec::with_capacity(exports.len());
        for export in exports {
            let (rows, path) = match export {
                CsvExport::All(path) => (query_responses(&tx, None)?, path),
                CsvExport::Tester(tester, path) => (query_responses(&tx, Some(tester))?, path),
            };
            let file = stage_responses_csv(path, &rows)?;
            record_published(&tx, &file, &now)?;
            staged.push(file);
        }

        tx.commit().context("failed to commit append transaction")?;
        for file in staged {
            let target = file.target().display().to_string();
            file.publish()
                .with_context(|| format!("batch {batch_id} is in the log but {target} was not refreshed"))?;
        }
        tracing::info!(batch = batch_id, responses = responses.len(), "batch appended");
        Ok(BatchOutcome::Recorded { responses: responses.len() })
    }

    /// Whether a batch id (a session id or an import digest) is already in the log.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn is_batch_recorded(&self, batch_id: &str) -> Result<bool> {
        batch_recorded(&self.conn, batch_id)
    }

    /// Every response in append order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_responses(&self) -> Result<Vec<Response>> {
        query_responses(&self.conn, None)
    }

    /// Responses recorded for `tester`, in append order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_responses_for_tester(&self, tester: &TesterId) -> Result<Vec<Response>> {
        query_responses(&self.conn, Some(tester))
    }

    /// Merge a flat results CSV into the log.
    ///
    /// The file's SHA-256 is its batch id, so the same file is only ever merged once. A file
    /// whose bytes match an export this store wrote is already in the log and merges nothing,
    /// whatever path it is read from.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, or the append fails.
    pub fn import_csv(&mut self, path: &Path, exports: &[CsvExport]) -> Result<ImportSummary> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read CSV file {}", path.display()))?;
        let digest = csv::sha256_hex(&bytes);
        let batch_id = import_batch_id(&digest);
        let responses = parse_csv_bytes(path, bytes)?;

        let outcome = if was_published(&self.conn, &digest)? {
            tracing::info!(source = %path.display(), "file is an export of this log; nothing imported");
            BatchOutcome::AlreadyRecorded
        } else {
            self.append_batch(&batch_id, None, &responses, exports)?
        };
        Ok(ImportSummary {
            source: path.display().to_string(),
            batch_id,
            rows_in_file: responses.len(),
            outcome,
        })
    }

    /// Write the whole log, or one tester's slice of it, as CSV.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or the file cannot be written.
    pub fn export_csv(&self, path: &Path, tester: Option<&TesterId>) -> Result<usize> {
        let rows = query_responses(&self.conn, tester)?;
        let file = stage_responses_csv(path, &rows)?;
        record_published(&self.conn, &file, &now_rfc3339()?)?;
        file.publish()?;
        Ok(rows.len())
    }

    /// Copy the database to `out_file` using the online backup API.
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

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let mut rows = stmt.query([])?;
        let mut foreign_key_violations = 0_usize;
        while rows.next()?.is_some() {
            foreign_key_violations += 1;
        }

        let schema_status = self.schema_status()?;
        let (response_rows, finalized_sessions) = if schema_status.current_version >= 1 {
            (count_rows(&self.conn, "responses")?, count_rows(&self.conn, "finalized_sessions")?)
        } else {
            (0, 0)
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            response_rows,
            finalized_sessions,
            schema_status,
        })
    }
}

fn query_responses(conn: &Connection, tester: Option<&TesterId>) -> Result<Vec<Response>> {
    let mut stmt = conn
        .prepare(
            "SELECT tester_id, item_id, left_variant, right_variant,
                    preferred_side, preferred_variant, confidence, comment
             FROM responses
             WHERE ?1 IS NULL OR tester_id = ?1
             ORDER BY seq ASC",
        )
        .context("failed to prepare response query")?;

    let mut rows = stmt.query(params![tester.map(TesterId::as_str)])?;
    let mut responses = Vec::new();

    while let Some(row) = rows.next()? {
        let tester_raw: String = row.get(0)?;
        let left_raw: String = row.get(2)?;
        let right_raw: String = row.get(3)?;
        let side_raw: String = row.get(4)?;
        let preferred_raw: String = row.get(5)?;

        responses.push(Response {
            tester_id: TesterId::parse(&tester_raw)?,
            item_id: ItemId::new(row.get::<_, String>(1)?),
            left_variant: parse_variant(&left_raw)?,
            right_variant: parse_variant(&right_raw)?,
            preferred_side: Preference::parse(&side_raw)?,
            preferred_variant: parse_preferred_variant(&preferred_raw)
                .ok_or_else(|| anyhow!("unknown preferred_variant: {preferred_raw}"))?,
            confidence: Confidence::new(row.get::<_, i64>(6)?)?,
            comment: row.get(7)?,
        });
    }

    Ok(responses)
}

fn batch_recorded(conn: &Connection, batch_id: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM finalized_sessions WHERE session_id = ?1)",
            params![batch_id],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to look up batch id")?;
    Ok(exists == 1)
}

fn insert_batch(
    conn: &Connection,
    batch_id: &str,
    tester: Option<&TesterId>,
    responses: &[Response],
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO finalized_sessions(session_id, tester_id, response_count, finalized_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            batch_id,
            tester.map(TesterId::as_str),
            i64::try_from(responses.len()).context("batch too large")?,
            now
        ],
    )
    .context("failed to record batch")?;

    let mut insert = conn
        .prepare(
            "INSERT INTO responses(
                session_id, tester_id, item_id, left_variant, right_variant,
                preferred_side, preferred_variant, confidence, comment, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .context("failed to prepare response insert")?;
    for response in responses {
        insert
            .execute(params![
                batch_id,
                response.tester_id.as_str(),
                response.item_id.as_str(),
                response.left_variant.as_str(),
                response.right_variant.as_str(),
                response.preferred_side.as_str(),
                preferred_variant_str(response.preferred_variant),
                response.confidence.get(),
                response.comment,
                now,
            ])
            .with_context(|| format!("failed to insert response for {}", response.item_id))?;
    }
    Ok(())
}

/// Append the rows of an existing results file that the log does not hold yet.
///
/// Files this store published are skipped outright. Otherwise rows are matched against the log
/// as a multiset, so a row present twice in the file and once in the log is adopted once.
fn adopt_unlogged_rows(conn: &Connection, path: &Path, batch_id: &str, now: &str) -> Result<()> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read existing results file {}", path.display())
            });
        }
    };
    let digest = csv::sha256_hex(&bytes);
    let adopt_id = import_batch_id(&digest);
    if adopt_id == batch_id || was_published(conn, &digest)? || batch_recorded(conn, &adopt_id)? {
        return Ok(());
    }

    let mut logged: HashMap<String, usize> = HashMap::new();
    for response in query_responses(conn, None)? {
        *logged.entry(csv::render_row(&response)).or_default() += 1;
    }
    let missing: Vec<Response> = parse_csv_bytes(path, bytes)?
        .into_iter()
        .filter(|response| match logged.get_mut(&csv::render_row(response)) {
            Some(count) if *count > 0 => {
                *count -= 1;
                false
            }
            _ => true,
        })
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    insert_batch(conn, &adopt_id, None, &missing, now)?;
    tracing::warn!(
        path = %path.display(),
        rows = missing.len(),
        "results file held rows missing from the log; adopted them before appending"
    );
    Ok(())
}

fn parse_csv_bytes(path: &Path, bytes: Vec<u8>) -> Result<Vec<Response>> {
    let text = String::from_utf8(bytes)
        .with_context(|| format!("CSV file {} is not valid UTF-8", path.display()))?;
    csv::parse_responses(&text).with_context(|| format!("invalid results CSV {}", path.display()))
}

fn import_batch_id(digest: &str) -> String {
    format!("import:sha256:{digest}")
}

fn was_published(conn: &Connection, digest: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM published_exports WHERE sha256 = ?1)",
            params![digest],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to look up published export")?;
    Ok(exists == 1)
}

fn record_published(conn: &Connection, file: &StagedCsv, now: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO published_exports(sha256, path, published_at) VALUES (?1, ?2, ?3)",
        params![file.sha256(), file.target().display().to_string(), now],
    )
    .with_context(|| format!("failed to record export of {}", file.target().display()))?;
    Ok(())
}

fn parse_variant(raw: &str) -> Result<Variant> {
    Variant::parse(raw).ok_or_else(|| anyhow!("unknown variant: {raw}"))
}

fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    let count = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to count rows in {table}"))?;
    usize::try_from(count).with_context(|| format!("negative row count in {table}"))
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
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
