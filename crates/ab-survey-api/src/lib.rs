use std::path::{Path, PathBuf};

use ab_survey_core::{
    summarize, ItemId, ItemPool, Response, Session, SessionState, SurveyError, SurveyRng, TesterId,
    TesterSummary,
};
use ab_survey_store_sqlite::{
    BatchOutcome, CsvExport, ImportSummary, IntegrityReport, SchemaStatus, SqliteStore,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

mod config;
mod runner;

pub use config::{ConfigOverrides, SurveyConfig, DEFAULT_CONFIG_FILE};
pub use runner::{FormInput, PresentationSurface, RunOutcome, SidePaths, SurveyRunner};

/// Prefix of every error raised while writing a finished session to disk.
pub const SAVE_FAILED: &str = "results could not be saved";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// What finalizing a completed session did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalizeReport {
    pub session_id: String,
    pub outcome: BatchOutcome,
    pub summary: TesterSummary,
    pub results_csv: PathBuf,
    pub tester_results_csv: PathBuf,
    /// Items this session passed over because their files could not be shown.
    pub skipped_items: Vec<ItemId>,
}

#[derive(Debug, Clone)]
pub struct SurveyApi {
    config: SurveyConfig,
}

impl SurveyApi {
    #[must_use]
    pub fn new(config: SurveyConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &SurveyConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.config.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity check fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.open_migrated_store()?.backup_database(out_file)
    }

    /// Scan both variant directories into a shuffled pool.
    ///
    /// # Errors
    /// Returns an error when the directories cannot be read or no item has both variants.
    pub fn load_pool(&self, rng: &mut SurveyRng) -> Result<ItemPool> {
        let pool = ItemPool::load(&self.config.variant_a_dir, &self.config.variant_b_dir, rng)?;
        Ok(pool)
    }

    /// Load the pool with the configured randomness and open a fresh session over it.
    ///
    /// # Errors
    /// Same as [`SurveyApi::load_pool`].
    pub fn start_session(&self) -> Result<(ItemPool, Session)> {
        let mut rng = self.config.rng();
        let pool = self.load_pool(&mut rng)?;
        let session = Session::new(pool.order().clone(), rng);
        tracing::debug!(session = %session.id(), items = pool.len(), "session started");
        Ok((pool, session))
    }

    /// Persist a completed session and summarize the tester's whole history.
    ///
    /// Runs at most once per session. A session that was already finalized, in this process or
    /// by an earlier one holding the same session id, writes nothing and still gets its summary.
    /// Rows already sitting in the results file but missing from the log, such as a file left by
    /// an older tool or another database, are appended ahead of this session's rows.
    ///
    /// # Errors
    /// Returns [`SurveyError::SessionIncomplete`] before every item is answered, and an error
    /// starting with [`SAVE_FAILED`] when the durable log or CSV files cannot be written.
    pub fn finalize(&self, session: &mut Session) -> Result<FinalizeReport> {
        if session.state() != SessionState::Completed {
            return Err(SurveyError::SessionIncomplete { remaining: session.remaining() }.into());
        }
        let tester = session.tester().cloned().ok_or(SurveyError::IdentityRequired)?;
        let session_id = session.id().to_string();
        let tester_results_csv = self.config.tester_results_path(&tester);

        let mut store = self.open_migrated_store().context(SAVE_FAILED)?;
        let outcome = if session.is_finalized() {
            BatchOutcome::AlreadyRecorded
        } else {
            let exports = [
                CsvExport::All(self.config.results_csv.clone()),
                CsvExport::Tester(tester.clone(), tester_results_csv.clone()),
            ];
            let outcome = store
                .append_batch(&session_id, Some(&tester), session.responses(), &exports)
                .context(SAVE_FAILED)?;
            session.mark_finalized();
            outcome
        };

        let history = store.list_responses_for_tester(&tester)?;
        let summary = summarize(&tester, &history);
        tracing::info!(
            session = %session_id,
            tester = %tester,
            total_comparisons = summary.total_comparisons,
            "session finalized"
        );

        Ok(FinalizeReport {
            session_id,
            outcome,
            summary,
            results_csv: self.config.results_csv.clone(),
            tester_results_csv,
            skipped_items: session.skipped().to_vec(),
        })
    }

    /// Summary over every response the log holds for `tester`.
    ///
    /// # Errors
    /// Returns an error when the log cannot be read.
    pub fn tester_summary(&self, tester: &TesterId) -> Result<TesterSummary> {
        let store = self.open_migrated_store()?;
        let history = store.list_responses_for_tester(tester)?;
        Ok(summarize(tester, &history))
    }

    /// # Errors
    /// Returns an error when the log cannot be read.
    pub fn responses(&self, tester: Option<&TesterId>) -> Result<Vec<Response>> {
        let store = self.open_migrated_store()?;
        match tester {
            Some(tester) => store.list_responses_for_tester(tester),
            None => store.list_responses(),
        }
    }

    /// Write the log, or one tester's part of it, to `out` as CSV. Returns the row count.
    ///
    /// # Errors
    /// Returns an error when the log cannot be read or the file cannot be written.
    pub fn export_csv(&self, out: &Path, tester: Option<&TesterId>) -> Result<usize> {
        self.open_migrated_store()?.export_csv(out, tester)
    }

    /// Merge a flat results CSV into the log and refresh the global results file.
    ///
    /// The live results file may be named here too: rows it holds from elsewhere are merged,
    /// and a copy the log itself wrote merges nothing.
    ///
    /// # Errors
    /// Returns an error when the file is unreadable or malformed, or the log cannot be written.
    pub fn import_csv(&self, input: &Path) -> Result<ImportSummary> {
        let mut store = self.open_migrated_store()?;
        let summary =
            store.import_csv(input, &[CsvExport::All(self.config.results_csv.clone())])?;
        tracing::info!(source = %input.display(), outcome = ?summary.outcome, "csv imported");
        Ok(summary)
    }
}
