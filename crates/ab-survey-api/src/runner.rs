use std::fs;
use std::path::{Path, PathBuf};

use ab_survey_core::{
    ItemPool, ItemView, Session, SessionState, Side, Submission, TesterSummary, VariantPaths,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{FinalizeReport, SurveyApi};

/// Files to draw for the current item.
///
/// Both are neutral copies named only by position and side, so neither the path nor the file
/// name tells which variant sits where.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SidePaths {
    pub left: PathBuf,
    pub right: PathBuf,
}

/// Raw form values read together when the tester presses submit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormInput {
    pub preference: String,
    pub confidence: i64,
    pub comment: Option<String>,
}

/// Whatever shows the survey to a tester: a terminal, a window, a test script.
///
/// `request_identity` and `collect_form` return `None` when the tester walks away.
pub trait PresentationSurface {
    /// # Errors
    /// Returns an error when the surface cannot read input.
    fn request_identity(&mut self) -> Result<Option<String>>;

    /// # Errors
    /// Returns an error when the surface cannot render.
    fn show_item(&mut self, view: &ItemView, paths: &SidePaths) -> Result<()>;

    /// # Errors
    /// Returns an error when the surface cannot read input.
    fn collect_form(&mut self, view: &ItemView) -> Result<Option<FormInput>>;

    /// # Errors
    /// Returns an error when the surface cannot render.
    fn notify(&mut self, message: &str) -> Result<()>;

    /// # Errors
    /// Returns an error when the surface cannot render.
    fn show_summary(&mut self, summary: &TesterSummary) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(FinalizeReport),
    /// Input ended first; nothing was written.
    Abandoned { answered: usize, total: usize },
}

/// Per-session scratch directory holding the pair currently on screen.
///
/// Removed with everything in it when dropped.
struct ViewStage {
    dir: PathBuf,
    current: Option<SidePaths>,
}

impl ViewStage {
    fn for_session(session: &Session) -> Self {
        Self { dir: std::env::temp_dir().join(format!("abt-view-{}", session.id())), current: None }
    }

    fn stage(&mut self, view: &ItemView, paths: &VariantPaths) -> Result<SidePaths> {
        if let Some(previous) = self.current.take() {
            let _ = fs::remove_file(previous.left);
            let _ = fs::remove_file(previous.right);
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create view directory {}", self.dir.display()))?;

        let extension = Path::new(view.item.as_str())
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let copy_side = |side: Side, label: &str| -> Result<PathBuf> {
            let source = paths.for_side(view.assignment, side);
            let staged = self.dir.join(format!("{:03}-{label}{extension}", view.position));
            fs::copy(source, &staged)
                .with_context(|| format!("failed to stage {} for display", source.display()))?;
            Ok(staged)
        };
        let sides = SidePaths {
            left: copy_side(Side::Left, "left")?,
            right: copy_side(Side::Right, "right")?,
        };
        self.current = Some(sides.clone());
        Ok(sides)
    }
}

impl Drop for ViewStage {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// Drives one session from discrete surface events.
pub struct SurveyRunner<'a, S> {
    api: &'a SurveyApi,
    pool: ItemPool,
    session: Session,
    surface: S,
    stage: ViewStage,
}

impl<'a, S: PresentationSurface> SurveyRunner<'a, S> {
    #[must_use]
    pub fn new(api: &'a SurveyApi, pool: ItemPool, session: Session, surface: S) -> Self {
        let stage = ViewStage::for_session(&session);
        Self { api, pool, session, surface, stage }
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn into_parts(self) -> (Session, S) {
        (self.session, self.surface)
    }

    /// Handle one identity entry. Rejected input is reported to the surface, not returned.
    ///
    /// # Errors
    /// Returns an error only when the surface fails.
    pub fn on_identity(&mut self, raw: &str) -> Result<()> {
        if let Err(err) = self.session.identify(raw) {
            tracing::debug!(session = %self.session.id(), error = %err, "identity rejected");
            self.surface.notify(&err.to_string())?;
        }
        Ok(())
    }

    /// Handle one form submission, finalizing when it answers the last item.
    ///
    /// # Errors
    /// Returns an error when the session refuses the submission, finalization fails, or the
    /// surface fails. Invalid form values are reported to the surface instead.
    pub fn on_submit(&mut self, form: FormInput) -> Result<Option<FinalizeReport>> {
        let submission =
            match Submission::parse(&form.preference, form.confidence, form.comment.as_deref()) {
                Ok(submission) => submission,
                Err(err) => {
                    self.surface.notify(&err.to_string())?;
                    return Ok(None);
                }
            };
        self.session.submit(submission)?;

        if !self.session.needs_finalization() {
            return Ok(None);
        }
        let report = self.api.finalize(&mut self.session)?;
        self.surface.show_summary(&report.summary)?;
        Ok(Some(report))
    }

    /// Run the session to completion or until the surface runs out of input.
    ///
    /// An item whose files can no longer be read is reported, skipped, and left out of the
    /// saved responses; the rest of the session carries on.
    ///
    /// # Errors
    /// Returns an error when finalization fails or the surface fails.
    pub fn run(&mut self) -> Result<RunOutcome> {
        while self.session.state() == SessionState::AwaitingIdentity {
            let Some(raw) = self.surface.request_identity()? else {
                return Ok(self.abandon());
            };
            self.on_identity(&raw)?;
        }

        while self.session.state() == SessionState::InProgress {
            let view = self.session.present()?;
            let staged = match self.pool.resolve(&view.item) {
                Ok(paths) => self.stage.stage(&view, &paths),
                Err(err) => Err(err.into()),
            };
            let sides = match staged {
                Ok(sides) => sides,
                Err(err) => {
                    self.skip_unshowable(&err)?;
                    continue;
                }
            };
            self.surface.show_item(&view, &sides)?;

            let Some(form) = self.surface.collect_form(&view)? else {
                return Ok(self.abandon());
            };
            if let Some(report) = self.on_submit(form)? {
                return Ok(RunOutcome::Completed(report));
            }
        }

        let report = self.api.finalize(&mut self.session)?;
        self.surface.show_summary(&report.summary)?;
        Ok(RunOutcome::Completed(report))
    }

    fn skip_unshowable(&mut self, err: &anyhow::Error) -> Result<()> {
        let item = self.session.skip_current()?;
        tracing::warn!(
            session = %self.session.id(),
            item = %item,
            error = ?err,
            "item could not be shown; skipped"
        );
        self.surface.notify(&format!("{item} could not be shown and was skipped"))?;
        Ok(())
    }

    fn abandon(&self) -> RunOutcome {
        let answered = self.session.responses().len();
        let total = self.session.total();
        tracing::warn!(
            session = %self.session.id(),
            answered,
            total,
            "input ended before the survey was finished; responses discarded"
        );
        RunOutcome::Abandoned { answered, total }
    }
}
