use std::io::{BufRead, Write};

use ab_survey_api::{FormInput, PresentationSurface, SidePaths};
use ab_survey_core::{Confidence, ItemView, TesterSummary};
use anyhow::{Context, Result};

/// Line-oriented survey on a pair of streams.
pub struct TerminalSurface<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> TerminalSurface<R, W> {
    #[must_use]
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn prompt(&mut self, label: &str) -> Result<Option<String>> {
        write!(self.output, "{label}").context("failed to write prompt")?;
        self.output.flush().context("failed to flush prompt")?;

        let mut line = String::new();
        let read = self.input.read_line(&mut line).context("failed to read input")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn read_confidence(&mut self) -> Result<Option<i64>> {
        let label = format!(
            "Confidence {}-{} [{}]: ",
            Confidence::MIN,
            Confidence::MAX,
            Confidence::DEFAULT
        );
        loop {
            let Some(raw) = self.prompt(&label)? else {
                return Ok(None);
            };
            let raw = raw.trim();
            if raw.is_empty() {
                return Ok(Some(i64::from(Confidence::DEFAULT.get())));
            }
            match raw.parse::<i64>() {
                Ok(value) => return Ok(Some(value)),
                Err(_) => self.notify(&format!("confidence must be a whole number, got {raw:?}"))?,
            }
        }
    }
}

impl<R: BufRead, W: Write> PresentationSurface for TerminalSurface<R, W> {
    fn request_identity(&mut self) -> Result<Option<String>> {
        self.prompt("Tester ID: ")
    }

    fn show_item(&mut self, view: &ItemView, paths: &SidePaths) -> Result<()> {
        writeln!(
            self.output,
            "\n[{}/{}] Which image do you prefer?\n  Left:  {}\n  Right: {}",
            view.position,
            view.total,
            paths.left.display(),
            paths.right.display()
        )
        .context("failed to render item")
    }

    fn collect_form(&mut self, _view: &ItemView) -> Result<Option<FormInput>> {
        let Some(preference) = self.prompt("Preference [l]eft / [r]ight / [n]o preference: ")?
        else {
            return Ok(None);
        };
        let Some(confidence) = self.read_confidence()? else {
            return Ok(None);
        };
        let Some(comment) = self.prompt("Comment (optional): ")? else {
            return Ok(None);
        };
        Ok(Some(FormInput { preference, confidence, comment: Some(comment) }))
    }

    fn notify(&mut self, message: &str) -> Result<()> {
        writeln!(self.output, "! {message}").context("failed to write notice")
    }

    fn show_summary(&mut self, summary: &TesterSummary) -> Result<()> {
        let mean = summary
            .mean_confidence
            .map_or_else(|| "n/a".to_string(), |mean| format!("{mean:.2}"));
        writeln!(self.output, "\nThanks, {}! Your results:", summary.tester_id)?;
        writeln!(self.output, "  comparisons:     {}", summary.total_comparisons)?;
        writeln!(
            self.output,
            "  preferred A/B/-: {}/{}/{}",
            summary.preference_counts.a, summary.preference_counts.b, summary.preference_counts.none
        )?;
        writeln!(self.output, "  mean confidence: {mean}")?;
        for commented in &summary.commented_items {
            writeln!(self.output, "  {}: {}", commented.item_id, commented.comment)?;
        }
        self.output.flush().context("failed to flush summary")
    }
}
