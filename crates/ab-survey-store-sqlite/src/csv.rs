//! Flat CSV rendition of the response log.

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ab_survey_core::{
    parse_preferred_variant, preferred_variant_str, Confidence, ItemId, Preference, Response,
    TesterId, Variant,
};
use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use ulid::Ulid;

pub const RESPONSE_COLUMNS: [&str; 8] = [
    "tester_id",
    "item_id",
    "left_variant",
    "right_variant",
    "preferred_side",
    "preferred_variant",
    "confidence",
    "comment",
];

/// Older header layout, still accepted on import.
const LEGACY_COLUMNS: [&str; 8] = [
    "tester",
    "image",
    "left_model",
    "right_model",
    "preferred_side",
    "preferred_model",
    "confidence",
    "comment",
];

/// Render responses as CSV text, header first.
#[must_use]
pub fn render_responses(responses: &[Response]) -> String {
    let mut out = RESPONSE_COLUMNS.join(",");
    out.push('\n');
    for response in responses {
        out.push_str(&render_row(response));
        out.push('\n');
    }
    out
}

/// One response as a CSV line, without the line terminator.
pub(crate) fn render_row(response: &Response) -> String {
    let confidence = response.confidence.to_string();
    let fields = [
        csv_escape(response.tester_id.as_str()),
        csv_escape(response.item_id.as_str()),
        Cow::Borrowed(response.left_variant.as_str()),
        Cow::Borrowed(response.right_variant.as_str()),
        Cow::Borrowed(response.preferred_side.as_str()),
        Cow::Borrowed(preferred_variant_str(response.preferred_variant)),
        Cow::Borrowed(confidence.as_str()),
        csv_escape(&response.comment),
    ];
    fields.join(",")
}

/// A rendered CSV waiting in a temp file next to its target.
///
/// The target only changes on [`StagedCsv::publish`]. Dropping an unpublished file removes
/// the temp file.
#[derive(Debug)]
pub struct StagedCsv {
    tmp: PathBuf,
    target: PathBuf,
    sha256: String,
    published: bool,
}

impl StagedCsv {
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// SHA-256 of the staged bytes, which is what the target holds once published.
    #[must_use]
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Rename the temp file over the target.
    ///
    /// # Errors
    /// Returns an error when the rename fails; the temp file is removed.
    pub fn publish(mut self) -> Result<()> {
        fs::rename(&self.tmp, &self.target).with_context(|| {
            format!("failed to move {} into place at {}", self.tmp.display(), self.target.display())
        })?;
        self.published = true;
        Ok(())
    }
}

impl Drop for StagedCsv {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

/// Render `responses` into a synced temp file beside `path` without touching `path` itself.
///
/// # Errors
/// Returns an error when the directory or temp file cannot be created, written, or synced.
pub fn stage_responses_csv(path: &Path, responses: &[Response]) -> Result<StagedCsv> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let body = render_responses(responses);
    let staged = StagedCsv {
        tmp: temp_sibling(path)?,
        target: path.to_path_buf(),
        sha256: sha256_hex(body.as_bytes()),
        published: false,
    };
    write_synced(&staged.tmp, body.as_bytes())?;
    Ok(staged)
}

/// Write `responses` to `path` by writing a sibling temp file and renaming it over the target.
///
/// Returns the SHA-256 of the written bytes.
///
/// # Errors
/// Returns an error when the temp file cannot be written, synced, or renamed.
pub fn write_responses_csv(path: &Path, responses: &[Response]) -> Result<String> {
    let staged = stage_responses_csv(path, responses)?;
    let sha256 = staged.sha256().to_string();
    staged.publish()?;
    Ok(sha256)
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Read a results CSV in either header layout.
///
/// # Errors
/// Returns an error on unreadable files, unknown headers, or rows that fail validation.
pub fn read_responses_csv(path: &Path) -> Result<Vec<Response>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read CSV file {}", path.display()))?;
    parse_responses(&text).with_context(|| format!("invalid results CSV {}", path.display()))
}

/// Parse CSV text into validated responses.
///
/// # Errors
/// Returns an error on malformed CSV, unknown headers, or invalid rows.
pub fn parse_responses(text: &str) -> Result<Vec<Response>> {
    let mut rows = parse_records(text)?.into_iter();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let columns = ColumnMap::from_header(&header)?;

    rows.enumerate()
        .map(|(index, row)| {
            columns.response(&row).with_context(|| format!("row {} is invalid", index + 2))
        })
        .collect()
}

struct ColumnMap {
    positions: [usize; 8],
}

impl ColumnMap {
    fn from_header(header: &[String]) -> Result<Self> {
        let names: Vec<&str> = header.iter().map(|name| name.trim()).collect();
        for expected in [RESPONSE_COLUMNS, LEGACY_COLUMNS] {
            let found: Option<Vec<usize>> = expected
                .iter()
                .map(|column| names.iter().position(|name| name == column))
                .collect();
            if let Some(found) = found {
                let mut positions = [0_usize; 8];
                positions.copy_from_slice(&found);
                return Ok(Self { positions });
            }
        }
        Err(anyhow!(
            "unrecognized CSV header [{}]; expected columns {}",
            names.join(","),
            RESPONSE_COLUMNS.join(",")
        ))
    }

    fn field<'a>(&self, row: &'a [String], column: usize) -> Result<&'a str> {
        let position = self.positions[column];
        row.get(position)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("missing column {}", RESPONSE_COLUMNS[column]))
    }

    fn response(&self, row: &[String]) -> Result<Response> {
        let variant = |column: usize| -> Result<Variant> {
            let raw = self.field(row, column)?;
            Variant::parse(raw.trim())
                .ok_or_else(|| anyhow!("{} must be A or B, got {raw:?}", RESPONSE_COLUMNS[column]))
        };

        let preferred_raw = self.field(row, 5)?;
        let preferred_variant = parse_preferred_variant(preferred_raw.trim())
            .ok_or_else(|| anyhow!("preferred_variant must be A, B or None, got {preferred_raw:?}"))?;

        let response = Response {
            tester_id: TesterId::parse(self.field(row, 0)?)?,
            item_id: ItemId::new(self.field(row, 1)?),
            left_variant: variant(2)?,
            right_variant: variant(3)?,
            preferred_side: Preference::parse(self.field(row, 4)?)?,
            preferred_variant,
            confidence: parse_confidence(self.field(row, 6)?)?,
            comment: self.field(row, 7)?.to_string(),
        };
        response.validate()?;
        Ok(response)
    }
}

// Spreadsheet round-trips can turn integral confidences into floats (`4.0`).
#[allow(clippy::cast_possible_truncation)]
fn parse_confidence(raw: &str) -> Result<Confidence> {
    let trimmed = raw.trim();
    let value = match trimmed.parse::<i64>() {
        Ok(value) => value,
        Err(_) => {
            let float: f64 = trimmed
                .parse()
                .with_context(|| format!("confidence must be an integer, got {raw:?}"))?;
            if float.fract() != 0.0 || !(1.0..=5.0).contains(&float) {
                return Err(anyhow!("confidence must be an integer in [1, 5], got {raw:?}"));
            }
            float as i64
        }
    };
    Ok(Confidence::new(value)?)
}

fn csv_escape(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Split CSV text into records. Quoted fields may contain separators, doubled quotes, and
/// line breaks; blank lines between records are skipped.
fn parse_records(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut field_started = false;
    let mut chars = text.trim_start_matches('\u{feff}').chars().peekable();
    let mut line = 1_usize;

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if !field_started => {
                in_quotes = true;
                field_started = true;
            }
            '"' => return Err(anyhow!("unexpected quote inside unquoted field on line {line}")),
            ',' => {
                record.push(std::mem::take(&mut field));
                field_started = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                line += 1;
                if field_started || !record.is_empty() {
                    record.push(std::mem::take(&mut field));
                    records.push(std::mem::take(&mut record));
                }
                field_started = false;
            }
            _ => {
                field.push(c);
                field_started = true;
            }
        }
    }

    if in_quotes {
        return Err(anyhow!("unterminated quoted field at end of input"));
    }
    if field_started || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    Ok(records)
}

fn write_synced(tmp: &Path, body: &[u8]) -> Result<()> {
    let file =
        File::create(tmp).with_context(|| format!("failed to create temp file {}", tmp.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(body).with_context(|| format!("failed to write temp file {}", tmp.display()))?;
    let file = writer
        .into_inner()
        .map_err(|err| anyhow!("failed to flush temp file {}: {}", tmp.display(), err.error()))?;
    file.sync_all().with_context(|| format!("failed to sync temp file {}", tmp.display()))
}

fn temp_sibling(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("CSV target has no file name: {}", path.display()))?;
    Ok(path.with_file_name(format!(".{}.{}.tmp", name.to_string_lossy(), Ulid::new())))
}

#[cfg(test)]
mod tests {
    use ab_survey_core::Assignment;

    use super::*;

    fn response(tester: &str, item: &str, preference: Preference, comment: &str) -> Result<Response> {
        Ok(Response::new(
            TesterId::parse(tester)?,
            ItemId::new(item),
            Assignment::B_LEFT,
            preference,
            Confidence::new(4)?,
            comment.to_string(),
        ))
    }

    #[test]
    fn header_lists_response_fields_in_order() -> Result<()> {
        let text = render_responses(&[response("alice", "cat.png", Preference::Left, "")?]);
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("tester_id,item_id,left_variant,right_variant,preferred_side,preferred_variant,confidence,comment")
        );
        assert_eq!(lines.next(), Some("alice,cat.png,B,A,Left,B,4,"));
        Ok(())
    }

    #[test]
    fn awkward_comments_survive_a_write_and_read() -> Result<()> {
        let responses = vec![
            response("alice", "cat.png", Preference::NoPreference, "soft, \"dreamy\"\nsecond line")?,
            response("o'neil, jr", "dog.png", Preference::Right, "")?,
        ];
        let path = std::env::temp_dir().join(format!("ab-survey-csv-{}.csv", Ulid::new()));
        write_responses_csv(&path, &responses)?;
        assert_eq!(read_responses_csv(&path)?, responses);
        fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn dropped_stage_leaves_target_and_directory_untouched() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("ab-survey-stage-{}", Ulid::new()));
        let path = dir.join("results.csv");
        let staged = stage_responses_csv(&path, &[response("alice", "cat.png", Preference::Left, "")?])?;
        assert_eq!(staged.target(), path.as_path());
        assert!(!path.exists());
        drop(staged);

        assert!(!path.exists());
        assert_eq!(fs::read_dir(&dir)?.count(), 0);

        let staged = stage_responses_csv(&path, &[])?;
        let sha256 = staged.sha256().to_string();
        staged.publish()?;
        assert_eq!(sha256_hex(&fs::read(&path)?), sha256);
        assert_eq!(fs::read_dir(&dir)?.count(), 1);

        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn legacy_header_is_accepted() -> Result<()> {
        let text = "tester,image,left_model,right_model,preferred_side,preferred_model,confidence,comment\r\n\
                    alice,cat.png,A,B,Left,A,5,\r\n\
                    alice,dog.png,B,A,No preference,,2.0,blurry\r\n";
        let parsed = parse_responses(text)?;
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].preferred_variant, Some(Variant::A));
        assert_eq!(parsed[1].preferred_variant, None);
        assert_eq!(parsed[1].confidence.get(), 2);
        assert_eq!(parsed[1].comment, "blurry");
        Ok(())
    }

    #[test]
    fn inconsistent_rows_are_rejected_with_row_number() {
        let text = "tester_id,item_id,left_variant,right_variant,preferred_side,preferred_variant,confidence,comment\n\
                    alice,cat.png,A,B,Left,B,5,\n";
        let err = parse_responses(text).err().map(|err| format!("{err:#}"));
        let message = err.unwrap_or_default();
        assert!(message.contains("row 2"), "unexpected error: {message}");
    }

    #[test]
    fn unknown_header_is_rejected() {
        assert!(parse_responses("who,what\nalice,cat.png\n").is_err());
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let text = "tester_id,item_id,left_variant,right_variant,preferred_side,preferred_variant,confidence,comment\n\
                    alice,cat.png,A,B,Left,A,7,\n";
        assert!(parse_responses(text).is_err());
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(parse_records("a,\"b\n").is_err());
    }
}
