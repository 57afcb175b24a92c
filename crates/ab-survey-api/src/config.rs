use std::fs;
use std::path::{Path, PathBuf};

use ab_survey_core::{SurveyRng, TesterId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Config file picked up from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "abt.toml";

/// Where the survey reads images from and writes results to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SurveyConfig {
    pub variant_a_dir: PathBuf,
    pub variant_b_dir: PathBuf,
    pub db_path: PathBuf,
    pub results_csv: PathBuf,
    pub tester_results_dir: PathBuf,
    pub seed: Option<u64>,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            variant_a_dir: PathBuf::from("images_a"),
            variant_b_dir: PathBuf::from("images_b"),
            db_path: PathBuf::from("ab_survey.sqlite3"),
            results_csv: PathBuf::from("ab_test_results.csv"),
            tester_results_dir: PathBuf::from("."),
            seed: None,
        }
    }
}

/// Values that win over the config file, typically flags or environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub variant_a_dir: Option<PathBuf>,
    pub variant_b_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub results_csv: Option<PathBuf>,
    pub tester_results_dir: Option<PathBuf>,
    pub seed: Option<u64>,
}

impl SurveyConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns an error for malformed TOML or unknown keys.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid survey config")
    }

    /// Load `path` when given, else `abt.toml` from the working directory if present, else defaults.
    ///
    /// # Errors
    /// Returns an error when an explicit path cannot be read, or any config file fails to parse.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !required && !path.is_file() {
            tracing::debug!("no config file found; using defaults");
            return Ok(Self::default());
        }

        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&text)
            .with_context(|| format!("failed to load config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(dir) = overrides.variant_a_dir {
            self.variant_a_dir = dir;
        }
        if let Some(dir) = overrides.variant_b_dir {
            self.variant_b_dir = dir;
        }
        if let Some(path) = overrides.db_path {
            self.db_path = path;
        }
        if let Some(path) = overrides.results_csv {
            self.results_csv = path;
        }
        if let Some(dir) = overrides.tester_results_dir {
            self.tester_results_dir = dir;
        }
        if overrides.seed.is_some() {
            self.seed = overrides.seed;
        }
        self
    }

    /// Per-tester extract location, `results_<stem>_<tag>.csv` under `tester_results_dir`.
    ///
    /// The stem keeps the name readable; the tag is the first 8 hex digits of the SHA-256 of
    /// the full tester id, so ids that sanitize to the same stem still get their own file.
    #[must_use]
    pub fn tester_results_path(&self, tester: &TesterId) -> PathBuf {
        let digest = Sha256::digest(tester.as_str().as_bytes());
        let tag: String = digest.iter().take(4).map(|byte| format!("{byte:02x}")).collect();
        self.tester_results_dir.join(format!("results_{}_{tag}.csv", tester.file_stem()))
    }

    #[must_use]
    pub fn rng(&self) -> SurveyRng {
        SurveyRng::from_seed_option(self.seed)
    }
}
