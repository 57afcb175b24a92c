use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Assignment, ItemId, Side, SurveyError, SurveyRng, Variant};

/// Shuffled item order for one session. Fixed once built.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct PresentationOrder(Vec<ItemId>);

impl PresentationOrder {
    /// Build an order from a list the caller already arranged (used by tests and replays).
    #[must_use]
    pub fn from_items(items: Vec<ItemId>) -> Self {
        Self(items)
    }

    #[must_use]
    pub fn items(&self) -> &[ItemId] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ItemId> {
        self.0.get(index)
    }
}

/// On-disk locations of both renditions of one item.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VariantPaths {
    pub a: PathBuf,
    pub b: PathBuf,
}

impl VariantPaths {
    #[must_use]
    pub fn for_variant(&self, variant: Variant) -> &Path {
        match variant {
            Variant::A => &self.a,
            Variant::B => &self.b,
        }
    }

    #[must_use]
    pub fn for_side(&self, assignment: Assignment, side: Side) -> &Path {
        self.for_variant(assignment.variant_at(side))
    }
}

/// The comparable items found across the two variant directories.
#[derive(Debug, Clone)]
pub struct ItemPool {
    dir_a: PathBuf,
    dir_b: PathBuf,
    order: PresentationOrder,
    skipped: Vec<ItemId>,
}

impl ItemPool {
    /// Enumerate items present in `dir_a`, keep those with a counterpart in `dir_b`,
    /// and shuffle them into a presentation order.
    ///
    /// # Errors
    /// Returns [`SurveyError::Io`] when `dir_a` cannot be listed and
    /// [`SurveyError::PoolEmpty`] when no eligible item remains.
    pub fn load(dir_a: &Path, dir_b: &Path, rng: &mut SurveyRng) -> Result<Self, SurveyError> {
        let mut names = list_files(dir_a)?;
        names.sort();

        let mut eligible = Vec::with_capacity(names.len());
        let mut skipped = Vec::new();
        for name in names {
            if dir_b.join(&name).is_file() {
                eligible.push(ItemId(name));
            } else {
                tracing::warn!(
                    item = %name,
                    dir = %dir_b.display(),
                    "skipping item without a variant B counterpart"
                );
                skipped.push(ItemId(name));
            }
        }

        if eligible.is_empty() {
            return Err(SurveyError::PoolEmpty { dir: dir_a.display().to_string() });
        }

        rng.shuffle(&mut eligible);
        tracing::debug!(items = eligible.len(), skipped = skipped.len(), "item pool loaded");

        Ok(Self {
            dir_a: dir_a.to_path_buf(),
            dir_b: dir_b.to_path_buf(),
            order: PresentationOrder(eligible),
            skipped,
        })
    }

    #[must_use]
    pub fn order(&self) -> &PresentationOrder {
        &self.order
    }

    #[must_use]
    pub fn skipped(&self) -> &[ItemId] {
        &self.skipped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Locate both files for `item`, checking they are still there.
    ///
    /// # Errors
    /// Returns [`SurveyError::MissingVariantFile`] naming the first absent rendition.
    pub fn resolve(&self, item: &ItemId) -> Result<VariantPaths, SurveyError> {
        let paths = VariantPaths { a: self.dir_a.join(&item.0), b: self.dir_b.join(&item.0) };
        for variant in [Variant::A, Variant::B] {
            let path = paths.for_variant(variant);
            if !path.is_file() {
                return Err(SurveyError::MissingVariantFile {
                    item: item.0.clone(),
                    variant,
                    path: path.display().to_string(),
                });
            }
        }
        Ok(paths)
    }
}

fn list_files(dir: &Path) -> Result<Vec<String>, SurveyError> {
    let io_error = |err: std::io::Error| SurveyError::Io {
        path: dir.display().to_string(),
        message: err.to_string(),
    };

    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let entry = entry.map_err(io_error)?;
        if !entry.path().is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 file name");
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    Ok(names)
}
