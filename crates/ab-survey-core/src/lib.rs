//! Blinded pairwise image-comparison survey: domain model and session logic.
//!
//! A tester is shown two renditions of the same item side by side, one from
//! variant pool A and one from pool B, without being told which is which. The
//! left/right placement is decided once per item per session and then frozen,
//! so redisplaying an item never leaks the variant identity.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

mod pool;
mod rng;
mod session;
mod summary;

pub use pool::{ItemPool, PresentationOrder, VariantPaths};
pub use rng::SurveyRng;
pub use session::{ItemView, Session, SessionState, Submission};
pub use summary::{summarize, CommentedItem, PreferenceCounts, TesterSummary};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SurveyError {
    #[error("no comparable items found in {dir}")]
    PoolEmpty { dir: String },
    #[error("item {item} has no variant {variant} file at {path}")]
    MissingVariantFile { item: String, variant: Variant, path: String },
    #[error("tester identity MUST be non-empty")]
    EmptyIdentity,
    #[error("tester identity is locked to {current} once responses are recorded")]
    IdentityLocked { current: String },
    #[error("tester identity is required before comparisons begin")]
    IdentityRequired,
    #[error("confidence MUST be an integer in [1, 5], got {0}")]
    InvalidConfidence(i64),
    #[error("preference MUST be one of Left, Right, No preference; got {0:?}")]
    InvalidPreference(String),
    #[error("response is inconsistent: {0}")]
    InconsistentResponse(String),
    #[error("session already completed all {total} comparisons")]
    SessionCompleted { total: usize },
    #[error("session still has {remaining} comparisons left")]
    SessionIncomplete { remaining: usize },
    #[error("i/o error at {path}: {message}")]
    Io { path: String, message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(pub Ulid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the two image sources under comparison.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Variant {
    A,
    B,
}

impl Variant {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            _ => None,
        }
    }

    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl Display for Variant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text form of a derived preferred variant, `"None"` when no side was chosen.
#[must_use]
pub fn preferred_variant_str(value: Option<Variant>) -> &'static str {
    value.map_or("None", Variant::as_str)
}

/// Inverse of [`preferred_variant_str`].
#[must_use]
pub fn parse_preferred_variant(value: &str) -> Option<Option<Variant>> {
    match value {
        "None" | "" => Some(None),
        other => Variant::parse(other).map(Some),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "Left",
            Self::Right => "Right",
        }
    }
}

/// The forced-choice answer to "which image do you prefer?".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Preference {
    Left,
    Right,
    #[serde(rename = "No preference")]
    NoPreference,
}

impl Preference {
    pub const ALL: [Self; 3] = [Self::Left, Self::Right, Self::NoPreference];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "Left",
            Self::Right => "Right",
            Self::NoPreference => "No preference",
        }
    }

    /// Parse a preference label.
    ///
    /// Accepts the canonical labels plus the short forms a terminal user types.
    ///
    /// # Errors
    /// Returns [`SurveyError::InvalidPreference`] for anything else, including blank input.
    pub fn parse(value: &str) -> Result<Self, SurveyError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "left" | "l" => Ok(Self::Left),
            "right" | "r" => Ok(Self::Right),
            "no preference" | "no-preference" | "none" | "n" => Ok(Self::NoPreference),
            _ => Err(SurveyError::InvalidPreference(value.to_string())),
        }
    }

    #[must_use]
    pub fn side(self) -> Option<Side> {
        match self {
            Self::Left => Some(Side::Left),
            Self::Right => Some(Side::Right),
            Self::NoPreference => None,
        }
    }
}

/// Self-reported confidence on a closed 1..=5 scale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "i64", into = "u8")]
pub struct Confidence(u8);

impl Confidence {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;
    pub const DEFAULT: Self = Self(3);

    /// # Errors
    /// Returns [`SurveyError::InvalidConfidence`] when `value` is outside `[1, 5]`.
    pub fn new(value: i64) -> Result<Self, SurveyError> {
        if (i64::from(Self::MIN)..=i64::from(Self::MAX)).contains(&value) {
            u8::try_from(value).map(Self).map_err(|_| SurveyError::InvalidConfidence(value))
        } else {
            Err(SurveyError::InvalidConfidence(value))
        }
    }

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<i64> for Confidence {
    type Error = SurveyError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Confidence> for u8 {
    fn from(value: Confidence) -> Self {
        value.0
    }
}

impl Display for Confidence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct TesterId(String);

impl TesterId {
    /// # Errors
    /// Returns [`SurveyError::EmptyIdentity`] when the trimmed input is empty.
    pub fn parse(raw: &str) -> Result<Self, SurveyError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SurveyError::EmptyIdentity);
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name-safe rendition of the identifier. Distinct ids can share a stem.
    #[must_use]
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect()
    }
}

impl TryFrom<String> for TesterId {
    type Error = SurveyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TesterId> for String {
    fn from(value: TesterId) -> Self {
        value.0
    }
}

impl Display for TesterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared file name of one comparable pair, e.g. `cat.png`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Left/right placement of the two variants for one item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Assignment {
    pub left: Variant,
    pub right: Variant,
}

impl Assignment {
    pub const A_LEFT: Self = Self { left: Variant::A, right: Variant::B };
    pub const B_LEFT: Self = Self { left: Variant::B, right: Variant::A };

    #[must_use]
    pub fn from_coin(heads: bool) -> Self {
        if heads {
            Self::A_LEFT
        } else {
            Self::B_LEFT
        }
    }

    #[must_use]
    pub fn variant_at(self, side: Side) -> Variant {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    #[must_use]
    pub fn preferred_variant(self, preference: Preference) -> Option<Variant> {
        preference.side().map(|side| self.variant_at(side))
    }
}

/// One recorded forced-choice answer.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Response {
    pub tester_id: TesterId,
    pub item_id: ItemId,
    pub left_variant: Variant,
    pub right_variant: Variant,
    pub preferred_side: Preference,
    pub preferred_variant: Option<Variant>,
    pub confidence: Confidence,
    pub comment: String,
}

impl Response {
    #[must_use]
    pub fn new(
        tester_id: TesterId,
        item_id: ItemId,
        assignment: Assignment,
        preference: Preference,
        confidence: Confidence,
        comment: String,
    ) -> Self {
        Self {
            tester_id,
            item_id,
            left_variant: assignment.left,
            right_variant: assignment.right,
            preferred_side: preference,
            preferred_variant: assignment.preferred_variant(preference),
            confidence,
            comment,
        }
    }

    #[must_use]
    pub fn assignment(&self) -> Assignment {
        Assignment { left: self.left_variant, right: self.right_variant }
    }

    /// Check a response that did not come through [`Response::new`], e.g. an imported row.
    ///
    /// # Errors
    /// Returns [`SurveyError::InconsistentResponse`] when both sides carry the same variant
    /// or the preferred variant does not match the chosen side.
    pub fn validate(&self) -> Result<(), SurveyError> {
        if self.left_variant == self.right_variant {
            return Err(SurveyError::InconsistentResponse(format!(
                "item {} shows variant {} on both sides",
                self.item_id, self.left_variant
            )));
        }

        let expected = self.assignment().preferred_variant(self.preferred_side);
        if expected != self.preferred_variant {
            return Err(SurveyError::InconsistentResponse(format!(
                "item {}: preferred_side {} implies preferred_variant {}, got {}",
                self.item_id,
                self.preferred_side.as_str(),
                preferred_variant_str(expected),
                preferred_variant_str(self.preferred_variant)
            )));
        }

        Ok(())
    }
}
