use serde::{Deserialize, Serialize};

use crate::{ItemId, Response, TesterId, Variant};

/// Tally of `preferred_variant` values.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PreferenceCounts {
    #[serde(rename = "A")]
    pub a: usize,
    #[serde(rename = "B")]
    pub b: usize,
    #[serde(rename = "None")]
    pub none: usize,
}

impl PreferenceCounts {
    pub fn record(&mut self, preferred: Option<Variant>) {
        match preferred {
            Some(Variant::A) => self.a += 1,
            Some(Variant::B) => self.b += 1,
            None => self.none += 1,
        }
    }

    #[must_use]
    pub fn get(&self, preferred: Option<Variant>) -> usize {
        match preferred {
            Some(Variant::A) => self.a,
            Some(Variant::B) => self.b,
            None => self.none,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommentedItem {
    pub item_id: ItemId,
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TesterSummary {
    pub tester_id: TesterId,
    pub total_comparisons: usize,
    pub preference_counts: PreferenceCounts,
    /// `None` when the tester has no recorded comparisons.
    pub mean_confidence: Option<f64>,
    pub commented_items: Vec<CommentedItem>,
}

/// Aggregate every record belonging to `tester`; other testers' rows are ignored.
#[must_use]
pub fn summarize(tester: &TesterId, records: &[Response]) -> TesterSummary {
    let mut total_comparisons = 0_usize;
    let mut preference_counts = PreferenceCounts::default();
    let mut confidence_sum = 0.0_f64;
    let mut commented_items = Vec::new();

    for record in records.iter().filter(|record| &record.tester_id == tester) {
        total_comparisons += 1;
        preference_counts.record(record.preferred_variant);
        confidence_sum += f64::from(record.confidence.get());
        if !record.comment.is_empty() {
            commented_items.push(CommentedItem {
                item_id: record.item_id.clone(),
                comment: record.comment.clone(),
            });
        }
    }

    let mean_confidence = (total_comparisons > 0).then(|| {
        let count = u32::try_from(total_comparisons).map_or(f64::from(u32::MAX), f64::from);
        round_to_hundredths(confidence_sum / count)
    });

    TesterSummary {
        tester_id: tester.clone(),
        total_comparisons,
        preference_counts,
        mean_confidence,
        commented_items,
    }
}

fn round_to_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
