use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    Assignment, Confidence, ItemId, Preference, PresentationOrder, Response, SessionId,
    SurveyError, SurveyRng, TesterId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingIdentity,
    InProgress,
    Completed,
}

/// What the presentation surface needs to render the current comparison.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ItemView {
    /// 1-based position in the presentation order.
    pub position: usize,
    pub total: usize,
    pub item: ItemId,
    pub assignment: Assignment,
}

/// The three form inputs, read together at the moment the tester submits.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Submission {
    pub preference: Preference,
    pub confidence: Confidence,
    pub comment: String,
}

impl Submission {
    #[must_use]
    pub fn new(preference: Preference, confidence: Confidence, comment: impl Into<String>) -> Self {
        Self { preference, confidence, comment: comment.into() }
    }

    /// Build a submission from raw, unvalidated inputs.
    ///
    /// # Errors
    /// Returns [`SurveyError::InvalidPreference`] or [`SurveyError::InvalidConfidence`].
    pub fn parse(
        preference: &str,
        confidence: i64,
        comment: Option<&str>,
    ) -> Result<Self, SurveyError> {
        Ok(Self {
            preference: Preference::parse(preference)?,
            confidence: Confidence::new(confidence)?,
            comment: comment.unwrap_or_default().to_string(),
        })
    }
}

/// Per-tester survey context.
///
/// All progression goes through [`Session::identify`] and [`Session::submit`];
/// nothing outside the session mutates its position or log.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    tester: Option<TesterId>,
    order: PresentationOrder,
    current_index: usize,
    responses: Vec<Response>,
    skipped: Vec<ItemId>,
    assignments: BTreeMap<ItemId, Assignment>,
    finalized: bool,
    rng: SurveyRng,
}

impl Session {
    #[must_use]
    pub fn new(order: PresentationOrder, rng: SurveyRng) -> Self {
        Self {
            id: SessionId::new(),
            tester: None,
            order,
            current_index: 0,
            responses: Vec::new(),
            skipped: Vec::new(),
            assignments: BTreeMap::new(),
            finalized: false,
            rng,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn tester(&self) -> Option<&TesterId> {
        self.tester.as_ref()
    }

    #[must_use]
    pub fn order(&self) -> &PresentationOrder {
        &self.order
    }

    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn responses(&self) -> &[Response] {
        &self.responses
    }

    /// Items passed over without an answer because their files could not be shown.
    #[must_use]
    pub fn skipped(&self) -> &[ItemId] {
        &self.skipped
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.tester.is_none() {
            SessionState::AwaitingIdentity
        } else if self.current_index >= self.order.len() {
            SessionState::Completed
        } else {
            SessionState::InProgress
        }
    }

    /// Capture the tester identity.
    ///
    /// The identity can be corrected until the first response is recorded.
    ///
    /// # Errors
    /// Returns [`SurveyError::EmptyIdentity`] for blank input and
    /// [`SurveyError::IdentityLocked`] when a different identity arrives after responses exist.
    pub fn identify(&mut self, raw: &str) -> Result<&TesterId, SurveyError> {
        let tester = TesterId::parse(raw)?;
        match &self.tester {
            Some(current) if *current != tester && !self.responses.is_empty() => {
                return Err(SurveyError::IdentityLocked { current: current.to_string() });
            }
            _ => {}
        }
        tracing::debug!(session = %self.id, tester = %tester, "tester identified");
        Ok(self.tester.insert(tester))
    }

    /// Placement for `item`, drawn on first request and replayed verbatim afterwards.
    pub fn assignment_for(&mut self, item: &ItemId) -> Assignment {
        if let Some(existing) = self.assignments.get(item) {
            return *existing;
        }
        let assignment = Assignment::from_coin(self.rng.coin());
        self.assignments.insert(item.clone(), assignment);
        assignment
    }

    #[must_use]
    pub fn recorded_assignment(&self, item: &ItemId) -> Option<Assignment> {
        self.assignments.get(item).copied()
    }

    /// Current comparison to render.
    ///
    /// # Errors
    /// Returns [`SurveyError::IdentityRequired`] before identification and
    /// [`SurveyError::SessionCompleted`] once every item has been answered.
    pub fn present(&mut self) -> Result<ItemView, SurveyError> {
        let item = self.current_item()?.clone();
        let assignment = self.assignment_for(&item);
        Ok(ItemView {
            position: self.current_index + 1,
            total: self.order.len(),
            item,
            assignment,
        })
    }

    /// Record the tester's answer for the current item and move to the next one.
    ///
    /// # Errors
    /// Same preconditions as [`Session::present`]. On error nothing is recorded.
    pub fn submit(&mut self, submission: Submission) -> Result<&Response, SurveyError> {
        let item = self.current_item()?.clone();
        let tester = self.tester.clone().ok_or(SurveyError::IdentityRequired)?;
        let assignment = self.assignment_for(&item);

        let recorded = self.responses.len();
        self.responses.push(Response::new(
            tester,
            item,
            assignment,
            submission.preference,
            submission.confidence,
            submission.comment,
        ));
        self.current_index += 1;
        tracing::debug!(
            session = %self.id,
            position = self.current_index,
            total = self.order.len(),
            "response recorded"
        );

        Ok(&self.responses[recorded])
    }

    /// Move past the current item without recording a response.
    ///
    /// # Errors
    /// Same preconditions as [`Session::present`]. On error the position is unchanged.
    pub fn skip_current(&mut self) -> Result<ItemId, SurveyError> {
        let item = self.current_item()?.clone();
        self.skipped.push(item.clone());
        self.current_index += 1;
        tracing::debug!(session = %self.id, item = %item, "item skipped");
        Ok(item)
    }

    /// True exactly once the session is complete and has not been handed to finalization.
    #[must_use]
    pub fn needs_finalization(&self) -> bool {
        self.state() == SessionState::Completed && !self.finalized
    }

    pub fn mark_finalized(&mut self) {
        self.finalized = true;
    }

    /// Items still to be answered or skipped before the session completes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.order.len().saturating_sub(self.current_index)
    }

    fn current_item(&self) -> Result<&ItemId, SurveyError> {
        if self.tester.is_none() {
            return Err(SurveyError::IdentityRequired);
        }
        self.order
            .get(self.current_index)
            .ok_or(SurveyError::SessionCompleted { total: self.order.len() })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::Variant;

    fn order(names: &[&str]) -> PresentationOrder {
        PresentationOrder::from_items(names.iter().map(|name| ItemId::new(*name)).collect())
    }

    fn session(names: &[&str]) -> Session {
        Session::new(order(names), SurveyRng::seeded(11))
    }

    #[test]
    fn state_machine_walks_identity_progress_completion() -> anyhow::Result<()> {
        let mut session = session(&["cat.png", "dog.png"]);
        assert_eq!(session.state(), SessionState::AwaitingIdentity);
        assert_eq!(session.present(), Err(SurveyError::IdentityRequired));

        assert_eq!(session.identify("  "), Err(SurveyError::EmptyIdentity));
        assert_eq!(session.state(), SessionState::AwaitingIdentity);

        session.identify("alice")?;
        assert_eq!(session.state(), SessionState::InProgress);

        session.submit(Submission::parse("Left", 5, None)?)?;
        assert_eq!(session.current_index(), 1);
        assert_eq!(session.state(), SessionState::InProgress);
        assert!(!session.needs_finalization());

        session.submit(Submission::parse("No preference", 2, Some("blurry"))?)?;
        assert_eq!(session.current_index(), 2);
        assert_eq!(session.state(), SessionState::Completed);
        assert!(session.needs_finalization());

        assert_eq!(
            session.submit(Submission::parse("Left", 3, None)?),
            Err(SurveyError::SessionCompleted { total: 2 })
        );
        assert_eq!(session.current_index(), 2);

        session.mark_finalized();
        assert!(!session.needs_finalization());
        assert_eq!(session.state(), SessionState::Completed);
        Ok(())
    }

    #[test]
    fn skipped_item_advances_without_a_response() -> anyhow::Result<()> {
        let mut session = session(&["cat.png", "dog.png"]);
        assert_eq!(session.skip_current(), Err(SurveyError::IdentityRequired));

        session.identify("alice")?;
        session.submit(Submission::parse("Left", 4, None)?)?;
        let second = session.present()?.item;
        assert_eq!(session.skip_current()?, second);

        assert_eq!(session.state(), SessionState::Completed);
        assert!(session.needs_finalization());
        assert_eq!(session.responses().len(), 1);
        assert_eq!(session.skipped(), std::slice::from_ref(&second));
        assert_eq!(session.remaining(), 0);
        assert_eq!(session.skip_current(), Err(SurveyError::SessionCompleted { total: 2 }));
        Ok(())
    }

    #[test]
    fn redisplay_keeps_the_same_assignment() -> anyhow::Result<()> {
        let mut session = session(&["cat.png"]);
        session.identify("alice")?;
        let first = session.present()?;
        for _ in 0..20 {
            assert_eq!(session.present()?, first);
        }
        let response = session.submit(Submission::new(Preference::Right, Confidence::DEFAULT, ""))?;
        assert_eq!(response.left_variant, first.assignment.left);
        assert_eq!(response.preferred_variant, Some(first.assignment.right));
        Ok(())
    }

    #[test]
    fn identity_can_change_until_first_response() -> anyhow::Result<()> {
        let mut session = session(&["cat.png", "dog.png"]);
        session.identify("alcie")?;
        session.identify("alice")?;
        session.submit(Submission::parse("r", 4, None)?)?;

        session.identify("alice")?;
        assert_eq!(
            session.identify("bob"),
            Err(SurveyError::IdentityLocked { current: "alice".to_string() })
        );
        assert_eq!(session.responses()[0].tester_id.as_str(), "alice");
        Ok(())
    }

    #[test]
    fn submit_without_identity_records_nothing() {
        let mut session = session(&["cat.png"]);
        let result = session.submit(Submission::new(Preference::Left, Confidence::DEFAULT, ""));
        assert_eq!(result, Err(SurveyError::IdentityRequired));
        assert!(session.responses().is_empty());
        assert_eq!(session.current_index(), 0);
    }

    #[test]
    fn invalid_raw_inputs_are_rejected_before_recording() {
        assert_eq!(Submission::parse("Left", 0, None), Err(SurveyError::InvalidConfidence(0)));
        assert_eq!(
            Submission::parse("up", 3, None),
            Err(SurveyError::InvalidPreference("up".to_string()))
        );
    }

    #[test]
    fn empty_comment_is_kept_verbatim() -> anyhow::Result<()> {
        let with_empty = Submission::parse("Left", 3, Some(""))?;
        let absent = Submission::parse("Left", 3, None)?;
        assert_eq!(with_empty.comment, "");
        assert_eq!(absent.comment, "");
        Ok(())
    }

    #[test]
    fn seeded_sessions_draw_identical_assignments() {
        let names = ["a.png", "b.png", "c.png", "d.png", "e.png", "f.png", "g.png", "h.png"];
        let mut left = session(&names);
        let mut right = session(&names);
        for name in names {
            let item = ItemId::new(name);
            assert_eq!(left.assignment_for(&item), right.assignment_for(&item));
        }
    }

    proptest! {
        #[test]
        fn property_assignment_is_memoized(seed in any::<u64>(), lookups in 1_usize..40) {
            let names: Vec<String> = (0..5).map(|i| format!("item{i}.png")).collect();
            let items: Vec<ItemId> = names.iter().map(|name| ItemId::new(name.as_str())).collect();
            let mut session = Session::new(PresentationOrder::from_items(items.clone()), SurveyRng::seeded(seed));

            let first: Vec<Assignment> = items.iter().map(|item| session.assignment_for(item)).collect();
            for round in 0..lookups {
                let item = &items[round % items.len()];
                prop_assert_eq!(session.assignment_for(item), first[round % items.len()]);
            }
            for assignment in first {
                prop_assert_ne!(assignment.left, assignment.right);
                prop_assert!(matches!(assignment.left, Variant::A | Variant::B));
            }
        }

        #[test]
        fn property_index_advances_once_per_submission(
            seed in any::<u64>(),
            total in 1_usize..10,
            answers in prop::collection::vec((0_usize..3, 1_i64..=5), 0..15),
        ) {
            let items: Vec<ItemId> = (0..total).map(|i| ItemId::new(format!("{i}.png"))).collect();
            let mut session = Session::new(PresentationOrder::from_items(items), SurveyRng::seeded(seed));
            session.identify("prop").map_err(|err| TestCaseError::fail(err.to_string()))?;

            let mut last_index = 0;
            for (choice, confidence) in answers {
                let submission = Submission::new(
                    Preference::ALL[choice],
                    Confidence::new(confidence).map_err(|err| TestCaseError::fail(err.to_string()))?,
                    "",
                );
                let accepted = session.submit(submission).is_ok();
                let index = session.current_index();
                prop_assert!(index >= last_index);
                prop_assert_eq!(index - last_index, usize::from(accepted));
                prop_assert_eq!(session.state() == SessionState::Completed, index == total);
                last_index = index;
            }
            prop_assert_eq!(session.responses().len(), session.current_index());
        }
    }
}
