use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Randomness source for shuffling the item pool and flipping placement coins.
///
/// Unseeded by default; a fixed seed makes a whole session reproducible.
#[derive(Debug, Clone)]
pub struct SurveyRng(StdRng);

impl SurveyRng {
    #[must_use]
    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }

    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }

    #[must_use]
    pub fn from_seed_option(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::from_entropy, Self::seeded)
    }

    pub(crate) fn coin(&mut self) -> bool {
        self.0.gen_bool(0.5)
    }

    pub(crate) fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.0);
    }
}

impl Default for SurveyRng {
    fn default() -> Self {
        Self::from_entropy()
    }
}
