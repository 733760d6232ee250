use std::collections::HashMap;

/// Least-visited-first partner rotation.
///
/// Picks the candidate seen the fewest times, breaking ties by ascending
/// identity, so every verified peer gets a turn before anyone gets a second.
#[derive(Debug, Default)]
pub struct ShuffleSelector {
    visits: HashMap<String, u64>,
}

impl ShuffleSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose the next partner and count the visit. `None` for no candidates.
    pub fn pick_next(&mut self, candidates: &[String]) -> Option<String> {
        let chosen = candidates
            .iter()
            .min_by(|a, b| self.visits(a).cmp(&self.visits(b)).then_with(|| a.cmp(b)))?
            .clone();
        *self.visits.entry(chosen.clone()).or_insert(0) += 1;
        Some(chosen)
    }

    pub fn visits(&self, identity: &str) -> u64 {
        self.visits.get(identity).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.visits.clear();
    }
}
