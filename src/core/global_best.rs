use crate::core::ranking::RankedAccumulator;
use crate::types::ScoredCandidate;
use std::collections::HashSet;

/// Picks the globally best seed set across sources, ignoring per-source quotas
#[derive(Debug, Clone, Copy)]
pub struct GlobalBestSelector {
    k: usize,
}

impl Default for GlobalBestSelector {
    fn default() -> Self {
        Self { k: 5 }
    }
}

impl GlobalBestSelector {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    /// Top K over all per-source lists, best first; duplicates keep their first occurrence
    pub fn select(&self, per_source: &[Vec<ScoredCandidate>]) -> Vec<ScoredCandidate> {
        self.split(per_source).0
    }

    /// (top K, everything else) with duplicates removed
    pub fn split(
        &self,
        per_source: &[Vec<ScoredCandidate>],
    ) -> (Vec<ScoredCandidate>, Vec<ScoredCandidate>) {
        let mut seen = HashSet::new();
        let mut top = RankedAccumulator::new(self.k);
        let mut rest = Vec::new();
        for candidate in per_source.iter().flatten() {
            if !seen.insert(candidate.id().to_string()) {
                continue;
            }
            if let Some(dropped) = top.push(candidate.clone()) {
                rest.push(dropped);
            }
        }
        rest.sort_by(|a, b| a.rank_cmp(b));
        let top = top.into_sorted_vec();
        log::debug!(
            "Global best: {} seed candidate(s) from {} source list(s), {} left over",
            top.len(),
            per_source.len(),
            rest.len()
        );
        (top, rest)
    }
}
