use crate::types::{CandidateImage, ScoredCandidate};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Items that can be ranked: higher score first, then ascending id
pub trait Ranked {
    fn rank_score(&self) -> f64;
    fn rank_id(&self) -> &str;
}

impl Ranked for ScoredCandidate {
    fn rank_score(&self) -> f64 {
        self.score
    }

    fn rank_id(&self) -> &str {
        self.id()
    }
}

/// Candidate ranked by clearness (lowest cloud fraction first)
#[derive(Debug, Clone)]
pub struct ClearestCandidate(pub CandidateImage);

impl Ranked for ClearestCandidate {
    fn rank_score(&self) -> f64 {
        1.0 - self.0.effective_cloud_fraction()
    }

    fn rank_id(&self) -> &str {
        &self.0.id
    }
}

fn rank_order<T: Ranked>(a: &T, b: &T) -> Ordering {
    b.rank_score()
        .partial_cmp(&a.rank_score())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.rank_id().cmp(b.rank_id()))
}

/// Heap entry ordered so the worst-ranked item sits on top
struct Entry<T>(T);

impl<T: Ranked> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        rank_order(&self.0, &other.0) == Ordering::Equal
    }
}

impl<T: Ranked> Eq for Entry<T> {}

impl<T: Ranked> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ranked> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        rank_order(&self.0, &other.0)
    }
}

/// Bounded best-K accumulator.
///
/// Keeps at most `capacity` items; pushing into a full accumulator evicts the
/// worst-ranked item (which may be the new one).
pub struct RankedAccumulator<T: Ranked> {
    capacity: usize,
    heap: BinaryHeap<Entry<T>>,
}

impl<T: Ranked> RankedAccumulator<T> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, heap: BinaryHeap::with_capacity(capacity.saturating_add(1).min(1024)) }
    }

    /// Offer an item; returns whichever item was dropped, if any
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        self.heap.push(Entry(item));
        if self.heap.len() > self.capacity {
            self.heap.pop().map(|e| e.0)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    /// Best-ranked item
    pub fn best(&self) -> Option<&T> {
        self.heap.iter().map(|e| &e.0).min_by(|a, b| rank_order(*a, *b))
    }

    /// Kept items, best first
    pub fn into_sorted_vec(self) -> Vec<T> {
        self.heap.into_sorted_vec().into_iter().map(|e| e.0).collect()
    }

    pub fn into_best(self) -> Option<T> {
        self.into_sorted_vec().into_iter().next()
    }
}

impl<T: Ranked> Extend<T> for RankedAccumulator<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.push(item);
        }
    }
}
