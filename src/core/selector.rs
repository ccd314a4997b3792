//! Per-source candidate selection with adaptive threshold relaxation.
//!
//! Candidates are scanned in ascending metadata cloud order against two cloud
//! gates (scene percentage, then tile fraction) and a quality gate. When a
//! gate keeps rejecting with nothing accepted yet it steps to the next, looser
//! value of its ladder. If nothing is accepted at all the selector still
//! proposes one fallback: the best quality-gate failure, or else the clearest
//! cloud-gate failure.

use crate::core::provenance::DiscardedCandidate;
use crate::core::quality::{band_completeness, QualityModel};
use crate::core::ranking::{ClearestCandidate, RankedAccumulator};
use crate::io::catalog::CatalogAdapter;
use crate::io::sources::{BandMapping, BandNameCache, SourceAdapter};
use crate::io::transport::RetryPolicy;
use crate::types::{Band, CandidateImage, MetadataKey, MosaicError, ScoredCandidate, TileRequest};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata retrieved for every scanned candidate, in one batched call
pub const METADATA_KEYS: [MetadataKey; 4] = [
    MetadataKey::CloudFraction,
    MetadataKey::SolarZenith,
    MetadataKey::ViewZenith,
    MetadataKey::ValidPixelFraction,
];

/// Candidate selection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Candidates scanned per source
    pub scan_limit: usize,
    pub high_throughput_scan_limit: usize,
    /// Acceptances after which a source stops scanning
    pub excellent_target: usize,
    pub high_throughput_excellent_target: usize,
    /// Scene cloud percentage gate, tightest first
    pub cloud_pct_ladder: Vec<f64>,
    /// Tile cloud fraction gate, tightest first
    pub cloud_fraction_ladder: Vec<f64>,
    /// Quality score gate, tightest first
    pub quality_ladder: Vec<f64>,
    /// Size of the global seed set
    pub global_top_k: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            scan_limit: 15,
            high_throughput_scan_limit: 30,
            excellent_target: 3,
            high_throughput_excellent_target: 5,
            cloud_pct_ladder: vec![20.0, 30.0, 40.0, 50.0, 60.0, 80.0],
            cloud_fraction_ladder: vec![0.2, 0.3, 0.4, 0.5, 0.6, 0.8],
            quality_ladder: vec![0.9, 0.7, 0.5, 0.3, 0.1, 0.0],
            global_top_k: 5,
        }
    }
}

impl SelectionConfig {
    pub fn scan_limit_for(&self, high_throughput: bool) -> usize {
        if high_throughput {
            self.high_throughput_scan_limit
        } else {
            self.scan_limit
        }
    }

    pub fn excellent_target_for(&self, high_throughput: bool) -> usize {
        if high_throughput {
            self.high_throughput_excellent_target
        } else {
            self.excellent_target
        }
    }
}

/// Rejections before a gate may relax, from the pre-scan candidate total
pub fn relaxation_minimum(total_candidates: usize) -> usize {
    match total_candidates {
        0..=3 => 1,
        4..=10 => 2,
        _ => 3,
    }
}

/// Why a candidate was not accepted
#[derive(Debug, Clone)]
pub enum Rejection {
    MissingBands { missing: Vec<Band> },
    CloudMetadata { cloud_pct: f64, threshold: f64 },
    CloudFraction { fraction: f64, threshold: f64 },
    Quality { scored: Box<ScoredCandidate>, threshold: f64 },
}

impl Rejection {
    fn is_cloud(&self) -> bool {
        matches!(self, Rejection::CloudMetadata { .. } | Rejection::CloudFraction { .. })
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MissingBands { missing } => {
                let names: Vec<_> = missing.iter().map(|b| b.name()).collect();
                write!(f, "missing mandatory bands {}", names.join(","))
            }
            Rejection::CloudMetadata { cloud_pct, threshold } => {
                write!(f, "scene cloud {:.1}% above {:.0}%", cloud_pct, threshold)
            }
            Rejection::CloudFraction { fraction, threshold } => {
                write!(f, "tile cloud fraction {:.3} above {:.2}", fraction, threshold)
            }
            Rejection::Quality { scored, threshold } => {
                write!(f, "quality {:.3} below {:.2}", scored.score, threshold)
            }
        }
    }
}

/// Step-wise relaxing threshold
#[derive(Debug, Clone)]
struct Ladder {
    steps: Vec<f64>,
    index: usize,
    rejections_since_relax: usize,
}

impl Ladder {
    fn new(steps: &[f64], fallback: f64) -> Self {
        let steps = if steps.is_empty() { vec![fallback] } else { steps.to_vec() };
        Self { steps, index: 0, rejections_since_relax: 0 }
    }

    fn current(&self) -> f64 {
        self.steps[self.index]
    }

    /// Count a rejection; step down the ladder once enough piled up with nothing accepted
    fn reject(&mut self, min_tests: usize, accepted: usize) -> bool {
        self.rejections_since_relax += 1;
        let can_relax = self.index + 1 < self.steps.len();
        if accepted == 0 && self.rejections_since_relax >= min_tests && can_relax {
            self.index += 1;
            self.rejections_since_relax = 0;
            return true;
        }
        false
    }
}

/// Thresholds in force when a candidate was evaluated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSnapshot {
    pub candidate_id: String,
    pub cloud_pct: f64,
    pub cloud_fraction: f64,
    pub quality: f64,
    pub accepted: bool,
}

/// Result of one source's selection run
#[derive(Debug, Clone, Default)]
pub struct SelectionOutcome {
    pub source_id: String,
    /// Accepted candidates, best first
    pub accepted: Vec<ScoredCandidate>,
    /// Single fallback proposed when nothing was accepted
    pub fallback: Option<ScoredCandidate>,
    /// Scored candidates not accepted, available for gap filling
    pub pool: Vec<ScoredCandidate>,
    pub discarded: Vec<DiscardedCandidate>,
    pub trace: Vec<ThresholdSnapshot>,
    pub evaluated: usize,
    pub missing_band_rejections: usize,
}

impl SelectionOutcome {
    /// Accepted candidates, or the fallback when none were accepted
    pub fn contributions(&self) -> Vec<ScoredCandidate> {
        if self.accepted.is_empty() {
            self.fallback.iter().cloned().collect()
        } else {
            self.accepted.clone()
        }
    }

    /// Every evaluated candidate lacked the mandatory bands
    pub fn only_missing_bands(&self) -> bool {
        self.evaluated > 0 && self.missing_band_rejections == self.evaluated
    }
}

/// Candidate selector for one batch
pub struct CandidateSelector<'a> {
    config: &'a SelectionConfig,
    model: &'a QualityModel,
    catalog: &'a dyn CatalogAdapter,
    cache: &'a BandNameCache,
    retry: &'a RetryPolicy,
}

impl<'a> CandidateSelector<'a> {
    pub fn new(
        config: &'a SelectionConfig,
        model: &'a QualityModel,
        catalog: &'a dyn CatalogAdapter,
        cache: &'a BandNameCache,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self { config, model, catalog, cache, retry }
    }

    /// Select from one source's listed candidates
    pub fn select(
        &self,
        adapter: &dyn SourceAdapter,
        mut candidates: Vec<CandidateImage>,
        request: &TileRequest,
        min_tests: usize,
    ) -> SelectionOutcome {
        let source_id = adapter.source().id.clone();
        let scan_limit = self.config.scan_limit_for(request.high_throughput);
        let target = self.config.excellent_target_for(request.high_throughput).max(1);

        candidates.sort_by(|a, b| {
            a.cloud_cover_pct
                .partial_cmp(&b.cloud_cover_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        if candidates.len() > scan_limit {
            log::debug!(
                "{}: scanning {} of {} candidates",
                source_id,
                scan_limit,
                candidates.len()
            );
            candidates.truncate(scan_limit);
        }
        let candidates = self.enrich(&source_id, candidates);

        let mut outcome = SelectionOutcome { source_id: source_id.clone(), ..Default::default() };
        let mut cloud_pct = Ladder::new(&self.config.cloud_pct_ladder, 100.0);
        let mut cloud_fraction = Ladder::new(&self.config.cloud_fraction_ladder, 1.0);
        let mut quality = Ladder::new(&self.config.quality_ladder, 0.0);
        let mut accepted = RankedAccumulator::new(target);
        let mut best_quality_failure = RankedAccumulator::new(1);
        let mut clearest_cloud_failure = RankedAccumulator::new(1);

        let mut remaining = candidates.into_iter();
        for candidate in remaining.by_ref() {
            let mapping = adapter.prepare_bands(&candidate, self.cache);
            let thresholds = (cloud_pct.current(), cloud_fraction.current(), quality.current());
            let result = self.evaluate(&candidate, &mapping, request, thresholds);
            outcome.evaluated += 1;

            outcome.trace.push(ThresholdSnapshot {
                candidate_id: candidate.id.clone(),
                cloud_pct: thresholds.0,
                cloud_fraction: thresholds.1,
                quality: thresholds.2,
                accepted: result.is_ok(),
            });

            match result {
                Ok(scored) => {
                    log::debug!(
                        "{}: accepted {} (score {:.3})",
                        source_id,
                        scored.id(),
                        scored.score
                    );
                    accepted.push(scored);
                    if accepted.is_full() {
                        log::debug!("{}: excellent target of {} reached", source_id, target);
                        break;
                    }
                }
                Err(rejection) => {
                    log::debug!("{}: rejected {}: {}", source_id, candidate.id, rejection);
                    outcome.discarded.push(DiscardedCandidate {
                        id: candidate.id.clone(),
                        source_id: source_id.clone(),
                        reason: rejection.to_string(),
                    });

                    if rejection.is_cloud() {
                        outcome.pool.push(self.score(&candidate, &mapping, request));
                        clearest_cloud_failure.push(ClearestCandidate(candidate));
                        let relaxed_pct = cloud_pct.reject(min_tests, accepted.len());
                        let relaxed_fraction = cloud_fraction.reject(min_tests, accepted.len());
                        if relaxed_pct || relaxed_fraction {
                            log::debug!(
                                "{}: cloud gates relaxed to {:.0}% / {:.2}",
                                source_id,
                                cloud_pct.current(),
                                cloud_fraction.current()
                            );
                        }
                    } else if let Rejection::Quality { scored, .. } = rejection {
                        outcome.pool.push((*scored).clone());
                        best_quality_failure.push(*scored);
                        if quality.reject(min_tests, accepted.len()) {
                            log::debug!(
                                "{}: quality gate relaxed to {:.2}",
                                source_id,
                                quality.current()
                            );
                        }
                    } else {
                        outcome.missing_band_rejections += 1;
                    }
                }
            }
        }

        // Candidates left unscanned after the target was met still feed gap filling
        for candidate in remaining {
            let mapping = adapter.prepare_bands(&candidate, self.cache);
            if mapping.has_primary() {
                outcome.pool.push(self.score(&candidate, &mapping, request));
            }
        }

        outcome.accepted = accepted.into_sorted_vec();
        if outcome.accepted.is_empty() {
            outcome.fallback = match best_quality_failure.into_best() {
                Some(scored) => {
                    log::info!(
                        "{}: no acceptances, falling back to best quality failure {}",
                        source_id,
                        scored.id()
                    );
                    Some(scored)
                }
                None => clearest_cloud_failure.into_best().map(|clearest| {
                    let mapping = adapter.prepare_bands(&clearest.0, self.cache);
                    let scored = self.score(&clearest.0, &mapping, request);
                    log::info!(
                        "{}: no acceptances, falling back to clearest candidate {}",
                        source_id,
                        scored.id()
                    );
                    scored
                }),
            };
            if let Some(fallback) = &outcome.fallback {
                outcome.pool.retain(|c| c.id() != fallback.id());
            }
        }

        log::info!(
            "{}: {} evaluated, {} accepted, {} in pool{}",
            source_id,
            outcome.evaluated,
            outcome.accepted.len(),
            outcome.pool.len(),
            if outcome.fallback.is_some() { ", fallback used" } else { "" }
        );
        outcome
    }

    /// Apply batched metadata to the scanned candidates
    fn enrich(&self, source_id: &str, candidates: Vec<CandidateImage>) -> Vec<CandidateImage> {
        if candidates.is_empty() {
            return candidates;
        }
        let label = format!("{} metadata", source_id);
        let fetched = self.retry.run(&label, |_| {
            self.catalog
                .fetch_metadata(&candidates, &METADATA_KEYS)
                .map_err(MosaicError::from)
        });
        match fetched {
            Ok(maps) if maps.len() == candidates.len() => candidates
                .iter()
                .zip(maps.iter())
                .map(|(c, values)| c.with_metadata(values))
                .collect(),
            Ok(maps) => {
                log::warn!(
                    "{}: metadata response has {} entries for {} candidates, ignoring",
                    source_id,
                    maps.len(),
                    candidates.len()
                );
                candidates
            }
            Err(e) => {
                log::warn!(
                    "{}: metadata unavailable ({}), using scene metadata only",
                    source_id,
                    e
                );
                candidates
            }
        }
    }

    fn score(
        &self,
        candidate: &CandidateImage,
        mapping: &BandMapping,
        request: &TileRequest,
    ) -> ScoredCandidate {
        let completeness = band_completeness(&mapping.available());
        let score = self
            .model
            .score_candidate(candidate, request.start, request.window_days(), Some(completeness));
        ScoredCandidate { candidate: candidate.clone(), score, band_completeness: completeness }
    }

    /// Gate one candidate against the active thresholds
    pub fn evaluate(
        &self,
        candidate: &CandidateImage,
        mapping: &BandMapping,
        request: &TileRequest,
        (cloud_pct, cloud_fraction, quality): (f64, f64, f64),
    ) -> Result<ScoredCandidate, Rejection> {
        if !mapping.has_primary() {
            let missing = Band::PRIMARY
                .iter()
                .filter(|b| mapping.raw_name(**b).is_none())
                .copied()
                .collect();
            return Err(Rejection::MissingBands { missing });
        }
        if candidate.cloud_cover_pct > cloud_pct {
            return Err(Rejection::CloudMetadata {
                cloud_pct: candidate.cloud_cover_pct,
                threshold: cloud_pct,
            });
        }
        let fraction = candidate.effective_cloud_fraction();
        if fraction > cloud_fraction {
            return Err(Rejection::CloudFraction { fraction, threshold: cloud_fraction });
        }
        let scored = self.score(candidate, mapping, request);
        if scored.score < quality {
            return Err(Rejection::Quality { scored: Box::new(scored), threshold: quality });
        }
        Ok(scored)
    }
}
