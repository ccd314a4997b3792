//! Coverage-driven gap filling.
//!
//! Each iteration measures tile coverage and, while it is below target, adds
//! the best unused candidate as the lowest-priority layer of the composite.
//! Candidates are ranked by a gap-filling score dominated by resolution, then
//! a resolution-first tie-break picks the winner. Layers only fill invalid
//! pixels, so coverage never decreases.

use crate::core::composite::{Composite, LayerProvider};
use crate::types::{ScoredCandidate, TileGeometry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Gap filling parameters; the tie-break constants are empirical
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapFillConfig {
    pub target_coverage: f64,
    pub max_iterations: usize,
    pub high_throughput_max_iterations: usize,
    /// Improvement below which an iteration counts as stalled
    pub min_improvement: f64,
    /// Consecutive stalled iterations before giving up
    pub stall_iterations: usize,

    pub resolution_weight: f64,
    pub temporal_weight: f64,
    pub quality_weight: f64,
    /// Full temporal bonus up to this many days from a selected date
    pub temporal_full_days: f64,
    /// No temporal bonus from this many days on
    pub temporal_zero_days: f64,

    /// Finer by at least this much: accepted at up to `large_gain_max_deficit` lower score
    pub large_resolution_gain_m: f64,
    pub large_gain_max_deficit: f64,
    /// Finer by at least this much: accepted at up to `small_gain_max_deficit` lower score
    pub small_resolution_gain_m: f64,
    pub small_gain_max_deficit: f64,
    /// Coarser candidates need this margin at `small_resolution_gain_m` worse ...
    pub worse_min_margin: f64,
    /// ... rising to this margin at `worse_margin_saturation_m` worse
    pub worse_max_margin: f64,
    pub worse_margin_saturation_m: f64,

    pub initial_quality_floor: f64,
    pub quality_floor_step: f64,
    pub min_quality_floor: f64,
}

impl Default for GapFillConfig {
    fn default() -> Self {
        Self {
            target_coverage: 0.999,
            max_iterations: 20,
            high_throughput_max_iterations: 30,
            min_improvement: 0.001,     // 0.1% coverage
            stall_iterations: 3,
            resolution_weight: 0.70,
            temporal_weight: 0.15,
            quality_weight: 0.15,
            temporal_full_days: 10.0,
            temporal_zero_days: 30.0,
            large_resolution_gain_m: 50.0,
            large_gain_max_deficit: 0.10,
            small_resolution_gain_m: 20.0,
            small_gain_max_deficit: 0.05,
            worse_min_margin: 0.10,
            worse_max_margin: 0.15,
            worse_margin_saturation_m: 100.0,
            initial_quality_floor: 0.5,
            quality_floor_step: 0.05,
            min_quality_floor: 0.2,
        }
    }
}

impl GapFillConfig {
    pub fn iteration_cap(&self, high_throughput: bool) -> usize {
        if high_throughput {
            self.high_throughput_max_iterations
        } else {
            self.max_iterations
        }
    }

    /// Quality floor for a 0-based iteration
    pub fn quality_floor(&self, iteration: usize) -> f64 {
        let floor = self.initial_quality_floor - self.quality_floor_step * iteration as f64;
        floor.max(self.min_quality_floor)
    }
}

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    IterationCap,
    Stalled,
    PoolExhausted,
}

/// Unfillable gap or failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapFillEvent {
    pub iteration: usize,
    pub candidate_id: Option<String>,
    pub reason: String,
}

/// Gap filling diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapFillStats {
    pub gaps_identified: usize,
    pub gaps_filled: usize,
    pub unfillable: usize,
    pub attempts: usize,
    pub images_added: usize,
    pub iterations: usize,
    pub initial_coverage: f64,
    pub final_coverage: f64,
    /// Coverage after every iteration, starting with the initial value
    pub coverage_trace: Vec<f64>,
    pub events: Vec<GapFillEvent>,
    pub stop_reason: Option<StopReason>,
}

impl GapFillStats {
    fn unfillable(&mut self, iteration: usize, candidate_id: Option<&str>, reason: String) {
        log::warn!("Gap fill iteration {}: {}", iteration, reason);
        self.unfillable += 1;
        self.events.push(GapFillEvent {
            iteration,
            candidate_id: candidate_id.map(str::to_string),
            reason,
        });
    }
}

/// Candidate with its gap-filling score
#[derive(Debug, Clone)]
struct GapCandidate<'a> {
    scored: &'a ScoredCandidate,
    gap_score: f64,
}

/// Iterative gap filling engine
#[derive(Debug, Clone)]
pub struct GapFillEngine {
    config: GapFillConfig,
    target_resolution_m: f64,
}

impl GapFillEngine {
    pub fn new(config: GapFillConfig, target_resolution_m: f64) -> Self {
        Self { config, target_resolution_m }
    }

    /// Days-based proximity bonus to the closest already-selected date
    pub fn temporal_term(&self, acquired: DateTime<Utc>, selected: &[DateTime<Utc>]) -> f64 {
        let Some(days) = selected
            .iter()
            .map(|d| (acquired - *d).num_seconds().abs() as f64 / 86_400.0)
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        else {
            return 1.0;
        };
        let full = self.config.temporal_full_days;
        let zero = self.config.temporal_zero_days.max(full);
        if days <= full {
            1.0
        } else if days >= zero {
            0.0
        } else {
            1.0 - (days - full) / (zero - full)
        }
    }

    pub fn resolution_term(&self, native_resolution_m: f64) -> f64 {
        if !(native_resolution_m > 0.0) {
            return 0.0;
        }
        (self.target_resolution_m / native_resolution_m).min(1.0)
    }

    /// 0.7 resolution + 0.15 temporal proximity + 0.15 quality (default weights)
    pub fn gap_score(&self, candidate: &ScoredCandidate, selected: &[DateTime<Utc>]) -> f64 {
        self.config.resolution_weight * self.resolution_term(candidate.resolution_m())
            + self.config.temporal_weight
                * self.temporal_term(candidate.candidate.acquired, selected)
            + self.config.quality_weight * candidate.score
    }

    /// Whether a challenger displaces the incumbent under the resolution-first rule.
    ///
    /// The 50 m, 20 m and coarser-resolution margins are measured on the
    /// gap-filling score, which already weights resolution at 0.7; only the
    /// ±20 m band compares raw quality. A coarser image therefore needs more
    /// than a quality lead to win: for a 10 m target a 40 m image at quality
    /// 0.5 still beats a 100 m image at quality 0.9, and a 30 m image at 0.6
    /// beats a 300 m one at 0.75.
    fn challenger_wins(&self, challenger: &GapCandidate, incumbent: &GapCandidate) -> bool {
        let c = &self.config;
        let gain = incumbent.scored.resolution_m() - challenger.scored.resolution_m();
        if gain >= c.large_resolution_gain_m {
            challenger.gap_score >= incumbent.gap_score * (1.0 - c.large_gain_max_deficit)
        } else if gain >= c.small_resolution_gain_m {
            challenger.gap_score >= incumbent.gap_score * (1.0 - c.small_gain_max_deficit)
        } else if gain > -c.small_resolution_gain_m {
            challenger.scored.score > incumbent.scored.score
        } else {
            let worse_by = -gain;
            let span = (c.worse_margin_saturation_m - c.small_resolution_gain_m).max(f64::EPSILON);
            let t = ((worse_by - c.small_resolution_gain_m) / span).clamp(0.0, 1.0);
            let margin = c.worse_min_margin + t * (c.worse_max_margin - c.worse_min_margin);
            challenger.gap_score >= incumbent.gap_score * (1.0 + margin)
        }
    }

    /// Winner among candidates, or None when the slice is empty
    fn pick<'a>(&self, mut ranked: Vec<GapCandidate<'a>>) -> Option<&'a ScoredCandidate> {
        ranked.sort_by(|a, b| {
            b.gap_score
                .partial_cmp(&a.gap_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.scored.id().cmp(b.scored.id()))
        });
        let mut iter = ranked.into_iter();
        let mut best = iter.next()?;
        for challenger in iter {
            if self.challenger_wins(&challenger, &best) {
                log::debug!(
                    "Tie-break: {} ({:.0}m, gap {:.3}) displaces {} ({:.0}m, gap {:.3})",
                    challenger.scored.id(),
                    challenger.scored.resolution_m(),
                    challenger.gap_score,
                    best.scored.id(),
                    best.scored.resolution_m(),
                    best.gap_score
                );
                best = challenger;
            }
        }
        Some(best.scored)
    }

    /// Choose the next candidate from those still available
    pub fn choose<'a>(
        &self,
        available: &[&'a ScoredCandidate],
        selected: &[DateTime<Utc>],
        iteration: usize,
    ) -> Option<&'a ScoredCandidate> {
        let floor = self.config.quality_floor(iteration);
        let scored: Vec<GapCandidate<'a>> = available
            .iter()
            .map(|c| GapCandidate { scored: *c, gap_score: self.gap_score(c, selected) })
            .collect();
        let eligible: Vec<GapCandidate<'a>> =
            scored.iter().filter(|g| g.scored.score >= floor).cloned().collect();
        if eligible.is_empty() {
            log::debug!(
                "No candidate clears quality floor {:.2}, widening to all available",
                floor
            );
            return self.pick(scored);
        }
        self.pick(eligible)
    }

    /// Add candidates from `pool` until coverage reaches target or a stop condition hits
    pub fn improve(
        &self,
        mut composite: Composite,
        pool: &[ScoredCandidate],
        geometry: &TileGeometry,
        provider: &dyn LayerProvider,
        high_throughput: bool,
    ) -> (Composite, GapFillStats) {
        let cap = self.config.iteration_cap(high_throughput);
        let bounds = geometry.bounds();
        let mut used: HashSet<String> =
            composite.candidates().iter().map(|c| c.id().to_string()).collect();
        let mut coverage = composite.coverage();
        let mut stalled = 0usize;
        let mut stats = GapFillStats {
            initial_coverage: coverage,
            coverage_trace: vec![coverage],
            ..Default::default()
        };

        log::info!(
            "Gap fill: initial coverage {:.2}%, {} candidate(s) in pool",
            coverage * 100.0,
            pool.len()
        );

        let mut iteration = 0usize;
        let stop = loop {
            if coverage >= self.config.target_coverage {
                break StopReason::TargetReached;
            }
            if iteration >= cap {
                break StopReason::IterationCap;
            }
            stats.gaps_identified += 1;

            let available: Vec<&ScoredCandidate> = pool
                .iter()
                .filter(|c| !used.contains(c.id()))
                .filter(|c| c.candidate.footprint.map_or(true, |fp| fp.intersects(&bounds)))
                .collect();
            let selected: Vec<DateTime<Utc>> =
                composite.candidates().iter().map(|c| c.candidate.acquired).collect();

            let Some(choice) = self.choose(&available, &selected, iteration) else {
                stats.unfillable(
                    iteration,
                    None,
                    format!(
                        "no unused candidate intersects the tile at {:.2}% coverage",
                        coverage * 100.0
                    ),
                );
                break StopReason::PoolExhausted;
            };

            used.insert(choice.id().to_string());
            stats.attempts += 1;
            log::debug!(
                "Gap fill iteration {}: trying {} ({:.0}m, score {:.3})",
                iteration,
                choice.id(),
                choice.resolution_m(),
                choice.score
            );

            let added = provider
                .layer(choice, composite.grid())
                .and_then(|layer| composite.add_layer(choice.clone(), &layer));
            match added {
                Ok(filled) => {
                    stats.images_added += 1;
                    if filled > 0 {
                        stats.gaps_filled += 1;
                    } else {
                        let reason = format!("{} has no valid pixels in the gaps", choice.id());
                        stats.unfillable(iteration, Some(choice.id()), reason);
                    }
                }
                Err(e) => {
                    let reason = format!("{} could not be added: {}", choice.id(), e);
                    stats.unfillable(iteration, Some(choice.id()), reason);
                }
            }

            let new_coverage = composite.coverage().max(coverage);
            if new_coverage - coverage < self.config.min_improvement {
                stalled += 1;
            } else {
                stalled = 0;
            }
            coverage = new_coverage;
            stats.coverage_trace.push(coverage);
            iteration += 1;

            if stalled >= self.config.stall_iterations && coverage < self.config.target_coverage {
                break StopReason::Stalled;
            }
        };

        if stop != StopReason::TargetReached && stop != StopReason::PoolExhausted {
            stats.unfillable(
                iteration,
                None,
                format!("stopped ({:?}) with coverage {:.2}% below target", stop, coverage * 100.0),
            );
        }

        stats.iterations = iteration;
        stats.final_coverage = coverage;
        stats.stop_reason = Some(stop);
        log::info!(
            "Gap fill: {:.2}% -> {:.2}% after {} iteration(s), {} image(s) added ({:?})",
            stats.initial_coverage * 100.0,
            coverage * 100.0,
            iteration,
            stats.images_added,
            stop
        );
        (composite, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::projection::GridSpec;
    use crate::types::{
        Band, BoundingBox, CandidateImage, CoordinateSystem, GeoTransform, MosaicError,
        MosaicResult, Raster, NODATA,
    };
    use approx::assert_abs_diff_eq;
    use chrono::{Duration, TimeZone};
    use ndarray::{Array2, Array3};
    use std::collections::HashMap;

    const SIZE: usize = 10;

    fn grid() -> GridSpec {
        GridSpec {
            transform: GeoTransform::north_up(400_000.0, 5_800_000.0, 10.0),
            rows: SIZE,
            cols: SIZE,
            crs: CoordinateSystem::Utm { zone: 33, north: true },
        }
    }

    fn geometry() -> TileGeometry {
        TileGeometry::Rectangle(BoundingBox::new(13.0, 52.0, 13.1, 52.1))
    }

    fn scored(id: &str, score: f64, resolution: f64, day: i64) -> ScoredCandidate {
        ScoredCandidate {
            candidate: CandidateImage {
                id: id.into(),
                source_id: format!("src-{}", resolution),
                acquired: Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap() + Duration::days(day),
                cloud_cover_pct: 0.0,
                cloud_fraction: None,
                valid_pixel_fraction: None,
                solar_zenith_deg: None,
                view_zenith_deg: None,
                native_resolution_m: resolution,
                band_names: vec![],
                footprint: None,
                asset_ref: String::new(),
            },
            score,
            band_completeness: 1.0,
        }
    }

    fn layer(valid: impl Fn(usize, usize) -> bool) -> Raster {
        let g = grid();
        let data = Array3::from_shape_fn((6, SIZE, SIZE), |(_, r, c)| {
            if valid(r, c) {
                0.25
            } else {
                NODATA
            }
        });
        Raster::new(data, Band::STANDARD.to_vec(), g.transform, g.crs).unwrap()
    }

    struct Layers(HashMap<String, Raster>);

    impl LayerProvider for Layers {
        fn layer(&self, candidate: &ScoredCandidate, _grid: &GridSpec) -> MosaicResult<Raster> {
            self.0.get(candidate.id()).cloned().ok_or_else(|| MosaicError::DownloadFailure {
                attempts: 3,
                message: "unreachable".into(),
            })
        }
    }

    /// Composite seeded with a layer covering the first `rows` rows
    fn seeded(rows: usize) -> Composite {
        let mut composite = Composite::new(grid(), Array2::from_elem((SIZE, SIZE), true));
        composite
            .add_layer(scored("seed", 0.9, 10.0, 0), &layer(|r, _| r < rows))
            .unwrap();
        composite
    }

    #[test]
    fn test_gap_score_weights() {
        let engine = GapFillEngine::new(GapFillConfig::default(), 10.0);
        let selected = [Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap()];
        let fine = scored("fine", 0.6, 30.0, 0);
        let coarse = scored("coarse", 0.75, 300.0, 0);
        let fine_gap = engine.gap_score(&fine, &selected);
        let coarse_gap = engine.gap_score(&coarse, &selected);
        assert_abs_diff_eq!(fine_gap, 0.7 / 3.0 + 0.15 + 0.09, epsilon = 1e-9);
        assert_abs_diff_eq!(coarse_gap, 0.7 / 30.0 + 0.15 + 0.1125, epsilon = 1e-9);
    }

    #[test]
    fn test_temporal_term_decays_between_10_and_30_days() {
        let engine = GapFillEngine::new(GapFillConfig::default(), 10.0);
        let base = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(engine.temporal_term(base + Duration::days(7), &[base]), 1.0);
        let twenty_days = engine.temporal_term(base + Duration::days(20), &[base]);
        assert_abs_diff_eq!(twenty_days, 0.5, epsilon = 1e-9);
        assert_eq!(engine.temporal_term(base - Duration::days(45), &[base]), 0.0);
        assert_eq!(engine.temporal_term(base, &[]), 1.0);
    }

    #[test]
    fn test_resolution_first_pick_over_higher_quality_coarse() {
        let composite = seeded(8);
        assert_abs_diff_eq!(composite.coverage(), 0.8, epsilon = 1e-9);

        let pool = vec![scored("landsat", 0.6, 30.0, 2), scored("coarse", 0.75, 300.0, 2)];
        let provider = Layers(HashMap::from([
            ("landsat".to_string(), layer(|_, _| true)),
            ("coarse".to_string(), layer(|_, _| true)),
        ]));
        let engine = GapFillEngine::new(GapFillConfig::default(), 10.0);
        let (composite, stats) = engine.improve(composite, &pool, &geometry(), &provider, false);

        let ids: Vec<_> = composite.candidates().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec!["seed", "landsat"]);
        assert_eq!(stats.stop_reason, Some(StopReason::TargetReached));
        assert_eq!(stats.images_added, 1);
        assert_abs_diff_eq!(stats.initial_coverage, 0.8, epsilon = 1e-9);
        assert_eq!(stats.final_coverage, 1.0);
    }

    #[test]
    fn test_quality_lead_does_not_buy_back_coarse_resolution() {
        let engine = GapFillEngine::new(GapFillConfig::default(), 10.0);
        let selected = [Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap()];
        let fine = scored("fine40", 0.5, 40.0, 0);
        let coarse = scored("coarse100", 0.9, 100.0, 0);

        // 0.7 * 0.25 + 0.15 + 0.075 against 0.7 * 0.1 + 0.15 + 0.135
        assert_abs_diff_eq!(engine.gap_score(&fine, &selected), 0.4, epsilon = 1e-9);
        assert_abs_diff_eq!(engine.gap_score(&coarse, &selected), 0.355, epsilon = 1e-9);

        for pool in [[&fine, &coarse], [&coarse, &fine]] {
            let picked = engine.choose(&pool, &selected, 1).map(|c| c.id().to_string());
            assert_eq!(picked.as_deref(), Some("fine40"));
        }

        // same resolution band: quality decides
        let peer = scored("peer45", 0.9, 45.0, 0);
        let picked = engine.choose(&[&fine, &peer], &selected, 1).map(|c| c.id().to_string());
        assert_eq!(picked.as_deref(), Some("peer45"));
    }

    #[test]
    fn test_tie_break_rules() {
        let engine = GapFillEngine::new(GapFillConfig::default(), 10.0);
        fn gc(scored: &ScoredCandidate, gap_score: f64) -> GapCandidate<'_> {
            GapCandidate { scored, gap_score }
        }

        let coarse = scored("coarse", 0.8, 100.0, 0);
        let fine = scored("fine", 0.7, 30.0, 0);
        let mid = scored("mid", 0.7, 75.0, 0);
        let peer = scored("peer", 0.85, 90.0, 0);
        let coarser = scored("coarser", 0.9, 250.0, 0);

        // 70 m finer: accepted with a 9% deficit, refused with 11%
        assert!(engine.challenger_wins(&gc(&fine, 0.91), &gc(&coarse, 1.0)));
        assert!(!engine.challenger_wins(&gc(&fine, 0.89), &gc(&coarse, 1.0)));
        // 25 m finer: 5% allowance
        assert!(engine.challenger_wins(&gc(&mid, 0.96), &gc(&coarse, 1.0)));
        assert!(!engine.challenger_wins(&gc(&mid, 0.94), &gc(&coarse, 1.0)));
        // within 20 m: raw quality decides
        assert!(engine.challenger_wins(&gc(&peer, 0.5), &gc(&coarse, 1.0)));
        // 150 m coarser: needs the full 15% margin
        assert!(!engine.challenger_wins(&gc(&coarser, 1.14), &gc(&coarse, 1.0)));
        assert!(engine.challenger_wins(&gc(&coarser, 1.16), &gc(&coarse, 1.0)));
    }

    #[test]
    fn test_coverage_is_monotone_and_loop_terminates() {
        let composite = seeded(2);
        let mut layers = HashMap::new();
        let mut pool = Vec::new();
        for i in 0..40 {
            let id = format!("c{:02}", i);
            // every fourth candidate is unreachable, others cover a single row
            if i % 4 != 3 {
                let row = i % SIZE;
                layers.insert(id.clone(), layer(move |r, _| r == row));
            }
            let (score, resolution) = (0.3 + (i % 7) as f64 * 0.1, 10.0 + (i % 5) as f64 * 20.0);
            pool.push(scored(&id, score, resolution, i as i64));
        }
        let engine = GapFillEngine::new(GapFillConfig::default(), 10.0);
        let (_, stats) = engine.improve(composite, &pool, &geometry(), &Layers(layers), false);

        assert!(stats.iterations <= 20);
        for pair in stats.coverage_trace.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(stats.final_coverage >= stats.initial_coverage);
        assert_eq!(stats.attempts, stats.iterations);
    }

    #[test]
    fn test_stalls_after_three_fruitless_iterations() {
        let composite = seeded(5);
        let pool: Vec<_> = (0..10).map(|i| scored(&format!("empty{}", i), 0.8, 10.0, 0)).collect();
        let layers = pool.iter().map(|c| (c.id().to_string(), layer(|_, _| false))).collect();
        let engine = GapFillEngine::new(GapFillConfig::default(), 10.0);
        let (_, stats) = engine.improve(composite, &pool, &geometry(), &Layers(layers), false);

        assert_eq!(stats.stop_reason, Some(StopReason::Stalled));
        assert_eq!(stats.iterations, 3);
        assert_abs_diff_eq!(stats.final_coverage, 0.5, epsilon = 1e-9);
        assert!(stats.events.iter().any(|e| e.reason.contains("below target")));
    }

    #[test]
    fn test_pool_exhaustion_and_footprint_filter() {
        let composite = seeded(5);
        let mut far = scored("far", 0.9, 10.0, 0);
        far.candidate.footprint = Some(BoundingBox::new(100.0, 0.0, 101.0, 1.0));
        let engine = GapFillEngine::new(GapFillConfig::default(), 10.0);
        let empty = Layers(HashMap::new());
        let (composite, stats) = engine.improve(composite, &[far], &geometry(), &empty, false);

        assert_eq!(composite.len(), 1);
        assert_eq!(stats.stop_reason, Some(StopReason::PoolExhausted));
        assert_eq!(stats.unfillable, 1);
        assert_eq!(stats.attempts, 0);
    }

    #[test]
    fn test_quality_floor_relaxes_then_widens() {
        let config = GapFillConfig::default();
        assert_eq!(config.quality_floor(0), 0.5);
        assert_abs_diff_eq!(config.quality_floor(4), 0.3, epsilon = 1e-9);
        assert_eq!(config.quality_floor(50), 0.2);

        let engine = GapFillEngine::new(config, 10.0);
        let weak = scored("weak", 0.05, 10.0, 0);
        let available = vec![&weak];
        assert_eq!(engine.choose(&available, &[], 0).map(|c| c.id()), Some("weak"));
    }
}
