/*!
 * Provenance records for tiles and batches
 *
 * Every tile, successful or not, gets a JSON record with its status, the
 * ranked candidates it used, quality statistics, gap-fill diagnostics and the
 * candidates discarded along the way. A batch adds a summary with a
 * failure-reason histogram and one manifest row.
 */

use crate::core::gap_fill::GapFillStats;
use crate::types::{FailureHistogram, FailureReason, MosaicError, ScoredCandidate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    Succeeded,
    /// Output produced but coverage stayed below the partial threshold
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub rank: usize,
    pub id: String,
    pub source_id: String,
    pub acquired: DateTime<Utc>,
    pub score: f64,
    pub band_completeness: f64,
    pub resolution_m: f64,
    pub cloud_fraction: f64,
}

impl CandidateSummary {
    pub fn from_ranked(ranked: &[ScoredCandidate]) -> Vec<Self> {
        ranked
            .iter()
            .enumerate()
            .map(|(i, c)| Self {
                rank: i + 1,
                id: c.id().to_string(),
                source_id: c.source_id().to_string(),
                acquired: c.candidate.acquired,
                score: c.score,
                band_completeness: c.band_completeness,
                resolution_m: c.resolution_m(),
                cloud_fraction: c.candidate.effective_cloud_fraction(),
            })
            .collect()
    }
}

/// Score statistics over the candidates used
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityStats {
    pub count: usize,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

impl QualityStats {
    pub fn from_candidates(candidates: &[ScoredCandidate]) -> Option<Self> {
        if candidates.is_empty() {
            return None;
        }
        let scores = candidates.iter().map(|c| c.score);
        let min = scores.clone().fold(f64::INFINITY, f64::min);
        let max = scores.clone().fold(f64::NEG_INFINITY, f64::max);
        let mean = scores.sum::<f64>() / candidates.len() as f64;
        Some(Self { count: candidates.len(), min, mean, max })
    }
}

/// A candidate dropped during selection or gap filling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscardedCandidate {
    pub id: String,
    pub source_id: String,
    pub reason: String,
}

/// Per-tile provenance record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileProvenance {
    pub tile_id: String,
    pub status: TileStatus,
    pub failure_reason: Option<FailureReason>,
    pub message: Option<String>,
    pub dominant_source: Option<String>,
    pub candidates: Vec<CandidateSummary>,
    pub quality: Option<QualityStats>,
    pub coverage: f64,
    pub gap_fill: Option<GapFillStats>,
    pub discarded: Vec<DiscardedCandidate>,
    pub raster_path: Option<String>,
    pub processing_seconds: f64,
    pub created_at: DateTime<Utc>,
}

impl TileProvenance {
    /// Record for a tile whose pipeline produced a composite
    pub fn completed(
        tile_id: &str,
        ranked: &[ScoredCandidate],
        dominant_source: Option<String>,
        coverage: f64,
        gap_fill: GapFillStats,
        discarded: Vec<DiscardedCandidate>,
        partial_threshold: f64,
    ) -> Self {
        let status = if coverage >= partial_threshold {
            TileStatus::Succeeded
        } else {
            TileStatus::Partial
        };
        Self {
            tile_id: tile_id.to_string(),
            status,
            failure_reason: None,
            message: None,
            dominant_source,
            candidates: CandidateSummary::from_ranked(ranked),
            quality: QualityStats::from_candidates(ranked),
            coverage,
            gap_fill: Some(gap_fill),
            discarded,
            raster_path: None,
            processing_seconds: 0.0,
            created_at: Utc::now(),
        }
    }

    /// Record for a tile whose pipeline failed
    pub fn failed(tile_id: &str, error: &MosaicError) -> Self {
        Self {
            tile_id: tile_id.to_string(),
            status: TileStatus::Failed,
            failure_reason: Some(error.failure_reason()),
            message: Some(error.to_string()),
            dominant_source: None,
            candidates: Vec::new(),
            quality: None,
            coverage: 0.0,
            gap_fill: None,
            discarded: Vec::new(),
            raster_path: None,
            processing_seconds: 0.0,
            created_at: Utc::now(),
        }
    }

    pub fn produced_output(&self) -> bool {
        self.status != TileStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// At least one tile produced output
    Completed,
    Failed,
}

/// Batch-level summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub status: BatchStatus,
    pub tiles_total: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub failure_histogram: FailureHistogram,
    pub merged_coverage: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchSummary {
    pub fn from_tiles(batch_id: &str, tiles: &[TileProvenance], started_at: DateTime<Utc>) -> Self {
        let mut histogram = FailureHistogram::new();
        let mut succeeded = 0;
        let mut partial = 0;
        let mut failed = 0;
        for tile in tiles {
            match tile.status {
                TileStatus::Succeeded => succeeded += 1,
                TileStatus::Partial => partial += 1,
                TileStatus::Failed => {
                    failed += 1;
                    let reason = tile.failure_reason.unwrap_or(FailureReason::Unknown);
                    *histogram.entry(reason).or_insert(0) += 1;
                }
            }
        }
        let status =
            if succeeded + partial > 0 { BatchStatus::Completed } else { BatchStatus::Failed };
        Self {
            batch_id: batch_id.to_string(),
            status,
            tiles_total: tiles.len(),
            succeeded,
            partial,
            failed,
            failure_histogram: histogram,
            merged_coverage: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Human-readable summary
    pub fn report(&self) -> String {
        let mut report = format!(
            "Batch {} {:?}: {} tile(s), {} succeeded, {} partial, {} failed",
            self.batch_id, self.status, self.tiles_total, self.succeeded, self.partial, self.failed
        );
        for (reason, count) in &self.failure_histogram {
            report.push_str(&format!("\n  {:?}: {}", reason, count));
        }
        if let Some(coverage) = self.merged_coverage {
            report.push_str(&format!("\n  merged coverage: {:.1}%", coverage * 100.0));
        }
        report
    }
}

/// One line of `manifest.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub batch_id: String,
    pub status: BatchStatus,
    pub output_paths: Vec<String>,
    pub provenance_paths: Vec<String>,
    pub summary_path: String,
    pub timestamp: DateTime<Utc>,
}
