//! Batch configuration: every engine's parameters in one serialisable struct

use crate::core::gap_fill::GapFillConfig;
use crate::core::indices::IndexConfig;
use crate::core::quality::QualityWeights;
use crate::core::scheduler::SchedulerConfig;
use crate::core::selector::SelectionConfig;
use crate::core::tile_merge::MergeConfig;
use crate::io::transport::RetryPolicy;
use crate::types::{MosaicError, MosaicResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Output locations and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
    /// Largest grid a single pixel request may cover
    pub max_pixels_per_request: usize,
    /// Tiles below this coverage are reported as partial
    pub partial_coverage_threshold: f64,
    pub write_tile_rasters: bool,
    pub write_merged_raster: bool,
    /// Hand merged rasters to the COG converter
    pub convert_to_cog: bool,
    pub overview_levels: Vec<u32>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            max_pixels_per_request: 25_000_000,
            partial_coverage_threshold: 0.95,
            write_tile_rasters: false,
            write_merged_raster: true,
            convert_to_cog: false,
            overview_levels: vec![2, 4, 8, 16],
        }
    }
}

/// Platform cache directory, or a local folder when there is none
pub fn default_output_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("mosaicker"))
        .unwrap_or_else(|| PathBuf::from("./mosaicker-output"))
}

/// Complete mosaic batch configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    pub quality: QualityWeights,
    pub selection: SelectionConfig,
    pub gap_fill: GapFillConfig,
    pub merge: MergeConfig,
    pub indices: IndexConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub output: OutputConfig,
}

impl MosaicConfig {
    /// Broader scans and more gap-fill iterations for large batches
    pub fn high_throughput(mut self) -> Self {
        self.selection.scan_limit = self.selection.high_throughput_scan_limit;
        self.selection.excellent_target = self.selection.high_throughput_excellent_target;
        self.gap_fill.max_iterations = self.gap_fill.high_throughput_max_iterations;
        self
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> MosaicResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: MosaicConfig = serde_json::from_str(&content)?;
        config.validate()?;
        log::info!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn to_json_string(&self) -> MosaicResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values the engines cannot work with
    pub fn validate(&self) -> MosaicResult<()> {
        let fail = |msg: String| Err(MosaicError::Config(msg));

        if !self.quality.is_valid() {
            return fail(format!(
                "quality weights must be non-negative with a positive sum: {:?}",
                self.quality
            ));
        }

        let s = &self.selection;
        if s.scan_limit == 0 || s.high_throughput_scan_limit == 0 {
            return fail("scan limits must be at least 1".to_string());
        }
        if s.excellent_target == 0 || s.high_throughput_excellent_target == 0 {
            return fail("excellent targets must be at least 1".to_string());
        }
        if s.global_top_k == 0 {
            return fail("global_top_k must be at least 1".to_string());
        }
        for (name, ladder, loosening_up) in [
            ("cloud_pct_ladder", &s.cloud_pct_ladder, true),
            ("cloud_fraction_ladder", &s.cloud_fraction_ladder, true),
            ("quality_ladder", &s.quality_ladder, false),
        ] {
            if ladder.is_empty() {
                return fail(format!("{} must not be empty", name));
            }
            let ordered = ladder
                .windows(2)
                .all(|w| if loosening_up { w[0] <= w[1] } else { w[0] >= w[1] });
            if !ordered {
                return fail(format!("{} must loosen monotonically: {:?}", name, ladder));
            }
        }

        let g = &self.gap_fill;
        if !(g.target_coverage > 0.0 && g.target_coverage <= 1.0) {
            return fail(format!("target_coverage must be in (0, 1], got {}", g.target_coverage));
        }
        if g.max_iterations == 0 || g.stall_iterations == 0 {
            return fail("gap fill iteration limits must be at least 1".to_string());
        }
        if g.resolution_weight + g.temporal_weight + g.quality_weight <= 0.0 {
            return fail("gap fill score weights must have a positive sum".to_string());
        }
        if g.temporal_zero_days <= g.temporal_full_days {
            return fail("temporal_zero_days must exceed temporal_full_days".to_string());
        }

        if self.merge.feather_px < 0.0 || self.merge.hole_fill_radius_px < 0.0 {
            return fail("merge distances must be non-negative".to_string());
        }
        if !(self.indices.epsilon > 0.0) {
            return fail("index epsilon must be positive".to_string());
        }

        let w = &self.scheduler;
        if w.max_workers == 0 || w.min_workers > w.max_workers {
            return fail(format!("invalid worker bounds [{}, {}]", w.min_workers, w.max_workers));
        }
        if w.tile_timeout_ms == 0 {
            return fail("tile_timeout_ms must be positive".to_string());
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1".to_string());
        }

        let o = &self.output;
        if o.max_pixels_per_request == 0 {
            return fail("max_pixels_per_request must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&o.partial_coverage_threshold) {
            return fail("partial_coverage_threshold must be in [0, 1]".to_string());
        }
        if o.overview_levels.iter().any(|l| *l < 2) {
            return fail(format!("overview levels must be at least 2: {:?}", o.overview_levels));
        }
        Ok(())
    }
}
