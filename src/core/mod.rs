//! Core mosaicking modules

pub mod projection;
pub mod resample;
pub mod quality;
pub mod ranking;
pub mod selector;
pub mod global_best;
pub mod composite;
pub mod gap_fill;
pub mod tile_merge;
pub mod indices;
pub mod scheduler;
pub mod provenance;
pub mod pipeline;

// Re-export main types
pub use projection::{GridSpec, transform_point, utm_zone_for};
pub use resample::{ResamplingMethod, reproject};
pub use quality::{QualityModel, QualityWeights, QualityInputs, ScoreBreakdown};
pub use ranking::{Ranked, RankedAccumulator};
pub use selector::{CandidateSelector, SelectionConfig, SelectionOutcome, Rejection};
pub use global_best::GlobalBestSelector;
pub use composite::{Composite, CompositeBuilder, LayerProvider, CatalogLayerProvider};
pub use gap_fill::{GapFillEngine, GapFillConfig, GapFillStats, StopReason};
pub use tile_merge::{LocalTileMerger, MergeConfig};
pub use indices::{IndexCalculator, IndexConfig};
pub use scheduler::{
    ProcResourceSampler, ResourceSampler, ScalingPolicy, SchedulerConfig, WorkerScheduler,
};
pub use provenance::{TileProvenance, TileStatus, BatchSummary, BatchStatus, ManifestRow};
pub use pipeline::{TilePipeline, TileOutcome, BatchRunner, BatchReport};
