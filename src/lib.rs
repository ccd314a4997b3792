//! mosaicker: quality-ranked multi-source optical mosaics
//!
//! Candidate scenes from several sensors are scored with a weighted quality
//! model, selected per source under progressively relaxed thresholds, seeded
//! into a per-pixel priority composite and gap-filled until coverage targets
//! are met. Finished tiles are feather-merged and enriched with spectral
//! indices.

pub mod types;
pub mod config;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    Band, BoundingBox, CandidateImage, CoordinateSystem, FailureReason, GeoTransform, MosaicError,
    MosaicResult, Raster, ScoredCandidate, Source, SourceFamily, TileGeometry, TileRequest, NODATA,
};
pub use config::{MosaicConfig, OutputConfig};
pub use crate::core::{BatchReport, BatchRunner, TileOutcome, TilePipeline};
pub use io::{CatalogAdapter, StaticCatalog};
