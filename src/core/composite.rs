//! Priority mosaic composition for one tile.
//!
//! Layers are added in rank order; a layer only fills pixels that are still
//! invalid, so rank 1 wins wherever it has data and later ranks act as
//! fallbacks. Pixels are taken whole: the first layer with valid RGB at a
//! pixel supplies every band of that pixel.

use crate::core::projection::GridSpec;
use crate::core::provenance::DiscardedCandidate;
use crate::core::resample::{reproject, ResamplingMethod};
use crate::io::catalog::CatalogAdapter;
use crate::io::sources::{BandNameCache, SourceAdapter};
use crate::io::transport::PixelFetcher;
use crate::types::{
    is_valid_value, Band, MosaicError, MosaicResult, Raster, ScoredCandidate, TileRequest,
};
use ndarray::Array2;
use std::collections::HashMap;
use std::sync::Arc;

/// Upper bound on coverage samples per band
const COVERAGE_SAMPLES: usize = 65_536;

/// Supplies a candidate's pixels on the tile grid in the standard band profile
pub trait LayerProvider {
    fn layer(&self, candidate: &ScoredCandidate, grid: &GridSpec) -> MosaicResult<Raster>;
}

/// Layer provider backed by the catalog, source adapters and transport
pub struct CatalogLayerProvider<'a> {
    catalog: &'a dyn CatalogAdapter,
    adapters: &'a HashMap<String, Arc<dyn SourceAdapter>>,
    cache: &'a BandNameCache,
    fetcher: &'a PixelFetcher,
    resampling: ResamplingMethod,
}

impl<'a> CatalogLayerProvider<'a> {
    pub fn new(
        catalog: &'a dyn CatalogAdapter,
        adapters: &'a HashMap<String, Arc<dyn SourceAdapter>>,
        cache: &'a BandNameCache,
        fetcher: &'a PixelFetcher,
        resampling: ResamplingMethod,
    ) -> Self {
        Self { catalog, adapters, cache, fetcher, resampling }
    }
}

impl LayerProvider for CatalogLayerProvider<'_> {
    fn layer(&self, candidate: &ScoredCandidate, grid: &GridSpec) -> MosaicResult<Raster> {
        let adapter = self.adapters.get(candidate.source_id()).ok_or_else(|| {
            MosaicError::Processing(format!("no adapter for source {}", candidate.source_id()))
        })?;
        let mapping = adapter.prepare_bands(&candidate.candidate, self.cache);
        if !mapping.has_primary() {
            return Err(MosaicError::BandSelection(format!(
                "{} lacks mandatory RGB bands",
                candidate.id()
            )));
        }
        let raw = self
            .fetcher
            .fetch(self.catalog, &candidate.candidate, &mapping.raw_names(), grid)?;
        let harmonized = adapter.harmonize(&raw, &mapping)?;
        Ok(reproject(&harmonized, grid, self.resampling))
    }
}

/// Per-pixel-best raster built from ranked layers
#[derive(Debug, Clone)]
pub struct Composite {
    grid: GridSpec,
    clip: Array2<bool>,
    raster: Raster,
    /// Layers in priority order with the number of pixels each supplied
    layers: Vec<(ScoredCandidate, usize)>,
}

impl Composite {
    /// Empty composite on the grid, clipped by the mask
    pub fn new(grid: GridSpec, clip: Array2<bool>) -> Self {
        let raster = Raster::empty(
            Band::STANDARD.to_vec(),
            grid.rows,
            grid.cols,
            grid.transform,
            grid.crs,
        );
        Self { grid, clip, raster, layers: Vec::new() }
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn raster(&self) -> &Raster {
        &self.raster
    }

    pub fn into_raster(self) -> Raster {
        self.raster
    }

    /// Candidates in priority order (rank 1 first)
    pub fn candidates(&self) -> Vec<ScoredCandidate> {
        self.layers.iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn contains(&self, candidate_id: &str) -> bool {
        self.layers.iter().any(|(c, _)| c.id() == candidate_id)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Add a layer at the lowest priority; returns the pixels it filled
    pub fn add_layer(&mut self, candidate: ScoredCandidate, layer: &Raster) -> MosaicResult<usize> {
        if self.contains(candidate.id()) {
            return Ok(0);
        }
        if layer.rows() != self.grid.rows || layer.cols() != self.grid.cols {
            return Err(MosaicError::ValidationFailure(format!(
                "layer {} is {}x{}, tile grid is {}x{}",
                candidate.id(),
                layer.cols(),
                layer.rows(),
                self.grid.cols,
                self.grid.rows
            )));
        }

        if !layer.has_bands(&Band::PRIMARY) {
            return Err(MosaicError::BandSelection(format!(
                "layer {} lacks RGB bands",
                candidate.id()
            )));
        }
        let copy_bands: Vec<(usize, usize)> = self
            .raster
            .bands
            .iter()
            .enumerate()
            .filter_map(|(i, b)| layer.band_index(*b).map(|j| (i, j)))
            .collect();

        let mut filled = 0usize;
        for row in 0..self.grid.rows {
            for col in 0..self.grid.cols {
                if !self.clip[[row, col]] {
                    continue;
                }
                if self.raster.primary_valid_at(row, col) || !layer.primary_valid_at(row, col) {
                    continue;
                }
                for (i, j) in &copy_bands {
                    let v = layer.data[[*j, row, col]];
                    self.raster.data[[*i, row, col]] =
                        if is_valid_value(v) { v } else { self.raster.nodata };
                }
                filled += 1;
            }
        }

        log::debug!(
            "Layer {} (score {:.3}) filled {} pixel(s)",
            candidate.id(),
            candidate.score,
            filled
        );
        self.layers.push((candidate, filled));
        Ok(filled)
    }

    /// Mean valid fraction of the RGB bands inside the tile, sampled on a coarse stride
    pub fn coverage(&self) -> f64 {
        let stride = coverage_stride(self.grid.pixel_count());
        let mut inside = 0usize;
        let mut valid = [0usize; 3];
        for row in (0..self.grid.rows).step_by(stride) {
            for col in (0..self.grid.cols).step_by(stride) {
                if !self.clip[[row, col]] {
                    continue;
                }
                inside += 1;
                for (k, band) in Band::PRIMARY.iter().enumerate() {
                    if let Some(i) = self.raster.band_index(*band) {
                        if is_valid_value(self.raster.data[[i, row, col]]) {
                            valid[k] += 1;
                        }
                    }
                }
            }
        }
        if inside == 0 {
            return 0.0;
        }
        valid.iter().map(|v| *v as f64 / inside as f64).sum::<f64>() / valid.len() as f64
    }

    /// Source of the highest-scoring candidate that actually supplied pixels
    pub fn dominant_source(&self) -> Option<String> {
        self.layers
            .iter()
            .filter(|(_, filled)| *filled > 0)
            .min_by(|(a, _), (b, _)| a.rank_cmp(b))
            .map(|(c, _)| c.source_id().to_string())
    }
}

fn coverage_stride(pixels: usize) -> usize {
    ((pixels as f64 / COVERAGE_SAMPLES as f64).sqrt().floor() as usize).max(1)
}

/// Builds the priority mosaic for one tile
pub struct CompositeBuilder {
    grid: GridSpec,
    clip: Array2<bool>,
}

impl CompositeBuilder {
    /// Tile grid in the UTM zone nearest the centroid; oversized requests fail before any fetch
    pub fn for_tile(request: &TileRequest, max_pixels: usize) -> MosaicResult<Self> {
        let grid = GridSpec::for_tile(&request.geometry, request.target_resolution_m)?;
        if grid.pixel_count() > max_pixels {
            return Err(MosaicError::TileTooLarge { pixels: grid.pixel_count(), limit: max_pixels });
        }
        let clip = grid.clip_mask(&request.geometry);
        Ok(Self { grid, clip })
    }

    /// Builder over an explicit grid and clip mask
    pub fn with_grid(grid: GridSpec, clip: Array2<bool>) -> Self {
        Self { grid, clip }
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn empty_composite(&self) -> Composite {
        Composite::new(self.grid.clone(), self.clip.clone())
    }

    /// Compose ranked candidates. Candidates whose pixels cannot be fetched
    /// are discarded with a reason; if none could be fetched the last error
    /// is returned.
    pub fn build(
        &self,
        candidates: &[ScoredCandidate],
        provider: &dyn LayerProvider,
    ) -> MosaicResult<(Composite, Vec<DiscardedCandidate>)> {
        let mut ranked = candidates.to_vec();
        ranked.sort_by(|a, b| a.rank_cmp(b));

        let mut composite = self.empty_composite();
        let mut discarded = Vec::new();
        let mut last_error = None;

        for candidate in ranked {
            match provider.layer(&candidate, &self.grid) {
                Ok(layer) => {
                    composite.add_layer(candidate, &layer)?;
                }
                Err(e) => {
                    log::warn!("Dropping {} from composite: {}", candidate.id(), e);
                    discarded.push(DiscardedCandidate {
                        id: candidate.id().to_string(),
                        source_id: candidate.source_id().to_string(),
                        reason: e.to_string(),
                    });
                    last_error = Some(e);
                }
            }
        }

        if composite.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        log::info!(
            "Composite built from {} layer(s), coverage {:.1}%",
            composite.len(),
            composite.coverage() * 100.0
        );
        Ok((composite, discarded))
    }
}
