/*!
 * Per-tile pipeline and batch orchestration
 *
 * A tile runs pre-scan, per-source selection, global seeding, composite
 * construction and gap filling strictly in that order. The batch runner
 * schedules tiles on the worker pool, turns every outcome (or error) into a
 * provenance record, merges the successful tiles, derives indices and writes
 * the outputs.
 */

use crate::config::MosaicConfig;
use crate::core::composite::{CatalogLayerProvider, CompositeBuilder};
use crate::core::gap_fill::{GapFillEngine, GapFillStats};
use crate::core::global_best::GlobalBestSelector;
use crate::core::indices::IndexCalculator;
use crate::core::provenance::{
    BatchStatus, BatchSummary, DiscardedCandidate, ManifestRow, TileProvenance,
};
use crate::core::quality::QualityModel;
use crate::core::scheduler::WorkerScheduler;
use crate::core::selector::{relaxation_minimum, CandidateSelector, SelectionOutcome};
use crate::core::tile_merge::LocalTileMerger;
use crate::io::catalog::CatalogAdapter;
use crate::io::output::{
    default_raster_writer, sanitize_file_name, CogWriter, CommandCogWriter, ProvenanceWriter,
    RasterWriter,
};
use crate::io::sources::{adapter_for, BandNameCache, SourceAdapter};
use crate::io::transport::PixelFetcher;
use crate::types::{
    Band, CandidateImage, CatalogError, MosaicError, MosaicResult, Raster, ScoredCandidate, Source,
    TileRequest,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// A source adapter with the candidates it listed for a tile
type ListedSource = (Arc<dyn SourceAdapter>, Vec<CandidateImage>);

/// Everything a finished tile pipeline produced
#[derive(Debug, Clone)]
pub struct TileOutcome {
    pub tile_id: String,
    pub raster: Raster,
    /// Candidates in the composite, best first
    pub ranked: Vec<ScoredCandidate>,
    pub coverage: f64,
    pub dominant_source: Option<String>,
    pub gap_fill: GapFillStats,
    pub discarded: Vec<DiscardedCandidate>,
    pub selections: Vec<SelectionOutcome>,
    pub processing_seconds: f64,
}

impl TileOutcome {
    pub fn provenance(&self, partial_threshold: f64) -> TileProvenance {
        let mut record = TileProvenance::completed(
            &self.tile_id,
            &self.ranked,
            self.dominant_source.clone(),
            self.coverage,
            self.gap_fill.clone(),
            self.discarded.clone(),
            partial_threshold,
        );
        record.processing_seconds = self.processing_seconds;
        record
    }
}

/// Runs one tile from catalog query to gap-filled composite
#[derive(Clone)]
pub struct TilePipeline {
    config: Arc<MosaicConfig>,
    catalog: Arc<dyn CatalogAdapter>,
    adapters: Arc<Vec<Arc<dyn SourceAdapter>>>,
    by_id: Arc<HashMap<String, Arc<dyn SourceAdapter>>>,
    cache: Arc<BandNameCache>,
    fetcher: PixelFetcher,
    model: QualityModel,
}

impl TilePipeline {
    pub fn new(
        config: MosaicConfig,
        catalog: Arc<dyn CatalogAdapter>,
        sources: Vec<Source>,
    ) -> MosaicResult<Self> {
        config.validate()?;
        let mut adapters = Vec::with_capacity(sources.len());
        let mut by_id = HashMap::new();
        for source in sources {
            if by_id.contains_key(&source.id) {
                return Err(MosaicError::Config(format!("duplicate source id {}", source.id)));
            }
            let adapter = adapter_for(source)?;
            by_id.insert(adapter.source().id.clone(), Arc::clone(&adapter));
            adapters.push(adapter);
        }
        let fetcher = PixelFetcher::new(config.retry.clone()).with_default_decoder();
        let model = QualityModel::new(config.quality.clone());
        Ok(Self {
            config: Arc::new(config),
            catalog,
            adapters: Arc::new(adapters),
            by_id: Arc::new(by_id),
            cache: Arc::new(BandNameCache::new()),
            fetcher,
            model,
        })
    }

    /// Replace the pixel fetcher, e.g. to add an HTTP transport
    pub fn with_fetcher(mut self, fetcher: PixelFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn config(&self) -> &MosaicConfig {
        &self.config
    }

    /// List candidates for every included source overlapping the window
    fn prescan(&self, request: &TileRequest) -> MosaicResult<Vec<ListedSource>> {
        let mut listed = Vec::new();
        for adapter in self.adapters.iter() {
            let source = adapter.source();
            if !request.includes_source(&source.id) {
                continue;
            }
            if !source.overlaps(request.start, request.end) {
                log::debug!("{}: outside operational range, skipped", source.id);
                continue;
            }
            let label = format!("list {} for {}", source.id, request.tile_id);
            let catalog = self.catalog.as_ref();
            let result = self.config.retry.run(&label, |_| {
                adapter
                    .list_candidates(catalog, &request.geometry, request.start, request.end)
                    .map_err(MosaicError::from)
            });
            match result {
                Ok(candidates) => {
                    log::debug!(
                        "{}: {} candidate(s) for tile {}",
                        source.id,
                        candidates.len(),
                        request.tile_id
                    );
                    listed.push((Arc::clone(adapter), candidates));
                }
                Err(MosaicError::Catalog(CatalogError::CollectionUnavailable(message))) => {
                    log::warn!("{}: collection unavailable ({}), skipping", source.id, message);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(listed)
    }

    pub fn run_tile(&self, request: &TileRequest) -> MosaicResult<TileOutcome> {
        let started = Instant::now();
        if request.end < request.start {
            return Err(MosaicError::ValidationFailure(format!(
                "tile {}: window ends before it starts",
                request.tile_id
            )));
        }
        if !(request.target_resolution_m > 0.0) {
            return Err(MosaicError::ValidationFailure(format!(
                "tile {}: target resolution must be positive",
                request.tile_id
            )));
        }
        log::info!(
            "🧩 Tile {}: {} to {}",
            request.tile_id,
            request.start.date_naive(),
            request.end.date_naive()
        );

        let max_pixels = self.config.output.max_pixels_per_request;
        let builder = CompositeBuilder::for_tile(request, max_pixels)?;

        let listed = self.prescan(request)?;
        let total: usize = listed.iter().map(|(_, c)| c.len()).sum();
        if total == 0 {
            return Err(MosaicError::NoImagery(format!(
                "no candidates for tile {} in the requested window",
                request.tile_id
            )));
        }
        let min_tests = relaxation_minimum(total);
        log::debug!(
            "Tile {}: {} candidate(s), relaxation minimum {}",
            request.tile_id,
            total,
            min_tests
        );

        let selector = CandidateSelector::new(
            &self.config.selection,
            &self.model,
            self.catalog.as_ref(),
            &self.cache,
            &self.config.retry,
        );
        let selections: Vec<SelectionOutcome> = listed
            .into_iter()
            .map(|(adapter, candidates)| {
                selector.select(adapter.as_ref(), candidates, request, min_tests)
            })
            .collect();

        let mut per_source: Vec<Vec<ScoredCandidate>> =
            selections.iter().map(|s| s.contributions()).collect();
        if per_source.iter().all(|c| c.is_empty()) {
            // nothing accepted and no fallback: seed from whatever was scored
            per_source = selections.iter().map(|s| s.pool.clone()).collect();
        }
        if per_source.iter().all(|c| c.is_empty()) {
            let evaluated: Vec<&SelectionOutcome> =
                selections.iter().filter(|s| s.evaluated > 0).collect();
            if !evaluated.is_empty() && evaluated.iter().all(|s| s.only_missing_bands()) {
                return Err(MosaicError::BandSelection(format!(
                    "tile {}: no candidate carries the mandatory RGB bands",
                    request.tile_id
                )));
            }
            return Err(MosaicError::NoImagery(format!(
                "tile {}: no candidate survived selection",
                request.tile_id
            )));
        }

        let global = GlobalBestSelector::new(self.config.selection.global_top_k);
        let (seeds, rest) = global.split(&per_source);

        let provider = CatalogLayerProvider::new(
            self.catalog.as_ref(),
            &self.by_id,
            &self.cache,
            &self.fetcher,
            self.config.merge.resampling,
        );
        let (composite, mut discarded) = builder.build(&seeds, &provider)?;

        let mut seen: HashSet<String> =
            composite.candidates().iter().map(|c| c.id().to_string()).collect();
        seen.extend(discarded.iter().map(|d| d.id.clone()));
        let mut pool: Vec<ScoredCandidate> = Vec::new();
        let scored_pools = selections.iter().flat_map(|s| s.pool.iter().cloned());
        for candidate in rest.into_iter().chain(scored_pools) {
            if seen.insert(candidate.id().to_string()) {
                pool.push(candidate);
            }
        }
        pool.sort_by(|a, b| a.rank_cmp(b));

        let engine = GapFillEngine::new(self.config.gap_fill.clone(), request.target_resolution_m);
        let (composite, gap_fill) =
            engine.improve(composite, &pool, &request.geometry, &provider, request.high_throughput);

        let coverage = composite.coverage();
        if coverage <= 0.0 {
            return Err(MosaicError::NoImagery(format!(
                "tile {}: selected imagery has no valid pixels inside the tile",
                request.tile_id
            )));
        }

        for selection in &selections {
            discarded.extend(selection.discarded.iter().cloned());
        }
        let mut ranked = composite.candidates();
        ranked.sort_by(|a, b| a.rank_cmp(b));
        let dominant_source = composite.dominant_source();

        let processing_seconds = started.elapsed().as_secs_f64();
        log::info!(
            "✅ Tile {}: {} image(s), coverage {:.1}%, dominant source {} ({:.1}s)",
            request.tile_id,
            ranked.len(),
            coverage * 100.0,
            dominant_source.as_deref().unwrap_or("none"),
            processing_seconds
        );

        Ok(TileOutcome {
            tile_id: request.tile_id.clone(),
            raster: composite.into_raster(),
            ranked,
            coverage,
            dominant_source,
            gap_fill,
            discarded,
            selections,
            processing_seconds,
        })
    }
}

/// What a batch produced
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub summary: BatchSummary,
    pub tiles: Vec<TileProvenance>,
    /// Merged raster with index bands appended
    pub merged: Option<Raster>,
    pub output_paths: Vec<PathBuf>,
    pub provenance_paths: Vec<PathBuf>,
    pub summary_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// Schedules tile pipelines and assembles the batch outputs
pub struct BatchRunner {
    pipeline: TilePipeline,
    scheduler: WorkerScheduler,
    merger: LocalTileMerger,
    indices: IndexCalculator,
    raster_writer: Option<Box<dyn RasterWriter>>,
    cog_writer: Option<Box<dyn CogWriter>>,
    batch_id: String,
}

impl BatchRunner {
    pub fn new(pipeline: TilePipeline) -> Self {
        let config = pipeline.config().clone();
        Self {
            scheduler: WorkerScheduler::with_proc_sampler(config.scheduler.clone()),
            merger: LocalTileMerger::new(config.merge.clone()),
            indices: IndexCalculator::new(config.indices.clone()),
            raster_writer: default_raster_writer(),
            cog_writer: Some(Box::new(CommandCogWriter::default())),
            batch_id: format!("batch_{}", Utc::now().format("%Y%m%dT%H%M%S")),
            pipeline,
        }
    }

    pub fn with_scheduler(mut self, scheduler: WorkerScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_raster_writer(mut self, writer: Option<Box<dyn RasterWriter>>) -> Self {
        self.raster_writer = writer;
        self
    }

    pub fn with_cog_writer(mut self, writer: Option<Box<dyn CogWriter>>) -> Self {
        self.cog_writer = writer;
        self
    }

    pub fn with_batch_id(mut self, batch_id: &str) -> Self {
        self.batch_id = batch_id.to_string();
        self
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    fn write_raster(&self, raster: &Raster, dir: &Path, name: &str) -> Option<PathBuf> {
        let writer = self.raster_writer.as_ref()?;
        let path = dir.join(format!("{}{}", sanitize_file_name(name), writer.extension()));
        let written = std::fs::create_dir_all(dir)
            .map_err(MosaicError::from)
            .and_then(|_| writer.write(raster, &path));
        match written {
            Ok(()) => Some(path),
            Err(e) => {
                log::error!("Could not write {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Run every tile, merge the successful ones and write the batch outputs.
    /// Per-tile failures are recorded, never propagated; only output I/O
    /// errors abort the batch.
    pub fn run(&self, requests: Vec<TileRequest>) -> MosaicResult<BatchReport> {
        let started_at = Utc::now();
        let config = self.pipeline.config().clone();
        let root = config.output.output_dir.join(sanitize_file_name(&self.batch_id));
        let writer = ProvenanceWriter::new(&root)?;

        log::info!(
            "📦 Batch {}: {} tile(s), outputs in {}",
            self.batch_id,
            requests.len(),
            root.display()
        );

        let tile_ids: Vec<String> = requests.iter().map(|r| r.tile_id.clone()).collect();
        let pipeline = self.pipeline.clone();
        let results = self
            .scheduler
            .run(requests, move |request: TileRequest| pipeline.run_tile(&request));

        let mut tiles = Vec::with_capacity(results.len());
        let mut rasters = Vec::new();
        let mut output_paths = Vec::new();
        let tile_dir = root.join("tiles");

        for (tile_id, result) in tile_ids.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    let mut record = outcome.provenance(config.output.partial_coverage_threshold);
                    if config.output.write_tile_rasters {
                        if let Some(path) = self.write_raster(&outcome.raster, &tile_dir, tile_id) {
                            record.raster_path = Some(path.display().to_string());
                            output_paths.push(path);
                        }
                    }
                    rasters.push(outcome.raster);
                    tiles.push(record);
                }
                Err(e) => {
                    log::error!("❌ Tile {} failed: {}", tile_id, e);
                    tiles.push(TileProvenance::failed(tile_id, &e));
                }
            }
        }

        let merged = if rasters.is_empty() {
            None
        } else {
            match self.merger.merge(&rasters).and_then(|m| self.indices.apply(&m)) {
                Ok(merged) => Some(merged),
                Err(e) => {
                    log::error!("Merging {} tile(s) failed: {}", rasters.len(), e);
                    None
                }
            }
        };

        if let Some(merged) = &merged {
            if config.output.write_merged_raster {
                let name = format!("{}_mosaic", self.batch_id);
                if let Some(path) = self.write_raster(merged, &root, &name) {
                    if config.output.convert_to_cog {
                        if let Some(cog) = &self.cog_writer {
                            match cog.convert(&path, &config.output.overview_levels) {
                                Ok(cog_path) => output_paths.push(cog_path),
                                Err(e) => log::error!("COG conversion failed: {}", e),
                            }
                        }
                    }
                    output_paths.push(path);
                }
            }
        }

        let mut provenance_paths = Vec::with_capacity(tiles.len());
        for record in &tiles {
            provenance_paths.push(writer.write_tile(record)?);
        }

        let mut summary = BatchSummary::from_tiles(&self.batch_id, &tiles, started_at);
        summary.merged_coverage = merged.as_ref().map(|m| m.valid_fraction(Band::Red));
        let summary_path = writer.write_summary(&summary)?;
        let manifest_path = writer.append_manifest(&ManifestRow {
            batch_id: self.batch_id.clone(),
            status: summary.status,
            output_paths: output_paths.iter().map(|p| p.display().to_string()).collect(),
            provenance_paths: provenance_paths.iter().map(|p| p.display().to_string()).collect(),
            summary_path: summary_path.display().to_string(),
            timestamp: Utc::now(),
        })?;

        match summary.status {
            BatchStatus::Completed => log::info!("✅ {}", summary.report()),
            BatchStatus::Failed => log::error!("{}", summary.report()),
        }

        Ok(BatchReport {
            summary,
            tiles,
            merged,
            output_paths,
            provenance_paths,
            summary_path,
            manifest_path,
        })
    }
}
