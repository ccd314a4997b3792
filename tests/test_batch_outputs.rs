use chrono::{Duration, TimeZone, Utc};
use mosaicker::core::provenance::{BatchStatus, ManifestRow, TileProvenance, TileStatus};
use mosaicker::core::scheduler::{ResourceUsage, SchedulerConfig, StaticSampler, WorkerScheduler};
use mosaicker::io::catalog::RawRaster;
use mosaicker::io::output::RasterWriter;
use mosaicker::io::transport::RetryPolicy;
use mosaicker::types::FailureReason;
use mosaicker::{
    Band, BatchRunner, BoundingBox, CandidateImage, CoordinateSystem, GeoTransform, MosaicConfig,
    MosaicResult, Raster, Source, SourceFamily, StaticCatalog, TileGeometry, TilePipeline,
    TileRequest,
};
use ndarray::Array3;
use std::path::Path;
use std::sync::Arc;

const S2_BANDS: [&str; 6] = ["B2", "B3", "B4", "B8", "B11", "B12"];

/// Writes a small JSON description instead of a GeoTIFF
struct JsonShapeWriter;

impl RasterWriter for JsonShapeWriter {
    fn extension(&self) -> &str {
        ".json"
    }

    fn write(&self, raster: &Raster, path: &Path) -> MosaicResult<()> {
        let bands: Vec<&str> = raster.bands.iter().map(|b| b.name()).collect();
        let shape = serde_json::json!({
            "rows": raster.rows(),
            "cols": raster.cols(),
            "bands": bands,
        });
        std::fs::write(path, shape.to_string())?;
        Ok(())
    }
}

fn sentinel2() -> Source {
    Source {
        id: "s2".into(),
        family: SourceFamily::Sentinel2,
        collection: "COPERNICUS/S2_SR_HARMONIZED".into(),
        native_resolution_m: 10.0,
        operational_start: Utc.with_ymd_and_hms(2015, 6, 23, 0, 0, 0).unwrap(),
        operational_end: None,
    }
}

fn tile(tile_id: &str, west: f64, year: i32) -> TileRequest {
    TileRequest {
        tile_id: tile_id.into(),
        geometry: TileGeometry::Rectangle(BoundingBox::new(west, 52.50, west + 0.01, 52.51)),
        start: Utc.with_ymd_and_hms(year, 6, 1, 0, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(year, 6, 30, 0, 0, 0).unwrap(),
        include_sources: vec![],
        target_resolution_m: 30.0,
        high_throughput: false,
    }
}

fn catalog() -> StaticCatalog {
    let names: Vec<String> = S2_BANDS.iter().map(|s| s.to_string()).collect();
    // blue, green, red, nir, swir1, swir2 in digital numbers
    let values = [800.0f32, 1000.0, 1200.0, 3000.0, 2000.0, 1500.0];
    let mut data = Array3::zeros((6, 80, 100));
    for (b, v) in values.iter().enumerate() {
        data.index_axis_mut(ndarray::Axis(0), b).fill(*v);
    }
    let transform = GeoTransform {
        top_left_x: 13.38,
        pixel_width: 0.0005,
        rotation_x: 0.0,
        top_left_y: 52.53,
        rotation_y: 0.0,
        pixel_height: -0.0005,
    };
    let raw = RawRaster::new(data, names.clone(), transform, CoordinateSystem::Geographic)
        .expect("Failed to build raw raster");

    let mut catalog = StaticCatalog::new();
    catalog
        .add_candidate(CandidateImage {
            id: "S2B_20230612".into(),
            source_id: "s2".into(),
            acquired: Utc.with_ymd_and_hms(2023, 6, 1, 10, 0, 0).unwrap() + Duration::days(11),
            cloud_cover_pct: 3.0,
            cloud_fraction: None,
            valid_pixel_fraction: Some(1.0),
            solar_zenith_deg: Some(32.0),
            view_zenith_deg: Some(3.0),
            native_resolution_m: 10.0,
            band_names: names,
            footprint: Some(BoundingBox::new(13.0, 52.0, 14.0, 53.0)),
            asset_ref: String::new(),
        })
        .add_raster("S2B_20230612", raw);
    catalog
}

fn runner(output_dir: &Path) -> BatchRunner {
    let mut config = MosaicConfig::default();
    config.retry = RetryPolicy::immediate(2);
    config.output.output_dir = output_dir.to_path_buf();
    config.output.write_tile_rasters = true;
    config.merge.feather_px = 5.0;

    let pipeline = TilePipeline::new(config.clone(), Arc::new(catalog()), vec![sentinel2()])
        .expect("Failed to create pipeline");
    let scheduler = WorkerScheduler::new(
        SchedulerConfig {
            min_workers: 1,
            max_workers: 2,
            initial_workers: 2,
            ..config.scheduler.clone()
        },
        Arc::new(StaticSampler(ResourceUsage { cpu: 0.3, memory: 0.4 })),
    );
    BatchRunner::new(pipeline)
        .with_scheduler(scheduler)
        .with_raster_writer(Some(Box::new(JsonShapeWriter)))
        .with_cog_writer(None)
        .with_batch_id("berlin-june")
}

#[test]
fn test_batch_merges_tiles_and_records_failures() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");

    let requests = vec![
        tile("west", 13.40, 2023),
        tile("east", 13.41, 2023),
        tile("no-data-year", 13.40, 2019),
    ];
    let report = runner(dir.path()).run(requests).expect("Batch failed");
    println!("{}", report.summary.report());

    // summary and histogram
    assert_eq!(report.summary.status, BatchStatus::Completed);
    assert_eq!(report.summary.tiles_total, 3);
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.failure_histogram.get(&FailureReason::NoImagery), Some(&1));

    // tile records come back in request order
    let ids: Vec<&str> = report.tiles.iter().map(|t| t.tile_id.as_str()).collect();
    assert_eq!(ids, vec!["west", "east", "no-data-year"]);
    assert_eq!(report.tiles[2].status, TileStatus::Failed);
    assert!(report.tiles[0].raster_path.is_some());

    // merged raster spans both tiles and carries indices
    let merged = report.merged.as_ref().expect("No merged raster");
    assert!(merged.bands.contains(&Band::Ndvi));
    assert!(merged.bands.contains(&Band::Mndwi));
    let coverage = report.summary.merged_coverage.expect("No merged coverage");
    assert!(coverage > 0.8, "merged coverage {}", coverage);
    let ndvi = merged.band(Band::Ndvi).unwrap();
    let expected = (0.30 - 0.12) / (0.30 + 0.12);
    let (rows, cols) = ndvi.dim();
    assert!((ndvi[[rows / 2, cols / 2]] - expected as f32).abs() < 1e-4);
    assert!(merged.data.iter().all(|v| v.is_finite()));

    // files on disk
    for path in &report.provenance_paths {
        let text = std::fs::read_to_string(path).expect("Failed to read provenance");
        let record: TileProvenance = serde_json::from_str(&text).expect("Bad provenance JSON");
        assert!(report.tiles.iter().any(|t| t.tile_id == record.tile_id));
    }
    assert_eq!(report.provenance_paths.len(), 3);
    assert!(report.summary_path.exists());
    assert_eq!(report.output_paths.len(), 3);
    assert!(report.output_paths.iter().all(|p| p.exists()));

    let manifest = std::fs::read_to_string(&report.manifest_path).unwrap();
    let rows: Vec<ManifestRow> =
        manifest.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].batch_id, "berlin-june");
    assert_eq!(rows[0].provenance_paths.len(), 3);
}

#[test]
fn test_batch_without_any_output_is_failed() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");

    let report = runner(dir.path())
        .run(vec![tile("a", 13.40, 2018), tile("b", 13.41, 2019)])
        .expect("Batch failed");

    assert_eq!(report.summary.status, BatchStatus::Failed);
    assert_eq!(report.summary.failed, 2);
    assert!(report.merged.is_none());
    assert!(report.summary.merged_coverage.is_none());
    assert!(report.output_paths.is_empty());
    assert!(report.tiles.iter().all(|t| t.failure_reason == Some(FailureReason::NoImagery)));
}
