use chrono::{Duration, TimeZone, Utc};
use mosaicker::core::gap_fill::StopReason;
use mosaicker::io::catalog::RawRaster;
use mosaicker::io::transport::RetryPolicy;
use mosaicker::types::FailureReason;
use mosaicker::{
    Band, BoundingBox, CandidateImage, CoordinateSystem, GeoTransform, MosaicConfig, MosaicError,
    Source, SourceFamily, StaticCatalog, TileGeometry, TilePipeline, TileRequest,
};
use ndarray::{Array3, ArrayView2};
use std::sync::Arc;

const S2_BANDS: [&str; 6] = ["B2", "B3", "B4", "B8", "B11", "B12"];
const L8_BANDS: [&str; 6] = ["SR_B2", "SR_B3", "SR_B4", "SR_B5", "SR_B6", "SR_B7"];

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
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

fn landsat8() -> Source {
    Source {
        id: "l8".into(),
        family: SourceFamily::Landsat,
        collection: "LANDSAT/LC08/C02/T1_L2".into(),
        native_resolution_m: 30.0,
        operational_start: Utc.with_ymd_and_hms(2013, 4, 11, 0, 0, 0).unwrap(),
        operational_end: None,
    }
}

fn request() -> TileRequest {
    TileRequest {
        tile_id: "berlin-01".into(),
        geometry: TileGeometry::Rectangle(BoundingBox::new(13.40, 52.50, 13.41, 52.51)),
        start: Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2023, 6, 30, 0, 0, 0).unwrap(),
        include_sources: vec![],
        target_resolution_m: 30.0,
        high_throughput: false,
    }
}

fn candidate(
    id: &str,
    source: &Source,
    day: i64,
    cloud_pct: f64,
    bands: &[&str],
) -> CandidateImage {
    CandidateImage {
        id: id.into(),
        source_id: source.id.clone(),
        acquired: Utc.with_ymd_and_hms(2023, 6, 1, 10, 0, 0).unwrap() + Duration::days(day),
        cloud_cover_pct: cloud_pct,
        cloud_fraction: None,
        valid_pixel_fraction: None,
        solar_zenith_deg: Some(35.0),
        view_zenith_deg: Some(4.0),
        native_resolution_m: source.native_resolution_m,
        band_names: bands.iter().map(|s| s.to_string()).collect(),
        footprint: Some(BoundingBox::new(13.0, 52.0, 14.0, 53.0)),
        asset_ref: format!("gs://bucket/{}.tif", id),
    }
}

/// Geographic raster around the tile; columns at or east of `valid_cols` hold zeros (no data)
fn raster(bands: &[&str], value: f32, valid_cols: usize) -> RawRaster {
    let mut data = Array3::from_elem((bands.len(), 60, 60), value);
    for mut plane in data.outer_iter_mut() {
        for mut row in plane.rows_mut() {
            for (col, v) in row.iter_mut().enumerate() {
                if col >= valid_cols {
                    *v = 0.0;
                }
            }
        }
    }
    let transform = GeoTransform {
        top_left_x: 13.39,
        pixel_width: 0.0005,
        rotation_x: 0.0,
        top_left_y: 52.52,
        rotation_y: 0.0,
        pixel_height: -0.0005,
    };
    let names = bands.iter().map(|s| s.to_string()).collect();
    RawRaster::new(data, names, transform, CoordinateSystem::Geographic)
        .expect("Failed to build raw raster")
}

fn fast_config() -> MosaicConfig {
    let mut config = MosaicConfig::default();
    config.retry = RetryPolicy::immediate(3);
    config
}

fn both_sources(config: MosaicConfig, catalog: StaticCatalog) -> TilePipeline {
    TilePipeline::new(config, Arc::new(catalog), vec![sentinel2(), landsat8()])
        .expect("Failed to create pipeline")
}

/// Valid red value in the middle row, a quarter and three quarters across
fn west_east(red: ArrayView2<f32>) -> (f32, f32) {
    let (rows, cols) = red.dim();
    (red[[rows / 2, cols / 4]], red[[rows / 2, 3 * cols / 4]])
}

/// Sentinel-2 covers the west half of the tile, Landsat the whole tile
fn split_catalog() -> StaticCatalog {
    let (s2, l8) = (sentinel2(), landsat8());
    let mut catalog = StaticCatalog::new();
    catalog
        .add_candidate(candidate("s2-west", &s2, 4, 5.0, &S2_BANDS))
        .add_raster("s2-west", raster(&S2_BANDS, 1200.0, 30));
    catalog
        .add_candidate(candidate("l8-full", &l8, 6, 8.0, &L8_BANDS))
        .add_raster("l8-full", raster(&L8_BANDS, 12000.0, 60));
    catalog
}

#[test]
fn test_sources_complement_each_other() {
    init_logging();
    let pipeline = both_sources(fast_config(), split_catalog());

    let outcome = pipeline.run_tile(&request()).expect("Tile pipeline failed");
    let ranked: Vec<&str> = outcome.ranked.iter().map(|c| c.id()).collect();
    println!("coverage {:.4}, ranked {:?}", outcome.coverage, ranked);

    assert!(outcome.coverage > 0.999);
    assert_eq!(outcome.ranked.len(), 2);
    assert_eq!(outcome.ranked[0].id(), "s2-west");
    assert_eq!(outcome.dominant_source.as_deref(), Some("s2"));

    let (west, east) = west_east(outcome.raster.band(Band::Red).unwrap());
    assert!((west - 0.12).abs() < 1e-4, "west red {}", west);
    assert!((east - 0.13).abs() < 1e-4, "east red {}", east);
}

#[test]
fn test_gap_fill_completes_a_single_seed() {
    init_logging();
    let mut config = fast_config();
    config.selection.global_top_k = 1;
    let pipeline = both_sources(config, split_catalog());

    let outcome = pipeline.run_tile(&request()).expect("Tile pipeline failed");
    let stats = &outcome.gap_fill;
    println!("gap fill: {:?}", stats);

    assert!(stats.initial_coverage > 0.4 && stats.initial_coverage < 0.6);
    assert_eq!(stats.images_added, 1);
    assert_eq!(stats.stop_reason, Some(StopReason::TargetReached));
    assert!(stats.final_coverage > 0.999);
    assert!(stats.coverage_trace.windows(2).all(|w| w[1] >= w[0]));

    let provenance = outcome.provenance(0.95);
    assert_eq!(provenance.candidates.len(), 2);
    assert_eq!(provenance.dominant_source.as_deref(), Some("s2"));
}

#[test]
fn test_unavailable_collection_is_skipped() {
    init_logging();
    let mut catalog = split_catalog();
    catalog.mark_unavailable("l8");
    let pipeline = both_sources(fast_config(), catalog);

    let outcome = pipeline.run_tile(&request()).expect("Tile pipeline failed");
    assert_eq!(outcome.ranked.len(), 1);
    assert!(outcome.coverage > 0.4 && outcome.coverage < 0.6);
    assert!(outcome.provenance(0.95).status == mosaicker::core::TileStatus::Partial);
}

#[test]
fn test_rate_limit_exhaustion_is_a_download_failure() {
    init_logging();
    let mut catalog = split_catalog();
    catalog.mark_rate_limited("s2");
    let pipeline = both_sources(fast_config(), catalog);

    let err = pipeline.run_tile(&request()).unwrap_err();
    assert!(matches!(err, MosaicError::DownloadFailure { attempts: 3, .. }), "{:?}", err);
    assert_eq!(err.failure_reason(), FailureReason::DownloadFailure);
}

#[test]
fn test_failed_fetch_discards_candidate() {
    init_logging();
    let mut catalog = split_catalog();
    catalog.fail_fetches_for("s2-west");
    let pipeline = both_sources(fast_config(), catalog);

    let outcome = pipeline.run_tile(&request()).expect("Tile pipeline failed");
    assert_eq!(outcome.dominant_source.as_deref(), Some("l8"));
    assert!(outcome.coverage > 0.999);
    let dropped = outcome
        .discarded
        .iter()
        .find(|d| d.id == "s2-west")
        .expect("s2-west not discarded");
    assert!(dropped.reason.contains("attempt"), "{}", dropped.reason);
}

#[test]
fn test_include_sources_restricts_the_scan() {
    init_logging();
    let mut req = request();
    req.include_sources = vec!["l8".into()];
    let pipeline = both_sources(fast_config(), split_catalog());

    let outcome = pipeline.run_tile(&req).expect("Tile pipeline failed");
    assert!(outcome.ranked.iter().all(|c| c.source_id() == "l8"));
    assert_eq!(outcome.selections.len(), 1);
}

#[test]
fn test_source_outside_operational_range_is_not_queried() {
    init_logging();
    let mut retired = landsat8();
    retired.operational_end = Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
    let catalog = Arc::new(split_catalog());
    let pipeline = TilePipeline::new(fast_config(), catalog.clone(), vec![sentinel2(), retired])
        .expect("Failed to create pipeline");

    let outcome = pipeline.run_tile(&request()).expect("Tile pipeline failed");
    assert!(outcome.ranked.iter().all(|c| c.source_id() == "s2"));
    assert_eq!(catalog.counters.list_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}
