//! Catalog seam: candidate listing, batched metadata and pixel fetches.

use crate::core::projection::GridSpec;
use crate::types::{
    CandidateImage, CatalogError, CoordinateSystem, GeoTransform, MetadataKey, MosaicError,
    MosaicResult, Source, TileGeometry,
};
use chrono::{DateTime, Utc};
use ndarray::{Array3, Axis};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pixels as delivered by a source, labelled with the source's own band names
#[derive(Debug, Clone)]
pub struct RawRaster {
    pub data: Array3<f32>,
    pub band_names: Vec<String>,
    pub transform: GeoTransform,
    pub crs: CoordinateSystem,
    /// Source-side nodata value, if any
    pub nodata: Option<f32>,
}

impl RawRaster {
    pub fn new(
        data: Array3<f32>,
        band_names: Vec<String>,
        transform: GeoTransform,
        crs: CoordinateSystem,
    ) -> MosaicResult<Self> {
        if data.dim().0 != band_names.len() {
            return Err(MosaicError::ValidationFailure(format!(
                "raw raster has {} planes but {} band names",
                data.dim().0,
                band_names.len()
            )));
        }
        Ok(Self { data, band_names, transform, crs, nodata: None })
    }

    pub fn band_position(&self, name: &str) -> Option<usize> {
        self.band_names.iter().position(|n| n.eq_ignore_ascii_case(name))
    }

    /// Copy holding only the named bands, in the requested order
    pub fn select_bands(&self, names: &[String]) -> Result<RawRaster, CatalogError> {
        let mut positions = Vec::with_capacity(names.len());
        for name in names {
            let pos = self.band_position(name).ok_or_else(|| {
                CatalogError::InvalidResponse(format!("band {} not present in asset", name))
            })?;
            positions.push(pos);
        }
        Ok(RawRaster {
            data: self.data.select(Axis(0), &positions),
            band_names: names.to_vec(),
            transform: self.transform,
            crs: self.crs,
            nodata: self.nodata,
        })
    }

    /// Reject empty or zero-dimension payloads
    pub fn validate(&self) -> MosaicResult<()> {
        let (bands, rows, cols) = self.data.dim();
        if bands == 0 || rows == 0 || cols == 0 {
            return Err(MosaicError::ValidationFailure(format!(
                "empty raster payload ({} bands, {}x{})",
                bands, cols, rows
            )));
        }
        Ok(())
    }
}

/// Ready-to-fetch reference handed to the transport layer
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRef {
    pub url: String,
    /// Band names in the order the payload stores them
    pub band_names: Vec<String>,
}

/// Result of a pixel fetch
#[derive(Debug, Clone)]
pub enum PixelPayload {
    Decoded(RawRaster),
    /// Encoded raster file bytes (e.g. GeoTIFF), possibly archive-wrapped
    Encoded { bytes: Vec<u8>, band_names: Vec<String> },
    Remote(DownloadRef),
}

/// Remote image catalog
pub trait CatalogAdapter: Send + Sync {
    /// Images of one source intersecting the geometry inside [start, end].
    /// Zero results is `Ok(vec![])`.
    fn list_candidates(
        &self,
        source: &Source,
        geometry: &TileGeometry,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CandidateImage>, CatalogError>;

    /// Several metadata keys for many candidates in one call; one map per candidate
    fn fetch_metadata(
        &self,
        candidates: &[CandidateImage],
        keys: &[MetadataKey],
    ) -> Result<Vec<HashMap<MetadataKey, f64>>, CatalogError>;

    fn fetch_pixels(
        &self,
        candidate: &CandidateImage,
        bands: &[String],
        grid: &GridSpec,
    ) -> Result<PixelPayload, CatalogError>;
}

/// Call counters, useful to check batching
#[derive(Debug, Default)]
pub struct CatalogCounters {
    pub list_calls: AtomicUsize,
    pub metadata_calls: AtomicUsize,
    pub pixel_calls: AtomicUsize,
}

/// In-memory catalog for offline runs and tests
#[derive(Debug, Default)]
pub struct StaticCatalog {
    candidates: HashMap<String, Vec<CandidateImage>>,
    metadata: HashMap<String, HashMap<MetadataKey, f64>>,
    rasters: HashMap<String, RawRaster>,
    unavailable: HashSet<String>,
    rate_limited: HashSet<String>,
    failing_fetches: HashSet<String>,
    pub counters: CatalogCounters,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_candidate(&mut self, candidate: CandidateImage) -> &mut Self {
        self.candidates
            .entry(candidate.source_id.clone())
            .or_default()
            .push(candidate);
        self
    }

    pub fn add_metadata(
        &mut self,
        candidate_id: &str,
        values: HashMap<MetadataKey, f64>,
    ) -> &mut Self {
        self.metadata.entry(candidate_id.to_string()).or_default().extend(values);
        self
    }

    pub fn add_raster(&mut self, candidate_id: &str, raster: RawRaster) -> &mut Self {
        self.rasters.insert(candidate_id.to_string(), raster);
        self
    }

    /// Listing this source fails with `CollectionUnavailable`
    pub fn mark_unavailable(&mut self, source_id: &str) -> &mut Self {
        self.unavailable.insert(source_id.to_string());
        self
    }

    /// Listing this source fails with `RateLimited`
    pub fn mark_rate_limited(&mut self, source_id: &str) -> &mut Self {
        self.rate_limited.insert(source_id.to_string());
        self
    }

    /// Pixel fetches for this candidate fail with a transport error
    pub fn fail_fetches_for(&mut self, candidate_id: &str) -> &mut Self {
        self.failing_fetches.insert(candidate_id.to_string());
        self
    }
}

impl CatalogAdapter for StaticCatalog {
    fn list_candidates(
        &self,
        source: &Source,
        geometry: &TileGeometry,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CandidateImage>, CatalogError> {
        self.counters.list_calls.fetch_add(1, Ordering::Relaxed);
        if self.unavailable.contains(&source.id) {
            return Err(CatalogError::CollectionUnavailable(source.collection.clone()));
        }
        if self.rate_limited.contains(&source.id) {
            return Err(CatalogError::RateLimited(format!(
                "quota exceeded for {}",
                source.collection
            )));
        }

        let bounds = geometry.bounds();
        let mut found: Vec<CandidateImage> = self
            .candidates
            .get(&source.id)
            .map(|list| {
                list.iter()
                    .filter(|c| c.acquired >= start && c.acquired <= end)
                    .filter(|c| c.footprint.map_or(true, |fp| fp.intersects(&bounds)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by(|a, b| a.acquired.cmp(&b.acquired).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    fn fetch_metadata(
        &self,
        candidates: &[CandidateImage],
        keys: &[MetadataKey],
    ) -> Result<Vec<HashMap<MetadataKey, f64>>, CatalogError> {
        self.counters.metadata_calls.fetch_add(1, Ordering::Relaxed);
        Ok(candidates
            .iter()
            .map(|c| {
                self.metadata
                    .get(&c.id)
                    .map(|values| {
                        values
                            .iter()
                            .filter(|(k, _)| keys.contains(k))
                            .map(|(k, v)| (*k, *v))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect())
    }

    fn fetch_pixels(
        &self,
        candidate: &CandidateImage,
        bands: &[String],
        _grid: &GridSpec,
    ) -> Result<PixelPayload, CatalogError> {
        self.counters.pixel_calls.fetch_add(1, Ordering::Relaxed);
        if self.failing_fetches.contains(&candidate.id) {
            return Err(CatalogError::Transport(format!(
                "connection reset fetching {}",
                candidate.id
            )));
        }
        let raster = self.rasters.get(&candidate.id).ok_or_else(|| {
            CatalogError::InvalidResponse(format!("no pixels stored for {}", candidate.id))
        })?;
        Ok(PixelPayload::Decoded(raster.select_bands(bands)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, SourceFamily};
    use chrono::TimeZone;

    fn source() -> Source {
        Source {
            id: "s2".into(),
            family: SourceFamily::Sentinel2,
            collection: "COPERNICUS/S2_SR".into(),
            native_resolution_m: 10.0,
            operational_start: Utc.with_ymd_and_hms(2015, 6, 23, 0, 0, 0).unwrap(),
            operational_end: None,
        }
    }

    fn candidate(id: &str, day: u32, footprint: Option<BoundingBox>) -> CandidateImage {
        CandidateImage {
            id: id.into(),
            source_id: "s2".into(),
            acquired: Utc.with_ymd_and_hms(2023, 5, day, 10, 0, 0).unwrap(),
            cloud_cover_pct: 10.0,
            cloud_fraction: None,
            valid_pixel_fraction: None,
            solar_zenith_deg: None,
            view_zenith_deg: None,
            native_resolution_m: 10.0,
            band_names: vec!["B2".into(), "B3".into(), "B4".into()],
            footprint,
            asset_ref: id.into(),
        }
    }

    #[test]
    fn test_listing_filters_window_and_footprint() {
        let mut catalog = StaticCatalog::new();
        catalog
            .add_candidate(candidate("in", 10, Some(BoundingBox::new(13.0, 52.0, 14.0, 53.0))))
            .add_candidate(candidate("late", 28, None))
            .add_candidate(candidate("far", 12, Some(BoundingBox::new(0.0, 0.0, 1.0, 1.0))))
            .add_candidate(candidate("nofootprint", 5, None));

        let geometry = TileGeometry::Rectangle(BoundingBox::new(13.3, 52.4, 13.5, 52.6));
        let start = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 5, 20, 0, 0, 0).unwrap();
        let found = catalog.list_candidates(&source(), &geometry, start, end).unwrap();
        let ids: Vec<_> = found.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["nofootprint", "in"]);
    }

    #[test]
    fn test_unavailable_is_distinct_from_empty() {
        let mut catalog = StaticCatalog::new();
        let geometry = TileGeometry::Rectangle(BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 2, 1, 0, 0, 0).unwrap();
        assert!(catalog.list_candidates(&source(), &geometry, start, end).unwrap().is_empty());

        catalog.mark_rate_limited("s2");
        let err = catalog.list_candidates(&source(), &geometry, start, end).unwrap_err();
        assert!(err.is_transient());

        let mut catalog = StaticCatalog::new();
        catalog.mark_unavailable("s2");
        let err = catalog.list_candidates(&source(), &geometry, start, end).unwrap_err();
        assert!(matches!(err, CatalogError::CollectionUnavailable(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_metadata_is_batched_and_filtered() {
        let mut catalog = StaticCatalog::new();
        let values: HashMap<_, _> =
            [(MetadataKey::CloudFraction, 0.12), (MetadataKey::SolarZenith, 35.0)].into();
        catalog.add_metadata("a", values);

        let candidates = vec![candidate("a", 1, None), candidate("b", 2, None)];
        let maps = catalog.fetch_metadata(&candidates, &[MetadataKey::CloudFraction]).unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].get(&MetadataKey::CloudFraction), Some(&0.12));
        assert!(!maps[0].contains_key(&MetadataKey::SolarZenith));
        assert!(maps[1].is_empty());
        assert_eq!(catalog.counters.metadata_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_select_bands_reorders_and_rejects_missing() {
        let data = Array3::from_shape_fn((3, 2, 2), |(b, _, _)| b as f32 + 1.0);
        let names = vec!["B2".to_string(), "B3".to_string(), "B4".to_string()];
        let raw = RawRaster::new(
            data,
            names,
            GeoTransform::north_up(0.0, 0.0, 10.0),
            CoordinateSystem::Utm { zone: 33, north: true },
        )
        .unwrap();
        let picked = raw.select_bands(&["b4".to_string(), "B2".to_string()]).unwrap();
        assert_eq!(picked.data[[0, 0, 0]], 3.0);
        assert_eq!(picked.data[[1, 1, 1]], 1.0);
        assert!(raw.select_bands(&["B8".to_string()]).is_err());
    }
}
