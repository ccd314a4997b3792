use chrono::{DateTime, Utc};
use ndarray::{Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Numeric nodata sentinel written into every raster band
pub const NODATA: f32 = -9999.0;

/// A pixel value is usable when it is finite, non-zero and not the sentinel
#[inline]
pub fn is_valid_value(value: f32) -> bool {
    value.is_finite() && value != 0.0 && value != NODATA
}

/// Standard band profile plus derived index bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Red,
    Green,
    Blue,
    Nir,
    Swir1,
    Swir2,
    Ndvi,
    Ndwi,
    Mndwi,
    Evi,
    Savi,
    Fai,
    Avi,
}

impl Band {
    /// The six reflectance bands every harmonised raster carries, in storage order
    pub const STANDARD: [Band; 6] = [
        Band::Red,
        Band::Green,
        Band::Blue,
        Band::Nir,
        Band::Swir1,
        Band::Swir2,
    ];

    /// Visual bands that must be present for a usable candidate
    pub const PRIMARY: [Band; 3] = [Band::Red, Band::Green, Band::Blue];

    pub fn is_index(&self) -> bool {
        !Band::STANDARD.contains(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Band::Red => "red",
            Band::Green => "green",
            Band::Blue => "blue",
            Band::Nir => "nir",
            Band::Swir1 => "swir1",
            Band::Swir2 => "swir2",
            Band::Ndvi => "ndvi",
            Band::Ndwi => "ndwi",
            Band::Mndwi => "mndwi",
            Band::Evi => "evi",
            Band::Savi => "savi",
            Band::Fai => "fai",
            Band::Avi => "avi",
        }
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Coordinate system of a raster grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinateSystem {
    /// WGS84 longitude/latitude (EPSG:4326)
    Geographic,
    /// WGS84 / UTM zone (EPSG:326zz north, 327zz south)
    Utm { zone: u8, north: bool },
}

impl CoordinateSystem {
    pub fn epsg(&self) -> u32 {
        match self {
            CoordinateSystem::Geographic => 4326,
            CoordinateSystem::Utm { zone, north: true } => 32600 + *zone as u32,
            CoordinateSystem::Utm { zone, north: false } => 32700 + *zone as u32,
        }
    }

    pub fn from_epsg(epsg: u32) -> Option<Self> {
        match epsg {
            4326 => Some(CoordinateSystem::Geographic),
            32601..=32660 => {
                Some(CoordinateSystem::Utm { zone: (epsg - 32600) as u8, north: true })
            }
            32701..=32760 => {
                Some(CoordinateSystem::Utm { zone: (epsg - 32700) as u8, north: false })
            }
            _ => None,
        }
    }
}

/// Geospatial bounding box (degrees)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self { min_lon, max_lon, min_lat, max_lat }
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.max_lon < other.min_lon
            || other.max_lon < self.min_lon
            || self.max_lat < other.min_lat
            || other.max_lat < self.min_lat)
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.min_lon + self.max_lon) / 2.0, (self.min_lat + self.max_lat) / 2.0)
    }
}

/// Affine geotransform in GDAL order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square pixels
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_size: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: pixel_size,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_size,
        }
    }

    /// Map coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.top_left_x + (col as f64 + 0.5) * self.pixel_width,
            self.top_left_y + (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Fractional (row, col) of a map coordinate, pixel centres at integers
    pub fn map_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (y - self.top_left_y) / self.pixel_height - 0.5,
            (x - self.top_left_x) / self.pixel_width - 0.5,
        )
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }
}

/// Multi-band float raster (band, row, col) on a georeferenced grid
#[derive(Debug, Clone)]
pub struct Raster {
    pub data: Array3<f32>,
    pub bands: Vec<Band>,
    pub transform: GeoTransform,
    pub crs: CoordinateSystem,
    pub nodata: f32,
}

impl Raster {
    pub fn new(
        data: Array3<f32>,
        bands: Vec<Band>,
        transform: GeoTransform,
        crs: CoordinateSystem,
    ) -> MosaicResult<Self> {
        if data.dim().0 != bands.len() {
            return Err(MosaicError::ValidationFailure(format!(
                "raster has {} band planes but {} band labels",
                data.dim().0,
                bands.len()
            )));
        }
        Ok(Self { data, bands, transform, crs, nodata: NODATA })
    }

    /// Raster of the given shape with every pixel set to nodata
    pub fn empty(
        bands: Vec<Band>,
        rows: usize,
        cols: usize,
        transform: GeoTransform,
        crs: CoordinateSystem,
    ) -> Self {
        let data = Array3::from_elem((bands.len(), rows, cols), NODATA);
        Self { data, bands, transform, crs, nodata: NODATA }
    }

    pub fn rows(&self) -> usize {
        self.data.dim().1
    }

    pub fn cols(&self) -> usize {
        self.data.dim().2
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn band_index(&self, band: Band) -> Option<usize> {
        self.bands.iter().position(|b| *b == band)
    }

    pub fn band(&self, band: Band) -> Option<ArrayView2<'_, f32>> {
        self.band_index(band).map(|i| self.data.index_axis(Axis(0), i))
    }

    pub fn has_bands(&self, required: &[Band]) -> bool {
        required.iter().all(|b| self.bands.contains(b))
    }

    /// True when every primary band holds a valid value at (row, col)
    pub fn primary_valid_at(&self, row: usize, col: usize) -> bool {
        Band::PRIMARY.iter().all(|b| match self.band_index(*b) {
            Some(i) => is_valid_value(self.data[[i, row, col]]),
            None => false,
        })
    }

    /// Map-coordinate extent (min_x, min_y, max_x, max_y)
    pub fn extent(&self) -> (f64, f64, f64, f64) {
        let t = &self.transform;
        let x0 = t.top_left_x;
        let x1 = t.top_left_x + self.cols() as f64 * t.pixel_width;
        let y0 = t.top_left_y;
        let y1 = t.top_left_y + self.rows() as f64 * t.pixel_height;
        (x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }

    /// Fraction of valid pixels in one band
    pub fn valid_fraction(&self, band: Band) -> f64 {
        match self.band(band) {
            Some(view) if !view.is_empty() => {
                let valid = view.iter().filter(|v| is_valid_value(**v)).count();
                valid as f64 / view.len() as f64
            }
            _ => 0.0,
        }
    }
}

/// Source family; one adapter implementation exists per family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceFamily {
    Sentinel2,
    Landsat,
    Modis,
    PlanetScope,
}

/// One imaging instrument/program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub family: SourceFamily,
    /// Catalog collection identifier queried for this source
    pub collection: String,
    pub native_resolution_m: f64,
    pub operational_start: DateTime<Utc>,
    pub operational_end: Option<DateTime<Utc>>,
}

impl Source {
    /// Whether the operational range overlaps [start, end]
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        if self.operational_start > end {
            return false;
        }
        match self.operational_end {
            Some(op_end) => op_end >= start,
            None => true,
        }
    }
}

/// Metadata keys retrievable through the catalog in batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataKey {
    /// Cloud fraction computed over the tile footprint (0-1)
    CloudFraction,
    SolarZenith,
    ViewZenith,
    ValidPixelFraction,
}

/// One discrete image from a source; immutable once built
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateImage {
    pub id: String,
    pub source_id: String,
    pub acquired: DateTime<Utc>,
    /// Scene-level cloud percentage from catalog metadata (cheap proxy, 0-100)
    pub cloud_cover_pct: f64,
    /// Cloud fraction over the tile (0-1) when computed
    pub cloud_fraction: Option<f64>,
    pub valid_pixel_fraction: Option<f64>,
    pub solar_zenith_deg: Option<f64>,
    pub view_zenith_deg: Option<f64>,
    pub native_resolution_m: f64,
    pub band_names: Vec<String>,
    pub footprint: Option<BoundingBox>,
    /// Opaque reference the catalog resolves when pixels are fetched
    pub asset_ref: String,
}

impl CandidateImage {
    /// Best cloud estimate available: computed fraction, else scene metadata
    pub fn effective_cloud_fraction(&self) -> f64 {
        self.cloud_fraction
            .unwrap_or(self.cloud_cover_pct / 100.0)
            .clamp(0.0, 1.0)
    }

    /// New candidate carrying the given metadata values; unknown keys leave fields as-is
    pub fn with_metadata(&self, values: &std::collections::HashMap<MetadataKey, f64>) -> Self {
        let mut enriched = self.clone();
        for (key, value) in values {
            if !value.is_finite() {
                continue;
            }
            match key {
                MetadataKey::CloudFraction => enriched.cloud_fraction = Some(value.clamp(0.0, 1.0)),
                MetadataKey::SolarZenith => enriched.solar_zenith_deg = Some(*value),
                MetadataKey::ViewZenith => enriched.view_zenith_deg = Some(*value),
                MetadataKey::ValidPixelFraction => {
                    enriched.valid_pixel_fraction = Some(value.clamp(0.0, 1.0))
                }
            }
        }
        enriched
    }
}

/// Candidate with its quality and band-completeness scores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: CandidateImage,
    pub score: f64,
    pub band_completeness: f64,
}

impl ScoredCandidate {
    pub fn id(&self) -> &str {
        &self.candidate.id
    }

    pub fn source_id(&self) -> &str {
        &self.candidate.source_id
    }

    pub fn resolution_m(&self) -> f64 {
        self.candidate.native_resolution_m
    }

    /// Descending score order with id as a deterministic tie-break
    pub fn rank_cmp(&self, other: &ScoredCandidate) -> std::cmp::Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.id().cmp(other.id()))
    }
}

/// Geographic area of a tile (lon/lat)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TileGeometry {
    Rectangle(BoundingBox),
    /// Closed or open ring of (lon, lat) vertices
    Polygon(Vec<(f64, f64)>),
}

impl TileGeometry {
    pub fn bounds(&self) -> BoundingBox {
        match self {
            TileGeometry::Rectangle(bbox) => *bbox,
            TileGeometry::Polygon(ring) => {
                let mut bbox = BoundingBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
                for (lon, lat) in ring {
                    bbox.min_lon = bbox.min_lon.min(*lon);
                    bbox.max_lon = bbox.max_lon.max(*lon);
                    bbox.min_lat = bbox.min_lat.min(*lat);
                    bbox.max_lat = bbox.max_lat.max(*lat);
                }
                bbox
            }
        }
    }

    pub fn centroid(&self) -> (f64, f64) {
        match self {
            TileGeometry::Rectangle(bbox) => bbox.center(),
            TileGeometry::Polygon(ring) if !ring.is_empty() => {
                let n = ring.len() as f64;
                let (sx, sy) = ring.iter().fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
                (sx / n, sy / n)
            }
            TileGeometry::Polygon(_) => (0.0, 0.0),
        }
    }

    /// Point-in-geometry test (even-odd rule for polygons)
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        match self {
            TileGeometry::Rectangle(bbox) => bbox.contains(lon, lat),
            TileGeometry::Polygon(ring) => {
                if ring.len() < 3 {
                    return false;
                }
                let mut inside = false;
                let mut j = ring.len() - 1;
                for i in 0..ring.len() {
                    let (xi, yi) = ring[i];
                    let (xj, yj) = ring[j];
                    if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
                        inside = !inside;
                    }
                    j = i;
                }
                inside
            }
        }
    }
}

/// Request for one tile composite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileRequest {
    pub tile_id: String,
    pub geometry: TileGeometry,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Source ids to use; empty means every configured source
    pub include_sources: Vec<String>,
    pub target_resolution_m: f64,
    /// Larger candidate scans, more excellent picks and more gap-fill iterations
    pub high_throughput: bool,
}

impl TileRequest {
    pub fn includes_source(&self, source_id: &str) -> bool {
        self.include_sources.is_empty() || self.include_sources.iter().any(|s| s == source_id)
    }

    pub fn window_days(&self) -> f64 {
        (self.end - self.start).num_seconds().max(0) as f64 / 86_400.0
    }
}

/// Catalog-side failures, kept distinct from "zero results"
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("collection unavailable: {0}")]
    CollectionUnavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl CatalogError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::RateLimited(_) | CatalogError::Transport(_))
    }
}

/// Status codes recorded in provenance and the batch histogram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoImagery,
    ValidationFailure,
    DownloadFailure,
    TileTooLarge,
    BandSelectionError,
    Timeout,
    Unknown,
}

/// Error types for mosaic processing
#[derive(Debug, thiserror::Error)]
pub enum MosaicError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("No usable imagery: {0}")]
    NoImagery(String),

    #[error("Raster validation failed: {0}")]
    ValidationFailure(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Download failed after {attempts} attempt(s): {message}")]
    DownloadFailure { attempts: u32, message: String },

    #[error("Tile too large: {pixels} pixels exceeds the limit of {limit}")]
    TileTooLarge { pixels: usize, limit: usize },

    #[error("Band selection error: {0}")]
    BandSelection(String),

    #[error("Tile processing timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Unexpected error: {0}")]
    Unknown(String),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl MosaicError {
    /// Retryable with backoff (network and rate-limit conditions)
    pub fn is_transient(&self) -> bool {
        match self {
            MosaicError::Transport(_) => true,
            MosaicError::Catalog(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn failure_reason(&self) -> FailureReason {
        match self {
            MosaicError::NoImagery(_) => FailureReason::NoImagery,
            MosaicError::Catalog(CatalogError::CollectionUnavailable(_)) => {
                FailureReason::NoImagery
            }
            MosaicError::Catalog(CatalogError::InvalidResponse(_)) => {
                FailureReason::ValidationFailure
            }
            MosaicError::Catalog(_) => FailureReason::DownloadFailure,
            MosaicError::ValidationFailure(_) => FailureReason::ValidationFailure,
            MosaicError::Transport(_) | MosaicError::DownloadFailure { .. } => {
                FailureReason::DownloadFailure
            }
            MosaicError::TileTooLarge { .. } => FailureReason::TileTooLarge,
            MosaicError::BandSelection(_) => FailureReason::BandSelectionError,
            MosaicError::Timeout(_) => FailureReason::Timeout,
            #[cfg(feature = "gdal")]
            MosaicError::Gdal(_) => FailureReason::ValidationFailure,
            MosaicError::Io(_)
            | MosaicError::Json(_)
            | MosaicError::Config(_)
            | MosaicError::Processing(_)
            | MosaicError::Unknown(_) => FailureReason::Unknown,
        }
    }
}

/// Result type for mosaic operations
pub type MosaicResult<T> = Result<T, MosaicError>;

/// Count of failures per reason
pub type FailureHistogram = BTreeMap<FailureReason, usize>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_validity_rules() {
        assert!(is_valid_value(0.12));
        assert!(is_valid_value(-0.3));
        assert!(!is_valid_value(0.0));
        assert!(!is_valid_value(NODATA));
        assert!(!is_valid_value(f32::NAN));
        assert!(!is_valid_value(f32::INFINITY));
    }

    #[test]
    fn test_epsg_round_trip_for_utm() {
        let north = CoordinateSystem::Utm { zone: 33, north: true };
        let south = CoordinateSystem::Utm { zone: 19, north: false };
        assert_eq!(north.epsg(), 32633);
        assert_eq!(south.epsg(), 32719);
        assert_eq!(CoordinateSystem::from_epsg(32633), Some(north));
        assert_eq!(CoordinateSystem::from_epsg(4326), Some(CoordinateSystem::Geographic));
        assert_eq!(CoordinateSystem::from_epsg(3857), None);
    }

    #[test]
    fn test_source_operational_overlap() {
        let source = Source {
            id: "landsat7".to_string(),
            family: SourceFamily::Landsat,
            collection: "LANDSAT/LE07/C02/T1_L2".to_string(),
            native_resolution_m: 30.0,
            operational_start: Utc.with_ymd_and_hms(1999, 5, 28, 0, 0, 0).unwrap(),
            operational_end: Some(Utc.with_ymd_and_hms(2022, 4, 6, 0, 0, 0).unwrap()),
        };
        let before = Utc.with_ymd_and_hms(1990, 1, 1, 0, 0, 0).unwrap();
        let during = Utc.with_ymd_and_hms(2010, 6, 1, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        assert!(!source.overlaps(before, before + chrono::Duration::days(30)));
        assert!(source.overlaps(during, during + chrono::Duration::days(30)));
        assert!(!source.overlaps(after, after + chrono::Duration::days(30)));
    }

    #[test]
    fn test_polygon_contains() {
        let triangle = TileGeometry::Polygon(vec![(0.0, 0.0), (2.0, 0.0), (0.0, 2.0)]);
        assert!(triangle.contains(0.5, 0.5));
        assert!(!triangle.contains(1.5, 1.5));
        let bounds = triangle.bounds();
        assert_eq!(bounds.max_lon, 2.0);
        assert_eq!(bounds.max_lat, 2.0);
    }

    #[test]
    fn test_failure_reason_mapping() {
        let unavailable = MosaicError::Catalog(CatalogError::CollectionUnavailable("x".into()));
        assert_eq!(unavailable.failure_reason(), FailureReason::NoImagery);
        assert!(!unavailable.is_transient());

        let limited = MosaicError::Catalog(CatalogError::RateLimited("slow down".into()));
        assert!(limited.is_transient());
        assert_eq!(limited.failure_reason(), FailureReason::DownloadFailure);

        let timeout = MosaicError::Timeout(Duration::from_secs(5));
        assert_eq!(timeout.failure_reason(), FailureReason::Timeout);
    }
}
