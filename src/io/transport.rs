//! Pixel transport: HTTP downloads with retry/backoff, archive unwrapping
//! and raster decoding.

use crate::core::projection::GridSpec;
use crate::io::catalog::{CatalogAdapter, DownloadRef, PixelPayload, RawRaster};
use crate::types::{CandidateImage, CatalogError, MosaicError, MosaicResult};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

/// Exponential backoff for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000, // 2s first wait
            max_delay_ms: 30_000,
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy without waits, for tests and offline catalogs
    pub fn immediate(max_attempts: u32) -> Self {
        Self { max_attempts, base_delay_ms: 0, max_delay_ms: 0, factor: 2.0 }
    }

    /// Wait before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let millis = (self.base_delay_ms as f64 * self.factor.max(1.0).powi(exponent))
            .min(self.max_delay_ms as f64)
            .max(0.0);
        Duration::from_millis(millis as u64)
    }

    /// Run `op`, retrying transient errors. Exhausted retries surface as
    /// `DownloadFailure`; structural errors return immediately.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> MosaicResult<T>
    where
        F: FnMut(u32) -> MosaicResult<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            log::debug!("{}: attempt {} of {}", label, attempt, max_attempts);
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if attempt == max_attempts {
                        log::error!("{}: giving up after {} attempt(s): {}", label, attempt, e);
                        return Err(MosaicError::DownloadFailure {
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                    let wait = self.delay_for(attempt);
                    log::warn!(
                        "{}: attempt {} failed ({}), retrying in {:?}",
                        label,
                        attempt,
                        e,
                        wait
                    );
                    if !wait.is_zero() {
                        std::thread::sleep(wait);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(MosaicError::DownloadFailure {
            attempts: max_attempts,
            message: format!("{} failed", label),
        })
    }
}

/// Fetches raw bytes for a download reference
pub trait Transport: Send + Sync {
    fn fetch(&self, reference: &DownloadRef) -> MosaicResult<Vec<u8>>;
}

/// Blocking HTTP transport
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(retry: RetryPolicy, timeout: Duration) -> MosaicResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mosaicker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MosaicError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, retry })
    }

    fn try_fetch_once(&self, url: &str) -> MosaicResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| MosaicError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(CatalogError::RateLimited(url.to_string()).into());
        }
        if status.is_server_error() {
            return Err(MosaicError::Transport(format!("HTTP {}: {}", status.as_u16(), url)));
        }
        if !status.is_success() {
            return Err(MosaicError::DownloadFailure {
                attempts: 1,
                message: format!(
                    "HTTP {} {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or(""),
                    url
                ),
            });
        }

        let content = response
            .bytes()
            .map_err(|e| MosaicError::Transport(format!("Failed to read response body: {}", e)))?;
        log::debug!("Downloaded {} bytes from {}", content.len(), url);
        Ok(content.to_vec())
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, reference: &DownloadRef) -> MosaicResult<Vec<u8>> {
        let bytes = self.retry.run("download", |_| self.try_fetch_once(&reference.url))?;
        unwrap_archive(bytes)
    }
}

/// gzip magic bytes
pub fn is_gzip_content(content: &[u8]) -> bool {
    content.len() >= 2 && content[0] == 0x1F && content[1] == 0x8B
}

/// ZIP local file header magic bytes
pub fn is_zip_content(content: &[u8]) -> bool {
    content.len() >= 4 && content[0..4] == [0x50, 0x4B, 0x03, 0x04]
}

/// Strip gzip/ZIP wrapping; anything else is returned unchanged
pub fn unwrap_archive(content: Vec<u8>) -> MosaicResult<Vec<u8>> {
    if is_gzip_content(&content) {
        log::debug!("Decompressing gzip payload");
        let mut decoder = flate2::read::GzDecoder::new(content.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| {
                MosaicError::ValidationFailure(format!("Failed to decompress gzip data: {}", e))
            })?;
        if decompressed.is_empty() {
            return Err(MosaicError::ValidationFailure("Decompressed payload is empty".to_string()));
        }
        return Ok(decompressed);
    }
    if is_zip_content(&content) {
        return extract_raster_member(&content);
    }
    Ok(content)
}

/// First GeoTIFF member of a ZIP archive, else the first file member
fn extract_raster_member(zip_data: &[u8]) -> MosaicResult<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(zip_data))
        .map_err(|e| MosaicError::ValidationFailure(format!("Failed to open ZIP archive: {}", e)))?;

    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    let is_tiff = |name: &String| {
        let lower = name.to_lowercase();
        lower.ends_with(".tif") || lower.ends_with(".tiff")
    };
    let member = names
        .iter()
        .find(|n| is_tiff(n))
        .or_else(|| names.iter().find(|n| !n.ends_with('/')))
        .cloned()
        .ok_or_else(|| MosaicError::ValidationFailure("ZIP archive holds no files".to_string()))?;

    log::debug!("Extracting {} from ZIP payload", member);
    let mut file = archive
        .by_name(&member)
        .map_err(|e| {
            MosaicError::ValidationFailure(format!("Failed to read ZIP entry {}: {}", member, e))
        })?;
    let mut buffer = Vec::new();
    std::io::copy(&mut file, &mut buffer)?;
    Ok(buffer)
}

/// Decodes encoded raster bytes
pub trait RasterDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8], band_names: &[String]) -> MosaicResult<RawRaster>;
}

/// GeoTIFF decoding through GDAL via a temporary file
#[cfg(feature = "gdal")]
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalDecoder;

#[cfg(feature = "gdal")]
impl RasterDecoder for GdalDecoder {
    fn decode(&self, bytes: &[u8], band_names: &[String]) -> MosaicResult<RawRaster> {
        use crate::types::{CoordinateSystem, GeoTransform};
        use std::io::Write;

        let mut temp_file = tempfile::Builder::new().suffix(".tif").tempfile()?;
        temp_file.write_all(bytes)?;
        temp_file.flush()?;

        let dataset = gdal::Dataset::open(temp_file.path())?;
        let (width, height) = dataset.raster_size();
        let band_count = dataset.raster_count().max(0) as usize;
        log::debug!("Decoded payload: {}x{} pixels, {} band(s)", width, height, band_count);
        if band_count == 0 || width == 0 || height == 0 {
            return Err(MosaicError::ValidationFailure("payload has no raster data".to_string()));
        }

        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let crs = dataset
            .spatial_ref()
            .ok()
            .and_then(|srs| srs.auth_code().ok())
            .and_then(|code| CoordinateSystem::from_epsg(code as u32))
            .ok_or_else(|| {
                MosaicError::ValidationFailure("payload CRS is not WGS84 or UTM".to_string())
            })?;

        let mut data = ndarray::Array3::<f32>::zeros((band_count, height, width));
        let mut nodata = None;
        for b in 0..band_count {
            let rasterband = dataset.rasterband(b as isize + 1)?;
            if nodata.is_none() {
                nodata = rasterband.no_data_value().map(|v| v as f32);
            }
            let buffer =
                rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
            let plane = ndarray::Array2::from_shape_vec((height, width), buffer.data).map_err(|e| {
                MosaicError::Processing(format!("Failed to reshape band {}: {}", b + 1, e))
            })?;
            data.index_axis_mut(ndarray::Axis(0), b).assign(&plane);
        }

        let names = if band_names.len() == band_count {
            band_names.to_vec()
        } else {
            (1..=band_count).map(|i| format!("b{}", i)).collect()
        };
        let mut raw = RawRaster::new(data, names, transform, crs)?;
        raw.nodata = nodata;
        Ok(raw)
    }
}

/// Turns catalog pixel payloads into raw rasters
#[derive(Clone)]
pub struct PixelFetcher {
    retry: RetryPolicy,
    transport: Option<Arc<dyn Transport>>,
    decoder: Option<Arc<dyn RasterDecoder>>,
}

impl PixelFetcher {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry, transport: None, decoder: None }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn RasterDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Fetcher with the decoders available in this build
    pub fn with_default_decoder(self) -> Self {
        #[cfg(feature = "gdal")]
        {
            self.with_decoder(Arc::new(GdalDecoder))
        }
        #[cfg(not(feature = "gdal"))]
        {
            self
        }
    }

    /// Fetch, download and decode the candidate's pixels
    pub fn fetch(
        &self,
        catalog: &dyn CatalogAdapter,
        candidate: &CandidateImage,
        bands: &[String],
        grid: &GridSpec,
    ) -> MosaicResult<RawRaster> {
        let label = format!("fetch {}", candidate.id);
        let payload = self.retry.run(&label, |_| {
            catalog.fetch_pixels(candidate, bands, grid).map_err(MosaicError::from)
        })?;

        let raw = match payload {
            PixelPayload::Decoded(raw) => raw,
            PixelPayload::Encoded { bytes, band_names } => {
                self.decode(&unwrap_archive(bytes)?, &band_names)?
            }
            PixelPayload::Remote(reference) => {
                let transport = self.transport.as_ref().ok_or_else(|| {
                    MosaicError::Transport(format!("no transport configured for {}", reference.url))
                })?;
                let bytes = transport.fetch(&reference)?;
                self.decode(&bytes, &reference.band_names)?
            }
        };
        raw.validate()?;
        Ok(raw)
    }

    fn decode(&self, bytes: &[u8], band_names: &[String]) -> MosaicResult<RawRaster> {
        if bytes.is_empty() {
            return Err(MosaicError::ValidationFailure("empty raster payload".to_string()));
        }
        match &self.decoder {
            Some(decoder) => decoder.decode(bytes, band_names),
            None => Err(MosaicError::ValidationFailure("no raster decoder configured".to_string())),
        }
    }
}
