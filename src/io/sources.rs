//! Per-family source adapters and band harmonisation.
//!
//! Each family maps its own band naming and reflectance scaling onto the
//! standard six-band profile (red, green, blue, nir, swir1, swir2).

use crate::io::catalog::{CatalogAdapter, RawRaster};
use crate::types::{
    is_valid_value, Band, CandidateImage, CatalogError, MosaicError, MosaicResult, Raster, Source,
    SourceFamily, TileGeometry, NODATA,
};
use chrono::{DateTime, Utc};
use ndarray::{Array3, Axis};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Resolved raw band name per standard band, plus the reflectance conversion
#[derive(Debug, Clone, PartialEq)]
pub struct BandMapping {
    pub source_id: String,
    pub entries: Vec<(Band, String)>,
    pub scale: f64,
    pub offset: f64,
}

impl BandMapping {
    /// Standard bands this mapping can provide
    pub fn available(&self) -> Vec<Band> {
        self.entries.iter().map(|(b, _)| *b).collect()
    }

    pub fn raw_name(&self, band: Band) -> Option<&str> {
        self.entries.iter().find(|(b, _)| *b == band).map(|(_, n)| n.as_str())
    }

    /// Raw names to request from the catalog, in standard band order
    pub fn raw_names(&self) -> Vec<String> {
        self.entries.iter().map(|(_, n)| n.clone()).collect()
    }

    pub fn has_primary(&self) -> bool {
        Band::PRIMARY.iter().all(|b| self.raw_name(*b).is_some())
    }
}

/// Batch-scoped band-name lookup cache shared by tile workers.
///
/// Entries are advisory: a miss just resolves the names again.
#[derive(Debug, Default)]
pub struct BandNameCache {
    entries: Mutex<HashMap<String, BandMapping>>,
}

impl BandNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(source_id: &str, band_names: &[String]) -> String {
        format!("{}|{}", source_id, band_names.join(","))
    }

    pub fn get(&self, source_id: &str, band_names: &[String]) -> Option<BandMapping> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(&Self::key(source_id, band_names)).cloned()
    }

    pub fn insert(&self, source_id: &str, band_names: &[String], mapping: BandMapping) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(Self::key(source_id, band_names), mapping);
    }

    pub fn get_or_resolve<F>(
        &self,
        source_id: &str,
        band_names: &[String],
        resolve: F,
    ) -> BandMapping
    where
        F: FnOnce() -> BandMapping,
    {
        if let Some(mapping) = self.get(source_id, band_names) {
            return mapping;
        }
        let mapping = resolve();
        self.insert(source_id, band_names, mapping.clone());
        mapping
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Band-name patterns and reflectance scaling of one family
#[derive(Debug, Clone)]
pub struct BandProfile {
    patterns: Vec<(Band, Regex)>,
    pub scale: f64,
    pub offset: f64,
}

impl BandProfile {
    fn new(patterns: &[(Band, &str)], scale: f64, offset: f64) -> MosaicResult<Self> {
        let patterns = patterns
            .iter()
            .map(|(band, pattern)| {
                Regex::new(pattern)
                    .map(|re| (*band, re))
                    .map_err(|e| {
                        MosaicError::Config(format!("invalid band pattern {}: {}", pattern, e))
                    })
            })
            .collect::<MosaicResult<Vec<_>>>()?;
        Ok(Self { patterns, scale, offset })
    }

    /// Match raw band names against the patterns
    pub fn resolve(&self, source_id: &str, band_names: &[String]) -> BandMapping {
        let entries = self
            .patterns
            .iter()
            .filter_map(|(band, re)| {
                band_names
                    .iter()
                    .find(|name| re.is_match(name))
                    .map(|name| (*band, name.clone()))
            })
            .collect();
        BandMapping {
            source_id: source_id.to_string(),
            entries,
            scale: self.scale,
            offset: self.offset,
        }
    }
}

/// Uniform capability interface over source families
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> &Source;

    fn profile(&self) -> &BandProfile;

    fn native_resolution(&self) -> f64 {
        self.source().native_resolution_m
    }

    /// Candidates for the window; sources without operational overlap return nothing
    fn list_candidates(
        &self,
        catalog: &dyn CatalogAdapter,
        geometry: &TileGeometry,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CandidateImage>, CatalogError> {
        let source = self.source();
        if !source.overlaps(start, end) {
            log::debug!("{}: no operational overlap with window, skipping", source.id);
            return Ok(Vec::new());
        }
        let mut candidates = catalog.list_candidates(source, geometry, start, end)?;
        for candidate in candidates.iter_mut() {
            if !(candidate.native_resolution_m > 0.0) {
                candidate.native_resolution_m = self.native_resolution();
            }
        }
        Ok(candidates)
    }

    fn prepare_bands(&self, candidate: &CandidateImage, cache: &BandNameCache) -> BandMapping {
        let source_id = &self.source().id;
        cache.get_or_resolve(source_id, &candidate.band_names, || {
            self.profile().resolve(source_id, &candidate.band_names)
        })
    }

    /// Convert a raw raster into standard-profile surface reflectance.
    /// Bands the mapping lacks are filled with nodata.
    fn harmonize(&self, raw: &RawRaster, mapping: &BandMapping) -> MosaicResult<Raster> {
        raw.validate()?;
        let (_, rows, cols) = raw.data.dim();
        let mut data = Array3::from_elem((Band::STANDARD.len(), rows, cols), NODATA);
        let mut matched = 0usize;

        for (i, band) in Band::STANDARD.iter().enumerate() {
            let position = mapping.raw_name(*band).and_then(|name| raw.band_position(name));
            let Some(position) = position else {
                continue;
            };
            matched += 1;
            let src = raw.data.index_axis(Axis(0), position);
            let mut dst = data.index_axis_mut(Axis(0), i);
            dst.zip_mut_with(&src, |out, &v| {
                *out = to_reflectance(v, raw.nodata, mapping.scale, mapping.offset);
            });
        }

        if matched == 0 {
            return Err(MosaicError::ValidationFailure(format!(
                "{}: payload holds none of the mapped bands {:?}",
                self.source().id,
                mapping.raw_names()
            )));
        }

        Raster::new(data, Band::STANDARD.to_vec(), raw.transform, raw.crs)
    }
}

#[inline]
fn to_reflectance(value: f32, raw_nodata: Option<f32>, scale: f64, offset: f64) -> f32 {
    if !value.is_finite() || value == 0.0 || raw_nodata == Some(value) {
        return NODATA;
    }
    let reflectance = (value as f64 * scale + offset) as f32;
    if is_valid_value(reflectance) {
        reflectance
    } else {
        NODATA
    }
}

macro_rules! family_adapter {
    ($name:ident) => {
        #[derive(Debug, Clone)]
        pub struct $name {
            source: Source,
            profile: BandProfile,
        }

        impl SourceAdapter for $name {
            fn source(&self) -> &Source {
                &self.source
            }

            fn profile(&self) -> &BandProfile {
                &self.profile
            }
        }
    };
}

family_adapter!(Sentinel2Adapter);
family_adapter!(LandsatAdapter);
family_adapter!(ModisAdapter);
family_adapter!(PlanetScopeAdapter);

impl Sentinel2Adapter {
    pub fn new(source: Source) -> MosaicResult<Self> {
        let profile = BandProfile::new(
            &[
                (Band::Red, r"(?i)^B0?4$"),
                (Band::Green, r"(?i)^B0?3$"),
                (Band::Blue, r"(?i)^B0?2$"),
                (Band::Nir, r"(?i)^B0?8$"),
                (Band::Swir1, r"(?i)^B11$"),
                (Band::Swir2, r"(?i)^B12$"),
            ],
            1e-4,
            0.0,
        )?;
        Ok(Self { source, profile })
    }
}

/// Landsat sensor generation; decides the SR band numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandsatGeneration {
    /// TM / ETM+ (Landsat 4-7)
    Thematic,
    /// OLI (Landsat 8-9)
    Operational,
}

impl LandsatGeneration {
    /// Guess from a collection identifier such as `LANDSAT/LC09/C02/T1_L2`
    pub fn from_collection(collection: &str) -> Self {
        let oli = Regex::new(r"(?i)LC0?[89]").map(|re| re.is_match(collection)).unwrap_or(false);
        if oli {
            LandsatGeneration::Operational
        } else {
            LandsatGeneration::Thematic
        }
    }
}

impl LandsatAdapter {
    pub fn new(source: Source) -> MosaicResult<Self> {
        let generation = LandsatGeneration::from_collection(&source.collection);
        Self::with_generation(source, generation)
    }

    pub fn with_generation(source: Source, generation: LandsatGeneration) -> MosaicResult<Self> {
        let patterns: [(Band, &str); 6] = match generation {
            LandsatGeneration::Operational => [
                (Band::Red, r"(?i)^SR_B4$"),
                (Band::Green, r"(?i)^SR_B3$"),
                (Band::Blue, r"(?i)^SR_B2$"),
                (Band::Nir, r"(?i)^SR_B5$"),
                (Band::Swir1, r"(?i)^SR_B6$"),
                (Band::Swir2, r"(?i)^SR_B7$"),
            ],
            LandsatGeneration::Thematic => [
                (Band::Red, r"(?i)^SR_B3$"),
                (Band::Green, r"(?i)^SR_B2$"),
                (Band::Blue, r"(?i)^SR_B1$"),
                (Band::Nir, r"(?i)^SR_B4$"),
                (Band::Swir1, r"(?i)^SR_B5$"),
                (Band::Swir2, r"(?i)^SR_B7$"),
            ],
        };
        // Collection 2 Level-2 surface reflectance scaling
        let profile = BandProfile::new(&patterns, 2.75e-5, -0.2)?;
        Ok(Self { source, profile })
    }
}

impl ModisAdapter {
    pub fn new(source: Source) -> MosaicResult<Self> {
        let profile = BandProfile::new(
            &[
                (Band::Red, r"(?i)^sur_refl_b0?1$"),
                (Band::Green, r"(?i)^sur_refl_b0?4$"),
                (Band::Blue, r"(?i)^sur_refl_b0?3$"),
                (Band::Nir, r"(?i)^sur_refl_b0?2$"),
                (Band::Swir1, r"(?i)^sur_refl_b0?6$"),
                (Band::Swir2, r"(?i)^sur_refl_b0?7$"),
            ],
            1e-4,
            0.0,
        )?;
        Ok(Self { source, profile })
    }
}

impl PlanetScopeAdapter {
    pub fn new(source: Source) -> MosaicResult<Self> {
        // 4-band analytic product, no SWIR
        let profile = BandProfile::new(
            &[
                (Band::Red, r"(?i)^b(and_?)?3$"),
                (Band::Green, r"(?i)^b(and_?)?2$"),
                (Band::Blue, r"(?i)^b(and_?)?1$"),
                (Band::Nir, r"(?i)^b(and_?)?4$"),
            ],
            1e-4,
            0.0,
        )?;
        Ok(Self { source, profile })
    }
}

/// Adapter for a source, chosen by family
pub fn adapter_for(source: Source) -> MosaicResult<Arc<dyn SourceAdapter>> {
    let adapter: Arc<dyn SourceAdapter> = match source.family {
        SourceFamily::Sentinel2 => Arc::new(Sentinel2Adapter::new(source)?),
        SourceFamily::Landsat => Arc::new(LandsatAdapter::new(source)?),
        SourceFamily::Modis => Arc::new(ModisAdapter::new(source)?),
        SourceFamily::PlanetScope => Arc::new(PlanetScopeAdapter::new(source)?),
    };
    Ok(adapter)
}
