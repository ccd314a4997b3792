//! Output writers: rasters, COG conversion and provenance files.

use crate::core::provenance::{BatchSummary, ManifestRow, TileProvenance};
use crate::types::{MosaicError, MosaicResult, Raster};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Writes a multi-band raster to disk
pub trait RasterWriter: Send + Sync {
    /// File extension including the dot
    fn extension(&self) -> &str;

    fn write(&self, raster: &Raster, path: &Path) -> MosaicResult<()>;
}

/// Float32 GeoTIFF writer backed by GDAL
#[cfg(feature = "gdal")]
#[derive(Debug, Clone, Default)]
pub struct GdalGeoTiffWriter {
    /// GTiff COMPRESS creation option
    pub compression: Option<String>,
}

#[cfg(feature = "gdal")]
impl RasterWriter for GdalGeoTiffWriter {
    fn extension(&self) -> &str {
        ".tif"
    }

    fn write(&self, raster: &Raster, path: &Path) -> MosaicResult<()> {
        use gdal::raster::RasterCreationOption;
        use gdal::{DriverManager, Metadata};
        use ndarray::Axis;

        log::info!("Saving {}-band raster as GeoTIFF: {}", raster.band_count(), path.display());

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let (width, height) = (raster.cols(), raster.rows());

        let compress = self.compression.clone().unwrap_or_default();
        let options: Vec<RasterCreationOption> = if compress.is_empty() {
            Vec::new()
        } else {
            vec![RasterCreationOption { key: "COMPRESS", value: &compress }]
        };

        let mut dataset = driver.create_with_band_type_with_options::<f32, _>(
            path,
            width as isize,
            height as isize,
            raster.band_count() as isize,
            &options,
        )?;

        dataset.set_geo_transform(&raster.transform.to_gdal())?;
        dataset.set_spatial_ref(&gdal::spatial_ref::SpatialRef::from_epsg(raster.crs.epsg())?)?;

        for (i, band) in raster.bands.iter().enumerate() {
            let mut rasterband = dataset.rasterband(i as isize + 1)?;
            let flat_data: Vec<f32> = raster.data.index_axis(Axis(0), i).iter().cloned().collect();
            let buffer = gdal::raster::Buffer::new((width, height), flat_data);
            rasterband.write((0, 0), (width, height), &buffer)?;
            rasterband.set_no_data_value(Some(raster.nodata as f64))?;
            rasterband.set_description(band.name())?;
        }

        log::info!("✅ GeoTIFF saved successfully");
        Ok(())
    }
}

/// Raster writer available in this build, if any
pub fn default_raster_writer() -> Option<Box<dyn RasterWriter>> {
    #[cfg(feature = "gdal")]
    {
        Some(Box::new(GdalGeoTiffWriter { compression: Some("DEFLATE".to_string()) }))
    }
    #[cfg(not(feature = "gdal"))]
    {
        None
    }
}

/// Converts a validated GeoTIFF into a cloud-optimized GeoTIFF
pub trait CogWriter: Send + Sync {
    fn convert(&self, geotiff: &Path, overview_levels: &[u32]) -> MosaicResult<PathBuf>;
}

/// COG conversion through the GDAL command line tools.
///
/// The requested overview levels are built into the source GeoTIFF with
/// `gdaladdo` first, then `gdal_translate -of COG` copies them as they are.
#[derive(Debug, Clone)]
pub struct CommandCogWriter {
    pub program: String,
    pub overview_program: String,
    /// Overview resampling passed to `gdaladdo -r`
    pub overview_resampling: String,
}

impl Default for CommandCogWriter {
    fn default() -> Self {
        Self {
            program: "gdal_translate".to_string(),
            overview_program: "gdaladdo".to_string(),
            overview_resampling: "average".to_string(),
        }
    }
}

impl CommandCogWriter {
    pub fn cog_path(geotiff: &Path) -> PathBuf {
        let stem = geotiff.file_stem().and_then(|s| s.to_str()).unwrap_or("mosaic");
        geotiff.with_file_name(format!("{}_cog.tif", stem))
    }

    /// `gdaladdo` arguments building exactly the requested decimation factors
    pub fn overview_arguments(
        &self,
        geotiff: &Path,
        overview_levels: &[u32],
    ) -> MosaicResult<Vec<String>> {
        if let Some(bad) = overview_levels.iter().find(|l| **l < 2) {
            return Err(MosaicError::Config(format!("overview level {} must be at least 2", bad)));
        }
        let mut args = vec![
            "-r".to_string(),
            self.overview_resampling.clone(),
            geotiff.display().to_string(),
        ];
        args.extend(overview_levels.iter().map(u32::to_string));
        Ok(args)
    }

    pub fn arguments(geotiff: &Path, output: &Path, overview_levels: &[u32]) -> Vec<String> {
        let mut args = vec![
            "-of".to_string(),
            "COG".to_string(),
            "-co".to_string(),
            "COMPRESS=DEFLATE".to_string(),
            "-co".to_string(),
            "BIGTIFF=IF_SAFER".to_string(),
        ];
        args.push("-co".to_string());
        if overview_levels.is_empty() {
            args.push("OVERVIEWS=NONE".to_string());
        } else {
            args.push("OVERVIEWS=FORCE_USE_EXISTING".to_string());
        }
        args.push(geotiff.display().to_string());
        args.push(output.display().to_string());
        args
    }
}

impl CogWriter for CommandCogWriter {
    fn convert(&self, geotiff: &Path, overview_levels: &[u32]) -> MosaicResult<PathBuf> {
        let output = Self::cog_path(geotiff);
        log::info!("Converting {} to COG with overviews {:?}", geotiff.display(), overview_levels);
        if !overview_levels.is_empty() {
            let args = self.overview_arguments(geotiff, overview_levels)?;
            run_tool(&self.overview_program, &args, geotiff)?;
        }
        run_tool(&self.program, &Self::arguments(geotiff, &output, overview_levels), geotiff)?;
        Ok(output)
    }
}

fn run_tool(program: &str, args: &[String], geotiff: &Path) -> MosaicResult<()> {
    log::debug!("{} {}", program, args.join(" "));
    let status = std::process::Command::new(program).args(args).status()?;
    if !status.success() {
        return Err(MosaicError::Processing(format!(
            "{} exited with {} converting {}",
            program,
            status,
            geotiff.display()
        )));
    }
    Ok(())
}

/// Writes provenance JSON, batch summaries and manifest rows
#[derive(Debug, Clone)]
pub struct ProvenanceWriter {
    root: PathBuf,
}

impl ProvenanceWriter {
    pub fn new<P: AsRef<Path>>(root: P) -> MosaicResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("provenance"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.jsonl")
    }

    pub fn tile_path(&self, tile_id: &str) -> PathBuf {
        self.root.join("provenance").join(format!("{}.json", sanitize_file_name(tile_id)))
    }

    pub fn write_tile(&self, record: &TileProvenance) -> MosaicResult<PathBuf> {
        let path = self.tile_path(&record.tile_id);
        std::fs::write(&path, serde_json::to_string_pretty(record)?)?;
        log::debug!("Provenance for tile {} written to {}", record.tile_id, path.display());
        Ok(path)
    }

    pub fn write_summary(&self, summary: &BatchSummary) -> MosaicResult<PathBuf> {
        let path = self
            .root
            .join(format!("{}_summary.json", sanitize_file_name(&summary.batch_id)));
        std::fs::write(&path, serde_json::to_string_pretty(summary)?)?;
        Ok(path)
    }

    /// Append one JSON line to the manifest
    pub fn append_manifest(&self, row: &ManifestRow) -> MosaicResult<PathBuf> {
        let path = self.manifest_path();
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(row)?)?;
        Ok(path)
    }
}

/// Keep ids usable as file names
pub fn sanitize_file_name(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "unnamed".to_string()
    } else {
        cleaned
    }
}
