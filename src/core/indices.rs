//! Spectral indices derived from the merged reflectance raster

use crate::types::{is_valid_value, Band, MosaicError, MosaicResult, Raster, NODATA};
use ndarray::{Array2, Array3, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Centre wavelengths (nm) used by the floating algae index baseline
const FAI_RED_NM: f32 = 665.0;
const FAI_NIR_NM: f32 = 842.0;
const FAI_SWIR_NM: f32 = 1610.0;

/// Index derivation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Indices to derive, in output order
    pub indices: Vec<Band>,
    /// Smallest denominator magnitude accepted
    pub epsilon: f32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            indices: vec![
                Band::Ndvi,
                Band::Ndwi,
                Band::Mndwi,
                Band::Evi,
                Band::Savi,
                Band::Fai,
                Band::Avi,
            ],
            epsilon: 1e-6,
        }
    }
}

/// Reflectance bands an index reads, in the order `index_value` expects them.
/// Empty for reflectance bands.
pub fn required_bands(index: Band) -> &'static [Band] {
    match index {
        Band::Ndvi | Band::Savi => &[Band::Nir, Band::Red],
        Band::Ndwi => &[Band::Green, Band::Nir],
        Band::Mndwi => &[Band::Green, Band::Swir1],
        Band::Evi => &[Band::Nir, Band::Red, Band::Blue],
        Band::Fai => &[Band::Red, Band::Nir, Band::Swir1],
        Band::Avi => &[Band::Nir, Band::Red, Band::Green],
        _ => &[],
    }
}

#[inline]
fn ratio(num: f32, den: f32, eps: f32) -> Option<f32> {
    if !den.is_finite() || den.abs() <= eps {
        return None;
    }
    let v = num / den;
    v.is_finite().then_some(v)
}

#[inline]
fn normalized_difference(a: f32, b: f32, eps: f32) -> Option<f32> {
    ratio(a - b, a + b, eps)
}

/// Index value for one pixel, `None` when any input is invalid or the denominator degenerates
pub fn index_value(index: Band, values: &[f32], eps: f32) -> Option<f32> {
    if values.iter().any(|v| !is_valid_value(*v)) {
        return None;
    }
    let value = match (index, values) {
        (Band::Ndvi, [n, r]) => normalized_difference(*n, *r, eps),
        (Band::Ndwi, [g, n]) | (Band::Mndwi, [g, n]) => normalized_difference(*g, *n, eps),
        (Band::Evi, [n, r, b]) => ratio(2.5 * (n - r), n + 6.0 * r - 7.5 * b + 1.0, eps),
        (Band::Savi, [n, r]) => ratio(1.5 * (n - r), n + r + 0.5, eps),
        (Band::Fai, [r, n, s]) => {
            let baseline = r + (s - r) * (FAI_NIR_NM - FAI_RED_NM) / (FAI_SWIR_NM - FAI_RED_NM);
            Some(n - baseline)
        }
        (Band::Avi, [n, r, g]) => {
            let ndvi = normalized_difference(*n, *r, eps)?;
            let ndwi = normalized_difference(*g, *n, eps)?;
            Some(0.5 * (ndvi + ndwi))
        }
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

/// Derives index bands and appends them to a raster
#[derive(Debug, Clone, Default)]
pub struct IndexCalculator {
    config: IndexConfig,
}

impl IndexCalculator {
    pub fn new(config: IndexConfig) -> Self {
        Self { config }
    }

    /// One index plane; nodata wherever the inputs do not support a value
    pub fn compute_index(&self, raster: &Raster, index: Band) -> MosaicResult<Array2<f32>> {
        if !index.is_index() {
            return Err(MosaicError::Processing(format!("{} is not a derived index", index)));
        }
        let required = required_bands(index);
        if !raster.has_bands(required) {
            return Err(MosaicError::BandSelection(format!(
                "{} needs bands {:?}, raster has {:?}",
                index, required, raster.bands
            )));
        }
        let inputs: Vec<ArrayView2<f32>> =
            required.iter().filter_map(|b| raster.band(*b)).collect();

        let eps = self.config.epsilon;
        let mut out = Array2::from_elem((raster.rows(), raster.cols()), NODATA);
        let fill = |(row, col): (usize, usize), value: &mut f32| {
            let mut px = [0f32; 3];
            for (slot, view) in px.iter_mut().zip(inputs.iter()) {
                *slot = view[[row, col]];
            }
            *value = index_value(index, &px[..inputs.len()], eps).unwrap_or(NODATA);
        };

        #[cfg(feature = "parallel")]
        Zip::indexed(&mut out).par_for_each(fill);

        #[cfg(not(feature = "parallel"))]
        Zip::indexed(&mut out).for_each(fill);

        Ok(out)
    }

    /// Append every configured index the raster can support
    pub fn apply(&self, raster: &Raster) -> MosaicResult<Raster> {
        let mut planes: Vec<(Band, Array2<f32>)> = Vec::new();
        for index in &self.config.indices {
            if !index.is_index() {
                log::warn!("Skipping {}: not a derived index", index);
                continue;
            }
            let missing: Vec<Band> = required_bands(*index)
                .iter()
                .copied()
                .filter(|b| raster.valid_fraction(*b) == 0.0)
                .collect();
            if !missing.is_empty() {
                log::info!("Skipping {}: no valid data in {:?}", index, missing);
                continue;
            }
            planes.push((*index, self.compute_index(raster, *index)?));
        }

        let kept: Vec<usize> = (0..raster.band_count())
            .filter(|i| !planes.iter().any(|(b, _)| *b == raster.bands[*i]))
            .collect();
        let shape = (kept.len() + planes.len(), raster.rows(), raster.cols());
        let mut data = Array3::from_elem(shape, NODATA);
        let mut bands = Vec::with_capacity(kept.len() + planes.len());
        for (slot, i) in kept.iter().enumerate() {
            data.index_axis_mut(Axis(0), slot).assign(&raster.data.index_axis(Axis(0), *i));
            bands.push(raster.bands[*i]);
        }
        for (offset, (band, plane)) in planes.into_iter().enumerate() {
            data.index_axis_mut(Axis(0), kept.len() + offset).assign(&plane);
            bands.push(band);
        }

        log::info!("📈 Derived {} index band(s)", bands.len() - kept.len());
        Raster::new(data, bands, raster.transform, raster.crs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CoordinateSystem, GeoTransform};
    use approx::assert_abs_diff_eq;

    fn raster(values: [f32; 6]) -> Raster {
        let mut data = Array3::zeros((6, 4, 4));
        for (b, v) in values.iter().enumerate() {
            data.index_axis_mut(Axis(0), b).fill(*v);
        }
        Raster::new(
            data,
            Band::STANDARD.to_vec(),
            GeoTransform::north_up(500_000.0, 4_000_000.0, 10.0),
            CoordinateSystem::Utm { zone: 31, north: true },
        )
        .unwrap()
    }

    #[test]
    fn test_known_index_values() {
        let eps = 1e-6;
        let cases: [(Band, &[f32], f32); 5] = [
            (Band::Ndvi, &[0.5, 0.1], 0.666_667),
            (Band::Ndwi, &[0.2, 0.5], -0.428_571),
            (Band::Evi, &[0.5, 0.1, 0.05], 0.579_710),
            (Band::Savi, &[0.5, 0.1], 0.545_455),
            (Band::Fai, &[0.1, 0.5, 0.2], 0.381_270),
        ];
        for (index, inputs, expected) in cases {
            assert_abs_diff_eq!(index_value(index, inputs, eps).unwrap(), expected, epsilon = 1e-5);
        }
        let avi = index_value(Band::Avi, &[0.5, 0.1, 0.2], eps).unwrap();
        assert_abs_diff_eq!(avi, 0.5 * (0.666_667 - 0.428_571), epsilon = 1e-5);
    }

    #[test]
    fn test_degenerate_denominators_give_nodata() {
        let eps = 1e-6;
        // n + r == 0
        assert_eq!(index_value(Band::Ndvi, &[0.1, -0.1], eps), None);
        // zero and sentinel inputs are invalid
        assert_eq!(index_value(Band::Ndvi, &[0.0, 0.3], eps), None);
        assert_eq!(index_value(Band::Savi, &[NODATA, 0.3], eps), None);
        assert_eq!(index_value(Band::Evi, &[f32::NAN, 0.1, 0.1], eps), None);
        // EVI denominator n + 6r - 7.5b + 1 == 0
        assert_eq!(index_value(Band::Evi, &[0.5, 0.25, 0.4], eps), None);
    }

    #[test]
    fn test_all_zero_bands_never_produce_nan() {
        let calculator = IndexCalculator::default();
        let zero = raster([0.0; 6]);
        for index in IndexConfig::default().indices {
            let plane = calculator.compute_index(&zero, index).unwrap();
            assert!(plane.iter().all(|v| *v == NODATA), "{} leaked a value", index);
        }
        // skipped entirely when inputs carry no valid data
        let out = calculator.apply(&zero).unwrap();
        assert_eq!(out.band_count(), 6);
    }

    #[test]
    fn test_only_index_bands_can_be_computed() {
        assert!(Band::Fai.is_index());
        assert!(!Band::Swir1.is_index());
        assert!(required_bands(Band::Red).is_empty());

        let calculator = IndexCalculator::default();
        let r = raster([0.1, 0.2, 0.05, 0.5, 0.3, 0.2]);
        assert!(matches!(calculator.compute_index(&r, Band::Red), Err(MosaicError::Processing(_))));

        let mut config = IndexConfig::default();
        config.indices = vec![Band::Nir, Band::Ndvi];
        let out = IndexCalculator::new(config).apply(&r).unwrap();
        assert_eq!(out.bands[6..], [Band::Ndvi]);
    }

    #[test]
    fn test_missing_input_band_is_a_band_selection_error() {
        let mut r = raster([0.1, 0.2, 0.05, 0.5, 0.3, 0.2]);
        r.bands.truncate(4);
        r.data = r.data.slice(ndarray::s![0..4, .., ..]).to_owned();
        let err = IndexCalculator::default().compute_index(&r, Band::Mndwi).unwrap_err();
        assert!(matches!(err, MosaicError::BandSelection(_)), "{:?}", err);
        assert!(IndexCalculator::default().compute_index(&r, Band::Ndvi).is_ok());
    }

    #[test]
    fn test_apply_appends_supported_indices_only() {
        // no SWIR: MNDWI and FAI are skipped
        let r = raster([0.1, 0.2, 0.05, 0.5, NODATA, NODATA]);
        let out = IndexCalculator::default().apply(&r).unwrap();
        assert_eq!(
            out.bands[6..],
            [Band::Ndvi, Band::Ndwi, Band::Evi, Band::Savi, Band::Avi]
        );
        let ndvi = out.band(Band::Ndvi).unwrap();
        assert_abs_diff_eq!(ndvi[[2, 2]], 0.666_667, epsilon = 1e-5);
        assert!(out.data.iter().all(|v| v.is_finite()));
        // re-applying replaces rather than duplicates
        let again = IndexCalculator::default().apply(&out).unwrap();
        assert_eq!(again.band_count(), out.band_count());
    }
}
