use crate::core::projection::{transform_point, GridSpec};
use crate::types::{is_valid_value, CoordinateSystem, GeoTransform, Raster, NODATA};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Keys cubic convolution parameter
const CUBIC_A: f64 = -0.5;

/// Tolerance (in pixels) for treating two grids as aligned
const ALIGN_TOLERANCE: f64 = 1e-6;

/// Resampling kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResamplingMethod {
    Nearest,
    Bilinear,
    /// Cubic convolution with bilinear fallback near invalid pixels
    Cubic,
}

/// Integer (row, col) offset of `grid` inside a source grid, when both share CRS and pixel size
pub fn aligned_offset(
    src_transform: &GeoTransform,
    src_crs: CoordinateSystem,
    grid: &GridSpec,
) -> Option<(isize, isize)> {
    if src_crs != grid.crs {
        return None;
    }
    let gt = &grid.transform;
    let same_size = (src_transform.pixel_width - gt.pixel_width).abs()
        <= ALIGN_TOLERANCE * gt.pixel_width.abs()
        && (src_transform.pixel_height - gt.pixel_height).abs()
            <= ALIGN_TOLERANCE * gt.pixel_height.abs();
    if !same_size || src_transform.rotation_x != 0.0 || src_transform.rotation_y != 0.0 {
        return None;
    }
    let col_off = (gt.top_left_x - src_transform.top_left_x) / src_transform.pixel_width;
    let row_off = (gt.top_left_y - src_transform.top_left_y) / src_transform.pixel_height;
    if (col_off - col_off.round()).abs() > ALIGN_TOLERANCE
        || (row_off - row_off.round()).abs() > ALIGN_TOLERANCE
    {
        return None;
    }
    Some((row_off.round() as isize, col_off.round() as isize))
}

/// Fractional source (row, col) for every target pixel centre
pub fn source_coordinates(
    src_transform: &GeoTransform,
    src_crs: CoordinateSystem,
    grid: &GridSpec,
) -> Array2<[f64; 2]> {
    Array2::from_shape_fn((grid.rows, grid.cols), |(row, col)| {
        let (x, y) = grid.transform.pixel_center(row, col);
        let (sx, sy) = transform_point(grid.crs, src_crs, x, y);
        let (r, c) = src_transform.map_to_pixel(sx, sy);
        [r, c]
    })
}

/// Resample one band onto precomputed source coordinates
pub fn resample_band(
    band: ArrayView2<f32>,
    coords: &Array2<[f64; 2]>,
    method: ResamplingMethod,
) -> Array2<f32> {
    let mut out = Array2::from_elem(coords.dim(), NODATA);

    #[cfg(feature = "parallel")]
    {
        use ndarray::parallel::prelude::*;
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(coords.axis_iter(Axis(0)).into_par_iter())
            .for_each(|(mut line, coord_line)| {
                for (value, rc) in line.iter_mut().zip(coord_line.iter()) {
                    *value = sample(&band, rc[0], rc[1], method).unwrap_or(NODATA);
                }
            });
    }

    #[cfg(not(feature = "parallel"))]
    {
        for (value, rc) in out.iter_mut().zip(coords.iter()) {
            *value = sample(&band, rc[0], rc[1], method).unwrap_or(NODATA);
        }
    }

    out
}

/// Copy one band across aligned grids
pub fn copy_aligned_band(
    band: ArrayView2<f32>,
    offset: (isize, isize),
    shape: (usize, usize),
) -> Array2<f32> {
    let (src_rows, src_cols) = band.dim();
    Array2::from_shape_fn(shape, |(row, col)| {
        let r = row as isize + offset.0;
        let c = col as isize + offset.1;
        if r >= 0 && c >= 0 && (r as usize) < src_rows && (c as usize) < src_cols {
            band[[r as usize, c as usize]]
        } else {
            NODATA
        }
    })
}

/// Reproject every band of a raster onto the target grid
pub fn reproject(src: &Raster, grid: &GridSpec, method: ResamplingMethod) -> Raster {
    let mut data = Array3::from_elem((src.band_count(), grid.rows, grid.cols), NODATA);

    if let Some(offset) = aligned_offset(&src.transform, src.crs, grid) {
        log::debug!("Aligned grids, copying with offset {:?}", offset);
        for (b, mut plane) in data.axis_iter_mut(Axis(0)).enumerate() {
            let band = src.data.index_axis(Axis(0), b);
            plane.assign(&copy_aligned_band(band, offset, (grid.rows, grid.cols)));
        }
    } else {
        let coords = source_coordinates(&src.transform, src.crs, grid);
        for (b, mut plane) in data.axis_iter_mut(Axis(0)).enumerate() {
            let band = src.data.index_axis(Axis(0), b);
            plane.assign(&resample_band(band, &coords, method));
        }
    }

    Raster {
        data,
        bands: src.bands.clone(),
        transform: grid.transform,
        crs: grid.crs,
        nodata: NODATA,
    }
}

fn sample(band: &ArrayView2<f32>, r: f64, c: f64, method: ResamplingMethod) -> Option<f32> {
    let (rows, cols) = band.dim();
    if !(r.is_finite() && c.is_finite()) {
        return None;
    }
    if r < -0.5 || c < -0.5 || r >= rows as f64 - 0.5 || c >= cols as f64 - 0.5 {
        return None;
    }
    match method {
        ResamplingMethod::Nearest => sample_nearest(band, r, c),
        ResamplingMethod::Bilinear => {
            sample_bilinear(band, r, c).or_else(|| sample_nearest(band, r, c))
        }
        ResamplingMethod::Cubic => sample_cubic(band, r, c)
            .or_else(|| sample_bilinear(band, r, c))
            .or_else(|| sample_nearest(band, r, c)),
    }
}

#[inline]
fn clamp_index(i: isize, n: usize) -> usize {
    i.clamp(0, n as isize - 1) as usize
}

fn sample_nearest(band: &ArrayView2<f32>, r: f64, c: f64) -> Option<f32> {
    let (rows, cols) = band.dim();
    let value = band[[
        clamp_index(r.round() as isize, rows),
        clamp_index(c.round() as isize, cols),
    ]];
    is_valid_value(value).then_some(value)
}

fn sample_bilinear(band: &ArrayView2<f32>, r: f64, c: f64) -> Option<f32> {
    let (rows, cols) = band.dim();
    let r0 = r.floor();
    let c0 = c.floor();
    let dr = r - r0;
    let dc = c - c0;
    let (r0, c0) = (r0 as isize, c0 as isize);

    let y1 = clamp_index(r0, rows);
    let y2 = clamp_index(r0 + 1, rows);
    let x1 = clamp_index(c0, cols);
    let x2 = clamp_index(c0 + 1, cols);

    let v11 = band[[y1, x1]];
    let v12 = band[[y2, x1]];
    let v21 = band[[y1, x2]];
    let v22 = band[[y2, x2]];
    if ![v11, v12, v21, v22].iter().all(|v| is_valid_value(*v)) {
        return None;
    }

    let interpolated = v11 as f64 * (1.0 - dc) * (1.0 - dr)
        + v21 as f64 * dc * (1.0 - dr)
        + v12 as f64 * (1.0 - dc) * dr
        + v22 as f64 * dc * dr;
    Some(interpolated as f32)
}

fn cubic_kernel(x: f64) -> f64 {
    let x = x.abs();
    if x <= 1.0 {
        (CUBIC_A + 2.0) * x.powi(3) - (CUBIC_A + 3.0) * x * x + 1.0
    } else if x < 2.0 {
        CUBIC_A * x.powi(3) - 5.0 * CUBIC_A * x * x + 8.0 * CUBIC_A * x - 4.0 * CUBIC_A
    } else {
        0.0
    }
}

fn sample_cubic(band: &ArrayView2<f32>, r: f64, c: f64) -> Option<f32> {
    let (rows, cols) = band.dim();
    let r0 = r.floor();
    let c0 = c.floor();
    let dr = r - r0;
    let dc = c - c0;
    let (r0, c0) = (r0 as isize, c0 as isize);

    let taps = |d: f64| {
        [cubic_kernel(1.0 + d), cubic_kernel(d), cubic_kernel(1.0 - d), cubic_kernel(2.0 - d)]
    };
    let (wr, wc) = (taps(dr), taps(dc));

    let mut acc = 0.0f64;
    for (i, wy) in wr.iter().enumerate() {
        let y = clamp_index(r0 - 1 + i as isize, rows);
        for (j, wx) in wc.iter().enumerate() {
            let x = clamp_index(c0 - 1 + j as isize, cols);
            let v = band[[y, x]];
            if !is_valid_value(v) {
                return None;
            }
            acc += v as f64 * wy * wx;
        }
    }
    Some(acc as f32)
}
