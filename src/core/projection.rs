//! WGS84 / UTM projection helpers and output grid construction.
//!
//! Transverse Mercator series after Snyder (1987), "Map Projections: A Working
//! Manual", USGS Professional Paper 1395, pp. 61-64.

use crate::types::{
    BoundingBox, CoordinateSystem, GeoTransform, MosaicError, MosaicResult, Raster, TileGeometry,
};
use ndarray::Array2;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const UTM_K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// Points sampled along each edge when projecting an extent
const EDGE_SAMPLES: usize = 16;

/// UTM zone whose central meridian is nearest to the given point
pub fn utm_zone_for(lon: f64, lat: f64) -> CoordinateSystem {
    let wrapped = ((lon + 180.0).rem_euclid(360.0)) - 180.0;
    let zone = (((wrapped + 180.0) / 6.0).floor() as i32 + 1).clamp(1, 60) as u8;
    CoordinateSystem::Utm { zone, north: lat >= 0.0 }
}

fn central_meridian(zone: u8) -> f64 {
    (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
}

/// Geographic (lon, lat) degrees to UTM (easting, northing) meters
pub fn lonlat_to_utm(lon: f64, lat: f64, zone: u8, north: bool) -> (f64, f64) {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let ep2 = e2 / (1.0 - e2);
    let e4 = e2 * e2;
    let e6 = e4 * e2;

    let phi = lat.to_radians();
    let lam = lon.to_radians();
    let lam0 = central_meridian(zone).to_radians();

    let sin_phi = phi.sin();
    let cos_phi = phi.cos();
    let tan_phi = phi.tan();

    let n = WGS84_A / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = tan_phi * tan_phi;
    let c = ep2 * cos_phi * cos_phi;
    let a = cos_phi * (lam - lam0);

    let m = WGS84_A
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin());

    let x = UTM_K0
        * n
        * (a + (1.0 - t + c) * a.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0)
        + FALSE_EASTING;

    let mut y = UTM_K0
        * (m + n
            * tan_phi
            * (a * a / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));

    if !north {
        y += FALSE_NORTHING_SOUTH;
    }
    (x, y)
}

/// UTM (easting, northing) meters to geographic (lon, lat) degrees
pub fn utm_to_lonlat(x: f64, y: f64, zone: u8, north: bool) -> (f64, f64) {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let ep2 = e2 / (1.0 - e2);
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    let sqrt_1me2 = (1.0 - e2).sqrt();
    let e1 = (1.0 - sqrt_1me2) / (1.0 + sqrt_1me2);

    let x = x - FALSE_EASTING;
    let y = if north { y } else { y - FALSE_NORTHING_SOUTH };

    let m = y / UTM_K0;
    let mu = m / (WGS84_A * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let sin_phi1 = phi1.sin();
    let cos_phi1 = phi1.cos();
    let tan_phi1 = phi1.tan();

    let n1 = WGS84_A / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
    let t1 = tan_phi1 * tan_phi1;
    let c1 = ep2 * cos_phi1 * cos_phi1;
    let r1 = WGS84_A * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
    let d = x / (n1 * UTM_K0);

    let phi = phi1
        - (n1 * tan_phi1 / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);

    let lam = central_meridian(zone).to_radians()
        + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1)
                * d.powi(5)
                / 120.0)
            / cos_phi1;

    (lam.to_degrees(), phi.to_degrees())
}

/// Transform a point between the supported coordinate systems
pub fn transform_point(from: CoordinateSystem, to: CoordinateSystem, x: f64, y: f64) -> (f64, f64) {
    if from == to {
        return (x, y);
    }
    let (lon, lat) = match from {
        CoordinateSystem::Geographic => (x, y),
        CoordinateSystem::Utm { zone, north } => utm_to_lonlat(x, y, zone, north),
    };
    match to {
        CoordinateSystem::Geographic => (lon, lat),
        CoordinateSystem::Utm { zone, north } => lonlat_to_utm(lon, lat, zone, north),
    }
}

/// Project an extent (min_x, min_y, max_x, max_y) by sampling its edges
pub fn project_extent(
    extent: (f64, f64, f64, f64),
    from: CoordinateSystem,
    to: CoordinateSystem,
) -> (f64, f64, f64, f64) {
    if from == to {
        return extent;
    }
    let (x0, y0, x1, y1) = extent;
    let mut out = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for i in 0..=EDGE_SAMPLES {
        let f = i as f64 / EDGE_SAMPLES as f64;
        let xs = x0 + f * (x1 - x0);
        let ys = y0 + f * (y1 - y0);
        for (x, y) in [(xs, y0), (xs, y1), (x0, ys), (x1, ys)] {
            let (px, py) = transform_point(from, to, x, y);
            out.0 = out.0.min(px);
            out.1 = out.1.min(py);
            out.2 = out.2.max(px);
            out.3 = out.3.max(py);
        }
    }
    out
}

/// Output grid: north-up transform, shape and coordinate system
#[derive(Debug, Clone, PartialEq)]
pub struct GridSpec {
    pub transform: GeoTransform,
    pub rows: usize,
    pub cols: usize,
    pub crs: CoordinateSystem,
}

impl GridSpec {
    /// Grid covering `extent` at `resolution`, snapped outward to whole pixels
    pub fn covering(
        extent: (f64, f64, f64, f64),
        resolution: f64,
        crs: CoordinateSystem,
    ) -> MosaicResult<Self> {
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(MosaicError::Config(format!("invalid grid resolution {}", resolution)));
        }
        let (min_x, min_y, max_x, max_y) = extent;
        if !(max_x > min_x && max_y > min_y) {
            return Err(MosaicError::Processing(format!(
                "degenerate grid extent {:?}",
                extent
            )));
        }
        let snap_min_x = (min_x / resolution).floor() * resolution;
        let snap_max_y = (max_y / resolution).ceil() * resolution;
        let cols = ((max_x - snap_min_x) / resolution).ceil().max(1.0) as usize;
        let rows = ((snap_max_y - min_y) / resolution).ceil().max(1.0) as usize;

        Ok(Self {
            transform: GeoTransform::north_up(snap_min_x, snap_max_y, resolution),
            rows,
            cols,
            crs,
        })
    }

    /// UTM grid for a tile: zone nearest the centroid at the target resolution
    pub fn for_tile(geometry: &TileGeometry, resolution_m: f64) -> MosaicResult<Self> {
        let (clon, clat) = geometry.centroid();
        let crs = utm_zone_for(clon, clat);
        let bbox = geometry.bounds();
        let extent = project_extent(
            (bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat),
            CoordinateSystem::Geographic,
            crs,
        );
        let grid = Self::covering(extent, resolution_m, crs)?;
        log::debug!(
            "Tile grid: {}x{} pixels at {:.1}m in EPSG:{}",
            grid.cols,
            grid.rows,
            resolution_m,
            crs.epsg()
        );
        Ok(grid)
    }

    pub fn from_raster(raster: &Raster) -> Self {
        Self {
            transform: raster.transform,
            rows: raster.rows(),
            cols: raster.cols(),
            crs: raster.crs,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.rows * self.cols
    }

    pub fn resolution(&self) -> f64 {
        self.transform.pixel_width.abs()
    }

    pub fn extent(&self) -> (f64, f64, f64, f64) {
        let t = &self.transform;
        let x1 = t.top_left_x + self.cols as f64 * t.pixel_width;
        let y1 = t.top_left_y + self.rows as f64 * t.pixel_height;
        (
            t.top_left_x.min(x1),
            t.top_left_y.min(y1),
            t.top_left_x.max(x1),
            t.top_left_y.max(y1),
        )
    }

    /// Geographic bounds of the grid
    pub fn lonlat_bounds(&self) -> BoundingBox {
        let (x0, y0, x1, y1) =
            project_extent(self.extent(), self.crs, CoordinateSystem::Geographic);
        BoundingBox::new(x0, y0, x1, y1)
    }

    /// Pixels whose centre falls inside the tile geometry
    pub fn clip_mask(&self, geometry: &TileGeometry) -> Array2<bool> {
        Array2::from_shape_fn((self.rows, self.cols), |(row, col)| {
            let (x, y) = self.transform.pixel_center(row, col);
            let (lon, lat) = transform_point(self.crs, CoordinateSystem::Geographic, x, y);
            geometry.contains(lon, lat)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_utm_zone_selection() {
        assert_eq!(utm_zone_for(15.0, 52.0), CoordinateSystem::Utm { zone: 33, north: true });
        assert_eq!(utm_zone_for(-122.4, 37.8), CoordinateSystem::Utm { zone: 10, north: true });
        assert_eq!(utm_zone_for(-70.6, -33.4), CoordinateSystem::Utm { zone: 19, north: false });
        assert_eq!(utm_zone_for(180.0, 10.0), CoordinateSystem::Utm { zone: 1, north: true });
    }

    #[test]
    fn test_central_meridian_maps_to_false_easting() {
        let (x, y) = lonlat_to_utm(15.0, 0.0, 33, true);
        assert_abs_diff_eq!(x, 500_000.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_known_utm_coordinate() {
        // Berlin (13.4050E, 52.5200N) in UTM 33N
        let (x, y) = lonlat_to_utm(13.405, 52.52, 33, true);
        assert_abs_diff_eq!(x, 391_779.0, epsilon = 5.0);
        assert_abs_diff_eq!(y, 5_820_072.0, epsilon = 5.0);
    }

    #[test]
    fn test_forward_inverse_round_trip() {
        for &(lon, lat) in &[(13.4, 52.5), (-70.6, -33.4), (2.9, 0.1), (-119.0, 64.0)] {
            if let CoordinateSystem::Utm { zone, north } = utm_zone_for(lon, lat) {
                let (x, y) = lonlat_to_utm(lon, lat, zone, north);
                let (lon2, lat2) = utm_to_lonlat(x, y, zone, north);
                assert_abs_diff_eq!(lon, lon2, epsilon = 1e-6);
                assert_abs_diff_eq!(lat, lat2, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_tile_grid_is_snapped_and_clipped() {
        let geometry = TileGeometry::Rectangle(BoundingBox::new(13.30, 52.45, 13.32, 52.47));
        let grid = GridSpec::for_tile(&geometry, 30.0).unwrap();
        assert_eq!(grid.crs, CoordinateSystem::Utm { zone: 33, north: true });
        assert_abs_diff_eq!(grid.transform.top_left_x % 30.0, 0.0, epsilon = 1e-6);
        assert!(grid.cols > 40 && grid.cols < 60);
        assert!(grid.rows > 70 && grid.rows < 90);

        let mask = grid.clip_mask(&geometry);
        let inside = mask.iter().filter(|v| **v).count();
        assert!(inside as f64 > 0.8 * grid.pixel_count() as f64);
    }

    #[test]
    fn test_invalid_resolution_is_rejected() {
        let geometry = TileGeometry::Rectangle(BoundingBox::new(0.0, 0.0, 0.1, 0.1));
        assert!(GridSpec::for_tile(&geometry, 0.0).is_err());
        assert!(GridSpec::for_tile(&geometry, f64::NAN).is_err());
    }
}
