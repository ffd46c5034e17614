//! Tile coordinate math and utilities
//!
//! This module provides functions for converting between geographic coordinates (lat/lng),
//! Web Mercator meters and tile coordinates (x/y/z) of the XYZ slippy-map scheme:
//! origin at the top-left corner, y increasing southward, 2^z tiles per axis.

use std::f64::consts::PI;
use std::fmt;

use crate::{Error, Result};

/// Half the earth's circumference in Web Mercator meters
pub const HALF_EARTH: f64 = 20_037_508.342_789_244;

/// Spherical Web Mercator radius (EPSG:3857)
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Latitude limit of the Web Mercator square
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_6;

/// Deepest zoom level accepted anywhere a zoom enters the crate
pub const MAX_ZOOM: u8 = 30;

/// Guards tile lookups against floating point noise on exact tile edges
const EPSILON: f64 = 1e-14;

/// Shrinks a bbox before looking up its lower-right tile, so that a bbox
/// exactly matching a tile footprint does not spill onto its neighbours
const LL_EPSILON: f64 = 1e-11;

/// Reject zoom levels past [`MAX_ZOOM`].
pub fn check_zoom(zoom: u8) -> Result<u8> {
    if zoom > MAX_ZOOM {
        return Err(Error::Config(format!(
            "Zoom {} is out of range, expected 0..={}",
            zoom, MAX_ZOOM
        )));
    }
    Ok(zoom)
}

/// Tile coordinates: x, y, and zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileCoord {
    /// Create a new tile coordinate
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Number of tiles per axis at this tile's zoom
    pub fn grid_size(&self) -> u64 {
        1u64 << self.z
    }

    /// Get the bounding box of this tile in geographic coordinates (lng/lat)
    pub fn bounds(&self) -> TileBounds {
        let n = 2_f64.powi(self.z as i32);
        let lng_min = (self.x as f64) / n * 360.0 - 180.0;
        let lng_max = (self.x as f64 + 1.0) / n * 360.0 - 180.0;

        let lat_rad = |y: f64| {
            let y_rad = PI * (1.0 - 2.0 * y / n);
            y_rad.sinh().atan().to_degrees()
        };

        let lat_max = lat_rad(self.y as f64);
        let lat_min = lat_rad(self.y as f64 + 1.0);

        TileBounds {
            lng_min,
            lat_min,
            lng_max,
            lat_max,
        }
    }

    /// Get the bounding box of this tile in Web Mercator meters (EPSG:3857)
    pub fn mercator_bounds(&self) -> MercatorBounds {
        let size = 2.0 * HALF_EARTH / 2_f64.powi(self.z as i32);
        let x_min = -HALF_EARTH + self.x as f64 * size;
        let y_max = HALF_EARTH - self.y as f64 * size;

        MercatorBounds {
            x_min,
            y_min: y_max - size,
            x_max: x_min + size,
            y_max,
        }
    }

    /// The tile at offset (dx, dy) on the same zoom, if it lies on the grid
    pub fn offset(&self, dx: i64, dy: i64) -> Option<TileCoord> {
        let n = self.grid_size() as i64;
        let x = self.x as i64 + dx;
        let y = self.y as i64 + dy;

        if (0..n).contains(&x) && (0..n).contains(&y) {
            Some(TileCoord::new(x as u32, y as u32, self.z))
        } else {
            None
        }
    }

    /// The eight compass neighbours, row by row from the upper-left one.
    ///
    /// Neighbours falling off the grid are `None`.
    pub fn neighbours(&self) -> [Option<TileCoord>; 8] {
        [
            self.offset(-1, -1),
            self.offset(0, -1),
            self.offset(1, -1),
            self.offset(-1, 0),
            self.offset(1, 0),
            self.offset(-1, 1),
            self.offset(0, 1),
            self.offset(1, 1),
        ]
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Geographic bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileBounds {
    pub lng_min: f64,
    pub lat_min: f64,
    pub lng_max: f64,
    pub lat_max: f64,
}

impl TileBounds {
    /// Create a new bounding box
    pub fn new(lng_min: f64, lat_min: f64, lng_max: f64, lat_max: f64) -> Self {
        Self {
            lng_min,
            lat_min,
            lng_max,
            lat_max,
        }
    }

    /// Build from a `[west, south, east, north]` array
    pub fn from_array(bounds: [f64; 4]) -> Self {
        Self::new(bounds[0], bounds[1], bounds[2], bounds[3])
    }

    /// Create an empty/invalid bounding box
    pub fn empty() -> Self {
        Self {
            lng_min: f64::INFINITY,
            lat_min: f64::INFINITY,
            lng_max: f64::NEG_INFINITY,
            lat_max: f64::NEG_INFINITY,
        }
    }

    /// Check if this is a valid bounding box
    pub fn is_valid(&self) -> bool {
        self.lng_min <= self.lng_max && self.lat_min <= self.lat_max
    }

    /// Expand this bounding box to include another
    pub fn expand(&mut self, other: &Self) {
        self.lng_min = self.lng_min.min(other.lng_min);
        self.lat_min = self.lat_min.min(other.lat_min);
        self.lng_max = self.lng_max.max(other.lng_max);
        self.lat_max = self.lat_max.max(other.lat_max);
    }

    /// Get the width in degrees
    pub fn width(&self) -> f64 {
        self.lng_max - self.lng_min
    }

    /// Get the height in degrees
    pub fn height(&self) -> f64 {
        self.lat_max - self.lat_min
    }

    /// Geometric center, as (lng, lat)
    pub fn center(&self) -> (f64, f64) {
        (
            (self.lng_min + self.lng_max) / 2.0,
            (self.lat_min + self.lat_max) / 2.0,
        )
    }

    /// `[west, south, east, north]`
    pub fn to_array(&self) -> [f64; 4] {
        [self.lng_min, self.lat_min, self.lng_max, self.lat_max]
    }
}

/// Bounding box in Web Mercator meters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MercatorBounds {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl MercatorBounds {
    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }
}

/// Project a lng/lat position to Web Mercator meters
pub fn lng_lat_to_mercator(lng: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let x = EARTH_RADIUS * lng.to_radians();
    let y = EARTH_RADIUS * (PI * 0.25 + 0.5 * lat.to_radians()).tan().ln();
    (x, y)
}

/// Unproject Web Mercator meters to a lng/lat position
pub fn mercator_to_lng_lat(x: f64, y: f64) -> (f64, f64) {
    let lng = (x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - PI * 0.5).to_degrees();
    (lng, lat)
}

/// Convert longitude/latitude to tile coordinates at a given zoom level
///
/// Uses Web Mercator projection (EPSG:3857). Positions on the grid edges
/// (or beyond) are clamped to the first/last tile.
///
/// # Arguments
///
/// * `lng` - Longitude in degrees (-180 to 180)
/// * `lat` - Latitude in degrees (-85.0511 to 85.0511, Web Mercator bounds)
/// * `zoom` - Zoom level (0-30)
///
/// # Returns
///
/// TileCoord with x, y, and zoom
pub fn lng_lat_to_tile(lng: f64, lat: f64, zoom: u8) -> TileCoord {
    let n = 2_f64.powi(zoom as i32);
    let last = (1u64 << zoom) as f64 - 1.0;

    let x = (lng + 180.0) / 360.0;

    let sin = lat.to_radians().sin();
    let y = 0.5 - 0.25 * ((1.0 + sin) / (1.0 - sin)).ln() / PI;

    let to_index = |fraction: f64| {
        if fraction.is_nan() || fraction <= 0.0 {
            0.0
        } else if fraction >= 1.0 {
            last
        } else {
            ((fraction + EPSILON) * n).floor().min(last)
        }
    };

    TileCoord::new(to_index(x) as u32, to_index(y) as u32, zoom)
}

/// Interpolate a position inside a tile, `dx`/`dy` being fractions of its width/height.
///
/// `dy` grows northward from the tile's southern edge. Returns (lng, lat).
pub fn pixel_to_location(tile: &TileCoord, dx: f64, dy: f64) -> Result<(f64, f64)> {
    if !(0.0..=1.0).contains(&dx) || !(0.0..=1.0).contains(&dy) {
        return Err(Error::Config(format!(
            "pixel offsets must be in [0, 1], got ({}, {})",
            dx, dy
        )));
    }

    let bounds = tile.bounds();
    let lerp = |a: f64, b: f64, c: f64| a + c * (b - a);

    Ok((
        lerp(bounds.lng_min, bounds.lng_max, dx),
        lerp(bounds.lat_min, bounds.lat_max, dy),
    ))
}

/// Get all tiles that intersect a geographic bounding box at a given zoom level
///
/// Latitudes are clamped to the Web Mercator limits. A bbox whose west edge is
/// east of its east edge is taken as crossing the antimeridian.
///
/// # Arguments
///
/// * `bbox` - Geographic bounding box
/// * `zoom` - Zoom level
///
/// # Returns
///
/// Iterator of TileCoord that intersect the bbox
pub fn tiles_for_bbox(bbox: &TileBounds, zoom: u8) -> impl Iterator<Item = TileCoord> {
    let spans = if bbox.lng_min > bbox.lng_max {
        vec![
            TileBounds::new(-180.0, bbox.lat_min, bbox.lng_max, bbox.lat_max),
            TileBounds::new(bbox.lng_min, bbox.lat_min, 180.0, bbox.lat_max),
        ]
    } else {
        vec![*bbox]
    };

    spans.into_iter().flat_map(move |span| {
        let west = span.lng_min.max(-180.0);
        let east = span.lng_max.min(180.0);
        let south = span.lat_min.max(-MAX_LATITUDE);
        let north = span.lat_max.min(MAX_LATITUDE);

        // Get corner tiles
        let min_tile = lng_lat_to_tile(west, north, zoom); // Note: north for min_y
        let max_tile = lng_lat_to_tile(
            (east - LL_EPSILON).max(west),
            (south + LL_EPSILON).min(north),
            zoom,
        ); // Note: south for max_y

        // Iterate over all tiles in the range
        (min_tile.y..=max_tile.y).flat_map(move |y| {
            (min_tile.x..=max_tile.x).map(move |x| TileCoord::new(x, y, zoom))
        })
    })
}
