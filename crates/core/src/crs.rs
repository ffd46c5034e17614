//! Coordinate Reference System utilities.
//!
//! Everything in this crate ends up on the Web Mercator tile grid, so two
//! systems are handled inline:
//!
//! - **WGS84 (EPSG:4326)**: geographic lng/lat in degrees. Feature fragments,
//!   coverage extents and tile footprints are expressed in it.
//! - **Web Mercator (EPSG:3857)**: meters. Used for rasterization, metric
//!   buffering and tile pixel transforms.
//!
//! Other systems (UTM zones, Lambert-93, ETRS89-LAEA) go through `proj4rs`.
//!
//! Bounds arrays are `[min_x, min_y, max_x, max_y]` = `[west, south, east, north]`.

use geo::{Coord, Geometry, MapCoords};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::tile::{lng_lat_to_mercator, mercator_to_lng_lat};
use crate::{Error, Result};

/// WGS84 geographic coordinates (lng/lat in degrees)
pub const EPSG_WGS84: u32 = 4326;

/// Web Mercator (spherical Mercator, meters)
pub const EPSG_WEB_MERCATOR: u32 = 3857;

/// Points sampled along each bbox edge by [`CoordTransformer::transform_bounds`]
pub const DENSIFY_POINTS: usize = 21;

const WGS84_PROJ: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// Resolve a CRS name, as found in a GeoJSON `crs.properties.name` member.
///
/// Accepts `EPSG:2154`, `urn:ogc:def:crs:EPSG::2154`, the `CRS84` and
/// `900913` aliases, or a bare numeric code.
pub fn srid_from_name(name: &str) -> Option<u32> {
    let code = name.rsplit(':').next()?.trim();

    match code {
        "CRS84" | "crs84" => Some(EPSG_WGS84),
        "900913" | "3785" => Some(EPSG_WEB_MERCATOR),
        other => other.parse().ok(),
    }
}

/// Proj string for the EPSG codes this crate knows how to project.
pub fn proj_string(epsg: u32) -> Option<String> {
    match epsg {
        4326 | 4258 => Some(WGS84_PROJ.to_string()),
        3857 => Some(
            "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
                .to_string(),
        ),
        2154 => Some(
            "+proj=lcc +lat_0=46.5 +lon_0=3 +lat_1=49 +lat_2=44 +x_0=700000 +y_0=6600000 \
             +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs"
                .to_string(),
        ),
        3035 => Some(
            "+proj=laea +lat_0=52 +lon_0=10 +x_0=4321000 +y_0=3210000 +ellps=GRS80 \
             +towgs84=0,0,0,0,0,0,0 +units=m +no_defs"
                .to_string(),
        ),
        // WGS84 / UTM north and south
        32601..=32660 => Some(format!(
            "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs",
            epsg - 32600
        )),
        32701..=32760 => Some(format!(
            "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
            epsg - 32700
        )),
        // ETRS89 / UTM
        25828..=25838 => Some(format!(
            "+proj=utm +zone={} +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs",
            epsg - 25800
        )),
        _ => None,
    }
}

/// Check if an EPSG code is a geographic (degree based) system
pub fn is_geographic(epsg: u32) -> bool {
    matches!(epsg, 4326 | 4258)
}

/// One end of a transformation, always pivoting through WGS84 lng/lat.
enum Projection {
    Geographic,
    WebMercator,
    Proj { lonlat: Box<Proj>, proj: Box<Proj> },
}

impl Projection {
    fn from_epsg(epsg: u32) -> Result<Self> {
        if is_geographic(epsg) {
            return Ok(Projection::Geographic);
        }
        if epsg == EPSG_WEB_MERCATOR {
            return Ok(Projection::WebMercator);
        }

        let definition = proj_string(epsg).ok_or(Error::UnsupportedCrs(epsg))?;
        let proj = Proj::from_proj_string(&definition)
            .map_err(|e| Error::Projection(format!("Invalid projection EPSG:{}: {:?}", epsg, e)))?;
        let lonlat = Proj::from_proj_string(WGS84_PROJ)
            .map_err(|e| Error::Projection(format!("Invalid WGS84 projection: {:?}", e)))?;

        Ok(Projection::Proj {
            lonlat: Box::new(lonlat),
            proj: Box::new(proj),
        })
    }

    fn to_lng_lat(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        match self {
            Projection::Geographic => Ok((x, y)),
            Projection::WebMercator => Ok(mercator_to_lng_lat(x, y)),
            Projection::Proj { lonlat, proj } => {
                let mut point = (x, y, 0.0);
                transform(proj, lonlat, &mut point)
                    .map_err(|e| Error::Projection(format!("Transform failed: {:?}", e)))?;
                Ok((point.0.to_degrees(), point.1.to_degrees()))
            }
        }
    }

    fn from_lng_lat(&self, lng: f64, lat: f64) -> Result<(f64, f64)> {
        match self {
            Projection::Geographic => Ok((lng, lat)),
            Projection::WebMercator => Ok(lng_lat_to_mercator(lng, lat)),
            Projection::Proj { lonlat, proj } => {
                let mut point = (lng.to_radians(), lat.to_radians(), 0.0);
                transform(lonlat, proj, &mut point)
                    .map_err(|e| Error::Projection(format!("Transform failed: {:?}", e)))?;
                Ok((point.0, point.1))
            }
        }
    }
}

/// Coordinate transformer between two EPSG codes.
///
/// Not `Sync`: build one per worker rather than sharing it.
pub struct CoordTransformer {
    source_epsg: u32,
    target_epsg: u32,
    source: Projection,
    target: Projection,
}

impl std::fmt::Debug for CoordTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordTransformer")
            .field("source_epsg", &self.source_epsg)
            .field("target_epsg", &self.target_epsg)
            .finish_non_exhaustive()
    }
}

impl CoordTransformer {
    /// Create a transformer between any two supported EPSG codes.
    ///
    /// # Errors
    /// `Error::UnsupportedCrs` if either code is unknown.
    pub fn new(source_epsg: u32, target_epsg: u32) -> Result<Self> {
        Ok(Self {
            source_epsg,
            target_epsg,
            source: Projection::from_epsg(source_epsg)?,
            target: Projection::from_epsg(target_epsg)?,
        })
    }

    /// Transformer from `source_epsg` to WGS84 lng/lat
    pub fn to_lng_lat(source_epsg: u32) -> Result<Self> {
        Self::new(source_epsg, EPSG_WGS84)
    }

    pub fn source_epsg(&self) -> u32 {
        self.source_epsg
    }

    pub fn target_epsg(&self) -> u32 {
        self.target_epsg
    }

    /// Check if the transformation is a no-op
    pub fn is_identity(&self) -> bool {
        self.source_epsg == self.target_epsg
            || (is_geographic(self.source_epsg) && is_geographic(self.target_epsg))
    }

    /// Transform one position from source CRS to target CRS.
    ///
    /// # Errors
    /// `Error::Projection` when the position can't be represented in the target CRS.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        if self.is_identity() {
            return Ok((x, y));
        }

        let (lng, lat) = self.source.to_lng_lat(x, y)?;
        let (out_x, out_y) = self.target.from_lng_lat(lng, lat)?;

        if !out_x.is_finite() || !out_y.is_finite() {
            return Err(Error::Projection(format!(
                "({}, {}) has no finite image from EPSG:{} to EPSG:{}",
                x, y, self.source_epsg, self.target_epsg
            )));
        }

        Ok((out_x, out_y))
    }

    /// Transform a bbox, densifying each edge so curved edges stay enclosed.
    pub fn transform_bounds(&self, bounds: [f64; 4]) -> Result<[f64; 4]> {
        if self.is_identity() {
            return Ok(bounds);
        }

        let [west, south, east, north] = bounds;
        let mut out = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];

        let steps = (DENSIFY_POINTS - 1) as f64;
        for i in 0..DENSIFY_POINTS {
            let t = i as f64 / steps;
            let x = west + (east - west) * t;
            let y = south + (north - south) * t;

            for (px, py) in [(x, south), (x, north), (west, y), (east, y)] {
                let (tx, ty) = self.transform(px, py)?;
                out[0] = out[0].min(tx);
                out[1] = out[1].min(ty);
                out[2] = out[2].max(tx);
                out[3] = out[3].max(ty);
            }
        }

        Ok(out)
    }

    /// Transform every coordinate of a geometry.
    pub fn transform_geometry(&self, geometry: &Geometry<f64>) -> Result<Geometry<f64>> {
        if self.is_identity() {
            return Ok(geometry.clone());
        }

        geometry.try_map_coords(|coord: Coord<f64>| {
            let (x, y) = self.transform(coord.x, coord.y)?;
            Ok(Coord { x, y })
        })
    }
}
