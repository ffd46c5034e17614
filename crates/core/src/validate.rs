//! Polygon validation ahead of burning.
//!
//! Only polygonal geometry is burned into the tile grid. Before a polygon is
//! indexed it must have closed rings with enough points, finite coordinates
//! and a non-zero area. A negative buffer, for instance, can shrink a polygon
//! to nothing, and reprojection can produce infinities near the poles.
//!
//! Degenerate polygons are dropped, never repaired.
//!
//! # Usage
//!
//! ```
//! use neo_tiles_core::validate::{polygon_parts, is_valid_polygon};
//! use geo::{polygon, Geometry};
//!
//! let square = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)];
//! let parts = polygon_parts(&Geometry::Polygon(square));
//! assert!(parts.iter().all(is_valid_polygon));
//! ```

use std::fmt;

use geo::{Area, Geometry, LineString, Polygon};

/// Minimum number of points for a valid polygon ring (3 unique + closing = 4)
pub const MIN_POLYGON_RING_POINTS: usize = 4;

/// Polygons with an area below this are considered degenerate
pub const MIN_POLYGON_AREA: f64 = 1e-20;

/// Result of polygon validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// Polygon can be burned
    Valid,
    /// Polygon is degenerate and should be dropped
    Invalid(InvalidReason),
}

/// Reason why a polygon is invalid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// Polygon ring has fewer than 4 points
    PolygonTooFewPoints {
        ring_index: usize,
        point_count: usize,
    },
    /// A coordinate is NaN or infinite
    NonFiniteCoordinate,
    /// Polygon has zero or near-zero area
    ZeroAreaPolygon,
    /// Geometry holds no polygon at all
    EmptyGeometry,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::PolygonTooFewPoints {
                ring_index,
                point_count,
            } => write!(f, "ring {} has only {} points", ring_index, point_count),
            InvalidReason::NonFiniteCoordinate => write!(f, "non finite coordinate"),
            InvalidReason::ZeroAreaPolygon => write!(f, "zero area polygon"),
            InvalidReason::EmptyGeometry => write!(f, "empty geometry"),
        }
    }
}

impl ValidationResult {
    /// Returns true if the polygon is valid
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    /// Returns true if the polygon is invalid
    pub fn is_invalid(&self) -> bool {
        matches!(self, ValidationResult::Invalid(_))
    }
}

fn ring_is_finite(ring: &LineString<f64>) -> bool {
    ring.coords().all(|c| c.x.is_finite() && c.y.is_finite())
}

/// Validate a polygon and return the detailed result.
pub fn validate_polygon(poly: &Polygon<f64>) -> ValidationResult {
    let rings = std::iter::once(poly.exterior()).chain(poly.interiors());

    for (ring_index, ring) in rings.enumerate() {
        let point_count = ring.0.len();
        if point_count < MIN_POLYGON_RING_POINTS {
            return ValidationResult::Invalid(InvalidReason::PolygonTooFewPoints {
                ring_index,
                point_count,
            });
        }
        if !ring_is_finite(ring) {
            return ValidationResult::Invalid(InvalidReason::NonFiniteCoordinate);
        }
    }

    if poly.unsigned_area() < MIN_POLYGON_AREA {
        return ValidationResult::Invalid(InvalidReason::ZeroAreaPolygon);
    }

    ValidationResult::Valid
}

/// Check if a polygon can be burned.
pub fn is_valid_polygon(poly: &Polygon<f64>) -> bool {
    validate_polygon(poly).is_valid()
}

/// Decompose a geometry into its polygons.
///
/// Multi-polygons are split and geometry collections walked recursively.
/// Non-polygonal members (points, lines) contribute nothing.
pub fn polygon_parts(geom: &Geometry<f64>) -> Vec<Polygon<f64>> {
    match geom {
        Geometry::Polygon(poly) => vec![poly.clone()],
        Geometry::MultiPolygon(mp) => mp.0.clone(),
        Geometry::Rect(rect) => vec![rect.to_polygon()],
        Geometry::Triangle(triangle) => vec![triangle.to_polygon()],
        Geometry::GeometryCollection(gc) => gc.0.iter().flat_map(polygon_parts).collect(),
        _ => Vec::new(),
    }
}
