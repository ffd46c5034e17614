//! Core library for building XYZ tile datasets for semantic segmentation.
//!
//! The crate covers the tile side of a training data pipeline:
//!
//! - **Coverage**: which tiles at a zoom level intersect a set of rasters,
//!   a bounding box, vector features or an existing tile directory.
//! - **Tiling**: cut georeferenced rasters into fixed size tiles, reproject
//!   them to Web Mercator, drop nodata tiles and composite overlaps.
//! - **Rasterization**: burn vector features into paletted label tiles.
//! - **Tile store**: the `root/z/x/y.ext` layout, neighbour buffering,
//!   subset extraction and coverage files.
//!
//! # Examples
//!
//! ```no_run
//! use neo_tiles_core::cover::{build_coverage, CoverSource, BoundingBox};
//!
//! let bbox: BoundingBox = "2.2,48.8,2.4,48.9".parse().unwrap();
//! let build = build_coverage(&CoverSource::BBox(bbox), Some(14)).unwrap();
//! println!("{} tiles, extent {}", build.coverage.len(), build.extent_string());
//! ```

use std::path::PathBuf;

use thiserror::Error;

pub mod cover;
pub mod crs;
pub mod palette;
pub mod pipeline;
pub mod raster;
pub mod rasterize;
pub mod spatial_index;
pub mod split;
pub mod store;
pub mod tile;
pub mod validate;

pub use cover::{build_coverage, BoundingBox, CoverBuild, CoverSource, Coverage};
pub use palette::{ClassesConfig, Palette};
pub use pipeline::{tile_rasters, TilerConfig, TilingReport};
pub use raster::{InMemoryRaster, RasterSource, Resampling};
pub use spatial_index::{FeatureIndex, IndexConfig};
pub use store::{ImageFormat, LabelTile, TileImage};
pub use tile::{TileBounds, TileCoord};

/// Errors that can occur while covering, tiling or rasterizing
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Empty result: {0}")]
    EmptyResult(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write image {path}: {reason}")]
    ImageWrite { path: PathBuf, reason: String },

    #[error("Failed to read image {path}: {reason}")]
    ImageRead { path: PathBuf, reason: String },

    #[error("Tile {tile} matches {count} files, expected one")]
    AmbiguousTile { tile: TileCoord, count: usize },

    #[error("Mixed zoom levels in coverage: expected {expected}, found {found}")]
    MixedZoom { expected: u8, found: u8 },

    #[error("Unsupported CRS: EPSG:{0}")]
    UnsupportedCrs(u32),

    #[error("Projection failed: {0}")]
    Projection(String),

    #[error("GeoJSON error: {0}")]
    GeoJson(String),

    #[error("Invalid cover {path}, line {line}: {reason}")]
    InvalidCover {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Failed to read raster {path}: {reason}")]
    Raster { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
