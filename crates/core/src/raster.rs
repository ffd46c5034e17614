//! Georeferenced raster sources and their resampling onto the tile grid.
//!
//! A [`RasterSource`] is a north-up grid of unsigned samples with bounds in
//! its own CRS. [`warp_tile`] fills a tile's pixels by mapping each Web
//! Mercator pixel center back into the source and sampling it.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

use crate::cover::RasterFootprint;
use crate::crs::{CoordTransformer, EPSG_WEB_MERCATOR};
use crate::store::TileImage;
use crate::tile::{TileBounds, TileCoord};
use crate::{Error, Result};

/// GeoKey holding the EPSG code of a projected CRS
const PROJECTED_CRS_GEOKEY: u16 = 3072;
/// GeoKey holding the EPSG code of a geographic CRS
const GEOGRAPHIC_CRS_GEOKEY: u16 = 2048;
/// GeoKey value for user-defined systems
const USER_DEFINED: u16 = 32767;

/// Width of source samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleDepth {
    #[default]
    U8,
    U16,
    U32,
}

impl SampleDepth {
    /// Downscale a sample to 8 bits.
    pub fn to_u8(self, value: u32) -> u8 {
        match self {
            SampleDepth::U8 => value.min(255) as u8,
            SampleDepth::U16 => (value.min(65535) / 256) as u8,
            SampleDepth::U32 => (value / 65536).min(255) as u8,
        }
    }
}

/// How source samples are interpolated at tile pixel centers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampling {
    /// Closest sample, for labels
    Nearest,
    /// Weighted mean of the four surrounding samples, for imagery
    #[default]
    Bilinear,
}

/// A georeferenced, north-up, multi-band raster
pub trait RasterSource: Send + Sync {
    /// Name used in logs, usually the file path
    fn name(&self) -> &str;

    /// EPSG code, `None` without usable georeferencing
    fn srid(&self) -> Option<u32>;

    /// `[min_x, min_y, max_x, max_y]` in the raster CRS
    fn bounds(&self) -> [f64; 4];

    /// `(width, height)` in pixels
    fn size(&self) -> (u32, u32);

    fn band_count(&self) -> usize;

    fn depth(&self) -> SampleDepth;

    /// Sample of 1-based `band` at (col, row)
    fn value(&self, band: usize, col: u32, row: u32) -> u32;

    /// Source nodata value, read as "outside" when warping
    fn nodata(&self) -> Option<f64> {
        None
    }
}

/// Footprint of a raster, for coverage building
pub fn footprint<S: RasterSource + ?Sized>(raster: &S) -> RasterFootprint {
    RasterFootprint::new(raster.name(), raster.srid(), raster.bounds())
}

/// Raster held in memory, one plane per band
#[derive(Debug, Clone)]
pub struct InMemoryRaster {
    name: String,
    srid: Option<u32>,
    bounds: [f64; 4],
    width: u32,
    height: u32,
    depth: SampleDepth,
    nodata: Option<f64>,
    planes: Vec<Vec<u32>>,
}

impl InMemoryRaster {
    /// Build a raster from row-major band planes.
    ///
    /// # Errors
    /// `Error::Config` on empty or mis-sized planes, or degenerate bounds.
    pub fn new(
        name: impl Into<String>,
        srid: Option<u32>,
        bounds: [f64; 4],
        (width, height): (u32, u32),
        depth: SampleDepth,
        planes: Vec<Vec<u32>>,
    ) -> Result<Self> {
        let name = name.into();
        let pixels = width as usize * height as usize;

        if planes.is_empty() || pixels == 0 {
            return Err(Error::Config(format!("{}: empty raster", name)));
        }
        if let Some(plane) = planes.iter().find(|p| p.len() != pixels) {
            return Err(Error::Config(format!(
                "{}: band of {} samples for a {}x{} raster",
                name,
                plane.len(),
                width,
                height
            )));
        }
        let [min_x, min_y, max_x, max_y] = bounds;
        if !(min_x < max_x && min_y < max_y) {
            return Err(Error::Config(format!("{}: invalid bounds {:?}", name, bounds)));
        }

        Ok(Self {
            name,
            srid,
            bounds,
            width,
            height,
            depth,
            nodata: None,
            planes,
        })
    }

    /// 8-bit raster
    pub fn from_u8(
        name: impl Into<String>,
        srid: Option<u32>,
        bounds: [f64; 4],
        size: (u32, u32),
        planes: Vec<Vec<u8>>,
    ) -> Result<Self> {
        let planes = planes
            .into_iter()
            .map(|plane| plane.into_iter().map(u32::from).collect())
            .collect();
        Self::new(name, srid, bounds, size, SampleDepth::U8, planes)
    }

    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }
}

impl RasterSource for InMemoryRaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn srid(&self) -> Option<u32> {
        self.srid
    }

    fn bounds(&self) -> [f64; 4] {
        self.bounds
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn band_count(&self) -> usize {
        self.planes.len()
    }

    fn depth(&self) -> SampleDepth {
        self.depth
    }

    fn value(&self, band: usize, col: u32, row: u32) -> u32 {
        self.planes[band - 1][row as usize * self.width as usize + col as usize]
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }
}

fn raster_error(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::Raster {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// EPSG code from a GeoKeyDirectory, projected CRS first
fn epsg_from_geokeys(keys: &[u16]) -> Option<u32> {
    let lookup = |wanted: u16| {
        keys.get(4..)?
            .chunks_exact(4)
            .find(|entry| entry[0] == wanted && entry[1] == 0)
            .map(|entry| entry[3])
            .filter(|&code| code != 0 && code != USER_DEFINED)
    };

    lookup(PROJECTED_CRS_GEOKEY)
        .or_else(|| lookup(GEOGRAPHIC_CRS_GEOKEY))
        .map(u32::from)
}

/// Bounds from pixel scale and the first tie point
fn geotiff_bounds(scale: &[f64], tiepoint: &[f64], (width, height): (u32, u32)) -> Option<[f64; 4]> {
    if scale.len() < 2 || tiepoint.len() < 6 || scale[0] <= 0.0 || scale[1] <= 0.0 {
        return None;
    }
    let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
    let min_x = x - i * scale[0];
    let max_y = y + j * scale[1];

    Some([
        min_x,
        max_y - height as f64 * scale[1],
        min_x + width as f64 * scale[0],
        max_y,
    ])
}

/// Read a GeoTIFF into memory.
///
/// Chunky (interleaved) 8, 16 and 32 bit images are supported. Following
/// pages of the same size are read as extra bands, other pages (overviews)
/// are ignored. A raster without georeferencing tags opens fine but has no
/// CRS, so it is skipped when covering or tiling.
///
/// # Errors
/// `Error::Raster` when the file is not a decodable TIFF.
pub fn open_geotiff(path: &Path) -> Result<InMemoryRaster> {
    let file = File::open(path).map_err(|e| raster_error(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| raster_error(path, e))?;

    let size = decoder.dimensions().map_err(|e| raster_error(path, e))?;
    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok();
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok();
    let geokeys = decoder.get_tag_u16_vec(Tag::GeoKeyDirectoryTag).ok();
    let nodata = decoder
        .get_tag_ascii_string(Tag::GdalNodata)
        .ok()
        .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok());

    let bounds = match (&scale, &tiepoint) {
        (Some(scale), Some(tiepoint)) => geotiff_bounds(scale, tiepoint, size),
        _ => None,
    };
    let srid = bounds.and(geokeys.as_deref().and_then(epsg_from_geokeys));

    if bounds.is_none() {
        log::warn!("{} carries no georeferencing", path.display());
    }

    let pixels = size.0 as usize * size.1 as usize;
    let mut depth = None;
    let mut planes: Vec<Vec<u32>> = Vec::new();

    loop {
        if decoder.dimensions().map_err(|e| raster_error(path, e))? == size {
            let (page_depth, data): (SampleDepth, Vec<u32>) =
                match decoder.read_image().map_err(|e| raster_error(path, e))? {
                    DecodingResult::U8(v) => (SampleDepth::U8, v.into_iter().map(u32::from).collect()),
                    DecodingResult::U16(v) => (SampleDepth::U16, v.into_iter().map(u32::from).collect()),
                    DecodingResult::U32(v) => (SampleDepth::U32, v),
                    _ => return Err(raster_error(path, "unsupported sample format")),
                };

            if *depth.get_or_insert(page_depth) != page_depth {
                return Err(raster_error(path, "pages of different sample depths"));
            }
            if data.is_empty() || data.len() % pixels != 0 {
                return Err(raster_error(path, "truncated image data"));
            }

            let samples = data.len() / pixels;
            for band in 0..samples {
                planes.push(data.iter().skip(band).step_by(samples).copied().collect());
            }
        }

        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(|e| raster_error(path, e))?;
    }

    // Ungeoreferenced rasters keep their pixel grid as bounds
    let bounds = bounds.unwrap_or([0.0, 0.0, size.0 as f64, size.1 as f64]);

    InMemoryRaster::new(
        path.display().to_string(),
        srid,
        bounds,
        size,
        depth.unwrap_or_default(),
        planes,
    )
    .map(|raster| raster.with_nodata(nodata))
}

/// Source sample at fractional pixel coordinates, `None` outside the raster
fn sample<S: RasterSource + ?Sized>(
    source: &S,
    band: usize,
    fx: f64,
    fy: f64,
    resampling: Resampling,
) -> Option<f64> {
    let (width, height) = source.size();
    let (w, h) = (width as f64, height as f64);

    // fx, fy are relative to pixel centers
    if fx < -0.5 || fy < -0.5 || fx >= w - 0.5 || fy >= h - 0.5 {
        return None;
    }

    let nodata = source.nodata();
    let valid = |v: f64| nodata.map_or(true, |n| v != n);

    match resampling {
        Resampling::Nearest => {
            let col = (fx + 0.5).floor().clamp(0.0, w - 1.0) as u32;
            let row = (fy + 0.5).floor().clamp(0.0, h - 1.0) as u32;
            Some(source.value(band, col, row) as f64).filter(|&v| valid(v))
        }
        Resampling::Bilinear => {
            let x0 = fx.floor();
            let y0 = fy.floor();
            let (tx, ty) = (fx - x0, fy - y0);

            let clamp_col = |c: f64| c.clamp(0.0, w - 1.0) as u32;
            let clamp_row = |r: f64| r.clamp(0.0, h - 1.0) as u32;
            let (c0, c1) = (clamp_col(x0), clamp_col(x0 + 1.0));
            let (r0, r1) = (clamp_row(y0), clamp_row(y0 + 1.0));

            let v = |c, r| source.value(band, c, r) as f64;
            let (v00, v10, v01, v11) = (v(c0, r0), v(c1, r0), v(c0, r1), v(c1, r1));
            if ![v00, v10, v01, v11].into_iter().all(valid) {
                return None;
            }

            let top = v00 * (1.0 - tx) + v10 * tx;
            let bottom = v01 * (1.0 - tx) + v11 * tx;
            Some(top * (1.0 - ty) + bottom * ty)
        }
    }
}

/// Resample `source` onto `tile`.
///
/// Each output pixel center is taken in Web Mercator, reprojected into the
/// source CRS and sampled. Pixels falling outside the source are 0. Samples
/// are downscaled to 8 bits after interpolation.
///
/// # Arguments
///
/// * `source` - Raster to read
/// * `tile` - Target tile
/// * `(width, height)` - Output size in pixels
/// * `bands` - 1-based source bands, in output order
/// * `resampling` - Interpolation
///
/// # Errors
/// - `Error::Config` for a band outside the source
/// - `Error::Projection` / `Error::UnsupportedCrs` when the source CRS can't be used
pub fn warp_tile<S: RasterSource + ?Sized>(
    source: &S,
    tile: &TileCoord,
    (width, height): (u32, u32),
    bands: &[usize],
    resampling: Resampling,
) -> Result<TileImage> {
    if bands.is_empty() || bands.iter().any(|&b| b == 0 || b > source.band_count()) {
        return Err(Error::Config(format!(
            "Invalid bands {:?} for {} ({} bands)",
            bands,
            source.name(),
            source.band_count()
        )));
    }

    let srid = source
        .srid()
        .ok_or_else(|| Error::Projection(format!("{} has no coordinate reference system", source.name())))?;
    let transformer = CoordTransformer::new(EPSG_WEB_MERCATOR, srid)?;

    let mercator = tile.mercator_bounds();
    let res_x = mercator.width() / width as f64;
    let res_y = mercator.height() / height as f64;

    let [min_x, min_y, max_x, max_y] = source.bounds();
    let (src_w, src_h) = source.size();
    let src_res_x = (max_x - min_x) / src_w as f64;
    let src_res_y = (max_y - min_y) / src_h as f64;

    let depth = source.depth();
    let mut image = TileImage::new(width, height, bands.len());

    for row in 0..height {
        let my = mercator.y_max - (row as f64 + 0.5) * res_y;
        for col in 0..width {
            let mx = mercator.x_min + (col as f64 + 0.5) * res_x;

            // Outside the source CRS domain means outside the raster
            let Ok((sx, sy)) = transformer.transform(mx, my) else {
                continue;
            };
            let fx = (sx - min_x) / src_res_x - 0.5;
            let fy = (max_y - sy) / src_res_y - 0.5;

            for (out_band, &band) in bands.iter().enumerate() {
                if let Some(value) = sample(source, band, fx, fy, resampling) {
                    image.set(col, row, out_band, depth.to_u8(value.round() as u32));
                }
            }
        }
    }

    Ok(image)
}

/// Geographic bounds of a raster
pub fn geographic_bounds<S: RasterSource + ?Sized>(source: &S) -> Result<TileBounds> {
    footprint(source).geographic_bounds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::EPSG_WGS84;
    use tempfile::TempDir;
    use tiff::encoder::{colortype, TiffEncoder};

    fn tile_raster(tile: &TileCoord, size: u32, planes: Vec<Vec<u8>>) -> InMemoryRaster {
        let m = tile.mercator_bounds();
        InMemoryRaster::from_u8(
            "tile",
            Some(EPSG_WEB_MERCATOR),
            [m.x_min, m.y_min, m.x_max, m.y_max],
            (size, size),
            planes,
        )
        .unwrap()
    }

    // ========================================================================
    // Samples
    // ========================================================================

    #[test]
    fn test_depth_scaling() {
        assert_eq!(SampleDepth::U8.to_u8(200), 200);
        assert_eq!(SampleDepth::U16.to_u8(65535), 255);
        assert_eq!(SampleDepth::U16.to_u8(511), 1);
        assert_eq!(SampleDepth::U32.to_u8(65536 * 128), 128);
        assert_eq!(SampleDepth::U32.to_u8(u32::MAX), 255);
    }

    #[test]
    fn test_in_memory_raster_rejects_bad_planes() {
        assert!(InMemoryRaster::from_u8("r", None, [0.0, 0.0, 1.0, 1.0], (2, 2), vec![vec![0; 3]]).is_err());
        assert!(InMemoryRaster::from_u8("r", None, [0.0, 0.0, 1.0, 1.0], (2, 2), vec![]).is_err());
        assert!(InMemoryRaster::from_u8("r", None, [1.0, 0.0, 0.0, 1.0], (2, 2), vec![vec![0; 4]]).is_err());
    }

    #[test]
    fn test_geokeys() {
        // Header, then GTModelType, ProjectedCSType
        let keys = [1, 1, 0, 2, 1024, 0, 1, 1, 3072, 0, 1, 32631];
        assert_eq!(epsg_from_geokeys(&keys), Some(32631));

        let geographic = [1, 1, 0, 1, 2048, 0, 1, 4326];
        assert_eq!(epsg_from_geokeys(&geographic), Some(4326));

        let user_defined = [1, 1, 0, 1, 3072, 0, 1, USER_DEFINED];
        assert_eq!(epsg_from_geokeys(&user_defined), None);
    }

    #[test]
    fn test_geotiff_bounds() {
        let bounds = geotiff_bounds(&[10.0, 5.0, 0.0], &[0.0, 0.0, 0.0, 1000.0, 2000.0, 0.0], (100, 40));
        assert_eq!(bounds, Some([1000.0, 1800.0, 2000.0, 2000.0]));
        assert_eq!(geotiff_bounds(&[0.0, 5.0], &[0.0; 6], (1, 1)), None);
    }

    // ========================================================================
    // Warping
    // ========================================================================

    #[test]
    fn test_warp_aligned_nearest_is_identity() {
        let tile = TileCoord::new(300, 200, 9);
        let plane: Vec<u8> = (0..64u32).map(|v| (v * 3) as u8).collect();
        let raster = tile_raster(&tile, 8, vec![plane.clone()]);

        let image = warp_tile(&raster, &tile, (8, 8), &[1], Resampling::Nearest).unwrap();
        assert_eq!(image.data(), plane.as_slice());
    }

    #[test]
    fn test_warp_aligned_bilinear_is_identity() {
        let tile = TileCoord::new(300, 200, 9);
        let plane: Vec<u8> = (0..64u32).map(|v| (v * 2) as u8).collect();
        let raster = tile_raster(&tile, 8, vec![plane.clone()]);

        let image = warp_tile(&raster, &tile, (8, 8), &[1], Resampling::Bilinear).unwrap();
        assert_eq!(image.data(), plane.as_slice());
    }

    #[test]
    fn test_warp_band_order_and_outside() {
        let tile = TileCoord::new(300, 200, 9);
        let raster = tile_raster(&tile, 4, vec![vec![10; 16], vec![20; 16]]);

        let image = warp_tile(&raster, &tile, (4, 4), &[2, 1], Resampling::Nearest).unwrap();
        assert_eq!(image.pixel(1, 1), &[20, 10]);

        // Neighbour tile doesn't overlap the raster
        let away = warp_tile(&raster, &TileCoord::new(302, 200, 9), (4, 4), &[1], Resampling::Nearest).unwrap();
        assert!(away.data().iter().all(|&v| v == 0));

        assert!(warp_tile(&raster, &tile, (4, 4), &[3], Resampling::Nearest).is_err());
    }

    #[test]
    fn test_warp_geographic_source() {
        // Uniform 4326 raster around Paris, fully covering the tile
        let raster = InMemoryRaster::from_u8(
            "paris",
            Some(EPSG_WGS84),
            [2.0, 48.0, 3.0, 49.0],
            (100, 100),
            vec![vec![77; 10_000]],
        )
        .unwrap();

        let tile = crate::tile::lng_lat_to_tile(2.5, 48.5, 12);
        let image = warp_tile(&raster, &tile, (16, 16), &[1], Resampling::Bilinear).unwrap();
        assert!(image.data().iter().all(|&v| v == 77));
    }

    #[test]
    fn test_warp_source_nodata_is_zero() {
        let tile = TileCoord::new(300, 200, 9);
        let raster = tile_raster(&tile, 2, vec![vec![5, 255, 5, 5]]).with_nodata(Some(255.0));

        let image = warp_tile(&raster, &tile, (2, 2), &[1], Resampling::Nearest).unwrap();
        assert_eq!(image.data(), &[5, 0, 5, 5]);
    }

    #[test]
    fn test_warp_requires_crs() {
        let raster = InMemoryRaster::from_u8("bare", None, [0.0, 0.0, 1.0, 1.0], (1, 1), vec![vec![1]]).unwrap();
        assert!(matches!(
            warp_tile(&raster, &TileCoord::new(0, 0, 0), (4, 4), &[1], Resampling::Nearest),
            Err(Error::Projection(_))
        ));
    }

    // ========================================================================
    // GeoTIFF
    // ========================================================================

    #[test]
    fn test_open_geotiff() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("utm.tif");

        {
            let file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(file).unwrap();
            let mut image = encoder.new_image::<colortype::Gray16>(4, 2).unwrap();
            image
                .encoder()
                .write_tag(Tag::ModelPixelScaleTag, &[10.0f64, 10.0, 0.0][..])
                .unwrap();
            image
                .encoder()
                .write_tag(Tag::ModelTiepointTag, &[0.0f64, 0.0, 0.0, 500000.0, 4982000.0, 0.0][..])
                .unwrap();
            image
                .encoder()
                .write_tag(Tag::GeoKeyDirectoryTag, &[1u16, 1, 0, 1, 3072, 0, 1, 32631][..])
                .unwrap();
            let data: Vec<u16> = (0..8).map(|v| v * 1024).collect();
            image.write_data(&data).unwrap();
        }

        let raster = open_geotiff(&path).unwrap();
        assert_eq!(raster.srid(), Some(32631));
        assert_eq!(raster.size(), (4, 2));
        assert_eq!(raster.depth(), SampleDepth::U16);
        assert_eq!(raster.bounds(), [500000.0, 4981980.0, 500040.0, 4982000.0]);
        assert_eq!(raster.value(1, 3, 1), 7 * 1024);

        let fp = footprint(&raster);
        assert_eq!(fp.srid, Some(32631));
        let geo = geographic_bounds(&raster).unwrap();
        assert!((geo.lng_min - 3.0).abs() < 1e-3);
    }

    #[test]
    fn test_open_geotiff_without_georeferencing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.tif");
        {
            let file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(file).unwrap();
            encoder.write_image::<colortype::RGB8>(2, 2, &[1u8; 12]).unwrap();
        }

        let raster = open_geotiff(&path).unwrap();
        assert_eq!(raster.srid(), None);
        assert_eq!(raster.band_count(), 3);
        assert!(geographic_bounds(&raster).is_err());
    }

    #[test]
    fn test_open_geotiff_not_a_tiff() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.tif");
        std::fs::write(&path, b"nope").unwrap();
        assert!(matches!(open_geotiff(&path), Err(Error::Raster { .. })));
    }
}
