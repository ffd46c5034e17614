//! On-disk tile store: `<root>/<z>/<x>/<y>.<ext>`.
//!
//! # Formats
//!
//! The image format follows the band count:
//!
//! | Bands | Format                                  |
//! |-------|-----------------------------------------|
//! | 1     | PNG, 8-bit grayscale                    |
//! | 3     | WebP (lossless) by default, or JPEG/PNG |
//! | other | TIFF, one 8-bit page per band           |
//!
//! Labels are always single band palette-indexed PNG. Writing a label in
//! append mode keeps, per pixel, the maximum of the existing and new values,
//! so classes burned one pass at a time accumulate.
//!
//! # Metatiles
//!
//! [`buffer_with_neighbours`] pads a tile with a quarter tile border taken
//! from its eight neighbours, zero filled where a neighbour is missing.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};

use crate::cover::Coverage;
use crate::palette::{Palette, MAX_PALETTE_COLORS};
use crate::tile::{TileCoord, MAX_ZOOM};
use crate::{Error, Result};

/// JPEG quality used when JPEG is requested for 3 band tiles
pub const JPEG_QUALITY: u8 = 95;

/// Multi-band 8-bit tile image, pixels interleaved row by row (H, W, C)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileImage {
    width: u32,
    height: u32,
    bands: usize,
    data: Vec<u8>,
}

impl TileImage {
    /// All zero image
    pub fn new(width: u32, height: u32, bands: usize) -> Self {
        Self {
            width,
            height,
            bands,
            data: vec![0; width as usize * height as usize * bands],
        }
    }

    /// Wrap interleaved pixel data.
    ///
    /// # Errors
    /// `Error::Config` if `data` doesn't hold `width * height * bands` samples.
    pub fn from_raw(width: u32, height: u32, bands: usize, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * bands;
        if bands == 0 || data.len() != expected {
            return Err(Error::Config(format!(
                "{}x{}x{} image needs {} samples, got {}",
                width,
                height,
                bands,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            bands,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.bands
    }

    /// Sample of `band` (0-based) at (x, y)
    pub fn get(&self, x: u32, y: u32, band: usize) -> u8 {
        self.data[self.offset(x, y) + band]
    }

    pub fn set(&mut self, x: u32, y: u32, band: usize, value: u8) {
        let offset = self.offset(x, y);
        self.data[offset + band] = value;
    }

    /// All samples of the pixel at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let offset = self.offset(x, y);
        &self.data[offset..offset + self.bands]
    }

    /// One band as a row-major plane
    pub fn band(&self, band: usize) -> Vec<u8> {
        self.data.iter().skip(band).step_by(self.bands).copied().collect()
    }

    /// Keep only the given 1-based bands, in the given order.
    pub fn select_bands(&self, bands: &[usize]) -> Result<TileImage> {
        if bands.is_empty() || bands.iter().any(|&b| b == 0 || b > self.bands) {
            return Err(Error::Config(format!(
                "Invalid band selection {:?} for a {} band image",
                bands, self.bands
            )));
        }

        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * bands.len());
        for pixel in self.data.chunks_exact(self.bands) {
            data.extend(bands.iter().map(|&b| pixel[b - 1]));
        }

        TileImage::from_raw(self.width, self.height, bands.len(), data)
    }

    /// Build an image from planar bands of equal size.
    fn from_planes(width: u32, height: u32, planes: &[Vec<u8>]) -> Result<Self> {
        let pixels = width as usize * height as usize;
        if planes.iter().any(|plane| plane.len() != pixels) {
            return Err(Error::Config("Bands of different sizes".to_string()));
        }

        let mut data = Vec::with_capacity(pixels * planes.len());
        for i in 0..pixels {
            data.extend(planes.iter().map(|plane| plane[i]));
        }
        TileImage::from_raw(width, height, planes.len(), data)
    }
}

/// Single band label tile, row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTile {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl LabelTile {
    /// All zero (background) label
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        if data.len() != width as usize * height as usize {
            return Err(Error::Config(format!(
                "{}x{} label needs {} values, got {}",
                width,
                height,
                width as usize * height as usize,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: u8) {
        self.data[y as usize * self.width as usize + x as usize] = value;
    }

    /// Number of non background pixels
    pub fn count_nonzero(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    /// Per pixel maximum with `other`.
    pub fn merge_max(&mut self, other: &LabelTile) -> Result<()> {
        if (self.width, self.height) != (other.width, other.height) {
            return Err(Error::Config(format!(
                "Can't merge a {}x{} label into a {}x{} one",
                other.width, other.height, self.width, self.height
            )));
        }

        for (value, new) in self.data.iter_mut().zip(&other.data) {
            *value = (*value).max(*new);
        }
        Ok(())
    }
}

/// Tile image encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Webp,
    Jpeg,
    Tiff,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Tiff => "tiff",
        }
    }

    /// Format used for `bands` bands. `preferred` only applies to 3 band images.
    pub fn for_bands(bands: usize, preferred: Option<ImageFormat>) -> ImageFormat {
        match bands {
            1 => ImageFormat::Png,
            3 => preferred.unwrap_or(ImageFormat::Webp),
            _ => ImageFormat::Tiff,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "webp" => Ok(ImageFormat::Webp),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "tiff" | "tif" => Ok(ImageFormat::Tiff),
            other => Err(Error::Config(format!("Unknown image format: {}", other))),
        }
    }
}

/// `<root>/<z>/<x>/<y>.<ext>`
pub fn tile_path(root: &Path, tile: &TileCoord, ext: &str) -> PathBuf {
    root.join(tile.z.to_string())
        .join(tile.x.to_string())
        .join(format!("{}.{}", tile.y, ext))
}

fn read_error(path: &Path, reason: impl fmt::Display) -> Error {
    Error::ImageRead {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn write_error(path: &Path, reason: impl fmt::Display) -> Error {
    Error::ImageWrite {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Expand packed 1, 2 or 4 bit samples to one byte each.
fn unpack_samples(bytes: &[u8], line_size: usize, samples_per_row: usize, depth: usize) -> Vec<u8> {
    if depth == 8 {
        return bytes.to_vec();
    }

    let mask = (1u16 << depth) as u8 - 1;
    let mut out = Vec::with_capacity(samples_per_row * (bytes.len() / line_size.max(1)));
    for row in bytes.chunks(line_size) {
        for i in 0..samples_per_row {
            let bit = i * depth;
            let shift = 8 - depth - bit % 8;
            out.push((row[bit / 8] >> shift) & mask);
        }
    }
    out
}

/// Decode a PNG as stored: palette indices stay indices.
fn read_png(path: &Path) -> Result<TileImage> {
    let file = File::open(path).map_err(|e| read_error(path, e))?;
    let mut decoder = png::Decoder::new(BufReader::new(file));
    decoder.set_transformations(png::Transformations::STRIP_16);

    let mut reader = decoder.read_info().map_err(|e| read_error(path, e))?;
    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf).map_err(|e| read_error(path, e))?;

    let bands = info.color_type.samples();
    let depth = match info.bit_depth {
        png::BitDepth::One => 1,
        png::BitDepth::Two => 2,
        png::BitDepth::Four => 4,
        _ => 8,
    };

    let bytes = &buf[..info.buffer_size()];
    let data = unpack_samples(bytes, info.line_size, info.width as usize * bands, depth);

    TileImage::from_raw(info.width, info.height, bands, data)
}

/// Samples per pixel of a TIFF page
fn tiff_samples(color: tiff::ColorType) -> usize {
    match color {
        tiff::ColorType::Gray(_) | tiff::ColorType::Palette(_) => 1,
        tiff::ColorType::GrayA(_) => 2,
        tiff::ColorType::RGB(_) | tiff::ColorType::YCbCr(_) => 3,
        tiff::ColorType::RGBA(_) | tiff::ColorType::CMYK(_) => 4,
    }
}

/// Decode every page of a TIFF, stacking their bands.
fn read_tiff(path: &Path) -> Result<TileImage> {
    let file = File::open(path).map_err(|e| read_error(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| read_error(path, e))?;

    let mut size = None;
    let mut planes: Vec<Vec<u8>> = Vec::new();

    loop {
        let (width, height) = decoder.dimensions().map_err(|e| read_error(path, e))?;
        if *size.get_or_insert((width, height)) != (width, height) {
            return Err(read_error(path, "pages of different sizes"));
        }

        let color = decoder.colortype().map_err(|e| read_error(path, e))?;
        let samples = tiff_samples(color);

        let data: Vec<u8> = match decoder.read_image().map_err(|e| read_error(path, e))? {
            DecodingResult::U8(v) => v,
            DecodingResult::U16(v) => v.into_iter().map(|s| (s >> 8) as u8).collect(),
            _ => return Err(read_error(path, "unsupported sample type")),
        };

        for band in 0..samples {
            planes.push(data.iter().skip(band).step_by(samples).copied().collect());
        }

        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(|e| read_error(path, e))?;
    }

    let (width, height) = size.unwrap_or((0, 0));
    TileImage::from_planes(width, height, &planes)
}

/// Decode WebP, JPEG and anything else the `image` crate knows.
fn read_other(path: &Path) -> Result<TileImage> {
    let image = image::open(path).map_err(|e| read_error(path, e))?;
    let (width, height) = (image.width(), image.height());

    let (bands, data) = match image.color().channel_count() {
        1 => (1, image.into_luma8().into_raw()),
        2 => (2, image.into_luma_alpha8().into_raw()),
        4 => (4, image.into_rgba8().into_raw()),
        _ => (3, image.into_rgb8().into_raw()),
    };

    TileImage::from_raw(width, height, bands, data)
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Read a tile image, failing with the cause.
pub fn try_read_image(path: &Path, bands: Option<&[usize]>) -> Result<TileImage> {
    let image = match extension(path).as_str() {
        "png" => read_png(path)?,
        "tif" | "tiff" => read_tiff(path)?,
        _ => read_other(path)?,
    };

    match bands {
        Some(bands) => image.select_bands(bands),
        None => Ok(image),
    }
}

/// Read a tile image, `None` on any I/O or format failure.
///
/// # Arguments
///
/// * `path` - Image file
/// * `bands` - 1-based bands to keep, all when `None`
pub fn read_image(path: &Path, bands: Option<&[usize]>) -> Option<TileImage> {
    match try_read_image(path, bands) {
        Ok(image) => Some(image),
        Err(e) => {
            log::debug!("{}", e);
            None
        }
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| write_error(path, e))?;
    }
    Ok(())
}

fn encode_tiff(path: &Path, image: &TileImage) -> Result<()> {
    let file = File::create(path).map_err(|e| write_error(path, e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(|e| write_error(path, e))?;

    for band in 0..image.bands() {
        encoder
            .write_image::<colortype::Gray8>(image.width(), image.height(), &image.band(band))
            .map_err(|e| write_error(path, e))?;
    }
    Ok(())
}

/// Write a tile image under `root`, choosing the format from the band count.
///
/// # Arguments
///
/// * `root` - Tile directory root
/// * `tile` - Tile coordinates, giving the `z/x/y` path
/// * `image` - Pixels
/// * `preferred` - Format for 3 band images (WebP when `None`)
///
/// # Returns
///
/// The written path.
///
/// # Errors
/// `Error::ImageWrite` when the file can't be written.
pub fn write_image(
    root: &Path,
    tile: &TileCoord,
    image: &TileImage,
    preferred: Option<ImageFormat>,
) -> Result<PathBuf> {
    let format = ImageFormat::for_bands(image.bands(), preferred);
    let path = tile_path(root, tile, format.extension());
    create_parent(&path)?;

    let (w, h) = (image.width(), image.height());
    let color = match image.bands() {
        1 => ExtendedColorType::L8,
        _ => ExtendedColorType::Rgb8,
    };

    match format {
        ImageFormat::Tiff => encode_tiff(&path, image)?,
        _ => {
            let writer = BufWriter::new(File::create(&path).map_err(|e| write_error(&path, e))?);
            let result = match format {
                ImageFormat::Png => PngEncoder::new(writer).write_image(image.data(), w, h, color),
                ImageFormat::Jpeg => {
                    JpegEncoder::new_with_quality(writer, JPEG_QUALITY).write_image(image.data(), w, h, color)
                }
                _ => WebPEncoder::new_lossless(writer).write_image(image.data(), w, h, color),
            };
            result.map_err(|e| write_error(&path, e))?;
        }
    }

    Ok(path)
}

/// Read a single band label, `None` on failure.
pub fn read_label(path: &Path) -> Option<LabelTile> {
    let image = read_image(path, Some(&[1]))?;
    LabelTile::from_raw(image.width(), image.height(), image.into_raw()).ok()
}

/// Write a palette-indexed label tile as `<root>/<z>/<x>/<y>.png`.
///
/// The palette's transparency index, if any, is marked transparent. With
/// `append`, an existing label at the same path is merged in by per pixel
/// maximum.
///
/// # Errors
/// - `Error::ImageRead` if `append` finds a label it can't read
/// - `Error::ImageWrite` if the file can't be written
pub fn write_label(
    root: &Path,
    tile: &TileCoord,
    palette: &Palette,
    label: &LabelTile,
    append: bool,
) -> Result<PathBuf> {
    let path = tile_path(root, tile, "png");

    let mut label = label.clone();
    if append && path.is_file() {
        let previous = read_label(&path)
            .ok_or_else(|| read_error(&path, "unable to open existing label"))?;
        label.merge_max(&previous)?;
    } else {
        create_parent(&path)?;
    }

    let file = File::create(&path).map_err(|e| write_error(&path, e))?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), label.width(), label.height());
    encoder.set_color(png::ColorType::Indexed);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_palette(palette.to_rgb_bytes(MAX_PALETTE_COLORS));

    if let Some(index) = palette.transparency() {
        let mut trns = vec![255u8; index as usize + 1];
        trns[index as usize] = 0;
        encoder.set_trns(trns);
    }

    let mut writer = encoder.write_header().map_err(|e| write_error(&path, e))?;
    writer
        .write_image_data(label.data())
        .map_err(|e| write_error(&path, e))?;
    writer.finish().map_err(|e| write_error(&path, e))?;

    Ok(path)
}

/// Find the single file of `tile` in a `z/x/y` tree.
///
/// # Errors
/// `Error::AmbiguousTile` if several files (extensions) match.
pub fn tile_from_directory(root: &Path, tile: &TileCoord) -> Result<Option<PathBuf>> {
    let dir = root.join(tile.z.to_string()).join(tile.x.to_string());
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let y = tile.y.to_string();
    let mut matches = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let stem_matches = path.file_stem().and_then(|s| s.to_str()) == Some(y.as_str());
        if stem_matches && path.extension().is_some() {
            matches.push(path);
        }
    }

    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        count => Err(Error::AmbiguousTile {
            tile: *tile,
            count,
        }),
    }
}

/// One level of the `z/x/y` tree still to read
#[derive(Debug, Clone)]
enum Pending {
    Root(PathBuf),
    Zoom(PathBuf, u8),
    Column(PathBuf, u8, u32),
}

/// Numeric directory entries of `dir`, sorted by number
fn numeric_entries<T: FromStr + Ord>(dir: &Path, files: bool) -> Result<Vec<(T, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = if files {
            if !path.is_file() || path.extension().is_none() {
                continue;
            }
            path.file_stem()
        } else {
            if !path.is_dir() {
                continue;
            }
            path.file_name()
        };

        if let Some(value) = name.and_then(|n| n.to_str()).and_then(|n| n.parse::<T>().ok()) {
            out.push((value, path));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Lazy traversal of a `z/x/y` tree, see [`list_tiles`]
#[derive(Debug)]
pub struct TileWalker<'a> {
    root: PathBuf,
    cover: Option<&'a Coverage>,
    stack: Vec<Pending>,
    ready: Vec<(TileCoord, PathBuf)>,
}

impl<'a> TileWalker<'a> {
    /// Start over from the root
    pub fn restart(&mut self) {
        self.stack = vec![Pending::Root(self.root.clone())];
        self.ready.clear();
    }

    fn expand(&mut self, pending: Pending) -> Result<()> {
        match pending {
            Pending::Root(dir) => {
                for (z, path) in numeric_entries::<u8>(&dir, false)?.into_iter().rev() {
                    if z > MAX_ZOOM {
                        continue;
                    }
                    self.stack.push(Pending::Zoom(path, z));
                }
            }
            Pending::Zoom(dir, z) => {
                for (x, path) in numeric_entries::<u32>(&dir, false)?.into_iter().rev() {
                    self.stack.push(Pending::Column(path, z, x));
                }
            }
            Pending::Column(dir, z, x) => {
                for (y, path) in numeric_entries::<u32>(&dir, true)?.into_iter().rev() {
                    let tile = TileCoord::new(x, y, z);
                    if self.cover.map_or(true, |cover| cover.contains(&tile)) {
                        self.ready.push((tile, path));
                    }
                }
            }
        }
        Ok(())
    }
}

impl<'a> Iterator for TileWalker<'a> {
    type Item = Result<(TileCoord, PathBuf)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(found) = self.ready.pop() {
                return Some(Ok(found));
            }
            let pending = self.stack.pop()?;
            if let Err(e) = self.expand(pending) {
                return Some(Err(e));
            }
        }
    }
}

/// Walk the tiles of a `z/x/y` tree, in z, x, y order.
///
/// Only files named `<y>.<ext>` under numeric directories are listed. With a
/// `cover`, tiles outside it are skipped.
pub fn list_tiles<'a>(root: &Path, cover: Option<&'a Coverage>) -> TileWalker<'a> {
    TileWalker {
        root: root.to_path_buf(),
        cover,
        stack: vec![Pending::Root(root.to_path_buf())],
        ready: Vec::new(),
    }
}

/// Anything that can tell whether it holds a tile
pub trait TileSet {
    fn contains_tile(&self, tile: &TileCoord) -> bool;
}

impl<V> TileSet for HashMap<TileCoord, V> {
    fn contains_tile(&self, tile: &TileCoord) -> bool {
        self.contains_key(tile)
    }
}

impl<V> TileSet for BTreeMap<TileCoord, V> {
    fn contains_tile(&self, tile: &TileCoord) -> bool {
        self.contains_key(tile)
    }
}

impl TileSet for HashSet<TileCoord> {
    fn contains_tile(&self, tile: &TileCoord) -> bool {
        self.contains(tile)
    }
}

impl TileSet for BTreeSet<TileCoord> {
    fn contains_tile(&self, tile: &TileCoord) -> bool {
        self.contains(tile)
    }
}

impl TileSet for Coverage {
    fn contains_tile(&self, tile: &TileCoord) -> bool {
        self.contains(tile)
    }
}

/// True iff all eight neighbours of `tile` are in `tiles`
pub fn is_neighboured<S: TileSet + ?Sized>(tile: &TileCoord, tiles: &S) -> bool {
    tile.neighbours()
        .iter()
        .all(|neighbour| neighbour.map_or(false, |n| tiles.contains_tile(&n)))
}

/// Tile image padded with a quarter tile border from its neighbours.
///
/// The result is `(w + w/2) x (h + h/2)` with the tile at its center. Missing
/// or unreadable neighbours leave their border zero filled.
///
/// # Errors
/// - `Error::Config` if `tile` itself is not in `tiles`
/// - `Error::ImageRead` if the tile image can't be read
pub fn buffer_with_neighbours(
    tile: &TileCoord,
    tiles: &HashMap<TileCoord, PathBuf>,
    bands: &[usize],
) -> Result<TileImage> {
    let center_path = tiles
        .get(tile)
        .ok_or_else(|| Error::Config(format!("{} is not in the tile set", tile)))?;
    let center = try_read_image(center_path, Some(bands))?;

    let (w, h, b) = (center.width(), center.height(), center.bands());
    let (ox, oy) = (w / 4, h / 4);

    // 3x3 grid, row by row, center included
    let mut grid: Vec<Option<TileImage>> = Vec::with_capacity(9);
    for dy in -1i64..=1 {
        for dx in -1i64..=1 {
            if dx == 0 && dy == 0 {
                grid.push(Some(center.clone()));
                continue;
            }
            let image = tile
                .offset(dx, dy)
                .and_then(|n| tiles.get(&n))
                .and_then(|path| read_image(path, Some(bands)))
                .filter(|img| img.width() == w && img.height() == h && img.bands() == b);
            grid.push(image);
        }
    }

    // Output coordinate -> (grid cell, source coordinate)
    let split = |v: u32, offset: u32, size: u32| -> (usize, u32) {
        if v < offset {
            (0, size - offset + v)
        } else if v < offset + size {
            (1, v - offset)
        } else {
            (2, v - offset - size)
        }
    };

    let mut out = TileImage::new(w + 2 * ox, h + 2 * oy, b);
    for y in 0..out.height() {
        let (row, sy) = split(y, oy, h);
        for x in 0..out.width() {
            let (col, sx) = split(x, ox, w);
            if let Some(source) = &grid[row * 3 + col] {
                for band in 0..b {
                    out.set(x, y, band, source.get(sx, sy, band));
                }
            }
        }
    }

    Ok(out)
}

/// How [`subset_directory`] handles the selected tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubsetMode {
    /// Relative symbolic links
    #[default]
    Link,
    Copy,
    /// Remove the tiles from the source tree
    Delete,
}

/// Outcome of a subset run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubsetReport {
    pub processed: usize,
    pub missing: usize,
    pub extensions: BTreeSet<String>,
}

/// Path of `target` relative to directory `base`. Both must exist.
fn relative_path(target: &Path, base: &Path) -> Result<PathBuf> {
    let target = fs::canonicalize(target)?;
    let base = fs::canonicalize(base)?;

    let target_parts: Vec<Component> = target.components().collect();
    let base_parts: Vec<Component> = base.components().collect();
    let common = target_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base_parts.len() {
        relative.push("..");
    }
    for part in &target_parts[common..] {
        relative.push(part.as_os_str());
    }
    Ok(relative)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

/// Link, copy or delete the tiles of `cover` found in the `src` tree.
///
/// Tiles missing from `src` are warned about and skipped. `out` is unused
/// when deleting.
pub fn subset_directory(
    src: &Path,
    cover: &Coverage,
    out: &Path,
    mode: SubsetMode,
) -> Result<SubsetReport> {
    let mut report = SubsetReport::default();

    for tile in cover {
        let Some(source) = tile_from_directory(src, tile)? else {
            log::warn!("skipping tile {}, not in {}", tile, src.display());
            report.missing += 1;
            continue;
        };

        if let Some(ext) = source.extension().and_then(|e| e.to_str()) {
            report.extensions.insert(ext.to_string());
        }

        if mode == SubsetMode::Delete {
            fs::remove_file(&source)?;
            report.processed += 1;
            continue;
        }

        let dst_dir = out.join(tile.z.to_string()).join(tile.x.to_string());
        fs::create_dir_all(&dst_dir)?;
        let file_name = source
            .file_name()
            .ok_or_else(|| Error::Config(format!("{} has no file name", source.display())))?;
        let dst = dst_dir.join(file_name);

        match mode {
            SubsetMode::Copy => {
                fs::copy(&source, &dst)?;
            }
            _ => {
                if dst.symlink_metadata().is_ok() {
                    fs::remove_file(&dst)?;
                }
                symlink(&relative_path(&source, &dst_dir)?, &dst)?;
            }
        }
        report.processed += 1;
    }

    Ok(report)
}
