// Benchmark suite for the hot paths: polygon burning, coverage building,
// label rasterization and raster warping.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use geo::{Coord, Geometry, LineString, Polygon};
use neo_tiles_core::cover::{build_coverage, BoundingBox, CoverSource};
use neo_tiles_core::crs::EPSG_WEB_MERCATOR;
use neo_tiles_core::raster::warp_tile;
use neo_tiles_core::rasterize::burn_tile;
use neo_tiles_core::spatial_index::{burn_polygon, index_geometries};
use neo_tiles_core::tile::lng_lat_to_tile;
use neo_tiles_core::{InMemoryRaster, IndexConfig, Resampling, TileCoord};

/// Regular polygon of `n` vertices around (lng, lat)
fn ngon(lng: f64, lat: f64, radius: f64, n: usize) -> Polygon<f64> {
    let coords = (0..=n)
        .map(|i| {
            let a = i as f64 / n as f64 * std::f64::consts::TAU;
            Coord {
                x: lng + radius * a.cos(),
                y: lat + radius * a.sin(),
            }
        })
        .collect();
    Polygon::new(LineString::new(coords), vec![])
}

fn bench_burn_polygon(c: &mut Criterion) {
    let polygon = ngon(2.35, 48.85, 0.05, 256);

    c.bench_function("burn_polygon_z16", |b| {
        b.iter(|| black_box(burn_polygon(black_box(&polygon), 16)))
    });
}

fn bench_index_geometries(c: &mut Criterion) {
    let geometries: Vec<Geometry<f64>> = (0..200)
        .map(|i| {
            let lng = 2.30 + (i % 20) as f64 * 0.005;
            let lat = 48.80 + (i / 20) as f64 * 0.005;
            Geometry::Polygon(ngon(lng, lat, 0.001, 32))
        })
        .collect();
    let config = IndexConfig::new(17);

    c.bench_function("index_200_polygons_z17", |b| {
        b.iter(|| black_box(index_geometries(geometries.clone(), 4326, &config).unwrap()))
    });
}

fn bench_cover_bbox(c: &mut Criterion) {
    let bbox: BoundingBox = "2.25,48.81,2.42,48.90".parse().unwrap();
    let source = CoverSource::BBox(bbox);

    c.bench_function("cover_bbox_z16", |b| {
        b.iter(|| black_box(build_coverage(&source, Some(16)).unwrap()))
    });
}

fn bench_burn_tile(c: &mut Criterion) {
    let tile = lng_lat_to_tile(2.35, 48.85, 16);
    let (lng, lat) = tile.bounds().center();
    let polygon = ngon(lng, lat, 0.002, 128);

    c.bench_function("burn_tile_512", |b| {
        b.iter(|| black_box(burn_tile(&tile, std::slice::from_ref(&polygon), (512, 512), 1)))
    });
}

fn bench_warp_tile(c: &mut Criterion) {
    let tile = TileCoord::new(300, 200, 9);
    let m = tile.mercator_bounds();
    let plane: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let raster = InMemoryRaster::from_u8(
        "bench",
        Some(EPSG_WEB_MERCATOR),
        [m.x_min, m.y_min, m.x_max, m.y_max],
        (1024, 1024),
        vec![plane.clone(), plane.clone(), plane],
    )
    .unwrap();

    c.bench_function("warp_tile_512_bilinear", |b| {
        b.iter(|| black_box(warp_tile(&raster, &tile, (512, 512), &[1, 2, 3], Resampling::Bilinear).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_burn_polygon,
    bench_index_geometries,
    bench_cover_bbox,
    bench_burn_tile,
    bench_warp_tile
);
criterion_main!(benches);
