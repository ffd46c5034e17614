//! Random partition of a coverage into percentage sized buckets.
//!
//! Bucket sizes are `floor(total * pct / 100)`. When the percentages add up
//! to exactly 100 the first bucket also takes the rounding remainder, so no
//! tile is lost. Smaller sums sample the coverage and leave the rest out.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{thread_rng, SeedableRng};

use crate::cover::Coverage;
use crate::tile::TileCoord;
use crate::{Error, Result};

/// Parse a `70/20/10` style split description
pub fn parse_splits(s: &str) -> Result<Vec<u32>> {
    s.split('/')
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| Error::Config(format!("Invalid split value: {}", s)))
        })
        .collect()
}

/// Shuffle `coverage` and cut it into one bucket per percentage.
///
/// # Arguments
///
/// * `coverage` - Tiles to partition
/// * `percentages` - Bucket sizes, summing to at most 100
/// * `seed` - Fixed seed for a reproducible shuffle, `None` for a random one
///
/// # Errors
/// - `Error::Config` if `percentages` is empty or its sum is 0 or above 100
/// - `Error::MixedZoom` if `coverage` spans several zoom levels
pub fn split_coverage(
    coverage: &Coverage,
    percentages: &[u32],
    seed: Option<u64>,
) -> Result<Vec<Coverage>> {
    let sum: u32 = percentages.iter().sum();
    if percentages.is_empty() || sum == 0 || sum > 100 {
        return Err(Error::Config(format!(
            "Invalid split percentages {:?}: sum must be in (0, 100]",
            percentages
        )));
    }
    coverage.zoom()?;

    let mut tiles: Vec<TileCoord> = coverage.iter().copied().collect();
    match seed {
        Some(seed) => tiles.shuffle(&mut StdRng::seed_from_u64(seed)),
        None => tiles.shuffle(&mut thread_rng()),
    }

    let total = tiles.len();
    let mut sizes: Vec<usize> = percentages
        .iter()
        .map(|&pct| total * pct as usize / 100)
        .collect();

    if sum == 100 {
        sizes[0] = total - sizes[1..].iter().sum::<usize>();
    }

    let mut buckets = Vec::with_capacity(sizes.len());
    let mut start = 0;
    for size in sizes {
        buckets.push(tiles[start..start + size].iter().copied().collect());
        start += size;
    }

    Ok(buckets)
}
