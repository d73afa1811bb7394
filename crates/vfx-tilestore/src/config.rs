//! Process-wide tunables for the tile store.
//!
//! # Environment Variables
//!
//! - `VFX_TILESTORE_CACHE_MB`: cache high-water mark, in MiB.
//! - `VFX_TILESTORE_SWAP_GROWTH_TILES`: swap file growth quantum, in units
//!   of one maximum-size tile.
//! - `VFX_TILESTORE_MAX_OPEN_SWAP_FILES`: bounded fd pool size.
//! - `VFX_TILESTORE_TILE_SIZE`: override for the tile width/height.
//!
//! These map onto `spec.md` §5's "shared-resource policy": immutable after
//! the store is constructed, set once at process start.

use std::env;

/// Default tile edge length. Tiles are square. Power of two, per the
/// contract in §6: external rasters are always tiled at this granularity.
pub const DEFAULT_TILE_SIZE: u32 = 64;

/// Default cache high-water mark: 64 MiB.
pub const DEFAULT_CACHE_BYTES: u64 = 64 * 1024 * 1024;

/// Default swap growth quantum, in units of one maximum-size tile (4 bytes
/// per pixel, `DEFAULT_TILE_SIZE` square), matching the source's
/// `16 * TILE_WIDTH * TILE_HEIGHT * 4`.
pub const DEFAULT_SWAP_GROWTH_TILES: u64 = 16;

/// Default bounded open-fd pool size, matching `MAX_OPEN_SWAP_FILES`.
pub const DEFAULT_MAX_OPEN_SWAP_FILES: usize = 16;

/// Immutable-after-construction settings for a [`crate::swap::FileSwapStore`]
/// and the [`crate::cache::TileCache`] it backs.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Tile edge length in pixels. Tiles are square.
    pub tile_size: u32,
    /// Cache high-water mark in bytes.
    pub cache_bytes: u64,
    /// Swap file growth quantum in bytes.
    pub swap_growth_bytes: u64,
    /// Bounded count of simultaneously open swap file descriptors.
    pub max_open_swap_files: usize,
}

impl Config {
    /// Built-in defaults, ignoring environment overrides.
    pub fn defaults() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            cache_bytes: DEFAULT_CACHE_BYTES,
            swap_growth_bytes: DEFAULT_SWAP_GROWTH_TILES * max_tile_bytes(DEFAULT_TILE_SIZE),
            max_open_swap_files: DEFAULT_MAX_OPEN_SWAP_FILES,
        }
    }

    /// Defaults overridden by `VFX_TILESTORE_*` environment variables where
    /// present and parseable; malformed values are ignored in favour of the
    /// default, not treated as an error.
    pub fn from_env() -> Self {
        let mut cfg = Self::defaults();

        if let Some(size) = env_tile_size() {
            cfg.tile_size = size;
            cfg.swap_growth_bytes = DEFAULT_SWAP_GROWTH_TILES * max_tile_bytes(size);
        }
        if let Some(mb) = env_u64("VFX_TILESTORE_CACHE_MB") {
            cfg.cache_bytes = mb * 1024 * 1024;
        }
        if let Some(tiles) = env_u64("VFX_TILESTORE_SWAP_GROWTH_TILES") {
            cfg.swap_growth_bytes = tiles * max_tile_bytes(cfg.tile_size);
        }
        if let Some(n) = env_u64("VFX_TILESTORE_MAX_OPEN_SWAP_FILES") {
            cfg.max_open_swap_files = n as usize;
        }

        cfg
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Bytes occupied by one tile at the maximum supported bytes-per-pixel (4:
/// RGBA at 8 bits, matching the source's `TILE_WIDTH * TILE_HEIGHT * 4`).
fn max_tile_bytes(tile_size: u32) -> u64 {
    tile_size as u64 * tile_size as u64 * 4
}

fn env_tile_size() -> Option<u32> {
    env::var("VFX_TILESTORE_TILE_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&s: &u32| s.is_power_of_two() && s >= 8 && s <= 1024)
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_source_constants() {
        let cfg = Config::defaults();
        assert_eq!(cfg.tile_size, 64);
        assert_eq!(cfg.max_open_swap_files, 16);
        assert_eq!(cfg.swap_growth_bytes, 16 * 64 * 64 * 4);
    }
}
