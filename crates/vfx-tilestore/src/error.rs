//! Error types for the tile store.
//!
//! # Overview
//!
//! Most of the tile store's failure modes are not exceptional: an
//! out-of-range coordinate is just a `None`, and the borrow/release protocol
//! returns booleans where the source does. The [`Error`] enum here exists
//! for the minority of failures that need more than that: disk I/O on the
//! swap store, and misuse of the attach/detach/map protocol that a caller
//! should be told about but that must not abort the process.
//!
//! ```rust
//! use vfx_tilestore::{Error, Result};
//!
//! fn check(dims: (u32, u32), other: (u32, u32)) -> Result<()> {
//!     if dims != other {
//!         return Err(Error::dimension_mismatch(dims, other));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors the tile store surfaces through a `Result`.
///
/// Out-of-range lookups (`borrow_at_pixel` past the manager's bounds, a
/// `TileId` from a destroyed slot) are deliberately *not* part of this enum:
/// per the store's error-handling policy those are silent `None` returns,
/// never logged, never an `Err`. This enum only covers I/O and protocol
/// misuse.
#[derive(Debug, Error)]
pub enum Error {
    /// A swap-store read, write, seek, or open failed.
    ///
    /// Logged once per kind by the swap store itself (see
    /// [`crate::swap`]); the tile involved is left in its prior state.
    #[error("swap I/O error: {0}")]
    SwapIo(#[from] std::io::Error),

    /// `map`/`map_at_pixel` was given a tile whose dimensions or bpp don't
    /// match the slot it's replacing.
    #[error("map dimension mismatch: slot is {slot_w}x{slot_h}@{slot_bpp}bpp, tile is {tile_w}x{tile_h}@{tile_bpp}bpp")]
    DimensionMismatch {
        /// Slot width in pixels.
        slot_w: u32,
        /// Slot height in pixels.
        slot_h: u32,
        /// Slot bytes-per-pixel.
        slot_bpp: u8,
        /// Incoming tile width in pixels.
        tile_w: u32,
        /// Incoming tile height in pixels.
        tile_h: u32,
        /// Incoming tile bytes-per-pixel.
        tile_bpp: u8,
    },

    /// `detach` was asked to remove an attachment that does not exist.
    #[error("detach of tile not attached to this manager slot")]
    NotAttached,

    /// `get_tile_coordinates` was asked about a tile that isn't attached to
    /// the manager it was called on.
    #[error("tile is not attached to this manager")]
    NotOwned,

    /// A write-borrow was requested on a tile whose share count is not 1
    /// after copy-on-write should have made it so. Indicates a borrow
    /// protocol invariant was violated by the caller.
    #[error("write-borrow requires share_count == 1, found {share_count}")]
    SharedWrite {
        /// Observed share count.
        share_count: u32,
    },

    /// Catch-all for configuration errors (e.g. a malformed environment
    /// variable override) surfaced at construction time.
    #[error("{0}")]
    Config(String),
}

impl Error {
    /// Creates an [`Error::DimensionMismatch`].
    #[inline]
    pub fn dimension_mismatch(slot: (u32, u32, u8), tile: (u32, u32, u8)) -> Self {
        Self::DimensionMismatch {
            slot_w: slot.0,
            slot_h: slot.1,
            slot_bpp: slot.2,
            tile_w: tile.0,
            tile_h: tile.1,
            tile_bpp: tile.2,
        }
    }

    /// Returns `true` if this is a swap I/O error.
    #[inline]
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::SwapIo(_))
    }

    /// Returns `true` if this is a protocol-misuse error (never a panic,
    /// always reported as a warning and skipped per the store's error
    /// handling policy).
    #[inline]
    pub fn is_protocol_misuse(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. } | Self::NotAttached | Self::NotOwned | Self::SharedWrite { .. }
        )
    }
}
