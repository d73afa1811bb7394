//! A concurrent, paged tile store: copy-on-write tile sharing across
//! managers, a bounded in-memory cache, and a disk-backed swap store for
//! whatever doesn't fit.
//!
//! Grounded on the GIMP tile manager (`tile.c` / `tile-manager.c` /
//! `tile-cache.c` / `tile-swap.c` / `pixel-region.c`), reworked behind
//! Rust's ownership model instead of manual refcounting: an arena of tiles
//! addressed by stable id, copy-on-write triggered by an attachment-count
//! check rather than a shared mutable struct, and a cache/swap pipeline
//! that never touches a tile's bytes without holding the right lock for no
//! longer than it has to.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    PixelRegion / process / process_parallel       │
//! │            rectangular cursor, lock-step multi-region kernels      │
//! ├──────────────────────────────────────────────────────────────────┤
//! │         Pyramid                    │         TileManager           │
//! │  chain of half-res managers,        │  lazily materialised tile     │
//! │  invalidate / update_sublevel       │  grid, borrow/map/validate    │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                           TileStore                                │
//! │   borrow/release/attach/detach protocol bridging the three below   │
//! ├───────────────────┬──────────────────────┬─────────────────────────┤
//! │     TileArena      │      TileCache       │       SwapStore         │
//! │  stable-id slots   │  bounded LRU of      │  free-gap allocator,    │
//! │  owning TileEntry   │  resident-but-       │  bounded open-fd pool   │
//! │                     │  unreferenced tiles  │  (FileSwapStore)        │
//! └───────────────────┴──────────────────────┴─────────────────────────┘
//! ```
//!
//! # Concurrency
//!
//! Each tile's control-plane state (`TileMeta`: counts, attachments, flags)
//! and payload bytes are guarded separately, so pixel kernels run with only
//! the payload lock held, never the tile's control mutex, and never more
//! than one tile's payload lock per thread outside of copy-on-write. Lock
//! order when more than one is needed: tile mutex before the swap store's
//! internal locks, never the reverse.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vfx_tilestore::{process, Config, PixelRegion, Rect, TileManager, TileStore};
//!
//! # fn main() -> std::io::Result<()> {
//! let store = TileStore::open("/tmp/my-app-swap", Config::from_env())?;
//! let manager = TileManager::new(store, 1920, 1080, 4);
//!
//! let mut region = PixelRegion::start(Arc::clone(&manager), Rect::new(0, 0, 1920, 1080), false, true);
//! process(std::slice::from_mut(&mut region), |views, _sub| {
//!     let view = &views[0];
//!     let mut payload = view.write();
//!     payload.as_mut().unwrap().fill(0);
//! });
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod pyramid;
pub mod region;
pub mod store;
pub mod swap;
pub mod tile;

pub use arena::TileId;
pub use cache::TileCache;
pub use config::Config;
pub use error::{Error, Result};
pub use manager::{ManagerId, TileManager, ValidateCallback};
pub use pyramid::Pyramid;
pub use region::{process, process_parallel, PixelRegion, Rect, RegionView};
pub use store::{TileHandle, TileStore};
pub use swap::{FileSwapStore, SwapId, SwapStore};
pub use tile::{RowHint, SwapExtent};
