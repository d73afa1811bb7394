//! A tile manager: one lazily-materialised grid of tiles covering a
//! rectangular image at a single resolution level, grounded on
//! `tile_manager.c`'s `TileManager`/`TileLevel` pair.
//!
//! `spec.md` §9 calls for "an explicit store object passed into managers at
//! construction" and "a single validate-callback trait instead of a
//! function-pointer-plus-opaque-data pair" in place of the source's global
//! state and `TileValidateProc`; both land here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::arena::TileId;
use crate::store::{TileHandle, TileStore};
use crate::tile::RowHint;
use crate::Error;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one [`TileManager`] for attachment bookkeeping. Cheap to
/// copy, stable for the manager's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerId(u64);

impl ManagerId {
    fn next() -> Self {
        ManagerId(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn for_test(n: u64) -> Self {
        ManagerId(n)
    }
}

/// Gives the owning subsystem a chance to synthesise pixels the first time
/// a tile is borrowed invalid. Replaces the source's
/// `(TileValidateProc, gpointer)` pair with one trait object per manager
/// (`spec.md` §9).
pub trait ValidateCallback: Send + Sync {
    /// Called with a write-borrowed handle to the tile at `(col, row)`.
    /// The implementation fills the payload and marks the tile valid via
    /// [`TileHandle::mark_valid`]; a callback that returns without marking
    /// the tile valid leaves it invalid (it will be invoked again on the
    /// next borrow).
    fn validate(&self, manager: &TileManager, col: u32, row: u32, tile: &TileHandle);
}

/// A lazily-materialised grid of tiles covering one `width x height` image
/// at `bpp` bytes per pixel, tiled into `tile_size`-edge squares (the last
/// row/column may be a partial, smaller edge (`spec.md` §3's "edge tiles").
pub struct TileManager {
    id: ManagerId,
    store: Arc<TileStore>,
    width: u32,
    height: u32,
    bpp: u8,
    tile_size: u32,
    cols: u32,
    rows: u32,
    slots: Mutex<Option<Vec<TileId>>>,
    validate: Mutex<Option<Arc<dyn ValidateCallback>>>,
    user_data: Mutex<Option<Arc<dyn std::any::Any + Send + Sync>>>,
}

impl TileManager {
    /// Creates a manager over `width x height` pixels at `bpp` bytes/pixel,
    /// tiled at `store`'s configured tile size. No tiles are created yet;
    /// the grid materialises lazily on first access (`spec.md` §4.1).
    pub fn new(store: Arc<TileStore>, width: u32, height: u32, bpp: u8) -> Arc<Self> {
        let tile_size = store.config().tile_size;
        let cols = width.div_ceil(tile_size).max(1);
        let rows = height.div_ceil(tile_size).max(1);
        Arc::new(Self {
            id: ManagerId::next(),
            store,
            width,
            height,
            bpp,
            tile_size,
            cols,
            rows,
            slots: Mutex::new(None),
            validate: Mutex::new(None),
            user_data: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ManagerId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bpp(&self) -> u8 {
        self.bpp
    }

    pub fn level_width(&self) -> u32 {
        self.width
    }

    pub fn level_height(&self) -> u32 {
        self.height
    }

    pub fn level_bpp(&self) -> u8 {
        self.bpp
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn tile_cols(&self) -> u32 {
        self.cols
    }

    /// Reports whether the tile at `(col, row)` is currently valid, without
    /// borrowing it or triggering validation. Used by
    /// [`crate::region::PixelRegion::probe`].
    pub fn is_tile_valid(&self, col: u32, row: u32) -> Option<bool> {
        let id = self.tile_id_at(col, row)?;
        self.store.peek_valid(id)
    }

    /// The id of the tile currently occupying `(col, row)`, materialising
    /// the grid if this is the first access. Two managers sharing the same
    /// [`TileId`] (via [`TileManager::map`]) are sharing the same tile.
    pub fn tile_at(&self, col: u32, row: u32) -> Option<TileId> {
        self.tile_id_at(col, row)
    }

    /// Current share count of the tile at `(col, row)`: the number of
    /// manager slots attached to it, including this one.
    pub fn share_count(&self, col: u32, row: u32) -> u32 {
        self.tile_id_at(col, row).map(|id| self.store.share_count(id)).unwrap_or(0)
    }

    pub fn tile_rows(&self) -> u32 {
        self.rows
    }

    /// Installs the callback invoked to synthesise pixels for invalid
    /// tiles. Replaces any previously installed callback.
    pub fn set_validate_callback(&self, callback: Arc<dyn ValidateCallback>) {
        *self.validate.lock().unwrap() = Some(callback);
    }

    /// Attaches caller-defined data to this manager, retrievable via
    /// [`TileManager::user_data`]. Mirrors the source's opaque
    /// `tile_manager_set_user_data`.
    pub fn set_user_data(&self, data: Arc<dyn std::any::Any + Send + Sync>) {
        *self.user_data.lock().unwrap() = Some(data);
    }

    pub fn user_data(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.user_data.lock().unwrap().clone()
    }

    /// Converts a pixel coordinate to (tile col, tile row, x within tile, y
    /// within tile), or `None` if the coordinate lies outside the image;
    /// an out-of-range lookup is an ordinary expected outcome, not an
    /// error (`spec.md` §7).
    pub fn pixel_to_tile(&self, x: u32, y: u32) -> Option<(u32, u32, u32, u32)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let col = x / self.tile_size;
        let row = y / self.tile_size;
        Some((col, row, x % self.tile_size, y % self.tile_size))
    }

    /// `get-tile-coordinates(tile)`: finds the attachment of `tile` that
    /// belongs to this manager and returns the pixel origin `(x, y)` of the
    /// slot it occupies. Warns and returns [`Error::NotOwned`] if `tile`
    /// isn't attached to this manager (`spec.md` §4.1). Unlike an
    /// out-of-range pixel/tile index, this is a caller misusing the
    /// protocol with the wrong manager, not an ordinary miss.
    pub fn get_tile_coordinates(&self, tile: TileId) -> Result<(u32, u32), Error> {
        let entry = self.store.entry(tile).ok_or(Error::NotOwned)?;
        let slot_index = entry
            .meta
            .lock()
            .unwrap()
            .attachments
            .iter()
            .find(|a| a.manager == self.id)
            .map(|a| a.slot_index);

        match slot_index {
            Some(slot_index) => {
                let col = slot_index as u32 % self.cols;
                let row = slot_index as u32 / self.cols;
                Ok((col * self.tile_size, row * self.tile_size))
            }
            None => {
                tracing::warn!(manager = ?self.id, "get_tile_coordinates: tile not attached to this manager");
                Err(Error::NotOwned)
            }
        }
    }

    fn slot_index(&self, col: u32, row: u32) -> Option<usize> {
        if col >= self.cols || row >= self.rows {
            return None;
        }
        Some((row * self.cols + col) as usize)
    }

    pub(crate) fn tile_edge(&self, col: u32, row: u32) -> (u16, u16) {
        let ew = if col + 1 == self.cols {
            self.width - col * self.tile_size
        } else {
            self.tile_size
        };
        let eh = if row + 1 == self.rows {
            self.height - row * self.tile_size
        } else {
            self.tile_size
        };
        (ew as u16, eh as u16)
    }

    /// Materialises the tile grid on first access: creates one unattached
    /// tile per slot (sized to its edge, which may be smaller than
    /// `tile_size` on the last row/column) and attaches each to this
    /// manager.
    fn ensure_materialized(&self) {
        let mut slots = self.slots.lock().unwrap();
        if slots.is_some() {
            return;
        }
        let mut grid = Vec::with_capacity((self.cols * self.rows) as usize);
        for row in 0..self.rows {
            for col in 0..self.cols {
                let (ew, eh) = self.tile_edge(col, row);
                let id = self.store.create_tile(ew, eh, self.bpp);
                let slot_index = grid.len();
                self.store.attach(id, self.id, slot_index);
                grid.push(id);
            }
        }
        *slots = Some(grid);
    }

    fn tile_id_at(&self, col: u32, row: u32) -> Option<TileId> {
        self.ensure_materialized();
        let slot_index = self.slot_index(col, row)?;
        self.slots.lock().unwrap().as_ref().unwrap().get(slot_index).copied()
    }

    /// `borrow-by-index(col, row, write?)`: the full borrow path,
    /// materialising the grid lazily, running copy-on-write if a
    /// write-borrow targets a shared tile, swapping the payload in, and
    /// invoking the validate callback (outside any lock) if the tile was
    /// invalid. Returns `None` if `(col, row)` is outside the grid.
    pub fn borrow_by_index(self: &Arc<Self>, col: u32, row: u32, want_write: bool) -> Option<TileHandle> {
        let slot_index = self.slot_index(col, row)?;
        self.ensure_materialized();

        let mut id = *self.slots.lock().unwrap().as_ref().unwrap().get(slot_index)?;

        if want_write && self.store.share_count(id) > 1 {
            id = self.copy_on_write(slot_index, id);
        }

        let (handle, needs_validate) = self.store.borrow(id, want_write)?;

        if needs_validate {
            if let Some(callback) = self.validate.lock().unwrap().clone() {
                callback.validate(self, col, row, &handle);
            }
        }

        Some(handle)
    }

    /// `borrow-at-pixel(x, y, write?)`: resolves the pixel coordinate to a
    /// tile and delegates to [`TileManager::borrow_by_index`].
    pub fn borrow_at_pixel(self: &Arc<Self>, x: u32, y: u32, want_write: bool) -> Option<TileHandle> {
        let (col, row, _, _) = self.pixel_to_tile(x, y)?;
        self.borrow_by_index(col, row, want_write)
    }

    /// Hints that the tile at `(x, y)` will likely be borrowed soon.
    /// Delegates to the swap store's `in_async`; the default swap store
    /// implements it as a no-op (`spec.md` §9's "explicit, optional,
    /// no-op-by-default prefetch channel").
    pub fn prefetch_at_pixel(self: &Arc<Self>, x: u32, y: u32) {
        let Some((col, row, _, _)) = self.pixel_to_tile(x, y) else {
            return;
        };
        if let Some(id) = self.tile_id_at(col, row) {
            if let Some(extent) = self.store.swap_extent(id) {
                self.store.prefetch(extent);
            }
        }
    }

    /// Detaches the occupant tile at `(col, row)` (destroying it if this
    /// was its last attachment) and attaches `replacement` in its place,
    /// which must match this manager's per-tile dimensions and bpp.
    /// `spec.md` §4.1 `map`: replaces a tile wholesale, e.g. to plug a tile
    /// owned by another manager into this grid.
    pub fn map(&self, col: u32, row: u32, replacement: TileId) -> Result<(), Error> {
        self.ensure_materialized();
        let slot_index = self.slot_index(col, row).ok_or(Error::NotAttached)?;

        let (expect_ew, expect_eh) = self.tile_edge(col, row);
        let entry = self.store.entry(replacement).ok_or(Error::NotOwned)?;
        {
            let meta = entry.meta.lock().unwrap();
            if meta.ewidth != expect_ew || meta.eheight != expect_eh || meta.bpp != self.bpp {
                return Err(Error::dimension_mismatch(
                    (expect_ew as u32, expect_eh as u32, self.bpp),
                    (meta.ewidth as u32, meta.eheight as u32, meta.bpp),
                ));
            }
        }

        let mut slots = self.slots.lock().unwrap();
        let grid = slots.as_mut().unwrap();
        let old_id = grid[slot_index];
        self.store.attach(replacement, self.id, slot_index);
        grid[slot_index] = replacement;
        drop(slots);
        let _ = self.store.detach(old_id, self.id, slot_index);
        Ok(())
    }

    /// `map-at-pixel`: resolves `(x, y)` to a tile slot and delegates to
    /// [`TileManager::map`].
    pub fn map_at_pixel(&self, x: u32, y: u32, replacement: TileId) -> Result<(), Error> {
        let (col, row, _, _) = self.pixel_to_tile(x, y).ok_or(Error::NotAttached)?;
        self.map(col, row, replacement)
    }

    /// Marks the tile at `(col, row)` valid without going through a borrow
    /// used by callers that fill tiles outside the normal validate-
    /// callback path.
    pub fn validate_tile(&self, col: u32, row: u32) {
        if let Some(id) = self.tile_id_at(col, row) {
            self.store.mark_valid(id);
        }
    }

    pub fn row_hint(&self, col: u32, row: u32, pixel_row: usize) -> Option<RowHint> {
        let id = self.tile_id_at(col, row)?;
        self.store.row_hint(id, pixel_row)
    }

    pub fn set_row_hint(&self, col: u32, row: u32, pixel_row: usize, hint: RowHint) {
        if let Some(id) = self.tile_id_at(col, row) {
            self.store.set_row_hint(id, pixel_row, hint);
        }
    }

    /// Invalidates the tile at `(col, row)` in place. If the tile is
    /// shared, it is first cloned and the clone swapped into this slot so
    /// other attachments are unaffected, matching the copy-on-write
    /// discipline used for writes.
    pub fn invalidate(&self, col: u32, row: u32) {
        let Some(slot_index) = self.slot_index(col, row) else {
            return;
        };
        self.ensure_materialized();
        let id = {
            let slots = self.slots.lock().unwrap();
            *slots.as_ref().unwrap().get(slot_index).unwrap()
        };

        if self.store.share_count(id) > 1 {
            let new_id = self.copy_on_write(slot_index, id);
            self.store.invalidate_unshared(new_id);
        } else {
            self.store.invalidate_unshared(id);
        }
    }

    /// Clones `id`'s payload into a fresh tile, attaches it in place of
    /// `id` at `slot_index`, detaches `id` from this manager (leaving it
    /// attached to whichever other managers still reference it), and
    /// returns the new tile's id.
    fn copy_on_write(&self, slot_index: usize, id: TileId) -> TileId {
        let new_id = self
            .store
            .clone_tile(id)
            .expect("tile referenced by a live slot must exist in the arena");

        self.store.attach(new_id, self.id, slot_index);
        {
            let mut slots = self.slots.lock().unwrap();
            slots.as_mut().unwrap()[slot_index] = new_id;
        }
        let _ = self.store.detach(id, self.id, slot_index);
        new_id
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &Arc<TileStore> {
        &self.store
    }
}

impl Drop for TileManager {
    /// Detaches every materialised slot. A tile still attached to another
    /// manager survives; one with no remaining attachments is freed,
    /// including its swap extent.
    fn drop(&mut self) {
        if let Some(grid) = self.slots.get_mut().unwrap().take() {
            for (slot_index, id) in grid.into_iter().enumerate() {
                let _ = self.store.detach(id, self.id, slot_index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::swap::FileSwapStore;

    fn test_manager(width: u32, height: u32, bpp: u8) -> Arc<TileManager> {
        let dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        let swap = Arc::new(FileSwapStore::new(dir.path(), 16, 4096));
        let swap_id = swap.add().unwrap();
        let config = Config {
            tile_size: 64,
            ..Config::defaults()
        };
        let store = TileStore::new(swap, swap_id, config);
        TileManager::new(store, width, height, bpp)
    }

    #[test]
    fn coordinates_map_into_tile_grid() {
        let manager = test_manager(200, 100, 4);
        assert_eq!(manager.tile_cols(), 4);
        assert_eq!(manager.tile_rows(), 2);

        let (col, row, tx, ty) = manager.pixel_to_tile(70, 10).unwrap();
        assert_eq!((col, row), (1, 0));
        assert_eq!((tx, ty), (6, 10));

        assert!(manager.pixel_to_tile(200, 0).is_none());
        assert!(manager.pixel_to_tile(0, 100).is_none());
    }

    #[test]
    fn borrow_at_pixel_materialises_grid_lazily() {
        let manager = test_manager(130, 70, 1);
        assert!(manager.slots.lock().unwrap().is_none());

        let handle = manager.borrow_at_pixel(0, 0, true).unwrap();
        assert_eq!(handle.ewidth(), 64);
        assert_eq!(handle.eheight(), 64);
        drop(handle);

        assert!(manager.slots.lock().unwrap().is_some());
    }

    #[test]
    fn write_borrow_on_shared_tile_copies_on_write() {
        let manager = test_manager(64, 64, 1);
        let tile_id = manager.tile_id_at(0, 0).unwrap();

        // Simulate a second manager sharing the same tile.
        manager.store().attach(tile_id, ManagerId::for_test(99), 0);
        assert_eq!(manager.store().share_count(tile_id), 2);

        let handle = manager.borrow_by_index(0, 0, true).unwrap();
        assert_ne!(handle.id(), tile_id, "write-borrow of a shared tile must COW");
        assert_eq!(manager.store().share_count(tile_id), 1, "original tile keeps the other attachment");
    }

    #[test]
    fn edge_tiles_are_smaller() {
        let manager = test_manager(70, 70, 1);
        let handle = manager.borrow_by_index(1, 1, false).unwrap();
        assert_eq!(handle.ewidth(), 6);
        assert_eq!(handle.eheight(), 6);
    }
}
