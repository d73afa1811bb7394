//! Ties the arena (component B's control-plane data), the swap store
//! (component A), and the cache (component C) together behind one object
//! that [`crate::manager::TileManager`]s share.
//!
//! `spec.md` §9 calls for "an explicit store object passed into managers at
//! construction" in place of the source's global mutable swap table / fd
//! list / cache. `TileStore` is that object.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::arena::{TileArena, TileId};
use crate::cache::TileCache;
use crate::config::Config;
use crate::manager::ManagerId;
use crate::swap::{FileSwapStore, SwapId, SwapStore};
use crate::tile::{Attachment, RowHint, SwapExtent, TileEntry};
use crate::Error;

/// Owns every live tile, the cache tracking which of them are resident-but-
/// unreferenced, and the swap store they page to.
pub struct TileStore {
    arena: TileArena,
    swap: Arc<dyn SwapStore>,
    swap_id: SwapId,
    cache: Mutex<TileCache>,
    config: Config,
}

impl TileStore {
    /// Creates a store backed by `swap`, using `swap_id` (already
    /// registered with it) for every tile this store creates.
    pub fn new(swap: Arc<dyn SwapStore>, swap_id: SwapId, config: Config) -> Arc<Self> {
        Arc::new(Self {
            arena: TileArena::new(),
            swap,
            swap_id,
            cache: Mutex::new(TileCache::new(config.cache_bytes)),
            config,
        })
    }

    pub fn config(&self) -> Config {
        self.config
    }

    /// Convenience constructor wiring a [`FileSwapStore`] rooted at
    /// `base_dir` (sized from `config`) and registering the one swap file
    /// this store's tiles will page to.
    pub fn open(base_dir: impl AsRef<Path>, config: Config) -> std::io::Result<Arc<Self>> {
        let swap = FileSwapStore::new(base_dir.as_ref(), config.max_open_swap_files, config.swap_growth_bytes);
        let swap_id = swap.add()?;
        Ok(Self::new(Arc::new(swap), swap_id, config))
    }

    /// Creates a fresh, unattached, invalid tile and returns its id.
    pub fn create_tile(&self, ewidth: u16, eheight: u16, bpp: u8) -> TileId {
        self.arena.insert(Arc::new(TileEntry::new(ewidth, eheight, bpp)))
    }

    /// Clones an existing tile's payload into a brand-new, unattached tile,
    /// the copy-on-write primitive used by
    /// [`crate::manager::TileManager::borrow_by_index`]. Swaps the source in
    /// first if it's currently evicted, so an evicted shared tile still
    /// copies byte-for-byte instead of cloning a `None` payload
    /// (`spec.md` §4.1 step 2: clone "byte-for-byte, allocating it if
    /// absent").
    pub fn clone_tile(&self, id: TileId) -> Option<TileId> {
        let entry = self.arena.get(id)?;
        if entry.payload.read().unwrap().is_none() {
            self.swap_in(&entry);
        }
        Some(self.arena.insert(Arc::new(entry.clone_payload())))
    }

    pub(crate) fn entry(&self, id: TileId) -> Option<Arc<TileEntry>> {
        self.arena.get(id)
    }

    /// Current share count (number of attachments) of a tile, or 0 if the
    /// id no longer names a live tile.
    pub fn share_count(&self, id: TileId) -> u32 {
        self.arena
            .get(id)
            .map(|e| e.meta.lock().unwrap().share_count())
            .unwrap_or(0)
    }

    /// `attach(tile, manager, index)`: prepends `(manager, index)` to the
    /// attachment list, incrementing `share_count`.
    pub fn attach(&self, id: TileId, manager: ManagerId, slot_index: usize) {
        if let Some(entry) = self.arena.get(id) {
            let mut meta = entry.meta.lock().unwrap();
            meta.attachments.insert(0, Attachment { manager, slot_index });
        }
    }

    /// `detach(tile, manager, index)`: unlinks the exact attachment; if the
    /// attachment list becomes empty, frees the in-memory buffer, releases
    /// any swap extent, and removes the tile from the arena.
    pub fn detach(&self, id: TileId, manager: ManagerId, slot_index: usize) -> Result<(), Error> {
        let entry = match self.arena.get(id) {
            Some(e) => e,
            None => return Ok(()),
        };

        let now_empty = {
            let mut meta = entry.meta.lock().unwrap();
            let pos = meta
                .attachments
                .iter()
                .position(|a| a.manager == manager && a.slot_index == slot_index);
            match pos {
                Some(p) => {
                    meta.attachments.remove(p);
                }
                None => {
                    tracing::warn!(?manager, slot_index, "detach of tile not attached to this slot");
                    return Err(Error::NotAttached);
                }
            }
            meta.attachments.is_empty()
        };

        if now_empty {
            let extent = entry.meta.lock().unwrap().swap_extent;
            if let Some(extent) = extent {
                if let Err(e) = self.swap.free(extent) {
                    tracing::warn!(error = %e, "failed to free swap extent on tile destruction");
                }
            }
            *entry.payload.write().unwrap() = None;
            self.cache.lock().unwrap().flush(id);
            self.arena.remove(id);
        }
        Ok(())
    }

    /// `borrow(tile, dirty?)`: increments `ref_count` (and `write_count` /
    /// sets `dirty` if this is a write-borrow), ensures the payload is
    /// resident, and removes the tile from the cache (a borrowed tile is
    /// never a cache member). Returns the handle plus whether the *caller*
    /// (a [`crate::manager::TileManager`]) must now run its validate
    /// callback, since validation is scoped to whichever manager initiated
    /// the borrow, not to the tile itself.
    pub fn borrow(self: &Arc<Self>, id: TileId, want_write: bool) -> Option<(TileHandle, bool)> {
        let entry = self.arena.get(id)?;

        {
            let mut meta = entry.meta.lock().unwrap();
            if want_write {
                debug_assert_eq!(
                    meta.share_count(),
                    1,
                    "write-borrow requires share_count == 1; copy-on-write must run first"
                );
            }
            meta.ref_count += 1;
            if want_write {
                meta.write_count += 1;
                meta.dirty = true;
            }
        }

        self.cache.lock().unwrap().flush(id);

        let needs_swap_in = entry.payload.read().unwrap().is_none();
        if needs_swap_in {
            self.swap_in(&entry);
        }

        let needs_validate = !entry.meta.lock().unwrap().valid;

        Some((
            TileHandle {
                store: Arc::clone(self),
                id,
                entry,
                write: want_write,
            },
            needs_validate,
        ))
    }

    /// `release(tile, dirty_override?)`: decrements `ref_count`; on the
    /// 1→0 transition, hands the tile to the cache, then performs eviction
    /// I/O (swap-out if dirty or never-swapped, buffer free) for whatever
    /// the cache kicks back over budget, which may include this very
    /// tile if the cache is already full.
    fn release(&self, id: TileId, entry: &Arc<TileEntry>, was_write: bool, dirty_override: bool) {
        let (ref_count, byte_len) = {
            let mut meta = entry.meta.lock().unwrap();
            meta.ref_count -= 1;
            if was_write {
                meta.write_count -= 1;
            }
            if dirty_override {
                meta.dirty = true;
            }
            (meta.ref_count, meta.byte_len())
        };

        if ref_count == 0 {
            let evicted = self.cache.lock().unwrap().insert(id, byte_len as u64);
            for victim in evicted {
                if let Some(victim_entry) = self.arena.get(victim) {
                    self.evict(&victim_entry);
                }
            }
        }
    }

    /// Demotes a resident, unreferenced tile to swap: writes it out if
    /// dirty or it has never been swapped, then frees the in-memory buffer.
    /// A clean tile with an up-to-date swap copy is just dropped.
    fn evict(&self, entry: &Arc<TileEntry>) {
        let needs_write = {
            let meta = entry.meta.lock().unwrap();
            meta.dirty || meta.swap_extent.is_none()
        };

        if needs_write {
            self.swap_out(entry);
        }
        *entry.payload.write().unwrap() = None;
    }

    fn swap_in(&self, entry: &Arc<TileEntry>) {
        let extent = entry.meta.lock().unwrap().swap_extent;
        let byte_len = entry.meta.lock().unwrap().byte_len();

        let mut buf = vec![0u8; byte_len];
        if let Some(extent) = extent {
            if let Err(e) = self.swap.read(extent, &mut buf) {
                tracing::warn!(error = %e, "swap-in failed, tile left uninitialised");
                // Per spec.md §7: borrow still completes with an allocated
                // but uninitialised buffer; caller sees an invalid tile.
            }
        }
        *entry.payload.write().unwrap() = Some(buf);
    }

    fn swap_out(&self, entry: &Arc<TileEntry>) {
        let byte_len = entry.meta.lock().unwrap().byte_len() as u64;
        let extent = entry.meta.lock().unwrap().swap_extent;

        let extent = match extent {
            Some(e) => e,
            None => match self.swap.allocate(self.swap_id, byte_len) {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(error = %err, "swap allocation failed, tile left dirty in memory");
                    return;
                }
            },
        };

        let payload = entry.payload.read().unwrap();
        let bytes = match payload.as_deref() {
            Some(bytes) => bytes,
            None => return,
        };

        match self.swap.write(extent, bytes) {
            Ok(()) => {
                drop(payload);
                let mut meta = entry.meta.lock().unwrap();
                meta.swap_extent = Some(extent);
                meta.dirty = false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "swap-out failed, tile left dirty in memory");
            }
        }
    }

    /// Forwards a prefetch hint to the swap store for an already-swapped-
    /// out extent. The default [`crate::swap::FileSwapStore`] ignores it.
    pub fn prefetch(&self, extent: SwapExtent) {
        self.swap.in_async(extent);
    }

    /// Reads the `valid` flag without borrowing: no ref-count change, no
    /// swap-in, no validate callback. Used by `probe`.
    pub fn peek_valid(&self, id: TileId) -> Option<bool> {
        self.arena.get(id).map(|e| e.meta.lock().unwrap().valid)
    }

    /// `validate-tile(tile)`: marks the tile valid. The validate callback
    /// itself is invoked by the manager, outside any lock, per §4.2 step 7.
    pub fn mark_valid(&self, id: TileId) {
        if let Some(entry) = self.arena.get(id) {
            entry.meta.lock().unwrap().valid = true;
        }
    }

    pub fn swap_extent(&self, id: TileId) -> Option<SwapExtent> {
        self.arena.get(id).and_then(|e| e.meta.lock().unwrap().swap_extent)
    }

    pub fn row_hint(&self, id: TileId, row: usize) -> Option<RowHint> {
        self.arena
            .get(id)
            .and_then(|e| e.meta.lock().unwrap().row_hints.get(row).copied())
    }

    pub fn set_row_hint(&self, id: TileId, row: usize, hint: RowHint) {
        if let Some(entry) = self.arena.get(id) {
            if let Some(slot) = entry.meta.lock().unwrap().row_hints.get_mut(row) {
                *slot = hint;
            }
        }
    }

    /// Invalidates a tile in place: if shared, the caller must have already
    /// detached/replaced the occupant (see
    /// [`crate::manager::TileManager::map`]); this just clears residency
    /// for an unshared tile: flush from cache, free the buffer, delete the
    /// swap extent, clear `valid`.
    pub fn invalidate_unshared(&self, id: TileId) {
        if let Some(entry) = self.arena.get(id) {
            self.cache.lock().unwrap().flush(id);
            *entry.payload.write().unwrap() = None;
            let extent = {
                let mut meta = entry.meta.lock().unwrap();
                meta.valid = false;
                meta.dirty = false;
                meta.swap_extent.take()
            };
            if let Some(extent) = extent {
                let _ = self.swap.free(extent);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cache_size_bytes(&self) -> u64 {
        self.cache.lock().unwrap().size_bytes()
    }

    #[cfg(test)]
    pub(crate) fn live_tile_count(&self) -> usize {
        self.arena.len()
    }

    #[cfg(test)]
    pub(crate) fn total_ref_count(&self) -> i64 {
        self.arena
            .live_tiles()
            .iter()
            .map(|(_, e)| e.meta.lock().unwrap().ref_count as i64)
            .sum()
    }

    #[cfg(test)]
    pub(crate) fn total_attachments(&self) -> usize {
        self.arena
            .live_tiles()
            .iter()
            .map(|(_, e)| e.meta.lock().unwrap().attachments.len())
            .sum()
    }
}

/// An RAII borrow of one tile's payload.
///
/// Dropping the handle releases the borrow (`spec.md` §4.2 `release`).
/// Holding this handle does *not* hold the tile's control-plane mutex;
/// reading or writing the payload locks only the per-tile `RwLock`, for the
/// duration of that one access, matching §5's "pixel kernels run with the
/// mutex released."
pub struct TileHandle {
    store: Arc<TileStore>,
    id: TileId,
    entry: Arc<TileEntry>,
    write: bool,
}

impl TileHandle {
    pub fn id(&self) -> TileId {
        self.id
    }

    pub fn ewidth(&self) -> u16 {
        self.entry.meta.lock().unwrap().ewidth
    }

    pub fn eheight(&self) -> u16 {
        self.entry.meta.lock().unwrap().eheight
    }

    pub fn bpp(&self) -> u8 {
        self.entry.meta.lock().unwrap().bpp
    }

    pub fn is_valid(&self) -> bool {
        self.entry.meta.lock().unwrap().valid
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Reads the current payload bytes. Allocated lazily on first borrow,
    /// so this is always `Some` for a live handle.
    pub fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<Vec<u8>>> {
        self.entry.payload.read().unwrap()
    }

    /// Writes to the payload. Panics if this handle was not write-borrowed
    /// a programming error in the caller, not a recoverable condition.
    pub fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Vec<u8>>> {
        assert!(self.write, "tile handle was not write-borrowed");
        self.entry.payload.write().unwrap()
    }

    /// Marks the tile valid, as the last step of a validate callback.
    pub fn mark_valid(&self) {
        self.entry.meta.lock().unwrap().valid = true;
    }
}

impl Drop for TileHandle {
    fn drop(&mut self) {
        self.store.release(self.id, &self.entry, self.write, self.write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::FileSwapStore;

    #[test]
    fn attach_detach_destroys_on_empty() {
        let dir = tempfile::tempdir().unwrap();
        let swap = Arc::new(FileSwapStore::new(dir.path(), 16, 4096));
        let swap_id = swap.add().unwrap();
        let store = TileStore::new(swap, swap_id, Config::defaults());

        let id = store.create_tile(64, 64, 3);
        let m = ManagerId::for_test(1);
        store.attach(id, m, 0);
        assert_eq!(store.share_count(id), 1);

        store.detach(id, m, 0).unwrap();
        assert_eq!(store.live_tile_count(), 0);
    }

    #[test]
    fn borrow_release_balances_ref_count() {
        let dir = tempfile::tempdir().unwrap();
        let swap = Arc::new(FileSwapStore::new(dir.path(), 16, 4096));
        let swap_id = swap.add().unwrap();
        let store = TileStore::new(swap, swap_id, Config::defaults());

        let id = store.create_tile(64, 64, 3);
        store.attach(id, ManagerId::for_test(1), 0);

        {
            let (_handle, _needs_validate) = store.borrow(id, true).unwrap();
            assert_eq!(store.total_ref_count(), 1);
        }
        assert_eq!(store.total_ref_count(), 0);
    }

    #[test]
    fn eviction_round_trips_through_swap() {
        let dir = tempfile::tempdir().unwrap();
        let swap = Arc::new(FileSwapStore::new(dir.path(), 16, 4096));
        let swap_id = swap.add().unwrap();
        let config = Config {
            cache_bytes: 4096, // exactly one small tile
            ..Config::defaults()
        };
        let store = TileStore::new(swap, swap_id, config);

        let tile_a = store.create_tile(64, 64, 1);
        store.attach(tile_a, ManagerId::for_test(1), 0);
        let tile_b = store.create_tile(64, 64, 1);
        store.attach(tile_b, ManagerId::for_test(1), 1);

        {
            let (handle, _) = store.borrow(tile_a, true).unwrap();
            handle.write().as_mut().unwrap().fill(0xAA);
        }
        {
            let (handle, _) = store.borrow(tile_b, true).unwrap();
            handle.write().as_mut().unwrap().fill(0xBB);
        }
        // tile_a should have been evicted (written to swap, buffer freed)
        // to make room for tile_b under the one-tile-sized budget.
        assert!(store.cache_size_bytes() <= 4096);

        let (handle, _) = store.borrow(tile_a, false).unwrap();
        assert_eq!(handle.read().as_deref(), Some(&[0xAAu8; 64 * 64][..]));
    }
}
