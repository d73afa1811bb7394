//! Tile data model: the control-plane state and payload bytes that live
//! behind one [`crate::arena::TileId`].
//!
//! This module holds plain data and the locks that guard it. The borrow /
//! release / attach / detach *protocol*, which needs to coordinate with the
//! swap store and cache, lives in [`crate::store`]; keeping that logic out
//! of this module is what lets a [`TileEntry`] be a value the arena owns
//! outright, per `spec.md` §9's redesign note.

use std::sync::{Mutex, RwLock};

use crate::manager::ManagerId;
use crate::swap::SwapId;

/// A tile's assigned location in a swap file, or absent if it has never
/// been written to swap. Tagged sum type replacing the source's
/// `swap_offset == -1` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapExtent {
    /// Which swap file this extent lives in.
    pub swap_id: SwapId,
    /// Start byte offset, inclusive.
    pub start: u64,
    /// End byte offset, exclusive.
    pub end: u64,
}

impl SwapExtent {
    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether this extent is empty (never constructed this way in
    /// practice, but kept for symmetry with `len`).
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A back-pointer from a tile to the one manager slot that references it.
/// `share_count` always equals the number of attachments on a tile; this
/// replaces the source's singly-linked `TileLink` list with a plain `Vec`
/// living in [`TileMeta`] rather than on the tile's C struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    /// Owning manager.
    pub manager: ManagerId,
    /// Row-major slot index within that manager's tile grid.
    pub slot_index: usize,
}

/// Per-row advisory summary used by compositors to skip work. Not
/// load-bearing for correctness; see `spec.md` GLOSSARY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowHint {
    #[default]
    Unknown,
    Opaque,
    Transparent,
    Mixed,
}

/// Control-plane state for one tile: everything except the payload bytes
/// themselves. Guarded by [`TileEntry::meta`].
#[derive(Debug)]
pub struct TileMeta {
    pub bpp: u8,
    pub ewidth: u16,
    pub eheight: u16,
    pub valid: bool,
    pub dirty: bool,
    pub ref_count: i32,
    pub write_count: i32,
    pub attachments: Vec<Attachment>,
    pub swap_extent: Option<SwapExtent>,
    pub row_hints: Vec<RowHint>,
}

impl TileMeta {
    fn new(ewidth: u16, eheight: u16, bpp: u8) -> Self {
        Self {
            bpp,
            ewidth,
            eheight,
            valid: false,
            dirty: false,
            ref_count: 0,
            write_count: 0,
            attachments: Vec::new(),
            swap_extent: None,
            row_hints: vec![RowHint::Unknown; eheight as usize],
        }
    }

    /// Number of managers attached to this tile. Invariant (§8.1): equals
    /// `attachments.len()` always, by construction: there is no separate
    /// counter to drift out of sync with the vector.
    pub fn share_count(&self) -> u32 {
        self.attachments.len() as u32
    }

    /// Size in bytes of this tile's payload, whether resident or not.
    pub fn byte_len(&self) -> usize {
        self.ewidth as usize * self.eheight as usize * self.bpp as usize
    }
}

/// One tile, owned by a [`crate::arena::TileArena`] slot.
///
/// Control state (`meta`) and payload bytes (`payload`) are guarded
/// separately: control-plane operations (attach/detach/borrow bookkeeping)
/// only ever need the small `Mutex<TileMeta>`, while pixel kernels read or
/// write through the `RwLock<Option<Vec<u8>>>` without touching `meta` at
/// all once a handle has been obtained, matching §5's requirement that
/// "pixel kernels run with the [tile] mutex released."
#[derive(Debug)]
pub struct TileEntry {
    pub(crate) meta: Mutex<TileMeta>,
    pub(crate) payload: RwLock<Option<Vec<u8>>>,
}

impl TileEntry {
    /// Creates a fresh, invalid, unattached, payload-less tile.
    pub fn new(ewidth: u16, eheight: u16, bpp: u8) -> Self {
        Self {
            meta: Mutex::new(TileMeta::new(ewidth, eheight, bpp)),
            payload: RwLock::new(None),
        }
    }

    /// Clones this tile's current payload and flags into a brand-new,
    /// unattached `TileEntry`. Used by copy-on-write in
    /// [`crate::manager::TileManager::borrow_by_index`]. The clone starts
    /// with `dirty` carried over and an empty attachment list; the caller
    /// attaches it to exactly one slot.
    pub fn clone_payload(&self) -> Self {
        let meta = self.meta.lock().unwrap();
        let payload = self.payload.read().unwrap();
        let cloned = Self {
            meta: Mutex::new(TileMeta {
                bpp: meta.bpp,
                ewidth: meta.ewidth,
                eheight: meta.eheight,
                valid: meta.valid,
                dirty: meta.dirty,
                ref_count: 0,
                write_count: 0,
                attachments: Vec::new(),
                swap_extent: None,
                row_hints: meta.row_hints.clone(),
            }),
            payload: RwLock::new(payload.clone()),
        };
        cloned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tile_is_invalid_and_unattached() {
        let entry = TileEntry::new(64, 64, 3);
        let meta = entry.meta.lock().unwrap();
        assert!(!meta.valid);
        assert_eq!(meta.share_count(), 0);
        assert_eq!(meta.byte_len(), 64 * 64 * 3);
    }

    #[test]
    fn clone_payload_copies_bytes_and_resets_counts() {
        let entry = TileEntry::new(4, 4, 1);
        {
            let mut payload = entry.payload.write().unwrap();
            *payload = Some(vec![0xAA; 16]);
            let mut meta = entry.meta.lock().unwrap();
            meta.dirty = true;
            meta.attachments.push(Attachment {
                manager: ManagerId::for_test(1),
                slot_index: 0,
            });
        }

        let clone = entry.clone_payload();
        assert_eq!(clone.payload.read().unwrap().as_deref(), Some(&[0xAAu8; 16][..]));
        let clone_meta = clone.meta.lock().unwrap();
        assert!(clone_meta.dirty);
        assert_eq!(clone_meta.share_count(), 0);
    }
}
