//! Multi-resolution coordination across a stack of [`TileManager`]s.
//!
//! Grounded on `tile_manager.c`'s `tile_manager_invalidate_area` and
//! `tile_manager_update_projection`-style sublevel refresh: a toplevel
//! manager holds full-resolution data, and a [`Pyramid`] keeps a chain of
//! progressively half-sized managers in sync with it on demand.

use std::sync::Arc;

use crate::manager::TileManager;
use crate::store::TileStore;

/// A toplevel manager plus a lazily-built chain of half-resolution
/// managers above it, indexed by level (0 = toplevel, 1 = half-size, ...).
pub struct Pyramid {
    store: Arc<TileStore>,
    levels: Vec<Arc<TileManager>>,
}

impl Pyramid {
    /// Builds a pyramid whose toplevel is `width x height` at `bpp`
    /// bytes/pixel, with `max_level` additional halved levels above it
    /// (so `levels().len() == max_level + 1`). Sublevels are created
    /// up-front (their tile grids still materialise lazily) since their
    /// dimensions are a pure function of the toplevel's.
    pub fn new(store: Arc<TileStore>, width: u32, height: u32, bpp: u8, max_level: u32) -> Self {
        let mut levels = Vec::with_capacity(max_level as usize + 1);
        levels.push(TileManager::new(Arc::clone(&store), width, height, bpp));

        let (mut w, mut h) = (width, height);
        for _ in 0..max_level {
            w = (w / 2).max(1);
            h = (h / 2).max(1);
            levels.push(TileManager::new(Arc::clone(&store), w, h, bpp));
        }

        Self { store, levels }
    }

    pub fn toplevel(&self) -> &Arc<TileManager> {
        &self.levels[0]
    }

    pub fn level(&self, level: u32) -> Option<&Arc<TileManager>> {
        self.levels.get(level as usize)
    }

    pub fn max_level(&self) -> u32 {
        self.levels.len() as u32 - 1
    }

    /// `invalidate(toplevel_tile)`: invalidates the tile at `(col, row)` in
    /// the toplevel manager, then invalidates the single coarser-level
    /// tile that covers the same area at every sublevel above it, so a
    /// later [`Pyramid::update_sublevel`] knows to resynthesize it.
    ///
    /// The mapping down to each sublevel is by fractional centre-point,
    /// not naive origin halving, so edge tiles (whose edge may be smaller
    /// than `tile_size`) still land on the correct sublevel tile:
    /// `(col*TILE_WIDTH + ewidth/2) / width` (`tile_manager.c:227-228`).
    pub fn invalidate(&self, col: u32, row: u32) {
        self.levels[0].invalidate(col, row);

        let top = &self.levels[0];
        let (ew, eh) = top.tile_edge(col, row);
        let tile_size = self.store.config().tile_size;
        let cx = col * tile_size + ew as u32 / 2;
        let cy = row * tile_size + eh as u32 / 2;
        let (width, height) = (top.width() as u64, top.height() as u64);

        for level in self.levels.iter().skip(1) {
            let x = (cx as u64 * level.width() as u64 / width) as u32;
            let y = (cy as u64 * level.height() as u64 / height) as u32;
            if let Some((lcol, lrow, _, _)) = level.pixel_to_tile(x, y) {
                level.invalidate(lcol, lrow);
            }
        }
    }

    /// `update-sublevel(toplevel_tile, level)`: recomputes the tile at
    /// `level` that covers the toplevel tile `(col, row)` by
    /// box-downsampling from `level - 1`. `level == 0` is a no-op (the
    /// toplevel has no source to derive from).
    ///
    /// Levels above 6 switch to a cheaper representative-pixel sample
    /// (top-left pixel of each 2x2 source block) instead of averaging all
    /// four. At that depth a source tile already represents 64x the
    /// toplevel area, so the visual difference is negligible and the
    /// sampling cost matters more. This mirrors the source's behaviour at
    /// deep pyramid levels.
    pub fn update_sublevel(&self, col: u32, row: u32, level: u32) {
        if level == 0 || level as usize >= self.levels.len() {
            return;
        }

        let tile_size = self.store.config().tile_size;
        let src_manager = &self.levels[(level - 1) as usize];
        let dst_manager = &self.levels[level as usize];

        let dst_x0 = col * tile_size;
        let dst_y0 = row * tile_size;
        let Some((dcol, drow, _, _)) = dst_manager.pixel_to_tile(dst_x0, dst_y0) else {
            return;
        };

        let Some(dst_handle) = dst_manager.borrow_by_index(dcol, drow, true) else {
            return;
        };

        let bpp = dst_handle.bpp() as usize;
        let dw = dst_handle.ewidth() as u32;
        let dh = dst_handle.eheight() as u32;
        let mut dst_payload = dst_handle.write();
        let dst_bytes = dst_payload.as_mut().expect("borrowed tile always has a payload");

        for dy in 0..dh {
            for dx in 0..dw {
                let sx = 2 * (dst_x0 + dx);
                let sy = 2 * (dst_y0 + dy);
                let pixel = if level > 6 {
                    sample_representative(src_manager, sx, sy, bpp)
                } else {
                    sample_box2x2(src_manager, sx, sy, bpp)
                };
                let dst_off = (dy * dw + dx) as usize * bpp;
                dst_bytes[dst_off..dst_off + bpp].copy_from_slice(&pixel[..bpp]);
            }
        }
        drop(dst_payload);
        dst_handle.mark_valid();
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &Arc<TileStore> {
        &self.store
    }
}

const MAX_BPP: usize = 8;

fn sample_representative(manager: &Arc<TileManager>, x: u32, y: u32, bpp: usize) -> [u8; MAX_BPP] {
    read_pixel(manager, x, y, bpp)
}

fn sample_box2x2(manager: &Arc<TileManager>, x: u32, y: u32, bpp: usize) -> [u8; MAX_BPP] {
    let mut sums = [0u32; MAX_BPP];
    let mut count = 0u32;
    for (ox, oy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
        if manager.pixel_to_tile(x + ox, y + oy).is_none() {
            continue;
        }
        let pixel = read_pixel(manager, x + ox, y + oy, bpp);
        for c in 0..bpp {
            sums[c] += pixel[c] as u32;
        }
        count += 1;
    }
    let mut out = [0u8; MAX_BPP];
    if count > 0 {
        for c in 0..bpp {
            out[c] = (sums[c] / count) as u8;
        }
    }
    out
}

fn read_pixel(manager: &Arc<TileManager>, x: u32, y: u32, bpp: usize) -> [u8; MAX_BPP] {
    let mut out = [0u8; MAX_BPP];
    let Some((col, row, tx, ty)) = manager.pixel_to_tile(x, y) else {
        return out;
    };
    let Some(handle) = manager.borrow_by_index(col, row, false) else {
        return out;
    };
    let ew = handle.ewidth() as usize;
    let payload = handle.read();
    if let Some(bytes) = payload.as_deref() {
        let off = (ty as usize * ew + tx as usize) * bpp;
        if off + bpp <= bytes.len() {
            out[..bpp].copy_from_slice(&bytes[off..off + bpp]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::swap::FileSwapStore;

    fn test_pyramid(width: u32, height: u32, bpp: u8, max_level: u32) -> Pyramid {
        let dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        let swap = Arc::new(FileSwapStore::new(dir.path(), 16, 4096));
        let swap_id = swap.add().unwrap();
        let config = Config {
            tile_size: 64,
            ..Config::defaults()
        };
        let store = TileStore::new(swap, swap_id, config);
        Pyramid::new(store, width, height, bpp, max_level)
    }

    #[test]
    fn levels_halve_each_step() {
        let pyramid = test_pyramid(256, 128, 1, 3);
        assert_eq!(pyramid.max_level(), 3);
        assert_eq!((pyramid.level(0).unwrap().width(), pyramid.level(0).unwrap().height()), (256, 128));
        assert_eq!((pyramid.level(1).unwrap().width(), pyramid.level(1).unwrap().height()), (128, 64));
        assert_eq!((pyramid.level(2).unwrap().width(), pyramid.level(2).unwrap().height()), (64, 32));
        assert_eq!((pyramid.level(3).unwrap().width(), pyramid.level(3).unwrap().height()), (32, 16));
    }

    #[test]
    fn update_sublevel_averages_box() {
        let pyramid = test_pyramid(4, 4, 1, 1);
        {
            let handle = pyramid.toplevel().borrow_by_index(0, 0, true).unwrap();
            handle.write().as_mut().unwrap().copy_from_slice(&[10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120, 130, 140, 150, 160]);
            handle.mark_valid();
        }

        pyramid.update_sublevel(0, 0, 1);

        let handle = pyramid.level(1).unwrap().borrow_by_index(0, 0, false).unwrap();
        let bytes = handle.read();
        let bytes = bytes.as_deref().unwrap();
        // top-left 2x2 block of the 4x4 source is [10,20,50,60] -> avg 35
        assert_eq!(bytes[0], 35);
    }

    #[test]
    fn update_sublevel_scales_destination_origin_for_non_zero_tile() {
        // Toplevel wide enough that level 1's tile (1, 0) has a non-zero
        // origin (dst_x0 == 64), so a box sampler that scales only the
        // pixel offset by 2 instead of the full destination coordinate
        // would read the wrong source tile entirely.
        let pyramid = test_pyramid(256, 64, 1, 1);
        {
            let handle = pyramid.toplevel().borrow_by_index(2, 0, true).unwrap();
            handle.write().as_mut().unwrap()[0] = 10;
            handle.write().as_mut().unwrap()[1] = 20;
            let ew = handle.ewidth() as usize;
            handle.write().as_mut().unwrap()[ew] = 30;
            handle.write().as_mut().unwrap()[ew + 1] = 40;
            handle.mark_valid();
        }

        pyramid.update_sublevel(1, 0, 1);

        let handle = pyramid.level(1).unwrap().borrow_by_index(1, 0, false).unwrap();
        let bytes = handle.read();
        let bytes = bytes.as_deref().unwrap();
        // dst tile (1, 0) has dst_x0 == 64, so its first pixel must sample
        // source pixels (128, 0), (129, 0), (128, 1), (129, 1): the
        // top-left 2x2 block of source tile (2, 0) -> avg 25. The
        // unscaled-offset bug would instead read from (64, 0), inside
        // source tile (1, 0), which is left at zero here.
        assert_eq!(bytes[0], 25);
    }
}
