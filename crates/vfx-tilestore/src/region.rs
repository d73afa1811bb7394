//! Rectangular, possibly-composed iteration cursor over one or more
//! managers. Component E, grounded on `pixel-region.c`'s
//! `pixel_region_init`/`pixel_regions_process`/`pixel_regions_process_parallel`
//! triad.
//!
//! A [`PixelRegion`] walks tile-aligned sub-rectangles of a pixel-space
//! rectangle, borrowing whichever tile covers the current sub-rectangle as
//! it goes. [`process`] and [`process_parallel`] compose several regions so
//! a kernel runs once per sub-rectangle of their geometric intersection,
//! with every region positioned on the same sub-rectangle: the "lock-step"
//! traversal `spec.md` §4.5 describes.

use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};

use rayon::prelude::*;

use crate::manager::TileManager;
use crate::store::TileHandle;

/// A rectangle in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    fn end_x(&self) -> u32 {
        self.x + self.width
    }

    fn end_y(&self) -> u32 {
        self.y + self.height
    }

    fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A transient read/write/read-write cursor over one manager's tiles
/// within `rect`.
pub struct PixelRegion {
    manager: Arc<TileManager>,
    rect: Rect,
    want_read: bool,
    want_write: bool,
    current: Option<(u32, u32, TileHandle)>,
}

impl PixelRegion {
    /// `start(region, manager, read?, write?)`: records the access mode.
    /// No tile is pinned until the first [`PixelRegion::position`].
    pub fn start(manager: Arc<TileManager>, rect: Rect, want_read: bool, want_write: bool) -> Self {
        Self {
            manager,
            rect,
            want_read,
            want_write,
            current: None,
        }
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn manager(&self) -> &Arc<TileManager> {
        &self.manager
    }

    /// `finish(region)`: releases any held tile. Dropping a `PixelRegion`
    /// does the same thing; this exists for callers that want to be
    /// explicit about when the final release happens.
    pub fn finish(mut self) {
        self.current = None;
    }

    /// `position(region, x, y)`: borrows the tile covering `(x, y)` if the
    /// currently held tile (if any) doesn't already cover it. Returns
    /// `false`, releasing any held tile, if `(x, y)` lies outside the
    /// manager. An out-of-range position is an ordinary expected outcome,
    /// not a panic. Idempotent when already positioned correctly.
    pub fn position(&mut self, x: u32, y: u32) -> bool {
        let Some((col, row, _, _)) = self.manager.pixel_to_tile(x, y) else {
            self.current = None;
            return false;
        };

        if let Some((ccol, crow, _)) = &self.current {
            if *ccol == col && *crow == row {
                return true;
            }
        }

        self.current = self
            .manager
            .borrow_by_index(col, row, self.want_write)
            .map(|h| (col, row, h));
        self.current.is_some()
    }

    /// `probe(region, x, y)`: whether the tile at `(x, y)` is currently
    /// valid. Never triggers validation or a borrow.
    pub fn probe(&self, x: u32, y: u32) -> bool {
        match self.manager.pixel_to_tile(x, y) {
            Some((col, row, _, _)) => self.manager.is_tile_valid(col, row).unwrap_or(false),
            None => false,
        }
    }

    fn view_for(&self, sub: Rect) -> RegionView<'_> {
        let (col, row, handle) = self
            .current
            .as_ref()
            .expect("region must be positioned before taking a view");
        let tile_size = self.manager.tile_size();
        RegionView {
            handle,
            local_x: sub.x - col * tile_size,
            local_y: sub.y - row * tile_size,
            width: sub.width,
            height: sub.height,
            want_read: self.want_read,
        }
    }
}

/// One region's view of the current sub-rectangle, handed to a
/// `process`/`process_parallel` kernel. Borrows from the bound tile's
/// payload lock for exactly as long as the kernel runs.
pub struct RegionView<'r> {
    handle: &'r TileHandle,
    local_x: u32,
    local_y: u32,
    width: u32,
    height: u32,
    want_read: bool,
}

impl<'r> RegionView<'r> {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bpp(&self) -> u8 {
        self.handle.bpp()
    }

    /// Bytes between the start of one row and the next within the bound
    /// tile's payload.
    pub fn stride(&self) -> usize {
        self.handle.ewidth() as usize * self.bpp() as usize
    }

    /// Byte offset of pixel `(dx, dy)`, relative to this sub-rectangle's
    /// origin, within the tile payload returned by [`RegionView::read`] /
    /// [`RegionView::write`].
    pub fn offset(&self, dx: u32, dy: u32) -> usize {
        debug_assert!(dx < self.width && dy < self.height);
        (self.local_y + dy) as usize * self.stride() + (self.local_x + dx) as usize * self.bpp() as usize
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Option<Vec<u8>>> {
        self.handle.read()
    }

    /// Locks the payload for writing. Panics if this region wasn't opened
    /// with write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, Option<Vec<u8>>> {
        assert!(self.handle.is_write(), "region was not opened for writing");
        self.handle.write()
    }

    pub fn is_readable(&self) -> bool {
        self.want_read
    }
}

/// Tiles `rect` into `tile_size`-aligned, non-overlapping sub-rectangles
/// covering it exactly (invariant §8.8: "sub-rectangles tile the
/// intersection with no overlap and no gap").
fn tile_aligned_subrects(rect: Rect, tile_size: u32) -> Vec<Rect> {
    if rect.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut y = rect.y;
    while y < rect.end_y() {
        let y_tile_end = (y / tile_size + 1) * tile_size;
        let h = y_tile_end.min(rect.end_y()) - y;
        let mut x = rect.x;
        while x < rect.end_x() {
            let x_tile_end = (x / tile_size + 1) * tile_size;
            let w = x_tile_end.min(rect.end_x()) - x;
            out.push(Rect::new(x, y, w, h));
            x += w;
        }
        y += h;
    }
    out
}

fn intersection(rects: &[Rect]) -> Rect {
    let mut acc = rects[0];
    for r in &rects[1..] {
        let x0 = acc.x.max(r.x);
        let y0 = acc.y.max(r.y);
        let x1 = acc.end_x().min(r.end_x());
        let y1 = acc.end_y().min(r.end_y());
        acc = if x1 > x0 && y1 > y0 {
            Rect::new(x0, y0, x1 - x0, y1 - y0)
        } else {
            Rect::new(x0, y0, 0, 0)
        };
    }
    acc
}

/// `process(N, regions…)`: walks the geometric intersection of every
/// region's rectangle in tile-aligned sub-rectangles, positioning all
/// regions on each sub-rectangle in turn and invoking `kernel` once per
/// sub-rectangle with every region's [`RegionView`].
///
/// If any region can't be positioned on a sub-rectangle (shouldn't happen
/// for well-formed input rectangles, but out-of-range coordinates are never
/// a hard error elsewhere in this crate either) that sub-rectangle is
/// skipped.
pub fn process<F>(regions: &mut [PixelRegion], mut kernel: F)
where
    F: FnMut(&[RegionView<'_>], Rect),
{
    assert!(!regions.is_empty(), "process requires at least one region");
    let tile_size = regions[0].manager.tile_size();
    let rects: Vec<Rect> = regions.iter().map(|r| r.rect).collect();
    let intersect = intersection(&rects);

    for sub in tile_aligned_subrects(intersect, tile_size) {
        let mut all_positioned = true;
        for region in regions.iter_mut() {
            if !region.position(sub.x, sub.y) {
                all_positioned = false;
                break;
            }
        }
        if !all_positioned {
            continue;
        }
        let views: Vec<RegionView<'_>> = regions.iter().map(|r| r.view_for(sub)).collect();
        kernel(&views, sub);
    }
}

/// `process-parallel(kernel, data, N, regions…)`: the parallel counterpart
/// of [`process`]. Each sub-rectangle of the intersection gets its own
/// fresh set of regions (rayon workers can't share a single
/// [`PixelRegion`]'s cursor state), so the kernel must be tile-local: it
/// may not reach into neighbouring sub-rectangles, matching `spec.md`
/// §4.5's requirement.
pub fn process_parallel<F>(managers: &[Arc<TileManager>], modes: &[(bool, bool)], rect: Rect, kernel: F)
where
    F: Fn(&[RegionView<'_>], Rect) + Sync,
{
    assert_eq!(managers.len(), modes.len(), "one mode per manager");
    assert!(!managers.is_empty(), "process_parallel requires at least one manager");
    let tile_size = managers[0].tile_size();

    let subrects = tile_aligned_subrects(rect, tile_size);
    subrects.par_iter().for_each(|&sub| {
        let mut regions: Vec<PixelRegion> = managers
            .iter()
            .zip(modes.iter())
            .map(|(m, &(want_read, want_write))| PixelRegion::start(Arc::clone(m), rect, want_read, want_write))
            .collect();

        let mut all_positioned = true;
        for region in regions.iter_mut() {
            if !region.position(sub.x, sub.y) {
                all_positioned = false;
                break;
            }
        }
        if !all_positioned {
            return;
        }
        let views: Vec<RegionView<'_>> = regions.iter().map(|r| r.view_for(sub)).collect();
        kernel(&views, sub);
    });
}
