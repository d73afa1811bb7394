//! End-to-end scenarios for the tile store: managers backed by a real
//! temp-dir swap file, exercised through public API only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use vfx_tilestore::{process, process_parallel, Config, PixelRegion, Rect, TileManager, TileStore};

fn small_tile_config() -> Config {
    Config {
        tile_size: 64,
        ..Config::defaults()
    }
}

fn open_store(config: Config) -> (Arc<TileStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = TileStore::open(dir.path(), config).unwrap();
    (store, dir)
}

#[test]
fn single_tile_write_then_read() {
    let (store, _dir) = open_store(small_tile_config());
    let mgr = TileManager::new(store, 64, 64, 3);

    {
        let handle = mgr.borrow_by_index(0, 0, true).unwrap();
        let mut payload = handle.write();
        payload.as_mut().unwrap().fill(0x42);
        handle.mark_valid();
    }

    let handle = mgr.borrow_by_index(0, 0, false).unwrap();
    let payload = handle.read();
    assert_eq!(payload.as_deref(), Some(&[0x42u8; 64 * 64 * 3][..]));
    assert!(handle.is_valid());
}

#[test]
fn cross_tile_write_produces_two_clean_tiles() {
    // spec.md §8 scenario 2.
    let (store, _dir) = open_store(small_tile_config());
    let mgr = TileManager::new(store, 128, 64, 1);
    let mut region = PixelRegion::start(Arc::clone(&mgr), Rect::new(0, 0, 128, 64), false, true);

    process(std::slice::from_mut(&mut region), |views, sub| {
        let view = &views[0];
        let mut payload = view.write();
        let bytes = payload.as_mut().unwrap();
        for dy in 0..view.height() {
            for dx in 0..view.width() {
                let x = sub.x + dx;
                let y = sub.y + dy;
                bytes[view.offset(dx, dy)] = ((x + y) % 256) as u8;
            }
        }
    });
    region.finish();

    assert_eq!(mgr.tile_cols(), 2);
    assert_eq!(mgr.tile_rows(), 1);
    assert_eq!(mgr.share_count(0, 0), 1);
    assert_eq!(mgr.share_count(1, 0), 1);

    let mut read_region = PixelRegion::start(Arc::clone(&mgr), Rect::new(0, 0, 128, 64), true, false);
    let mut mismatches = 0u32;
    process(std::slice::from_mut(&mut read_region), |views, sub| {
        let view = &views[0];
        let payload = view.read();
        let bytes = payload.as_deref().unwrap();
        for dy in 0..view.height() {
            for dx in 0..view.width() {
                let x = sub.x + dx;
                let y = sub.y + dy;
                let expected = ((x + y) % 256) as u8;
                if bytes[view.offset(dx, dy)] != expected {
                    mismatches += 1;
                }
            }
        }
    });
    assert_eq!(mismatches, 0);
}

#[test]
fn copy_on_write_isolates_the_shared_tile() {
    // Two managers share the tile at (0, 0) by mapping the same TileId
    // into both grids — the public primitive for tile sharing across
    // managers (undo snapshots, aliasing) per spec.md §4.1 `map`.
    let (store, _dir) = open_store(small_tile_config());
    let mgr_a = TileManager::new(Arc::clone(&store), 64, 64, 1);
    let mgr_b = TileManager::new(Arc::clone(&store), 64, 64, 1);

    let shared_id = mgr_a.tile_at(0, 0).unwrap();
    mgr_b.map(0, 0, shared_id).unwrap();
    assert_eq!(mgr_a.share_count(0, 0), 2);
    assert_eq!(mgr_b.tile_at(0, 0), Some(shared_id));

    {
        let handle = mgr_a.borrow_by_index(0, 0, true).unwrap();
        handle.write().as_mut().unwrap().fill(0x11);
    }

    // mgr_a's slot now points at a fresh, unshared tile...
    let new_id = mgr_a.tile_at(0, 0).unwrap();
    assert_ne!(new_id, shared_id);
    assert_eq!(mgr_a.share_count(0, 0), 1);

    // ...while mgr_b's original tile is untouched and still shared with
    // nobody else.
    assert_eq!(mgr_b.tile_at(0, 0), Some(shared_id));
    assert_eq!(mgr_b.share_count(0, 0), 1);
    let original = mgr_b.borrow_by_index(0, 0, false).unwrap();
    assert_ne!(original.read().as_deref(), Some(&[0x11u8; 64 * 64][..]));

    let new_handle = mgr_a.borrow_by_index(0, 0, false).unwrap();
    assert_eq!(new_handle.read().as_deref(), Some(&[0x11u8; 64 * 64][..]));
}

#[test]
fn eviction_round_trips_through_swap_under_tight_budget() {
    let config = Config {
        tile_size: 32,
        cache_bytes: 32 * 32, // exactly one tile
        ..Config::defaults()
    };
    let (store, _dir) = open_store(config);
    let mgr = TileManager::new(store, 64, 32, 1);

    {
        let h = mgr.borrow_by_index(0, 0, true).unwrap();
        h.write().as_mut().unwrap().fill(1);
    }
    {
        let h = mgr.borrow_by_index(1, 0, true).unwrap();
        h.write().as_mut().unwrap().fill(2);
    }

    // The first tile should have been evicted (swapped out) to admit the
    // second under the one-tile cache budget; borrowing it again must
    // still see its data.
    let h = mgr.borrow_by_index(0, 0, false).unwrap();
    assert_eq!(h.read().as_deref(), Some(&[1u8; 32 * 32][..]));
}

#[test]
fn manager_destruction_frees_unshared_tiles_but_not_shared_ones() {
    let (store, _dir) = open_store(small_tile_config());
    let mgr_a = TileManager::new(Arc::clone(&store), 64, 64, 1);
    let mgr_b = TileManager::new(Arc::clone(&store), 64, 64, 1);

    let shared_id = mgr_a.tile_at(0, 0).unwrap();
    mgr_b.map(0, 0, shared_id).unwrap();
    assert_eq!(store.share_count(shared_id), 2);

    drop(mgr_a);
    assert_eq!(store.share_count(shared_id), 1, "tile survives while mgr_b still holds it");

    drop(mgr_b);
    assert_eq!(store.share_count(shared_id), 0, "tile is freed once its last attachment is gone");
}

#[test]
fn parallel_lock_step_covers_every_pixel_exactly_once() {
    let (store, _dir) = open_store(small_tile_config());
    let mgr = TileManager::new(store, 200, 150, 1);
    let visited: Mutex<Vec<Rect>> = Mutex::new(Vec::new());
    let count = AtomicU64::new(0);

    process_parallel(
        &[Arc::clone(&mgr)],
        &[(false, true)],
        Rect::new(0, 0, 200, 150),
        |views, sub| {
            let view = &views[0];
            view.write().as_mut().unwrap()[view.offset(0, 0)] = 9;
            visited.lock().unwrap().push(sub);
            count.fetch_add(1, Ordering::Relaxed);
        },
    );

    let visited = visited.into_inner().unwrap();
    let covered_area: u64 = visited.iter().map(|r| r.width as u64 * r.height as u64).sum();
    assert_eq!(covered_area, 200 * 150);
    assert_eq!(count.load(Ordering::Relaxed) as usize, visited.len());
}
