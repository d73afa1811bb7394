//! Disk-backed swap store: a free-space allocator over one or more backing
//! files, grounded on `tile_swap.c`'s `DefSwapFile`/`Gap` pair.
//!
//! The store is pluggable (`spec.md` §6: `add(filename, optional
//! custom-swap-function, user-data)`); [`SwapStore`] is the trait a caller
//! can implement instead of [`FileSwapStore`], and [`FileSwapStore`] is the
//! default file-backed implementation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::tile::SwapExtent;

/// Identifies one backing file registered with a [`FileSwapStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapId(u64);

/// A pluggable byte store for tile payloads.
///
/// `spec.md` §6 describes `add`/`remove`/`in`/`out`/`delete`/`compress` as
/// per-tile commands against a named swap id; this trait is the Rust
/// equivalent of the source's per-swap-file function-pointer table
/// (`swap_func`/`user_data` in `tile_swap.c`'s `SwapFile`), collapsed into a
/// single interface per `spec.md` §9's "single trait instead of
/// per-function-pointer" redesign note.
pub trait SwapStore: Send + Sync {
    /// Allocates (or reuses, on re-write of a tile that already has an
    /// extent) `len` bytes of backing storage for `swap_id`.
    fn allocate(&self, swap_id: SwapId, len: u64) -> std::io::Result<SwapExtent>;

    /// Reads `buf.len()` bytes from `extent` into `buf`.
    fn read(&self, extent: SwapExtent, buf: &mut [u8]) -> std::io::Result<()>;

    /// Writes `buf` to `extent`. `buf.len()` must equal `extent.len()`.
    fn write(&self, extent: SwapExtent, buf: &[u8]) -> std::io::Result<()>;

    /// Releases `extent` back to the free-gap list, coalescing with
    /// neighbours and truncating the file if the freed gap touches the
    /// logical end.
    fn free(&self, extent: SwapExtent) -> std::io::Result<()>;

    /// Optional prefetch hint; the default implementation may ignore it.
    fn in_async(&self, _extent: SwapExtent) {}

    /// Compacts live extents in a swap file. Exists in the interface but,
    /// per `spec.md` §9's recorded open question, the source never
    /// implemented a body for this, left here as a no-op placeholder.
    fn compress(&self, _swap_id: SwapId) -> std::io::Result<()> {
        Ok(())
    }
}

/// A disjoint, ordered, non-adjacent free-space gap, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gap {
    start: u64,
    end: u64,
}

struct SwapFileState {
    path: PathBuf,
    gaps: Vec<Gap>,
    end: u64,
    fd: Option<File>,
    last_used: u64,
    seek_err_logged: AtomicBool,
    read_err_logged: AtomicBool,
    write_err_logged: AtomicBool,
}

impl SwapFileState {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            gaps: Vec::new(),
            end: 0,
            fd: None,
            last_used: 0,
            seek_err_logged: AtomicBool::new(false),
            read_err_logged: AtomicBool::new(false),
            write_err_logged: AtomicBool::new(false),
        }
    }

    /// First-fit allocation, growing the file by `growth_bytes` if nothing
    /// fits. Mirrors `tile_swap_find_offset`.
    fn find_offset(&mut self, len: u64, growth_bytes: u64) -> u64 {
        for i in 0..self.gaps.len() {
            let gap = self.gaps[i];
            let gap_len = gap.end - gap.start;
            if gap_len >= len {
                let offset = gap.start;
                if gap_len == len {
                    self.gaps.remove(i);
                } else {
                    self.gaps[i].start += len;
                }
                return offset;
            }
        }

        // No gap fits: grow the file by the quantum (or exactly `len` if
        // that's bigger) and carve the new tile from the start of the grown
        // region, leaving any remainder as a tail gap.
        let grow_by = growth_bytes.max(len);
        let offset = self.end;
        self.end += grow_by;
        if grow_by > len {
            self.gaps.push(Gap {
                start: offset + len,
                end: offset + grow_by,
            });
        }
        offset
    }

    /// Inserts a freed `[start, end)` range, merging with neighbours and
    /// truncating the logical end if the final gap touches it. Mirrors
    /// `tile_swap_default_delete`.
    fn free_range(&mut self, start: u64, end: u64) {
        let mut merged = Gap { start, end };

        // Find sorted insertion point and merge with adjacent gaps on
        // either side.
        let mut insert_at = self.gaps.len();
        let mut i = 0;
        while i < self.gaps.len() {
            let gap = self.gaps[i];
            if gap.end == merged.start {
                merged.start = gap.start;
                self.gaps.remove(i);
                continue;
            }
            if gap.start == merged.end {
                merged.end = gap.end;
                self.gaps.remove(i);
                continue;
            }
            if gap.start > merged.end {
                insert_at = i;
                break;
            }
            i += 1;
        }
        if insert_at > self.gaps.len() {
            insert_at = self.gaps.len();
        }

        if merged.end == self.end {
            self.end = merged.start;
        } else {
            self.gaps.insert(insert_at.min(self.gaps.len()), merged);
        }
    }
}

/// The default file-backed [`SwapStore`]: one logical file per registered
/// [`SwapId`], a bounded pool of open descriptors, and a per-file gap list.
pub struct FileSwapStore {
    base_dir: PathBuf,
    next_id: AtomicU64,
    files: RwLock<HashMap<SwapId, Mutex<SwapFileState>>>,
    max_open: usize,
    open_clock: AtomicU64,
    growth_bytes: u64,
}

impl FileSwapStore {
    /// Creates a store that will create its backing files under
    /// `base_dir`. `max_open` bounds the number of simultaneously open file
    /// descriptors (matching `MAX_OPEN_SWAP_FILES`); `growth_bytes` is the
    /// allocation quantum used when no existing gap fits a request.
    pub fn new(base_dir: impl Into<PathBuf>, max_open: usize, growth_bytes: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            next_id: AtomicU64::new(0),
            files: RwLock::new(HashMap::new()),
            max_open,
            open_clock: AtomicU64::new(0),
            growth_bytes,
        }
    }

    /// Registers a new swap file under a generated name, returning its id.
    /// Mirrors `tile_swap_add`.
    pub fn add(&self) -> std::io::Result<SwapId> {
        let id = SwapId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let path = self.base_dir.join(format!("tilestore-{}.swap", id.0));
        self.files
            .write()
            .unwrap()
            .insert(id, Mutex::new(SwapFileState::new(path)));
        Ok(id)
    }

    /// Unregisters a swap file and unlinks it from disk, matching the
    /// "swap files have no on-disk identity across process lifetimes"
    /// contract in `spec.md` §6.
    pub fn remove(&self, swap_id: SwapId) -> std::io::Result<()> {
        if let Some(state) = self.files.write().unwrap().remove(&swap_id) {
            let state = state.into_inner().unwrap();
            if state.fd.is_some() {
                let _ = std::fs::remove_file(&state.path);
            } else if state.path.exists() {
                let _ = std::fs::remove_file(&state.path);
            }
        }
        Ok(())
    }

    /// Runs `f` with the file's state locked. Takes the table's read guard
    /// exactly once for the whole call, passing the map down so nested
    /// helpers (`ensure_open`, `close_oldest`) never re-acquire it: a
    /// second `read()` from the same thread while a writer (`add`/`remove`)
    /// is waiting could otherwise deadlock under a writer-preferring
    /// `RwLock`.
    fn with_file<R>(
        &self,
        swap_id: SwapId,
        f: impl FnOnce(&Self, &HashMap<SwapId, Mutex<SwapFileState>>, &mut SwapFileState) -> std::io::Result<R>,
    ) -> std::io::Result<R> {
        let files = self.files.read().unwrap();
        let entry = files
            .get(&swap_id)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "unknown swap id"))?;
        let mut state = entry.lock().unwrap();
        f(self, &files, &mut state)
    }

    /// Bounded-pool-aware open: if the file has no fd, opens it, closing
    /// the globally least-recently-used open fd first if at the pool
    /// limit. Mirrors `tile_swap_open`'s close-oldest-then-reopen.
    fn ensure_open(
        &self,
        swap_id: SwapId,
        files: &HashMap<SwapId, Mutex<SwapFileState>>,
        state: &mut SwapFileState,
    ) -> std::io::Result<()> {
        if state.fd.is_some() {
            return Ok(());
        }

        let open_count = files
            .values()
            .filter(|s| s.try_lock().map(|g| g.fd.is_some()).unwrap_or(false))
            .count();

        if open_count >= self.max_open {
            self.close_oldest(files, swap_id);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&state.path)?;
        state.fd = Some(file);
        state.last_used = self.open_clock.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close_oldest(&self, files: &HashMap<SwapId, Mutex<SwapFileState>>, exclude: SwapId) {
        let mut oldest: Option<(SwapId, u64)> = None;
        for (&id, state) in files.iter() {
            if id == exclude {
                continue;
            }
            if let Ok(guard) = state.try_lock() {
                if guard.fd.is_some() {
                    match oldest {
                        Some((_, ts)) if ts <= guard.last_used => {}
                        _ => oldest = Some((id, guard.last_used)),
                    }
                }
            }
        }
        if let Some((id, _)) = oldest {
            if let Some(state) = files.get(&id) {
                if let Ok(mut guard) = state.try_lock() {
                    guard.fd = None;
                }
            }
        }
    }
}

impl SwapStore for FileSwapStore {
    fn allocate(&self, swap_id: SwapId, len: u64) -> std::io::Result<SwapExtent> {
        let start = self.with_file(swap_id, |_, _, state| Ok(state.find_offset(len, self.growth_bytes)))?;
        Ok(SwapExtent {
            swap_id,
            start,
            end: start + len,
        })
    }

    fn read(&self, extent: SwapExtent, buf: &mut [u8]) -> std::io::Result<()> {
        debug_assert_eq!(buf.len() as u64, extent.len());
        self.with_file(extent.swap_id, |store, files, state| {
            store.ensure_open(extent.swap_id, files, state)?;
            let fd = state.fd.as_mut().unwrap();
            let result = fd
                .seek(SeekFrom::Start(extent.start))
                .and_then(|_| fd.read_exact(buf));
            match &result {
                Ok(()) => {
                    state.read_err_logged.store(false, Ordering::Relaxed);
                }
                Err(_) => {
                    if !state.read_err_logged.swap(true, Ordering::Relaxed) {
                        tracing::warn!(swap_id = extent.swap_id.0, "swap read failed");
                    }
                }
            }
            result
        })
    }

    fn write(&self, extent: SwapExtent, buf: &[u8]) -> std::io::Result<()> {
        debug_assert_eq!(buf.len() as u64, extent.len());
        self.with_file(extent.swap_id, |store, files, state| {
            store.ensure_open(extent.swap_id, files, state)?;
            let fd = state.fd.as_mut().unwrap();
            let result = fd
                .seek(SeekFrom::Start(extent.start))
                .and_then(|_| fd.write_all(buf));
            match &result {
                Ok(()) => {
                    state.write_err_logged.store(false, Ordering::Relaxed);
                }
                Err(_) => {
                    if !state.write_err_logged.swap(true, Ordering::Relaxed) {
                        tracing::warn!(swap_id = extent.swap_id.0, "swap write failed");
                    }
                }
            }
            result
        })
    }

    fn free(&self, extent: SwapExtent) -> std::io::Result<()> {
        self.with_file(extent.swap_id, |_, _, state| {
            state.free_range(extent.start, extent.end);
            if state.end == 0 {
                if let Some(fd) = &state.fd {
                    let _ = fd.set_len(0);
                }
            } else if let Some(fd) = &state.fd {
                let _ = fd.set_len(state.end);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> FileSwapStore {
        FileSwapStore::new(dir.path(), 16, 4096)
    }

    #[test]
    fn allocate_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.add().unwrap();

        let extent = store.allocate(id, 8).unwrap();
        store.write(extent, b"deadbeef").unwrap();

        let mut buf = [0u8; 8];
        store.read(extent, &mut buf).unwrap();
        assert_eq!(&buf, b"deadbeef");
    }

    #[test]
    fn gap_coalescing_scenario() {
        // spec.md §8 scenario 5: 4 KiB extents allocated contiguously,
        // freeing middle-then-first coalesces to one gap, freeing last
        // truncates the file to zero.
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.add().unwrap();

        let a = store.allocate(id, 4096).unwrap();
        let b = store.allocate(id, 4096).unwrap();
        let c = store.allocate(id, 4096).unwrap();
        assert_eq!(a.start, 0);
        assert_eq!(b.start, 4096);
        assert_eq!(c.start, 8192);

        store.free(b).unwrap();
        store.free(a).unwrap();

        store
            .with_file(id, |_, _, state| {
                assert_eq!(state.gaps, vec![Gap { start: 0, end: 8192 }]);
                Ok(())
            })
            .unwrap();

        store.free(c).unwrap();
        store
            .with_file(id, |_, _, state| {
                assert!(state.gaps.is_empty());
                assert_eq!(state.end, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn allocate_grows_file_when_no_gap_fits() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSwapStore::new(dir.path(), 16, 100);
        let id = store.add().unwrap();

        let first = store.allocate(id, 40).unwrap();
        assert_eq!(first.start, 0);
        store
            .with_file(id, |_, _, state| {
                assert_eq!(state.end, 100);
                assert_eq!(state.gaps, vec![Gap { start: 40, end: 100 }]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn bounded_fd_pool_closes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSwapStore::new(dir.path(), 1, 4096);
        let a = store.add().unwrap();
        let b = store.add().unwrap();

        let ea = store.allocate(a, 16).unwrap();
        let eb = store.allocate(b, 16).unwrap();
        store.write(ea, &[1u8; 16]).unwrap();
        store.write(eb, &[2u8; 16]).unwrap();

        store
            .with_file(a, |_, _, state| {
                assert!(state.fd.is_none());
                Ok(())
            })
            .unwrap();
        store
            .with_file(b, |_, _, state| {
                assert!(state.fd.is_some());
                Ok(())
            })
            .unwrap();
    }
}
