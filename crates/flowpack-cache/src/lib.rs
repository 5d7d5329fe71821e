//! # flowpack-cache
//!
//! The stream cache (§4.5): a bounded map of open output-file handles
//! keyed by `(flowtype, sensor, hour)`, plus the two output-opener
//! variants (§4.6) that know how to turn a cache miss into an open file.
//!
//! Lock order is always cache map, then per-entry mutex; an entry's
//! mutex is never held while blocking on the map lock. Eviction and
//! flush may therefore have to wait on a writer holding an entry's
//! mutex, which is expected and not a bug.

pub mod opener;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard, RwLock};
use thiserror::Error;

use flowpack_model::CacheKey;

pub use opener::{OpenedFile, Opener};

const MAX_TIME: i64 = i64::MAX;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("opener failed: {0}")]
    Open(#[source] anyhow::Error),

    #[error("handle used after release")]
    Released,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

struct EntryState {
    stream: Option<File>,
    opened_rec_count: u64,
    total_rec_count: u64,
    last_accessed: i64,
    filename: PathBuf,
}

struct Entry {
    key: CacheKey,
    state: Mutex<EntryState>,
}

struct Inner {
    entries: BTreeMap<CacheKey, Arc<Entry>>,
    open_count: usize,
    total_count: usize,
}

/// The bounded stream cache. One instance per packing pipeline.
pub struct Cache {
    inner: RwLock<Inner>,
    max_open_count: usize,
    inactive_timeout: Duration,
}

/// One file flushed or closed by [`Cache::flush`] or [`Cache::close_all`].
#[derive(Debug, Clone)]
pub struct FlushedFile {
    pub filename: PathBuf,
    pub delta_records: u64,
}

impl Cache {
    pub fn new(max_open_count: usize, inactive_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: BTreeMap::new(),
                open_count: 0,
                total_count: 0,
            }),
            max_open_count: max_open_count.max(1),
            inactive_timeout,
        }
    }

    pub fn open_count(&self) -> usize {
        self.inner.read().open_count
    }

    pub fn total_count(&self) -> usize {
        self.inner.read().total_count
    }

    /// Find or open the stream for `key`, returning a handle that holds
    /// the entry's mutex until [`EntryHandle::release`] (or drop).
    pub fn lookup_or_open(
        &self,
        key: CacheKey,
        opener: &dyn Opener,
    ) -> Result<EntryHandle, CacheError> {
        // Fast path: read lock, entry already open.
        {
            let inner = self.inner.read();
            if let Some(entry) = inner.entries.get(&key) {
                let entry = entry.clone();
                drop(inner);
                let mut guard = entry.state.lock();
                if guard.stream.is_some() {
                    guard.last_accessed = now_ms();
                    return Ok(EntryHandle::new(entry, guard));
                }
                // Falls through: entry exists but closed, needs the
                // write-lock path below to reopen it.
            }
        }

        // Slow path: write lock, search again (covers the race where
        // another thread inserted or reopened the key in between).
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get(&key).cloned() {
            let mut guard = entry.state.lock();
            if guard.stream.is_some() {
                guard.last_accessed = now_ms();
                drop(inner);
                return Ok(EntryHandle::new(entry, guard));
            }
            let prior = guard.filename.clone();
            let opened = opener
                .open(key, Some(&prior))
                .map_err(CacheError::Open)?;
            guard.stream = Some(opened.file);
            guard.filename = opened.filename;
            guard.opened_rec_count = guard.total_rec_count;
            guard.last_accessed = now_ms();
            inner.open_count += 1;
            maybe_evict(&mut inner, self.max_open_count, key);
            drop(inner);
            return Ok(EntryHandle::new(entry, guard));
        }

        let opened = opener.open(key, None).map_err(CacheError::Open)?;
        let entry = Arc::new(Entry {
            key,
            state: Mutex::new(EntryState {
                stream: Some(opened.file),
                opened_rec_count: 0,
                total_rec_count: 0,
                last_accessed: now_ms(),
                filename: opened.filename,
            }),
        });
        inner.entries.insert(key, entry.clone());
        inner.total_count += 1;
        inner.open_count += 1;
        maybe_evict(&mut inner, self.max_open_count, key);
        let guard = entry.state.lock();
        drop(inner);
        Ok(EntryHandle::new(entry, guard))
    }

    /// Flush every entry whose last access is within the inactive
    /// timeout and close/remove every entry that is not. Entries whose
    /// mutex is currently held by a writer are skipped for this tick.
    pub fn flush(&self) -> Vec<FlushedFile> {
        let mut inner = self.inner.write();
        let cutoff = now_ms().saturating_sub(self.inactive_timeout.as_millis() as i64);
        let mut out = Vec::new();
        let mut to_remove = Vec::new();

        let Inner {
            entries,
            open_count,
            ..
        } = &mut *inner;
        for (key, entry) in entries.iter() {
            let mut guard = match entry.state.try_lock() {
                Some(g) => g,
                None => continue,
            };
            if guard.stream.is_some() && guard.last_accessed > cutoff {
                if let Some(stream) = guard.stream.as_mut() {
                    let _ = stream.flush();
                }
                let delta = guard.total_rec_count - guard.opened_rec_count;
                out.push(FlushedFile {
                    filename: guard.filename.clone(),
                    delta_records: delta,
                });
                guard.opened_rec_count = guard.total_rec_count;
            } else {
                if guard.stream.take().is_some() {
                    *open_count = open_count.saturating_sub(1);
                }
                if guard.total_rec_count > 0 {
                    out.push(FlushedFile {
                        filename: guard.filename.clone(),
                        delta_records: guard.total_rec_count,
                    });
                }
                to_remove.push(*key);
            }
        }

        for key in &to_remove {
            inner.entries.remove(key);
            inner.total_count = inner.total_count.saturating_sub(1);
        }
        out
    }

    /// Close and remove every entry unconditionally. Used on shutdown.
    pub fn close_all(&self) -> Vec<FlushedFile> {
        let mut inner = self.inner.write();
        let mut out = Vec::new();
        let keys: Vec<CacheKey> = inner.entries.keys().copied().collect();
        for key in keys {
            if let Some(entry) = inner.entries.get(&key).cloned() {
                let mut guard = entry.state.lock();
                if let Some(mut stream) = guard.stream.take() {
                    let _ = stream.flush();
                    inner.open_count = inner.open_count.saturating_sub(1);
                    drop(stream);
                }
                if guard.total_rec_count > 0 {
                    out.push(FlushedFile {
                        filename: guard.filename.clone(),
                        delta_records: guard.total_rec_count,
                    });
                }
            }
        }
        inner.entries.clear();
        inner.total_count = 0;
        out
    }
}

/// Scan for an eviction candidate (open, not `key`, oldest `last_accessed`)
/// and close it if `open_count` exceeds `max_open_count`. The entry stays
/// in the map with `stream = None`, pinned at `MAX_TIME` so it is never
/// picked again until it's reopened.
fn maybe_evict(inner: &mut Inner, max_open_count: usize, exclude: CacheKey) {
    if inner.open_count <= max_open_count {
        return;
    }
    let mut best: Option<(CacheKey, i64)> = None;
    for (key, entry) in inner.entries.iter() {
        if *key == exclude {
            continue;
        }
        let guard = entry.state.lock();
        if guard.stream.is_some() && best.map_or(true, |(_, b)| guard.last_accessed < b) {
            best = Some((*key, guard.last_accessed));
        }
    }
    let Some((key, _)) = best else { return };
    if let Some(entry) = inner.entries.get(&key) {
        let mut guard = entry.state.lock();
        if let Some(mut stream) = guard.stream.take() {
            let _ = stream.flush();
            drop(stream);
            guard.last_accessed = MAX_TIME;
            inner.open_count -= 1;
        }
    }
}

/// A held reference to one cache entry, with its per-entry mutex locked.
/// Holding `entry` alongside a transmuted-lifetime guard into its own
/// mutex keeps the `Mutex<EntryState>` allocation alive for as long as
/// the guard is; `guard` is declared first so it drops — and unlocks —
/// before `entry`'s refcount is released.
pub struct EntryHandle {
    guard: Option<MutexGuard<'static, EntryState>>,
    entry: Arc<Entry>,
}

impl EntryHandle {
    fn new(entry: Arc<Entry>, guard: MutexGuard<'_, EntryState>) -> Self {
        // SAFETY: `entry` is held in this same struct for the guard's
        // entire lifetime, so the `Mutex` the guard borrows from stays
        // allocated at a stable address (it lives on the heap behind
        // the `Arc`, unaffected by moves of the `Arc` handle itself).
        let guard: MutexGuard<'static, EntryState> = unsafe { std::mem::transmute(guard) };
        Self {
            guard: Some(guard),
            entry,
        }
    }

    pub fn key(&self) -> CacheKey {
        self.entry.key
    }

    pub fn filename(&self) -> PathBuf {
        self.guard.as_ref().expect("handle used after release").filename.clone()
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let guard = self.guard.as_mut().expect("handle used after release");
        let stream = guard
            .stream
            .as_mut()
            .expect("entry handle returned with no open stream");
        stream.write_all(bytes)?;
        guard.total_rec_count += 1;
        Ok(())
    }

    pub fn total_rec_count(&self) -> u64 {
        self.guard
            .as_ref()
            .expect("handle used after release")
            .total_rec_count
    }

    /// Release the per-entry mutex. Equivalent to dropping the handle;
    /// spelled out to match the contract's named `release()` operation.
    pub fn release(mut self) {
        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opener::OpenedFile;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOpener {
        dir: tempfile::TempDir,
        opens: AtomicUsize,
    }

    impl CountingOpener {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                opens: AtomicUsize::new(0),
            }
        }
    }

    impl Opener for CountingOpener {
        fn open(
            &self,
            key: CacheKey,
            prior_path: Option<&std::path::Path>,
        ) -> anyhow::Result<OpenedFile> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let path = match prior_path {
                Some(p) => p.to_path_buf(),
                None => self
                    .dir
                    .path()
                    .join(format!("{}-{}-{}", key.flowtype_id, key.sensor_id, key.hour_ms)),
            };
            let file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            Ok(OpenedFile {
                file,
                filename: path,
            })
        }
    }

    fn key(n: u16) -> CacheKey {
        CacheKey::new(n, 1, 0)
    }

    #[test]
    fn opens_once_and_reuses_for_same_key() {
        let cache = Cache::new(16, Duration::from_secs(300));
        let opener = CountingOpener::new();

        let mut handle = cache.lookup_or_open(key(1), &opener).unwrap();
        handle.write_all(b"abc").unwrap();
        handle.release();

        let handle = cache.lookup_or_open(key(1), &opener).unwrap();
        assert_eq!(handle.total_rec_count(), 1);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eviction_closes_oldest_when_over_max() {
        let cache = Cache::new(1, Duration::from_secs(300));
        let opener = CountingOpener::new();

        let h1 = cache.lookup_or_open(key(1), &opener).unwrap();
        h1.release();
        assert_eq!(cache.open_count(), 1);

        let h2 = cache.lookup_or_open(key(2), &opener).unwrap();
        h2.release();
        // key(1) should have been evicted (closed, not removed).
        assert_eq!(cache.open_count(), 1);
        assert_eq!(cache.total_count(), 2);
    }

    #[test]
    fn reopen_after_eviction_reuses_filename() {
        let cache = Cache::new(1, Duration::from_secs(300));
        let opener = CountingOpener::new();

        let h1 = cache.lookup_or_open(key(1), &opener).unwrap();
        let name1 = h1.filename();
        h1.release();
        let h2 = cache.lookup_or_open(key(2), &opener).unwrap();
        h2.release();

        let h1_again = cache.lookup_or_open(key(1), &opener).unwrap();
        assert_eq!(h1_again.filename(), name1);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn flush_skips_entries_held_by_another_writer() {
        let cache = Cache::new(16, Duration::from_secs(300));
        let opener = CountingOpener::new();

        let held = cache.lookup_or_open(key(1), &opener).unwrap();
        let flushed = cache.flush();
        assert!(flushed.is_empty());
        held.release();
    }

    #[test]
    fn close_all_empties_the_cache() {
        let cache = Cache::new(16, Duration::from_secs(300));
        let opener = CountingOpener::new();

        let mut h = cache.lookup_or_open(key(1), &opener).unwrap();
        h.write_all(b"x").unwrap();
        h.release();

        let closed = cache.close_all();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].delta_records, 1);
        assert_eq!(cache.total_count(), 0);
        assert_eq!(cache.open_count(), 0);
    }

    #[test]
    fn write_all_persists_to_disk() {
        let cache = Cache::new(16, Duration::from_secs(300));
        let opener = CountingOpener::new();

        let mut h = cache.lookup_or_open(key(1), &opener).unwrap();
        h.write_all(b"hello").unwrap();
        let path = h.filename();
        h.release();
        cache.close_all();

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello");
    }
}
