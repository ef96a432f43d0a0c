//! LRU cache over open readers and their decoded data.
//!
//! The cache owns two budgets: a count of open file handles and a byte total
//! of decoded face/tile/reduction buffers (plus large metadata bodies).
//! Readers stay registered until purged; going over the file budget closes
//! the least-recently-opened handles (readers reopen lazily and re-validate
//! their header), and going over the byte budget drops the cache's strong
//! reference to the least-recently-used buffers. A buffer still referenced
//! by a caller is never dropped; the minimum-item floor keeps a working set
//! resident even when single buffers exceed the byte budget.
//!
//! Failed opens are memoised: a path that failed once reports the same
//! error without touching the filesystem again.

use crate::handler::{DefaultInputHandler, InputHandler};
use crate::reader::PtexReader;
use ptex_core::{PtexError, Result};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::debug;

/// Default open-file cap when `max_files` is zero.
const DEFAULT_MAX_FILES: usize = 100;

/// Default byte cap when `max_mem` is zero (100 MB).
const DEFAULT_MAX_MEM: u64 = 100 * 1024 * 1024;

enum FileEntry {
    Ready(Arc<PtexReader>),
    Failed(String),
}

struct DataEntry {
    item: Arc<dyn Any + Send + Sync>,
    size: usize,
    owner: usize,
    queued: u32,
}

#[derive(Default)]
struct DataLru {
    map: HashMap<u64, DataEntry>,
    order: VecDeque<u64>,
    bytes: u64,
    next_id: u64,
}

/// Shared cache of readers and decoded texture data.
///
/// Create one per application (or several; they are independent) and fetch
/// textures through [`get`](PtexCache::get). All methods are thread-safe.
pub struct PtexCache {
    max_files: usize,
    max_mem: u64,
    min_data_count: usize,
    premultiply: bool,
    handler: Arc<dyn InputHandler>,
    search_dirs: RwLock<Vec<PathBuf>>,
    files: Mutex<HashMap<PathBuf, FileEntry>>,
    open_lock: Mutex<()>,
    open_files: AtomicUsize,
    file_order: Mutex<VecDeque<Weak<PtexReader>>>,
    data: Mutex<DataLru>,
    self_ref: Weak<PtexCache>,
}

impl PtexCache {
    /// Creates a cache with the given open-file and resident-byte budgets.
    /// Zero selects the defaults (100 files, 100 MB). `premultiply` makes
    /// readers multiply colour channels by alpha at load time.
    pub fn create(max_files: usize, max_mem: u64, premultiply: bool) -> Arc<PtexCache> {
        Self::create_with_handler(max_files, max_mem, premultiply, Arc::new(DefaultInputHandler))
    }

    /// Like [`create`](Self::create) with a custom I/O handler.
    pub fn create_with_handler(
        max_files: usize,
        max_mem: u64,
        premultiply: bool,
        handler: Arc<dyn InputHandler>,
    ) -> Arc<PtexCache> {
        let max_files = if max_files == 0 { DEFAULT_MAX_FILES } else { max_files };
        let max_mem = if max_mem == 0 { DEFAULT_MAX_MEM } else { max_mem };
        // keep room for a modest working set even when the byte budget is
        // blown by a few large items
        let min_data_count = (10 * max_files).min(1000);
        Arc::new_cyclic(|w| PtexCache {
            max_files,
            max_mem,
            min_data_count,
            premultiply,
            handler,
            search_dirs: RwLock::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            open_lock: Mutex::new(()),
            open_files: AtomicUsize::new(0),
            file_order: Mutex::new(VecDeque::new()),
            data: Mutex::new(DataLru::default()),
            self_ref: w.clone(),
        })
    }

    /// Sets the colon-separated directory list used to resolve relative
    /// paths.
    pub fn set_search_path(&self, path: &str) {
        let dirs = path
            .split(':')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        *self.search_dirs.write().unwrap() = dirs;
    }

    /// The current search path as a colon-separated string.
    pub fn search_path(&self) -> String {
        let dirs = self.search_dirs.read().unwrap();
        dirs.iter().map(|d| d.to_string_lossy()).collect::<Vec<_>>().join(":")
    }

    /// Returns the texture at `path`, opening it on first use.
    ///
    /// Failed opens are remembered; repeated requests return the same error
    /// without retrying.
    pub fn get(self: &Arc<Self>, path: impl AsRef<Path>) -> Result<Arc<PtexReader>> {
        let path = path.as_ref();
        if let Some(hit) = self.lookup(path) {
            self.enforce_file_budget(0);
            return hit;
        }

        // cache-wide open serialisation: two misses on one path open once
        let _open = self.open_lock.lock().unwrap();
        if let Some(hit) = self.lookup(path) {
            return hit;
        }

        let result = self
            .resolve(path)
            .and_then(|p| PtexReader::open_with(&p, self.premultiply, self.handler.clone(), self.self_ref.clone()));

        let entry = match &result {
            Ok(reader) => FileEntry::Ready(reader.clone()),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "ptex open failed");
                FileEntry::Failed(e.to_string())
            }
        };
        self.files.lock().unwrap().insert(path.to_path_buf(), entry);
        drop(_open);

        self.enforce_file_budget(0);
        result
    }

    fn lookup(&self, path: &Path) -> Option<Result<Arc<PtexReader>>> {
        let files = self.files.lock().unwrap();
        match files.get(path) {
            Some(FileEntry::Ready(r)) => Some(Ok(r.clone())),
            Some(FileEntry::Failed(msg)) => Some(Err(PtexError::OpenFailed(msg.clone()))),
            None => None,
        }
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let dirs = self.search_dirs.read().unwrap();
        if dirs.is_empty() {
            return Ok(path.to_path_buf());
        }
        for dir in dirs.iter() {
            let candidate = dir.join(path);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(PtexError::FileNotFound { path: path.to_path_buf() })
    }

    /// Drops the given texture from the cache along with its decoded data.
    pub fn purge_texture(&self, texture: &Arc<PtexReader>) {
        self.purge(texture.path());
    }

    /// Drops the texture opened from `path` along with its decoded data.
    pub fn purge(&self, path: impl AsRef<Path>) {
        let removed = self.files.lock().unwrap().remove(path.as_ref());
        if let Some(FileEntry::Ready(reader)) = removed {
            reader.close_handle();
            self.purge_owner(reader.cache_key());
        }
    }

    /// Empties the cache entirely. Outstanding handles stay valid until
    /// released.
    pub fn purge_all(&self) {
        let entries: Vec<FileEntry> = self.files.lock().unwrap().drain().map(|(_, e)| e).collect();
        for e in &entries {
            if let FileEntry::Ready(reader) = e {
                reader.close_handle();
            }
        }
        let mut data = self.data.lock().unwrap();
        data.map.clear();
        data.order.clear();
        data.bytes = 0;
    }

    /// Current resident bytes of cache-owned decoded data.
    pub fn resident_bytes(&self) -> u64 {
        self.data.lock().unwrap().bytes
    }

    /// Current number of cache-owned data items.
    pub fn resident_count(&self) -> usize {
        self.data.lock().unwrap().map.len()
    }

    /// Current number of open file handles.
    pub fn open_file_count(&self) -> usize {
        self.open_files.load(Ordering::Acquire)
    }

    /// The byte budget.
    pub fn max_mem(&self) -> u64 {
        self.max_mem
    }

    /// The open-file budget.
    pub fn max_files(&self) -> usize {
        self.max_files
    }

    /// The eviction floor on item count.
    pub fn min_data_count(&self) -> usize {
        self.min_data_count
    }

    // --- internal API used by readers ---

    /// Registers a decoded buffer; returns its LRU id.
    pub(crate) fn track_data(&self, item: Arc<dyn Any + Send + Sync>, size: usize, owner: usize) -> u64 {
        let id = {
            let mut data = self.data.lock().unwrap();
            let id = data.next_id;
            data.next_id += 1;
            data.map.insert(id, DataEntry { item, size, owner, queued: 1 });
            data.order.push_back(id);
            data.bytes += size as u64;
            id
        };
        self.enforce_data_budget();
        id
    }

    /// Marks a buffer recently used.
    pub(crate) fn touch_data(&self, id: u64) {
        let mut data = self.data.lock().unwrap();
        if let Some(entry) = data.map.get_mut(&id) {
            entry.queued += 1;
            data.order.push_back(id);
        }
    }

    /// Drops every buffer owned by a purged reader.
    pub(crate) fn purge_owner(&self, owner: usize) {
        let mut data = self.data.lock().unwrap();
        let mut freed = 0u64;
        data.map.retain(|_, e| {
            if e.owner == owner {
                freed += e.size as u64;
                false
            } else {
                true
            }
        });
        data.bytes -= freed;
    }

    fn enforce_data_budget(&self) {
        let mut dropped: Vec<Arc<dyn Any + Send + Sync>> = Vec::new();
        {
            let mut data = self.data.lock().unwrap();
            let mut attempts = 0usize;
            while data.bytes > self.max_mem && data.map.len() > self.min_data_count {
                let Some(id) = data.order.pop_front() else { break };
                let Some(entry) = data.map.get_mut(&id) else { continue };
                entry.queued -= 1;
                if entry.queued > 0 {
                    // stale queue position; a fresher one follows
                    continue;
                }
                if Arc::strong_count(&entry.item) > 1 {
                    // externally held, not evictable
                    entry.queued += 1;
                    data.order.push_back(id);
                    attempts += 1;
                    if attempts > data.map.len() {
                        break;
                    }
                    continue;
                }
                let entry = data.map.remove(&id).unwrap();
                data.bytes -= entry.size as u64;
                dropped.push(entry.item);
            }
        }
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "evicted ptex data buffers");
        }
        // buffers free outside the lru lock
        drop(dropped);
    }

    /// Records that a reader opened (or reopened) its file handle.
    pub(crate) fn note_file_opened(&self, reader: &Arc<PtexReader>) {
        self.open_files.fetch_add(1, Ordering::AcqRel);
        self.file_order.lock().unwrap().push_back(Arc::downgrade(reader));
    }

    /// Records that a reader's handle was closed.
    pub(crate) fn note_file_closed(&self) {
        self.open_files.fetch_sub(1, Ordering::AcqRel);
    }

    /// Closes least-recently-opened handles until the file budget holds.
    /// `skip` names a reader (by cache key) that must keep its handle.
    pub(crate) fn enforce_file_budget(&self, skip: usize) {
        let mut attempts = 0usize;
        while self.open_files.load(Ordering::Acquire) > self.max_files {
            let victim = {
                let mut order = self.file_order.lock().unwrap();
                let Some(weak) = order.pop_front() else { break };
                match weak.upgrade() {
                    Some(reader) if reader.handle_open() => {
                        if reader.cache_key() == skip {
                            order.push_back(weak);
                            attempts += 1;
                            if attempts > order.len() + 1 {
                                break;
                            }
                            continue;
                        }
                        Some(reader)
                    }
                    _ => continue, // stale entry
                }
            };
            if let Some(reader) = victim {
                debug!(path = %reader.path().display(), "closing lru ptex file handle");
                reader.close_handle();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied() {
        let cache = PtexCache::create(0, 0, false);
        assert_eq!(cache.max_files(), 100);
        assert_eq!(cache.max_mem(), 100 * 1024 * 1024);
        assert_eq!(cache.min_data_count(), 1000);

        let small = PtexCache::create(2, 1024, false);
        assert_eq!(small.min_data_count(), 20);
    }

    #[test]
    fn search_path_round_trip() {
        let cache = PtexCache::create(0, 0, false);
        assert_eq!(cache.search_path(), "");
        cache.set_search_path("/a/b:relative/dir:/c");
        assert_eq!(cache.search_path(), "/a/b:relative/dir:/c");
    }

    #[test]
    fn missing_file_memoised() {
        let cache = PtexCache::create(0, 0, false);
        let err1 = cache.get("/no/such/file.ptx").unwrap_err().to_string();
        let err2 = cache.get("/no/such/file.ptx").unwrap_err().to_string();
        assert_eq!(err1, err2);
    }

    #[test]
    fn data_budget_eviction() {
        let cache = PtexCache::create(4, 1000, false);
        // min_data_count = 40, so evictions only start above 40 items; use
        // unreferenced blobs and watch the byte total
        for _ in 0..100 {
            let blob: Arc<dyn Any + Send + Sync> = Arc::new(vec![0u8; 100]);
            cache.track_data(blob, 100, 1);
        }
        assert!(cache.resident_count() >= cache.min_data_count());
        assert!(
            cache.resident_bytes() <= 1000 || cache.resident_count() == cache.min_data_count(),
            "bytes={} count={}",
            cache.resident_bytes(),
            cache.resident_count()
        );
    }

    #[test]
    fn held_items_survive_eviction() {
        let cache = PtexCache::create(1, 100, false);
        let held: Arc<dyn Any + Send + Sync> = Arc::new(vec![7u8; 400]);
        cache.track_data(held.clone(), 400, 1);
        // push plenty of evictable data through
        for _ in 0..50 {
            let blob: Arc<dyn Any + Send + Sync> = Arc::new(vec![0u8; 400]);
            cache.track_data(blob, 400, 2);
        }
        // our held item must still be resident (it can never be evicted)
        let data = cache.data.lock().unwrap();
        assert!(data.map.values().any(|e| Arc::ptr_eq(&e.item, &held)));
    }

    #[test]
    fn purge_owner_frees_bytes() {
        let cache = PtexCache::create(4, 1 << 20, false);
        for i in 0..10 {
            let blob: Arc<dyn Any + Send + Sync> = Arc::new(vec![0u8; 64]);
            cache.track_data(blob, 64, i % 2);
        }
        let before = cache.resident_bytes();
        cache.purge_owner(0);
        assert_eq!(cache.resident_bytes(), before / 2);
    }
}
