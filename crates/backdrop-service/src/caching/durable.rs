use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tempfile::NamedTempFile;

use super::CacheKey;
use crate::config::Config;

/// The version of the on-disk layout, part of every cache path.
const STORE_VERSION: u32 = 1;

/// The interval in which used files are touched.
///
/// Files use a "time to idle" mode, so they need to be touched regularly to signal that they
/// are still in use. This is debounced to not touch them on every single lookup.
const TOUCH_EVERY: Duration = Duration::from_secs(3600);

/// A file in a [`DurableStore`], as listed by [`DurableStore::enumerate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// The path relative to the store root.
    pub path: PathBuf,
    pub size: u64,
    pub last_used: SystemTime,
}

/// A write location handed out by [`DurableStore::begin_insert`].
///
/// The contents only become visible through [`DurableStore::finish_insert`]. Dropping a pending
/// insert discards everything written to it.
#[derive(Debug)]
pub struct PendingInsert {
    key: CacheKey,
    file: NamedTempFile,
}

impl PendingInsert {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn file(&mut self) -> &mut File {
        self.file.as_file_mut()
    }
}

/// Statistics of a [`DurableStore::enforce_size_limit`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: usize,
    pub removed_bytes: u64,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// Persistent storage of cache files, keyed by [`CacheKey`].
///
/// All methods do blocking file system I/O and must only be called from jobs of the
/// [`Disk`](crate::jobs::JobCategory::Disk) category.
pub trait DurableStore: Send + Sync {
    /// Reads the file for `key`, `None` if there is none.
    fn lookup(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>>;

    /// Returns a location to write a new file for `key` to.
    fn begin_insert(&self, key: &CacheKey) -> io::Result<PendingInsert>;

    /// Atomically moves a fully written file into place, replacing any existing file.
    fn finish_insert(&self, pending: PendingInsert) -> io::Result<()>;

    /// Removes the file for `key`, returning whether there was one.
    fn remove(&self, key: &CacheKey) -> io::Result<bool>;

    /// Lists all files in the store.
    fn enumerate(&self) -> io::Result<Vec<StoredEntry>>;

    /// Removes the least recently used files until the store holds at most `max_bytes`.
    fn enforce_size_limit(&self, max_bytes: u64) -> io::Result<CleanupStats>;
}

/// A [`DurableStore`] in a directory of the local file system.
///
/// Files are laid out by the hash of their key, see [`CacheKey::cache_path`]. New files are
/// written to a sibling `tmp` directory first and then moved into place.
///
/// The modification time of a file keeps track of its last use, since creation and access times
/// are unreliable across file systems.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    data_dir: PathBuf,
    tmp_dir: PathBuf,
    max_unused_for: Option<Duration>,
}

impl FilesystemStore {
    /// Opens the store in `root`, creating it if needed.
    ///
    /// Temporary files left over from an earlier process, for example after a crash, are removed.
    pub fn open(root: &Path, max_unused_for: Option<Duration>) -> io::Result<Self> {
        let store = Self {
            data_dir: root.join("data"),
            tmp_dir: root.join("tmp"),
            max_unused_for,
        };

        if store.tmp_dir.exists() {
            fs::remove_dir_all(&store.tmp_dir)?;
        }
        fs::create_dir_all(&store.tmp_dir)?;
        fs::create_dir_all(&store.data_dir)?;

        tracing::debug!(root = %root.display(), "Opened durable store");
        Ok(store)
    }

    /// Opens the store in the `durable` directory below the configured cache directory, if any.
    pub fn from_config(config: &Config) -> io::Result<Option<Self>> {
        match config.cache_dir("durable") {
            Some(root) => Self::open(&root, config.durable_cache.max_unused_for).map(Some),
            None => Ok(None),
        }
    }

    fn path(&self, key: &CacheKey) -> PathBuf {
        self.data_dir.join(key.cache_path(STORE_VERSION))
    }

    fn is_expired(&self, last_used: SystemTime) -> bool {
        let unused_for = last_used.elapsed().unwrap_or_default();
        self.max_unused_for
            .is_some_and(|max_unused_for| unused_for > max_unused_for)
    }

    fn collect_entries(&self, directory: &Path, entries: &mut Vec<StoredEntry>) -> io::Result<()> {
        let Some(dir) = catch_not_found(|| fs::read_dir(directory))? else {
            return Ok(());
        };
        for entry in dir {
            let path = entry?.path();
            let Some(metadata) = catch_not_found(|| path.metadata())? else {
                continue;
            };
            if metadata.is_dir() {
                self.collect_entries(&path, entries)?;
            } else if let Ok(relative) = path.strip_prefix(&self.data_dir) {
                entries.push(StoredEntry {
                    path: relative.to_owned(),
                    size: metadata.len(),
                    last_used: metadata.modified()?,
                });
            }
        }
        Ok(())
    }

    fn remove_entry(&self, entry: &StoredEntry) -> io::Result<()> {
        let path = self.data_dir.join(&entry.path);
        catch_not_found(|| fs::remove_file(&path))?;

        // remove directories that became empty, errors mean they are not
        let mut dir = path.parent();
        while let Some(parent) = dir {
            if parent == self.data_dir || fs::remove_dir(parent).is_err() {
                break;
            }
            dir = parent.parent();
        }
        Ok(())
    }
}

impl DurableStore for FilesystemStore {
    fn lookup(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>> {
        let path = self.path(key);
        let contents = catch_not_found(|| {
            let metadata = path.metadata()?;
            let mtime = metadata.modified()?;
            if self.is_expired(mtime) {
                return Err(io::ErrorKind::NotFound.into());
            }

            let contents = fs::read(&path)?;
            if mtime.elapsed().unwrap_or_default() >= TOUCH_EVERY {
                filetime::set_file_mtime(&path, FileTime::now())?;
            }
            Ok(contents)
        })?;

        match contents {
            Some(ref contents) => {
                metric!(counter("caches.durable.hit") += 1);
                tracing::trace!(%key, size = contents.len(), "Durable cache hit");
            }
            None => metric!(counter("caches.durable.miss") += 1),
        }
        Ok(contents)
    }

    fn begin_insert(&self, key: &CacheKey) -> io::Result<PendingInsert> {
        // the tmp directory may have been removed by a cleanup in the meantime
        fs::create_dir_all(&self.tmp_dir)?;
        let file = tempfile::Builder::new()
            .prefix("tmp")
            .tempfile_in(&self.tmp_dir)?;

        Ok(PendingInsert {
            key: key.clone(),
            file,
        })
    }

    fn finish_insert(&self, pending: PendingInsert) -> io::Result<()> {
        let PendingInsert { key, file } = pending;
        let path = self.path(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        file.as_file().sync_all()?;
        let size = file.as_file().metadata()?.len();
        file.persist(&path).map_err(|e| e.error)?;

        tracing::trace!(%key, size, "Wrote durable cache file");
        metric!(counter("caches.durable.write") += 1);
        metric!(histogram("caches.durable.size") = size);
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> io::Result<bool> {
        let removed = catch_not_found(|| fs::remove_file(self.path(key)))?.is_some();
        if removed {
            tracing::trace!(%key, "Removed durable cache file");
        }
        Ok(removed)
    }

    fn enumerate(&self) -> io::Result<Vec<StoredEntry>> {
        let mut entries = Vec::new();
        self.collect_entries(&self.data_dir, &mut entries)?;
        Ok(entries)
    }

    fn enforce_size_limit(&self, max_bytes: u64) -> io::Result<CleanupStats> {
        let mut entries = self.enumerate()?;
        entries.sort_by_key(|entry| entry.last_used);

        let mut stats = CleanupStats::default();
        let mut total_bytes: u64 = entries.iter().map(|entry| entry.size).sum();

        for entry in &entries {
            if total_bytes > max_bytes || self.is_expired(entry.last_used) {
                if let Err(e) = self.remove_entry(entry) {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %entry.path.display(),
                        "Failed to clean durable cache file"
                    );
                    stats.retained_files += 1;
                    stats.retained_bytes += entry.size;
                    continue;
                }
                total_bytes -= entry.size;
                stats.removed_files += 1;
                stats.removed_bytes += entry.size;
            } else {
                stats.retained_files += 1;
                stats.retained_bytes += entry.size;
            }
        }

        tracing::debug!(
            removed_files = stats.removed_files,
            removed_bytes = stats.removed_bytes,
            retained_files = stats.retained_files,
            retained_bytes = stats.retained_bytes,
            "Cleaned up durable cache"
        );
        metric!(gauge("caches.durable.bytes") = stats.retained_bytes);
        metric!(counter("caches.durable.evicted") += stats.removed_files as i64);
        Ok(stats)
    }
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn insert(store: &FilesystemStore, key: &CacheKey, contents: &[u8]) {
        let mut pending = store.begin_insert(key).unwrap();
        pending.file().write_all(contents).unwrap();
        store.finish_insert(pending).unwrap();
    }

    fn set_age(store: &FilesystemStore, key: &CacheKey, age: Duration) {
        let mtime = FileTime::from_system_time(SystemTime::now() - age);
        filetime::set_file_mtime(store.path(key), mtime).unwrap();
    }

    #[test]
    fn test_insert_and_lookup() {
        let dir = backdrop_test::tempdir();
        let store = FilesystemStore::open(dir.path(), None).unwrap();
        let key = CacheKey::from("thumbnail");

        assert_eq!(store.lookup(&key).unwrap(), None);
        insert(&store, &key, b"pixels");
        assert_eq!(store.lookup(&key).unwrap().as_deref(), Some(&b"pixels"[..]));
        assert!(
            dir.path()
                .join("data/v1/80/f61f96/184524ba54db767ed49487392430ad26bf5cf2ef689905f3400325d7")
                .is_file()
        );

        assert!(store.remove(&key).unwrap());
        assert!(!store.remove(&key).unwrap());
        assert_eq!(store.lookup(&key).unwrap(), None);
    }

    #[test]
    fn test_discarded_insert() {
        let dir = backdrop_test::tempdir();
        let store = FilesystemStore::open(dir.path(), None).unwrap();
        let key = CacheKey::from("discarded");

        let mut pending = store.begin_insert(&key).unwrap();
        pending.file().write_all(b"half").unwrap();
        drop(pending);

        assert_eq!(store.lookup(&key).unwrap(), None);
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn test_open_clears_tmp() {
        let dir = backdrop_test::tempdir();
        fs::create_dir_all(dir.path().join("tmp")).unwrap();
        fs::write(dir.path().join("tmp/leftover"), b"crash").unwrap();

        FilesystemStore::open(dir.path(), None).unwrap();
        assert!(!dir.path().join("tmp/leftover").exists());
        assert!(dir.path().join("tmp").is_dir());
    }

    #[test]
    fn test_lookup_touches_file() {
        let dir = backdrop_test::tempdir();
        let store = FilesystemStore::open(dir.path(), None).unwrap();
        let key = CacheKey::from("old");
        insert(&store, &key, b"data");
        set_age(&store, &key, Duration::from_secs(7200));

        store.lookup(&key).unwrap().unwrap();
        let entries = store.enumerate().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].last_used.elapsed().unwrap() < TOUCH_EVERY);
    }

    #[test]
    fn test_enforce_size_limit() {
        let dir = backdrop_test::tempdir();
        let store = FilesystemStore::open(dir.path(), None).unwrap();
        let keys: Vec<_> = ["a", "b", "c"].into_iter().map(CacheKey::from).collect();
        for (i, key) in keys.iter().enumerate() {
            insert(&store, key, &[0; 100]);
            // `a` is the least recently used
            set_age(&store, key, Duration::from_secs(300 - 100 * i as u64));
        }

        let stats = store.enforce_size_limit(250).unwrap();
        assert_eq!(
            stats,
            CleanupStats {
                removed_files: 1,
                removed_bytes: 100,
                retained_files: 2,
                retained_bytes: 200,
            }
        );
        assert_eq!(store.lookup(&keys[0]).unwrap(), None);
        assert!(store.lookup(&keys[1]).unwrap().is_some());

        store.enforce_size_limit(0).unwrap();
        assert!(store.enumerate().unwrap().is_empty());
        // empty directories are removed as well
        assert_eq!(fs::read_dir(dir.path().join("data")).unwrap().count(), 0);
    }

    #[test]
    fn test_expiry() {
        let dir = backdrop_test::tempdir();
        let store = FilesystemStore::open(dir.path(), Some(Duration::from_secs(60))).unwrap();
        let fresh = CacheKey::from("fresh");
        let stale = CacheKey::from("stale");
        insert(&store, &fresh, b"fresh");
        insert(&store, &stale, b"stale");
        set_age(&store, &stale, Duration::from_secs(120));

        assert_eq!(store.lookup(&stale).unwrap(), None);

        let stats = store.enforce_size_limit(u64::MAX).unwrap();
        assert_eq!(stats.removed_files, 1);
        assert_eq!(store.enumerate().unwrap().len(), 1);
        assert!(store.lookup(&fresh).unwrap().is_some());
    }
}
