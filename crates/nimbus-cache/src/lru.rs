//! Size-bounded key to bytes store on local disk with least-recently-accessed eviction.
//!
//! Entries are plain files named by their key (typically a content hash) directly
//! under the cache directory. The bound is soft in the sense that concurrent
//! writers are not coordinated, but a single writer never leaves the directory
//! larger than the effective ceiling after a successful write.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::error::{CacheError, Result};
use crate::util::{atomic_write, atomic_write_with, remove_file_best_effort, TMP_MARKER};

/// Payload of a cache write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalData {
    /// Copy an existing file; its access/modify times are carried over.
    FilePath(PathBuf),
    InMemory(Vec<u8>),
}

impl LocalData {
    pub fn len(&self) -> io::Result<u64> {
        match self {
            LocalData::FilePath(path) => Ok(fs::metadata(path)?.len()),
            LocalData::InMemory(bytes) => Ok(bytes.len() as u64),
        }
    }
}

/// Soft size limits of an [`LruDiskCache`]. Unset limits do not apply; with both
/// unset the cache is unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheLimits {
    max_absolute: Option<u64>,
    max_fraction_of_free: Option<f64>,
}

impl CacheLimits {
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// `max_fraction_of_free` must be finite and within `(0, 1]`.
    pub fn new(max_absolute: Option<u64>, max_fraction_of_free: Option<f64>) -> Result<Self> {
        if let Some(fraction) = max_fraction_of_free {
            if !fraction.is_finite() || fraction <= 0.0 || fraction > 1.0 {
                return Err(CacheError::InvalidLimits {
                    message: format!("max_fraction_of_free must be within (0, 1], got {fraction}"),
                });
            }
        }
        Ok(Self {
            max_absolute,
            max_fraction_of_free,
        })
    }

    pub fn absolute(max_bytes: u64) -> Self {
        Self {
            max_absolute: Some(max_bytes),
            max_fraction_of_free: None,
        }
    }

    pub fn max_absolute(&self) -> Option<u64> {
        self.max_absolute
    }

    pub fn max_fraction_of_free(&self) -> Option<f64> {
        self.max_fraction_of_free
    }

    /// The tighter of the configured limits for a cache living in `dir`, `None`
    /// when unbounded.
    pub fn effective_ceiling(&self, dir: &Path) -> Result<Option<u64>> {
        let from_free = match self.max_fraction_of_free {
            Some(fraction) => {
                let free = fs2::available_space(dir)?;
                Some((free as f64 * fraction) as u64)
            }
            None => None,
        };
        Ok(match (self.max_absolute, from_free) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }
}

#[derive(Debug)]
struct CachedFile {
    path: PathBuf,
    size: u64,
    accessed: FileTime,
}

/// A directory of cache entries bounded by [`CacheLimits`].
#[derive(Clone, Debug)]
pub struct LruDiskCache {
    dir: PathBuf,
    limits: CacheLimits,
}

impl LruDiskCache {
    pub fn new(dir: impl Into<PathBuf>, limits: CacheLimits) -> Self {
        Self {
            dir: dir.into(),
            limits,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    pub fn entry_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }

    /// Store `data` under `key`, evicting least-recently-accessed entries as needed.
    ///
    /// Returns `false` (and leaves the cache untouched) when the entry alone is
    /// larger than the effective ceiling, or when eviction could not make room.
    pub fn write(&self, data: &LocalData, key: &str) -> Result<bool> {
        let dest = self.entry_path(key)?;
        fs::create_dir_all(&self.dir)?;

        let new_size = data.len()?;
        let Some(ceiling) = self.limits.effective_ceiling(&self.dir)? else {
            persist(data, &dest)?;
            return Ok(true);
        };

        if new_size > ceiling {
            tracing::debug!(
                target = "nimbus.cache",
                key,
                size = new_size,
                ceiling,
                "entry exceeds cache ceiling; not cached"
            );
            return Ok(false);
        }

        let mut entries = scan_entries(&self.dir)?;
        // The entry being replaced is overwritten, never evicted.
        entries.retain(|entry| entry.path != dest);
        let mut current: u64 = entries.iter().map(|entry| entry.size).sum();

        if current.saturating_add(new_size) > ceiling {
            entries.sort_by_key(|entry| entry.accessed);
            for victim in entries {
                if current.saturating_add(new_size) <= ceiling {
                    break;
                }
                match fs::remove_file(&victim.path) {
                    Ok(()) => {
                        tracing::debug!(
                            target = "nimbus.cache",
                            path = %victim.path.display(),
                            size = victim.size,
                            "evicted cache entry"
                        );
                        current = current.saturating_sub(victim.size);
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        current = current.saturating_sub(victim.size);
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "nimbus.cache",
                            path = %victim.path.display(),
                            error = %err,
                            "failed to evict cache entry; skipping"
                        );
                    }
                }
            }
        }

        if current.saturating_add(new_size) > ceiling {
            tracing::debug!(
                target = "nimbus.cache",
                key,
                current,
                size = new_size,
                ceiling,
                "could not make room for entry"
            );
            return Ok(false);
        }

        persist(data, &dest)?;
        Ok(true)
    }

    /// Path of the entry for `key` if present. Marks the entry as accessed.
    pub fn get(&self, key: &str) -> Option<PathBuf> {
        let path = self.entry_path(key).ok()?;
        let meta = fs::symlink_metadata(&path).ok()?;
        if !meta.is_file() {
            return None;
        }
        // Access times are not maintained on `noatime` mounts; bump explicitly.
        if let Err(err) = filetime::set_file_atime(&path, FileTime::now()) {
            tracing::debug!(
                target = "nimbus.cache",
                path = %path.display(),
                error = %err,
                "failed to update access time"
            );
        }
        Some(path)
    }

    pub fn read(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.get(key)?;
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target = "nimbus.cache",
                        path = %path.display(),
                        error = %err,
                        "failed to read cache entry"
                    );
                }
                None
            }
        }
    }

    /// Drop the entry for `key`. Returns `true` when it no longer exists.
    pub fn remove(&self, key: &str) -> bool {
        match self.entry_path(key) {
            Ok(path) => remove_file_best_effort(&path, "lru.remove"),
            Err(_) => true,
        }
    }

    /// Total size in bytes of all entries.
    pub fn total_size(&self) -> Result<u64> {
        if !self.dir.exists() {
            return Ok(0);
        }
        Ok(scan_entries(&self.dir)?.iter().map(|entry| entry.size).sum())
    }
}

/// Write `data` into `cache_dir` under `cache_key`, bounded by `limits`.
///
/// See [`LruDiskCache::write`].
pub fn lru_cache_write(
    data: &LocalData,
    cache_dir: &Path,
    cache_key: &str,
    limits: CacheLimits,
) -> Result<bool> {
    LruDiskCache::new(cache_dir, limits).write(data, cache_key)
}

fn validate_key(key: &str) -> Result<()> {
    let legal = !key.is_empty()
        && key != "."
        && key != ".."
        && !key.contains(TMP_MARKER)
        && !key.contains(['/', '\\', '\0']);
    if legal {
        Ok(())
    } else {
        Err(CacheError::InvalidKey {
            key: key.to_string(),
        })
    }
}

fn persist(data: &LocalData, dest: &Path) -> Result<()> {
    match data {
        LocalData::InMemory(bytes) => atomic_write(dest, bytes),
        LocalData::FilePath(src) => {
            let meta = fs::metadata(src)?;
            atomic_write_with(dest, |file| {
                io::copy(&mut fs::File::open(src)?, file)?;
                Ok(())
            })?;
            filetime::set_file_times(
                dest,
                FileTime::from_last_access_time(&meta),
                FileTime::from_last_modification_time(&meta),
            )?;
            Ok(())
        }
    }
}

fn scan_entries(dir: &Path) -> Result<Vec<CachedFile>> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            // The cache directory itself could not be read; sizes would be wrong.
            Err(err) if err.depth() == 0 => return Err(err.into()),
            Err(err) => {
                tracing::debug!(
                    target = "nimbus.cache",
                    dir = %dir.display(),
                    error = %err,
                    "failed to read cache directory entry"
                );
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().contains(TMP_MARKER) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                tracing::debug!(
                    target = "nimbus.cache",
                    path = %entry.path().display(),
                    error = %err,
                    "failed to stat cache entry"
                );
                continue;
            }
        };
        entries.push(CachedFile {
            path: entry.into_path(),
            size: meta.len(),
            accessed: FileTime::from_last_access_time(&meta),
        });
    }
    Ok(entries)
}
