//! Object downloads backed by an [`LruDiskCache`] keyed by content hash.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use filetime::FileTime;
use nimbus_backend::{content_sha512, retry_transient, ObjectMetadata, ObjectStore, RetryPolicy};
use serde_json::Value;

use crate::error::{CacheError, Result};
use crate::lru::{LocalData, LruDiskCache};
use crate::util::atomic_write;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadStatus {
    pub success: bool,
    /// The content came from the local cache (or `dest` was already current).
    pub cache_hit: bool,
    /// The downloaded content was written back to the cache.
    pub cache_write: bool,
}

/// Fetches objects through a local content-addressed cache.
///
/// Objects are keyed by the SHA-512 recorded in their metadata, or by
/// [`object_cache_key`]'s substitute when the upload recorded none.
pub struct CachedObjectFetcher {
    store: Arc<dyn ObjectStore>,
    cache: LruDiskCache,
    retry: RetryPolicy,
}

impl CachedObjectFetcher {
    pub fn new(store: Arc<dyn ObjectStore>, cache: LruDiskCache) -> Self {
        Self {
            store,
            cache,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache(&self) -> &LruDiskCache {
        &self.cache
    }

    /// Make `dest` hold the object's current content, with the object's
    /// last-modified time as its mtime.
    pub fn download_cached(&self, bucket: &str, key: &str, dest: &Path) -> Result<DownloadStatus> {
        let head = self.head(bucket, key)?;
        let cache_key = object_cache_key(bucket, key, &head);

        if let Some(expected) = head.sha512.as_deref() {
            if file_matches(dest, expected) {
                tracing::debug!(target = "nimbus.cache", bucket, key, "destination already current");
                return Ok(DownloadStatus {
                    success: true,
                    cache_hit: true,
                    cache_write: false,
                });
            }
        }
        if let Some(cached) = self.cache.get(&cache_key) {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&cached, dest)?;
            set_remote_mtime(dest, &head)?;
            return Ok(DownloadStatus {
                success: true,
                cache_hit: true,
                cache_write: false,
            });
        }

        let bytes = self.fetch(bucket, key, &head)?;
        atomic_write(dest, &bytes)?;
        set_remote_mtime(dest, &head)?;

        let cache_write = self.write_back(&LocalData::FilePath(dest.to_path_buf()), &cache_key);
        Ok(DownloadStatus {
            success: true,
            cache_hit: false,
            cache_write,
        })
    }

    /// The object's content decoded as JSON.
    ///
    /// A cached entry that no longer decodes is dropped and the object refetched.
    pub fn download_json_cached(&self, bucket: &str, key: &str) -> Result<Value> {
        let head = self.head(bucket, key)?;
        let cache_key = object_cache_key(bucket, key, &head);

        if let Some(bytes) = self.cache.read(&cache_key) {
            match serde_json::from_slice(&bytes) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(
                        target = "nimbus.cache",
                        bucket,
                        key,
                        error = %CacheError::from(err),
                        "cached object is not valid json; refetching"
                    );
                    self.cache.remove(&cache_key);
                }
            }
        }

        let bytes = self.fetch(bucket, key, &head)?;
        let value = serde_json::from_slice(&bytes)?;
        self.write_back(&LocalData::InMemory(bytes), &cache_key);
        Ok(value)
    }

    fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        Ok(retry_transient(&self.retry, "head_object", || {
            self.store.head_object(bucket, key)
        })?)
    }

    fn fetch(&self, bucket: &str, key: &str, head: &ObjectMetadata) -> Result<Vec<u8>> {
        tracing::info!(target = "nimbus.cache", bucket, key, size = head.size, "downloading object");
        let bytes = retry_transient(&self.retry, "get_object", || {
            self.store.get_object(bucket, key)
        })?;

        if let Some(expected) = &head.sha512 {
            let found = content_sha512(&bytes);
            if !found.eq_ignore_ascii_case(expected) {
                return Err(CacheError::ContentHashMismatch {
                    object: format!("{bucket}/{key}"),
                    expected: expected.clone(),
                    found,
                });
            }
        }
        Ok(bytes)
    }

    /// Cache write failures only cost a future download.
    fn write_back(&self, data: &LocalData, cache_key: &str) -> bool {
        match self.cache.write(data, cache_key) {
            Ok(written) => written,
            Err(err) => {
                tracing::warn!(
                    target = "nimbus.cache",
                    key = cache_key,
                    error = %err,
                    "failed to write object into cache"
                );
                false
            }
        }
    }
}

/// Cache key of an object's current content.
///
/// This is the SHA-512 from the object's metadata when the upload recorded one.
/// Otherwise it is a hash over the bucket, the key, the size, the last-modified
/// second and the etag, which changes whenever the object is replaced.
pub fn object_cache_key(bucket: &str, key: &str, head: &ObjectMetadata) -> String {
    if let Some(sha512) = &head.sha512 {
        return sha512.clone();
    }
    let modified_secs = head
        .last_modified_millis
        .map(|millis| ((millis + 500) / 1000).to_string())
        .unwrap_or_default();
    let mut identity = format!("{bucket}\n{key}\n{}\n{modified_secs}", head.size);
    if let Some(etag) = head.etag.as_deref().filter(|etag| !etag.is_empty()) {
        identity.push('\n');
        identity.push_str(etag);
    }
    content_sha512(identity)
}

fn set_remote_mtime(dest: &Path, head: &ObjectMetadata) -> Result<()> {
    let Some(millis) = head.last_modified_millis else {
        return Ok(());
    };
    let mtime = FileTime::from_unix_time((millis / 1000) as i64, ((millis % 1000) * 1_000_000) as u32);
    filetime::set_file_mtime(dest, mtime)?;
    Ok(())
}

fn file_matches(path: &Path, expected_sha512: &str) -> bool {
    match fs::read(path) {
        Ok(bytes) => content_sha512(bytes).eq_ignore_ascii_case(expected_sha512),
        Err(_) => false,
    }
}
