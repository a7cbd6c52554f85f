use filetime::FileTime;
use nimbus_backend::{content_sha512, MemoryBackend, ObjectStore, ResourceKind};
use nimbus_cache::{
    object_cache_key, CacheError, CacheLimits, CachedObjectFetcher, DownloadStatus, LruDiskCache,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::fs;
use std::sync::Arc;

fn fetcher(backend: &Arc<MemoryBackend>, cache_dir: &std::path::Path) -> CachedObjectFetcher {
    CachedObjectFetcher::new(
        backend.clone(),
        LruDiskCache::new(cache_dir, CacheLimits::absolute(1 << 20)),
    )
}

#[test]
fn second_download_is_served_from_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put_object("bucket", "report.csv", b"a,b\n1,2\n".to_vec());
    let fetcher = fetcher(&backend, &tmp.path().join("cache"));
    let dest = tmp.path().join("out").join("report.csv");

    let first = fetcher.download_cached("bucket", "report.csv", &dest).unwrap();
    assert_eq!(
        first,
        DownloadStatus {
            success: true,
            cache_hit: false,
            cache_write: true,
        }
    );
    assert!(fetcher.cache().get(&content_sha512(b"a,b\n1,2\n")).is_some());

    fs::remove_file(&dest).unwrap();
    let second = fetcher.download_cached("bucket", "report.csv", &dest).unwrap();
    assert!(second.cache_hit);
    assert!(!second.cache_write);
    assert_eq!(fs::read(&dest).unwrap(), b"a,b\n1,2\n");
}

#[test]
fn current_destination_is_left_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put_object("bucket", "k", b"same".to_vec());
    let dest = tmp.path().join("k");
    fs::write(&dest, b"same").unwrap();

    let status = fetcher(&backend, &tmp.path().join("cache"))
        .download_cached("bucket", "k", &dest)
        .unwrap();
    assert!(status.cache_hit);
    assert!(!tmp.path().join("cache").exists());
}

#[test]
fn changed_object_is_downloaded_again() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let fetcher = fetcher(&backend, &tmp.path().join("cache"));
    let dest = tmp.path().join("k");

    backend.put_object("bucket", "k", b"v1".to_vec());
    fetcher.download_cached("bucket", "k", &dest).unwrap();
    backend.put_object("bucket", "k", b"v2".to_vec());

    let status = fetcher.download_cached("bucket", "k", &dest).unwrap();
    assert!(!status.cache_hit);
    assert_eq!(fs::read(&dest).unwrap(), b"v2");
}

#[test]
fn json_downloads_recover_from_a_corrupt_cache_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let body = json!({"version": 3, "names": ["a", "b"]}).to_string();
    backend.put_object("bucket", "config.json", body.clone());
    let fetcher = fetcher(&backend, &tmp.path().join("cache"));

    let value = fetcher.download_json_cached("bucket", "config.json").unwrap();
    assert_eq!(value, json!({"version": 3, "names": ["a", "b"]}));

    let entry = fetcher.cache().get(&content_sha512(&body)).unwrap();
    fs::write(&entry, b"garbage").unwrap();

    let value = fetcher.download_json_cached("bucket", "config.json").unwrap();
    assert_eq!(value["version"], json!(3));
    assert_eq!(fs::read(&entry).unwrap(), body.as_bytes());
}

#[test]
fn missing_object_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let err = fetcher(&backend, tmp.path())
        .download_cached("bucket", "nope", &tmp.path().join("dest"))
        .unwrap_err();
    assert!(
        matches!(&err, CacheError::Backend(e) if e.is_not_found_of(ResourceKind::Object)),
        "{err}"
    );
}

#[test]
fn objects_without_a_recorded_hash_are_cached_by_identity() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put_object_unhashed("bucket", "plain.txt", b"uploaded without metadata".to_vec());
    let fetcher = fetcher(&backend, &tmp.path().join("cache"));
    let dest = tmp.path().join("plain.txt");

    let first = fetcher.download_cached("bucket", "plain.txt", &dest).unwrap();
    assert!(!first.cache_hit);
    assert!(first.cache_write);

    let second = fetcher.download_cached("bucket", "plain.txt", &dest).unwrap();
    assert_eq!(
        second,
        DownloadStatus {
            success: true,
            cache_hit: true,
            cache_write: false,
        }
    );
    assert_eq!(fs::read(&dest).unwrap(), b"uploaded without metadata");

    backend.put_object_unhashed("bucket", "plain.txt", b"replaced".to_vec());
    let third = fetcher.download_cached("bucket", "plain.txt", &dest).unwrap();
    assert!(!third.cache_hit);
    assert_eq!(fs::read(&dest).unwrap(), b"replaced");
}

#[test]
fn json_without_a_recorded_hash_is_read_from_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put_object_unhashed("bucket", "flags.json", json!({"dark_mode": true}).to_string());
    let fetcher = fetcher(&backend, &tmp.path().join("cache"));

    assert_eq!(
        fetcher.download_json_cached("bucket", "flags.json").unwrap(),
        json!({"dark_mode": true})
    );

    let head = backend.head_object("bucket", "flags.json").unwrap();
    let entry = fetcher
        .cache()
        .get(&object_cache_key("bucket", "flags.json", &head))
        .unwrap();
    fs::write(&entry, json!({"dark_mode": false}).to_string()).unwrap();
    assert_eq!(
        fetcher.download_json_cached("bucket", "flags.json").unwrap(),
        json!({"dark_mode": false})
    );
}

#[test]
fn downloads_carry_the_remote_modification_time() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put_object("bucket", "k", b"timed".to_vec());
    let millis = backend
        .head_object("bucket", "k")
        .unwrap()
        .last_modified_millis
        .unwrap();
    let expected = FileTime::from_unix_time((millis / 1000) as i64, ((millis % 1000) * 1_000_000) as u32);
    let fetcher = fetcher(&backend, &tmp.path().join("cache"));

    let fresh = tmp.path().join("fresh");
    fetcher.download_cached("bucket", "k", &fresh).unwrap();
    let meta = fs::metadata(&fresh).unwrap();
    assert_eq!(FileTime::from_last_modification_time(&meta), expected);

    let from_cache = tmp.path().join("from_cache");
    assert!(fetcher.download_cached("bucket", "k", &from_cache).unwrap().cache_hit);
    let meta = fs::metadata(&from_cache).unwrap();
    assert_eq!(FileTime::from_last_modification_time(&meta), expected);
}
