use filetime::FileTime;
use nimbus_cache::{lru_cache_write, CacheLimits, LocalData, LruDiskCache};
use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;

fn bytes(len: usize) -> LocalData {
    LocalData::InMemory(vec![b'x'; len])
}

fn set_atime(path: &Path, secs: i64) {
    filetime::set_file_atime(path, FileTime::from_unix_time(secs, 0)).unwrap();
}

fn entry_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn directory_never_exceeds_the_ceiling() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = LruDiskCache::new(tmp.path(), CacheLimits::absolute(1_000));

    for i in 0..10 {
        let key = format!("entry-{i}");
        assert!(cache.write(&bytes(300), &key).unwrap());
        set_atime(&tmp.path().join(&key), 1_000 + i);
        assert!(cache.total_size().unwrap() <= 1_000);
    }

    // Only the three most recently accessed entries fit.
    assert_eq!(entry_names(tmp.path()), vec!["entry-7", "entry-8", "entry-9"]);
}

#[test]
fn oversized_entry_is_refused_without_eviction() {
    let tmp = tempfile::tempdir().unwrap();
    let limits = CacheLimits::absolute(100);

    assert!(lru_cache_write(&bytes(60), tmp.path(), "small", limits).unwrap());
    assert!(!lru_cache_write(&bytes(101), tmp.path(), "huge", limits).unwrap());

    assert_eq!(entry_names(tmp.path()), vec!["small"]);
}

#[test]
fn evicts_by_access_time_not_creation_time() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = LruDiskCache::new(tmp.path(), CacheLimits::absolute(300));

    for key in ["a", "b", "c"] {
        assert!(cache.write(&bytes(100), key).unwrap());
    }
    // Creation order a, b, c; access order b, c, a.
    let times = [("a", 3_000, 100), ("b", 1_000, 200), ("c", 2_000, 300)];
    for (key, atime, mtime) in times {
        filetime::set_file_times(
            tmp.path().join(key),
            FileTime::from_unix_time(atime, 0),
            FileTime::from_unix_time(mtime, 0),
        )
        .unwrap();
    }

    assert!(cache.write(&bytes(100), "d").unwrap());
    assert_eq!(entry_names(tmp.path()), vec!["a", "c", "d"]);
}

#[test]
fn get_marks_an_entry_as_recently_used() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = LruDiskCache::new(tmp.path(), CacheLimits::absolute(200));

    cache.write(&bytes(100), "a").unwrap();
    cache.write(&bytes(100), "b").unwrap();
    set_atime(&tmp.path().join("a"), 1_000);
    set_atime(&tmp.path().join("b"), 2_000);

    assert_eq!(cache.get("a"), Some(tmp.path().join("a")));
    assert!(cache.write(&bytes(100), "c").unwrap());

    assert_eq!(entry_names(tmp.path()), vec!["a", "c"]);
    assert_eq!(cache.get("b"), None);
}

#[test]
fn replacing_an_entry_does_not_evict_it() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = LruDiskCache::new(tmp.path(), CacheLimits::absolute(100));

    assert!(cache.write(&bytes(80), "a").unwrap());
    assert!(cache.write(&LocalData::InMemory(vec![b'y'; 90]), "a").unwrap());

    assert_eq!(cache.read("a"), Some(vec![b'y'; 90]));
    assert_eq!(cache.total_size().unwrap(), 90);
}

#[test]
fn file_copies_keep_their_timestamps() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("download.bin");
    fs::write(&src, b"payload").unwrap();
    let mtime = FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_times(&src, FileTime::from_unix_time(1_600_000_100, 0), mtime).unwrap();

    let cache = LruDiskCache::new(tmp.path().join("cache"), CacheLimits::unbounded());
    assert!(cache.write(&LocalData::FilePath(src), "key").unwrap());

    let meta = fs::metadata(tmp.path().join("cache").join("key")).unwrap();
    assert_eq!(FileTime::from_last_modification_time(&meta), mtime);
    assert_eq!(cache.read("key"), Some(b"payload".to_vec()));
}

#[test]
fn remove_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = LruDiskCache::new(tmp.path(), CacheLimits::unbounded());
    cache.write(&bytes(1), "a").unwrap();

    assert!(cache.remove("a"));
    assert!(cache.remove("a"));
    assert_eq!(cache.read("a"), None);
}
