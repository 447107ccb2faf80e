use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::*;
use crate::snapshot::no_content_cache;
use crate::{FileSystem as _, FsError, Interrupt};

fn open_fs(dir: &tempfile::TempDir) -> MetaFilesystem {
    MetaFilesystem::open(Interrupt::never(), dir.path().join("fs")).unwrap()
}

async fn write_file(fls: &MetaFilesystem, path: &str, content: &[u8]) {
    let mut file = fls
        .new_open_options()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .unwrap();
    file.write_all(content).await.unwrap();
    file.flush().await.unwrap();
}

async fn read_file(fls: &MetaFilesystem, path: &str) -> Vec<u8> {
    let mut file = fls.new_open_options().read(true).open(path).unwrap();
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).await.unwrap();
    contents
}

#[tokio::test]
async fn create_write_stat_read() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    write_file(&fls, "/a/b/c.txt", b"hello").await;

    let metadata = fls.metadata(Path::new("/a/b/c.txt")).unwrap();
    assert!(metadata.is_file());
    assert_eq!(metadata.len(), 5);

    let parent = fls.metadata(Path::new("/a/b")).unwrap();
    assert!(parent.is_dir());
    assert_eq!(parent.len(), 0);

    assert_eq!(read_file(&fls, "/a/b/c.txt").await, b"hello");
}

#[tokio::test]
async fn metadata_is_stored_under_the_files_key_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    write_file(&fls, "/a/b.txt", b"x").await;

    let kv = SingleFileKv::open(dir.path().join("fs").join(METAFS_KV_FILENAME)).unwrap();
    let record = kv.get("/files/a/b.txt").unwrap().expect("record must exist");

    // the three required fields plus the content pointer
    assert!(record.get("file-mode").is_some());
    assert!(record.get("creation-time").is_some());
    assert!(record.get("modification-time").is_some());
    assert!(record.get("underlying-file").is_some());
    assert!(record.get("children").is_none());

    // directory entries carry children and no content pointer
    let dir_record = kv.get("/files/a").unwrap().expect("record must exist");
    assert_eq!(
        dir_record.get("children").unwrap(),
        &serde_json::json!(["/a/b.txt"]),
    );
    assert!(dir_record.get("underlying-file").is_none());
}

#[tokio::test]
async fn opening_a_missing_file_without_create_fails() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    let err = fls
        .new_open_options()
        .read(true)
        .open("/nope.txt")
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err, FsError::NotFound);
}

#[tokio::test]
async fn exclusive_create_over_an_existing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    write_file(&fls, "/f.txt", b"x").await;

    let err = fls
        .new_open_options()
        .write(true)
        .create_new(true)
        .open("/f.txt")
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err, FsError::AlreadyExists);
}

#[tokio::test]
async fn opening_a_directory_as_a_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    fls.mkdir_all(Path::new("/d"), 0o755).unwrap();

    let err = fls
        .new_open_options()
        .read(true)
        .open("/d")
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err, FsError::IsADirectory);
}

#[tokio::test]
async fn read_dir_lists_children_sorted_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    write_file(&fls, "/d/c.txt", b"3").await;
    write_file(&fls, "/d/a.txt", b"1").await;
    fls.mkdir_all(Path::new("/d/b"), 0o755).unwrap();

    let names: Vec<_> = fls
        .read_dir(Path::new("/d"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names, vec!["a.txt", "b", "c.txt"]);

    let err = fls.read_dir(Path::new("/d/a.txt")).map(|_| ()).unwrap_err();
    assert_eq!(err, FsError::NotADirectory);
}

#[tokio::test]
async fn rename_moves_a_whole_subtree() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    write_file(&fls, "/a/b/c.txt", b"x").await;
    let before = fls.metadata(Path::new("/a/b/c.txt")).unwrap();

    fls.rename(Path::new("/a"), Path::new("/a2")).await.unwrap();

    let after = fls.metadata(Path::new("/a2/b/c.txt")).unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after.created, before.created);
    assert_eq!(after.modified, before.modified);

    assert_eq!(
        fls.metadata(Path::new("/a/b/c.txt")),
        Err(FsError::NotFound),
    );
    assert_eq!(fls.metadata(Path::new("/a")), Err(FsError::NotFound));

    assert_eq!(read_file(&fls, "/a2/b/c.txt").await, b"x");

    // the moved directory is listed under its new parent
    let root_entries: Vec<_> = fls
        .read_dir(Path::new("/"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(root_entries, vec!["a2"]);
}

#[tokio::test]
async fn rename_does_not_touch_sibling_paths_sharing_a_name_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    write_file(&fls, "/a/f.txt", b"1").await;
    write_file(&fls, "/ab/g.txt", b"2").await;

    fls.rename(Path::new("/a"), Path::new("/z")).await.unwrap();

    assert!(fls.metadata(Path::new("/ab/g.txt")).unwrap().is_file());
    assert!(fls.metadata(Path::new("/z/f.txt")).unwrap().is_file());
    assert_eq!(fls.metadata(Path::new("/z/g.txt")), Err(FsError::NotFound));
}

#[tokio::test]
async fn rename_back_and_forth_restores_the_previous_state() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    write_file(&fls, "/a/b/c.txt", b"x").await;
    let before = fls.take_snapshot(&no_content_cache).unwrap();

    fls.rename(Path::new("/a"), Path::new("/b")).await.unwrap();
    fls.rename(Path::new("/b"), Path::new("/a")).await.unwrap();

    let after = fls.take_snapshot(&no_content_cache).unwrap();
    assert_eq!(
        before.metadata().keys().collect::<Vec<_>>(),
        after.metadata().keys().collect::<Vec<_>>(),
    );
    assert_eq!(
        before.checksum_of(Path::new("/a/b/c.txt")),
        after.checksum_of(Path::new("/a/b/c.txt")),
    );
}

#[tokio::test]
async fn rename_rejects_a_missing_source_and_an_existing_destination() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    write_file(&fls, "/a.txt", b"1").await;
    write_file(&fls, "/b.txt", b"2").await;

    assert_eq!(
        fls.rename(Path::new("/nope"), Path::new("/c")).await,
        Err(FsError::NotFound),
    );
    assert_eq!(
        fls.rename(Path::new("/a.txt"), Path::new("/b.txt")).await,
        Err(FsError::AlreadyExists),
    );
}

#[tokio::test]
async fn remove_deletes_directories_recursively() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    write_file(&fls, "/a/b/c.txt", b"x").await;
    write_file(&fls, "/a/d.txt", b"y").await;
    write_file(&fls, "/keep.txt", b"z").await;

    fls.remove(Path::new("/a")).unwrap();

    assert_eq!(fls.metadata(Path::new("/a")), Err(FsError::NotFound));
    assert_eq!(
        fls.metadata(Path::new("/a/b/c.txt")),
        Err(FsError::NotFound),
    );
    assert!(fls.metadata(Path::new("/keep.txt")).unwrap().is_file());

    // content blobs of removed files are gone: only keep.txt's blob and
    // the metadata.kv file remain in the base directory
    let remaining = std::fs::read_dir(fls.base_dir()).unwrap().count();
    assert_eq!(remaining, 2);
}

#[tokio::test]
async fn remove_of_a_missing_entry_fails() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    assert_eq!(fls.remove(Path::new("/nope")), Err(FsError::NotFound));
}

#[tokio::test]
async fn reopening_the_store_preserves_the_tree() {
    let dir = tempfile::tempdir().unwrap();

    {
        let fls = open_fs(&dir);
        write_file(&fls, "/a/b.txt", b"persisted").await;
    }

    let fls = open_fs(&dir);
    assert_eq!(read_file(&fls, "/a/b.txt").await, b"persisted");
    assert!(fls.metadata(Path::new("/a")).unwrap().is_dir());
}

#[tokio::test]
async fn back_to_back_snapshots_are_identical() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    write_file(&fls, "/a/b/c.txt", b"x").await;
    write_file(&fls, "/a/d.txt", b"yy").await;

    let first = fls.take_snapshot(&no_content_cache).unwrap();
    let second = fls.take_snapshot(&no_content_cache).unwrap();

    assert_eq!(first.metadata(), second.metadata());
    for (path, _) in first.metadata() {
        assert_eq!(first.checksum_of(path), second.checksum_of(path));
    }
}

#[tokio::test]
async fn snapshots_share_content_through_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    write_file(&fls, "/a.txt", b"shared").await;

    let first = fls.take_snapshot(&no_content_cache).unwrap();
    let cache = |checksum: &crate::Checksum| first.contents().get(checksum).cloned();
    let second = fls.take_snapshot(&cache).unwrap();

    let a = first.content_of(Path::new("/a.txt")).unwrap();
    let b = second.content_of(Path::new("/a.txt")).unwrap();
    assert_eq!(a.as_ptr(), b.as_ptr());
}

#[tokio::test]
async fn the_trait_object_downcasts_to_the_concrete_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let fls = open_fs(&dir);

    let dyn_fs: std::sync::Arc<dyn crate::FileSystem> = std::sync::Arc::new(fls);
    assert!((*dyn_fs).downcast_ref::<MetaFilesystem>().is_some());
    assert!((*dyn_fs)
        .downcast_ref::<crate::host_fs::HostFileSystem>()
        .is_none());
}

#[tokio::test]
async fn a_tripped_interrupt_aborts_structural_walks() {
    let dir = tempfile::tempdir().unwrap();
    let interrupt = Interrupt::new();
    let fls = MetaFilesystem::open(interrupt.clone(), dir.path().join("fs")).unwrap();

    write_file(&fls, "/a/b.txt", b"x").await;
    interrupt.trip();

    assert_eq!(
        fls.rename(Path::new("/a"), Path::new("/b")).await,
        Err(FsError::Interrupted),
    );
    assert_eq!(fls.remove(Path::new("/a")), Err(FsError::Interrupted));

    // nothing was changed
    let untouched = MetaFilesystem::open(Interrupt::never(), dir.path().join("fs")).unwrap();
    assert!(untouched.metadata(Path::new("/a/b.txt")).unwrap().is_file());
}
