//! The meta filesystem: a filesystem stored on top of another one.
//!
//! All metadata (modes, timestamps, directory children, symlink targets)
//! lives in a single key-value file, `metadata.kv`, under the base
//! directory. File contents live next to it in opaque blobs named with
//! monotonic lexicographic ids; moving a file only rewrites metadata keys,
//! the blob never moves.

mod file;

pub use file::MetaFile;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::kv::{KvTx, SingleFileKv};
use crate::snapshot::{FilesystemSnapshot, SnapshotContentCache};
use crate::{
    canonicalize_unchecked, time, DirEntry, FileOpener, FileSystem, FileType, FsError, Interrupt,
    Metadata, OpenOptions, OpenOptionsConfig, ReadDir, Result, VirtualFile, MODE_DIR, MODE_SYMLINK,
};

pub const METAFS_KV_FILENAME: &str = "metadata.kv";
pub const METAFS_FILES_KEY: &str = "/files";

/// Mode bits applied to the underlying content blobs.
const BLOB_MODE: u32 = 0o600;

/// Iterations between two cancellation checks during long walks.
const WALK_CHECK_FUEL: u32 = 10;

/// Serialized form of a file's metadata, as stored in the KV.
///
/// `file-mode`, `creation-time` and `modification-time` are required;
/// directories carry `children`, leaves carry `underlying-file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataRecord {
    #[serde(rename = "file-mode")]
    file_mode: u32,
    #[serde(rename = "creation-time")]
    creation_time: u64,
    #[serde(rename = "modification-time")]
    modification_time: u64,
    #[serde(rename = "underlying-file", skip_serializing_if = "Option::is_none")]
    underlying_file: Option<String>,
    #[serde(rename = "children", skip_serializing_if = "Option::is_none")]
    children: Option<Vec<String>>,
    #[serde(rename = "symlink-target", skip_serializing_if = "Option::is_none")]
    symlink_target: Option<String>,
}

impl MetadataRecord {
    fn is_dir(&self) -> bool {
        self.file_mode & MODE_DIR != 0
    }

    fn is_symlink(&self) -> bool {
        self.file_mode & MODE_SYMLINK != 0
    }

    fn children(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.children.iter().flatten().map(PathBuf::from)
    }

    fn file_type(&self) -> FileType {
        if self.is_dir() {
            FileType::new_dir()
        } else if self.is_symlink() {
            FileType {
                symlink: true,
                ..Default::default()
            }
        } else {
            FileType::new_file()
        }
    }
}

#[derive(Debug)]
pub(crate) struct MetaFsState {
    base_dir: PathBuf,
    metadata: SingleFileKv,
    interrupt: Interrupt,
    next_blob_counter: AtomicU64,
    // Guards compound metadata operations; listings take it in read mode.
    lock: RwLock<()>,
}

/// The meta filesystem. Cloning is cheap, clones share the same store.
#[derive(Debug, Clone)]
pub struct MetaFilesystem {
    state: Arc<MetaFsState>,
}

impl MetaFilesystem {
    /// Opens (or creates) a meta filesystem stored under `base_dir` on the
    /// host. `interrupt` is tripped by the owning context on cancellation;
    /// long metadata walks poll it.
    pub fn open(interrupt: Interrupt, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;

        let metadata = SingleFileKv::open(base_dir.join(METAFS_KV_FILENAME))?;

        let fls = Self {
            state: Arc::new(MetaFsState {
                base_dir,
                metadata,
                interrupt,
                next_blob_counter: AtomicU64::new(0),
                lock: RwLock::new(()),
            }),
        };

        // The root directory gets a regular record so listing `/` works.
        if fls.state.metadata.get(METAFS_FILES_KEY)?.is_none() {
            let now = time();
            fls.set_record(
                Path::new("/"),
                &MetadataRecord {
                    file_mode: MODE_DIR | 0o755,
                    creation_time: now,
                    modification_time: now,
                    underlying_file: None,
                    children: Some(Vec::new()),
                    symlink_target: None,
                },
                None,
            )?;
        }

        Ok(fls)
    }

    pub fn base_dir(&self) -> &Path {
        &self.state.base_dir
    }

    /// The KV key of a path: `"/files" + path`, no trailing slash.
    fn kv_key(path: &Path) -> String {
        let mut key = format!("{METAFS_FILES_KEY}{}", path.display());
        if key.ends_with('/') {
            key.pop();
        }
        key
    }

    /// Host path of the content blob named by a record's `underlying-file`.
    fn blob_path(&self, basename: &str) -> PathBuf {
        self.state.base_dir.join(basename)
    }

    /// Allocates a fresh content-file id. Ids are monotonic and
    /// lexicographically ordered.
    fn next_blob_id(&self) -> String {
        let counter = self.state.next_blob_counter.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}-{:08x}", time(), counter)
    }

    fn get_record(&self, path: &Path, tx: Option<&KvTx<'_>>) -> Result<Option<MetadataRecord>> {
        if !path.is_absolute() {
            return Err(FsError::InvalidInput);
        }

        let key = Self::kv_key(path);
        let raw = match tx {
            Some(tx) => tx.get(&key),
            None => self.state.metadata.get(&key)?,
        };

        match raw {
            Some(value) => {
                let record: MetadataRecord =
                    serde_json::from_value(value).map_err(|_| FsError::InvalidData)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn set_record(
        &self,
        path: &Path,
        record: &MetadataRecord,
        tx: Option<&mut KvTx<'_>>,
    ) -> Result<()> {
        if !path.is_absolute() {
            return Err(FsError::InvalidInput);
        }

        let key = Self::kv_key(path);
        let value = serde_json::to_value(record).map_err(|_| FsError::InvalidData)?;

        match tx {
            Some(tx) => {
                tx.set(&key, value);
                Ok(())
            }
            None => self.state.metadata.set(&key, value),
        }
    }

    fn delete_record(&self, path: &Path, tx: Option<&mut KvTx<'_>>) -> Result<()> {
        let key = Self::kv_key(path);
        match tx {
            Some(tx) => {
                tx.delete(&key);
                Ok(())
            }
            None => self.state.metadata.delete(&key),
        }
    }

    /// Appends `child` to the children of `parent` (which must exist and be
    /// a directory), bumping the parent's modification time.
    fn link_child(&self, parent: &Path, child: &Path, mut tx: Option<&mut KvTx<'_>>) -> Result<()> {
        let mut record = self
            .get_record(parent, tx.as_deref())?
            .ok_or(FsError::NotFound)?;
        if !record.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let child = child.display().to_string();
        let children = record.children.get_or_insert_with(Vec::new);
        if !children.contains(&child) {
            children.push(child);
        }
        record.modification_time = time();

        self.set_record(parent, &record, tx.as_deref_mut())
    }

    /// Removes `child` from the children of `parent`.
    fn unlink_child(
        &self,
        parent: &Path,
        child: &Path,
        mut tx: Option<&mut KvTx<'_>>,
    ) -> Result<()> {
        let mut record = self
            .get_record(parent, tx.as_deref())?
            .ok_or(FsError::NotFound)?;

        let child = child.display().to_string();
        let children = record.children.get_or_insert_with(Vec::new);
        let position = children
            .iter()
            .position(|c| *c == child)
            .ok_or(FsError::UnknownError)?;
        children.remove(position);
        record.modification_time = time();

        self.set_record(parent, &record, tx.as_deref_mut())
    }

    fn mkdir_all_no_lock(&self, path: &Path, mode: u32, tx: Option<&mut KvTx<'_>>) -> Result<()> {
        let path = canonicalize_unchecked(path)?;
        self.mkdir_all_inner(&path, mode, tx)
    }

    fn mkdir_all_inner(
        &self,
        path: &Path,
        mode: u32,
        mut tx: Option<&mut KvTx<'_>>,
    ) -> Result<()> {
        if path == Path::new("/") {
            return Ok(());
        }

        if let Some(existing) = self.get_record(path, tx.as_deref())? {
            if !existing.is_dir() {
                return Err(FsError::NotADirectory);
            }
            return Ok(());
        }

        let parent = path.parent().ok_or(FsError::InvalidInput)?;
        self.mkdir_all_inner(parent, mode, tx.as_deref_mut())?;

        let now = time();
        self.set_record(
            path,
            &MetadataRecord {
                file_mode: mode | MODE_DIR,
                creation_time: now,
                modification_time: now,
                underlying_file: None,
                children: Some(Vec::new()),
                symlink_target: None,
            },
            tx.as_deref_mut(),
        )?;
        self.link_child(parent, path, tx)?;

        trace!(path = %path.display(), "meta-fs directory created");
        Ok(())
    }

    fn stat_no_lock(&self, path: &Path) -> Result<Metadata> {
        let record = self.get_record(path, None)?.ok_or(FsError::NotFound)?;
        self.metadata_from_record(&record)
    }

    fn metadata_from_record(&self, record: &MetadataRecord) -> Result<Metadata> {
        let len = match &record.underlying_file {
            Some(basename) => fs::metadata(self.blob_path(basename))
                .map(|m| m.len())
                .unwrap_or(0),
            None => 0,
        };

        Ok(Metadata {
            ft: record.file_type(),
            mode: record.file_mode,
            created: record.creation_time,
            modified: record.modification_time,
            len,
        })
    }

    /// Collects `(from, to)` moves for every descendant of `from`, by prefix
    /// scan over the metadata keys.
    fn collect_moves(&self, from: &Path, to: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
        let mut moves = vec![(from.to_path_buf(), to.to_path_buf())];

        let scan_prefix = Self::kv_key(from);
        self.state.metadata.for_each_prefix(&scan_prefix, |key, _| {
            let path = &key[METAFS_FILES_KEY.len()..];
            // A raw prefix scan also yields siblings like `/a2` when moving
            // `/a`; only keep true descendants.
            let relative = match path.strip_prefix(&scan_prefix[METAFS_FILES_KEY.len()..]) {
                Some(rest) if rest.starts_with('/') => &rest[1..],
                _ => return true,
            };
            moves.push((PathBuf::from(path), to.join(relative)));
            true
        })?;

        Ok(moves)
    }

    fn rename_sync(&self, from: &Path, to: &Path) -> Result<()> {
        let _guard = self.state.lock.write().map_err(|_| FsError::Lock)?;

        let from = canonicalize_unchecked(from)?;
        let to = canonicalize_unchecked(to)?;

        if self.get_record(&from, None)?.is_none() {
            return Err(FsError::NotFound);
        }
        if self.get_record(&to, None)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let moves = self.collect_moves(&from, &to)?;
        let mut fuel = WALK_CHECK_FUEL;

        self.state.metadata.update(|tx| {
            self.state.interrupt.check()?;

            if let Some(parent) = from.parent() {
                self.unlink_child(parent, &from, Some(&mut *tx))?;
            }

            let to_parent = to.parent().ok_or(FsError::InvalidInput)?;
            self.mkdir_all_inner(to_parent, 0o755, Some(&mut *tx))?;
            self.link_child(to_parent, &to, Some(&mut *tx))?;

            // Rewrite every descendant's metadata key. The content blobs
            // stay put: they are only referenced by basename.
            for (old_path, new_path) in &moves {
                if fuel == 0 {
                    self.state.interrupt.check()?;
                    fuel = WALK_CHECK_FUEL;
                } else {
                    fuel -= 1;
                }

                let record = self
                    .get_record(old_path, Some(&*tx))?
                    .ok_or(FsError::UnknownError)?;
                self.delete_record(old_path, Some(&mut *tx))?;

                let mut record = record;
                if let Some(children) = record.children.as_mut() {
                    for child in children.iter_mut() {
                        let child_path = Path::new(child.as_str());
                        if let Ok(rest) = child_path.strip_prefix(&from) {
                            *child = to.join(rest).display().to_string();
                        }
                    }
                }

                self.set_record(new_path, &record, Some(&mut *tx))?;
            }

            Ok(())
        })?;

        debug!(from = %from.display(), to = %to.display(), moved = moves.len(), "meta-fs rename");
        Ok(())
    }

    fn remove_sync(&self, path: &Path) -> Result<()> {
        let _guard = self.state.lock.write().map_err(|_| FsError::Lock)?;

        let path = canonicalize_unchecked(path)?;
        if path == Path::new("/") {
            return Err(FsError::InvalidInput);
        }

        let metadata = self.get_record(&path, None)?.ok_or(FsError::NotFound)?;

        let mut fuel = WALK_CHECK_FUEL;
        let mut orphaned_blobs = Vec::new();

        self.state.metadata.update(|tx| {
            self.state.interrupt.check()?;

            if let Some(parent) = path.parent() {
                self.unlink_child(parent, &path, Some(&mut *tx))?;
            }

            self.delete_record(&path, Some(&mut *tx))?;
            if let Some(basename) = &metadata.underlying_file {
                orphaned_blobs.push(self.blob_path(basename));
            }

            if !metadata.is_dir() {
                return Ok(());
            }

            // Depth-first walk over descendants with an explicit work stack.
            let mut queue: Vec<PathBuf> = metadata.children().collect();
            while let Some(current) = queue.pop() {
                if fuel == 0 {
                    self.state.interrupt.check()?;
                    fuel = WALK_CHECK_FUEL;
                } else {
                    fuel -= 1;
                }

                let current_record = match self.get_record(&current, Some(&*tx))? {
                    Some(record) => record,
                    // The metadata should exist, continue anyway.
                    None => continue,
                };

                if current_record.is_dir() {
                    queue.extend(current_record.children());
                }
                if let Some(basename) = &current_record.underlying_file {
                    orphaned_blobs.push(self.blob_path(basename));
                }

                self.delete_record(&current, Some(&mut *tx))?;
            }

            Ok(())
        })?;

        for blob in orphaned_blobs {
            if let Err(err) = fs::remove_file(&blob) {
                debug!(blob = %blob.display(), %err, "failed to remove content blob");
            }
        }

        debug!(path = %path.display(), "meta-fs remove");
        Ok(())
    }

    /// Refreshes a leaf's modification time; called by [`MetaFile`] when
    /// written contents are flushed.
    pub(crate) fn touch(state: &MetaFsState, path: &Path, modified: u64) {
        let _guard = match state.lock.write() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let key = Self::kv_key(path);
        let _ = state.metadata.update(|tx| {
            if let Some(mut value) = tx.get(&key) {
                if let Some(object) = value.as_object_mut() {
                    object.insert("modification-time".into(), modified.into());
                }
                tx.set(&key, value);
            }
            Ok(())
        });
    }
}

impl FileSystem for MetaFilesystem {
    fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        let _guard = self.state.lock.read().map_err(|_| FsError::Lock)?;

        let path = canonicalize_unchecked(path)?;
        let record = self.get_record(&path, None)?.ok_or(FsError::NotFound)?;
        if !record.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let mut entries = Vec::new();
        for child in record.children() {
            entries.push(DirEntry {
                metadata: self.stat_no_lock(&child),
                path: child,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(ReadDir::new(entries))
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<()> {
        let _guard = self.state.lock.write().map_err(|_| FsError::Lock)?;
        self.mkdir_all_no_lock(path, mode, None)
    }

    fn rename<'a>(&'a self, from: &'a Path, to: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { self.rename_sync(from, to) })
    }

    fn metadata(&self, path: &Path) -> Result<Metadata> {
        let _guard = self.state.lock.read().map_err(|_| FsError::Lock)?;
        self.stat_no_lock(&canonicalize_unchecked(path)?)
    }

    fn symlink_metadata(&self, path: &Path) -> Result<Metadata> {
        let _guard = self.state.lock.read().map_err(|_| FsError::Lock)?;

        let path = canonicalize_unchecked(path)?;
        let record = self.get_record(&path, None)?.ok_or(FsError::NotFound)?;
        if record.is_symlink() {
            // Symlinks exist in the metadata format but are not implemented.
            return Err(FsError::Unsupported);
        }
        self.stat_no_lock(&path)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.remove_sync(path)
    }

    fn new_open_options(&self) -> OpenOptions {
        OpenOptions::new(self)
    }

    fn take_snapshot(&self, cache: &SnapshotContentCache<'_>) -> Result<FilesystemSnapshot> {
        let _guard = self.state.lock.read().map_err(|_| FsError::Lock)?;

        let mut records = BTreeMap::new();
        let mut scan_error = None;
        self.state.metadata.for_each_prefix(METAFS_FILES_KEY, |key, value| {
            let path = if key == METAFS_FILES_KEY {
                PathBuf::from("/")
            } else {
                PathBuf::from(&key[METAFS_FILES_KEY.len()..])
            };
            match serde_json::from_value::<MetadataRecord>(value.clone()) {
                Ok(record) => {
                    records.insert(path, record);
                    true
                }
                Err(_) => {
                    scan_error = Some(FsError::InvalidData);
                    false
                }
            }
        })?;
        if let Some(err) = scan_error {
            return Err(err);
        }

        let mut builder = FilesystemSnapshot::builder();
        for (path, record) in records {
            let metadata = self.metadata_from_record(&record)?;
            match &record.underlying_file {
                Some(basename) => {
                    let content = fs::read(self.blob_path(basename))?;
                    builder.add_file(path, metadata, content.into(), cache);
                }
                None => builder.add_dir(path, metadata),
            }
        }

        Ok(builder.build())
    }
}

impl FileOpener for MetaFilesystem {
    fn open(
        &self,
        path: &Path,
        conf: &OpenOptionsConfig,
    ) -> Result<Box<dyn VirtualFile + Send + Sync + 'static>> {
        let _guard = self.state.lock.write().map_err(|_| FsError::Lock)?;

        let path = canonicalize_unchecked(path)?;
        let existing = self.get_record(&path, None)?;

        let record = match existing {
            None => {
                if !(conf.create() || conf.create_new()) {
                    return Err(FsError::NotFound);
                }

                let parent = path.parent().ok_or(FsError::InvalidInput)?;
                self.mkdir_all_no_lock(parent, 0o755, None)?;

                let now = time();
                let record = MetadataRecord {
                    file_mode: conf.mode & !MODE_DIR,
                    creation_time: now,
                    modification_time: now,
                    underlying_file: Some(self.next_blob_id()),
                    children: None,
                    symlink_target: None,
                };
                self.set_record(&path, &record, None)?;
                self.link_child(parent, &path, None)?;

                trace!(path = %path.display(), "meta-fs file created");
                record
            }
            Some(record) => {
                if record.is_symlink() {
                    return Err(FsError::Unsupported);
                }
                if conf.create_new() {
                    return Err(FsError::AlreadyExists);
                }
                if record.is_dir() {
                    return Err(FsError::IsADirectory);
                }
                record
            }
        };

        let basename = record.underlying_file.as_ref().ok_or(FsError::UnknownError)?;
        let blob = self.blob_path(basename);

        let mut options = fs::OpenOptions::new();
        options
            .read(conf.read())
            .write(conf.write() || conf.truncate() || conf.create() || conf.create_new())
            .append(conf.append())
            .truncate(conf.truncate())
            // The metadata decides existence; the blob itself is created
            // lazily on any mutating open.
            .create(conf.would_mutate());
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(BLOB_MODE);
        }

        // Do not leak details about the backing store on failure.
        let file = options.open(&blob).map_err(|_| FsError::IOError)?;

        Ok(Box::new(MetaFile::new(
            self.state.clone(),
            path,
            file,
            record.creation_time,
            record.modification_time,
        )?))
    }
}

#[cfg(test)]
mod tests;
