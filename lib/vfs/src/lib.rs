#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Virtual filesystem layer of the rill runtime.
//!
//! The interesting implementation is the [`meta_fs::MetaFilesystem`]: a
//! filesystem stored *on top of* another filesystem, with all file metadata
//! kept in a single key-value file and file contents kept in opaque blobs.

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub mod host_fs;
pub mod kv;
pub mod meta_fs;
pub mod snapshot;

pub use kv::SingleFileKv;
pub use meta_fs::MetaFilesystem;
pub use snapshot::{Checksum, FilesystemSnapshot, SnapshotContentCache};

pub type Result<T> = std::result::Result<T, FsError>;

// re-exports
pub use tokio::io::{AsyncRead, AsyncReadExt};
pub use tokio::io::{AsyncSeek, AsyncSeekExt};
pub use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Mode bit marking a directory entry, mirroring `S_IFDIR`.
pub const MODE_DIR: u32 = 0o0040000;
/// Mode bit marking a symbolic link, mirroring `S_IFLNK`.
pub const MODE_SYMLINK: u32 = 0o0120000;

pub trait FileSystem: fmt::Debug + Send + Sync + 'static + Upcastable {
    fn read_dir(&self, path: &Path) -> Result<ReadDir>;

    /// Creates the directory at `path` along with every missing ancestor.
    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<()>;

    /// Moves the entry at `from` (and, for directories, its whole subtree)
    /// to `to`.
    fn rename<'a>(&'a self, from: &'a Path, to: &'a Path) -> BoxFuture<'a, Result<()>>;

    fn metadata(&self, path: &Path) -> Result<Metadata>;

    /// This method gets metadata without following a symlink at the final
    /// path component.
    fn symlink_metadata(&self, path: &Path) -> Result<Metadata> {
        self.metadata(path)
    }

    /// Removes the entry at `path`; directories are removed recursively.
    fn remove(&self, path: &Path) -> Result<()>;

    fn new_open_options(&self) -> OpenOptions;

    /// Resolves `path` to an absolute path.
    fn absolute(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Err(FsError::InvalidInput)
        }
    }

    fn join(&self, base: &Path, elem: &Path) -> PathBuf {
        base.join(elem)
    }

    /// Takes an immutable point-in-time snapshot of the whole tree.
    ///
    /// `cache` may hand back a previously captured content for a checksum so
    /// identical blobs are shared across snapshots.
    fn take_snapshot(&self, _cache: &SnapshotContentCache<'_>) -> Result<FilesystemSnapshot> {
        Err(FsError::Unsupported)
    }
}

impl dyn FileSystem + 'static {
    #[inline]
    pub fn downcast_ref<T: 'static>(&'_ self) -> Option<&'_ T> {
        self.upcast_any_ref().downcast_ref::<T>()
    }
}

#[async_trait::async_trait]
impl<D, F> FileSystem for D
where
    D: std::ops::Deref<Target = F> + std::fmt::Debug + Send + Sync + 'static,
    F: FileSystem + ?Sized,
{
    fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        (**self).read_dir(path)
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<()> {
        (**self).mkdir_all(path, mode)
    }

    fn rename<'a>(&'a self, from: &'a Path, to: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { (**self).rename(from, to).await })
    }

    fn metadata(&self, path: &Path) -> Result<Metadata> {
        (**self).metadata(path)
    }

    fn symlink_metadata(&self, path: &Path) -> Result<Metadata> {
        (**self).symlink_metadata(path)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        (**self).remove(path)
    }

    fn new_open_options(&self) -> OpenOptions {
        (**self).new_open_options()
    }

    fn absolute(&self, path: &Path) -> Result<PathBuf> {
        (**self).absolute(path)
    }

    fn take_snapshot(&self, cache: &SnapshotContentCache<'_>) -> Result<FilesystemSnapshot> {
        (**self).take_snapshot(cache)
    }
}

pub trait FileOpener {
    fn open(
        &self,
        path: &Path,
        conf: &OpenOptionsConfig,
    ) -> Result<Box<dyn VirtualFile + Send + Sync + 'static>>;
}

#[derive(Debug, Clone)]
pub struct OpenOptionsConfig {
    pub read: bool,
    pub write: bool,
    pub create_new: bool,
    pub create: bool,
    pub append: bool,
    pub truncate: bool,
    pub mode: u32,
}

impl OpenOptionsConfig {
    pub const fn read(&self) -> bool {
        self.read
    }

    pub const fn write(&self) -> bool {
        self.write
    }

    pub const fn create_new(&self) -> bool {
        self.create_new
    }

    pub const fn create(&self) -> bool {
        self.create
    }

    pub const fn append(&self) -> bool {
        self.append
    }

    pub const fn truncate(&self) -> bool {
        self.truncate
    }

    /// Would a file opened with this [`OpenOptionsConfig`] change files on
    /// the filesystem.
    pub const fn would_mutate(&self) -> bool {
        let OpenOptionsConfig {
            read: _,
            write,
            create_new,
            create,
            append,
            truncate,
            mode: _,
        } = *self;
        append || write || create || create_new || truncate
    }
}

pub struct OpenOptions<'a> {
    opener: &'a dyn FileOpener,
    conf: OpenOptionsConfig,
}

impl<'a> fmt::Debug for OpenOptions<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.conf.fmt(f)
    }
}

impl<'a> OpenOptions<'a> {
    pub fn new(opener: &'a dyn FileOpener) -> Self {
        Self {
            opener,
            conf: OpenOptionsConfig {
                read: false,
                write: false,
                create_new: false,
                create: false,
                append: false,
                truncate: false,
                mode: 0o644,
            },
        }
    }

    pub fn get_config(&self) -> OpenOptionsConfig {
        self.conf.clone()
    }

    /// Use an existing [`OpenOptionsConfig`] to configure this [`OpenOptions`].
    pub fn options(&mut self, options: OpenOptionsConfig) -> &mut Self {
        self.conf = options;
        self
    }

    /// Sets the option for read access.
    pub fn read(&mut self, read: bool) -> &mut Self {
        self.conf.read = read;
        self
    }

    /// Sets the option for write access.
    pub fn write(&mut self, write: bool) -> &mut Self {
        self.conf.write = write;
        self
    }

    /// Sets the option for the append mode.
    ///
    /// Note that setting `.write(true).append(true)` has the same effect as
    /// setting only `.append(true)`.
    pub fn append(&mut self, append: bool) -> &mut Self {
        self.conf.append = append;
        self
    }

    /// Sets the option for truncating a previous file.
    ///
    /// The file must be opened with write access for truncate to work.
    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.conf.truncate = truncate;
        self
    }

    /// Sets the option to create a new file, or open it if it already exists.
    pub fn create(&mut self, create: bool) -> &mut Self {
        self.conf.create = create;
        self
    }

    /// Sets the option to create a new file, failing if it already exists.
    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.conf.create_new = create_new;
        self
    }

    /// Sets the mode bits a created file receives.
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.conf.mode = mode;
        self
    }

    pub fn open<P: AsRef<Path>>(
        &mut self,
        path: P,
    ) -> Result<Box<dyn VirtualFile + Send + Sync + 'static>> {
        self.opener.open(path.as_ref(), &self.conf)
    }
}

/// This trait relies on your file closing when it goes out of scope via `Drop`.
pub trait VirtualFile:
    fmt::Debug + AsyncRead + AsyncWrite + AsyncSeek + Unpin + Upcastable + Send
{
    /// the time at which the file was created in nanoseconds as a UNIX timestamp
    fn created_time(&self) -> u64;

    /// the last time the file was modified in nanoseconds as a UNIX timestamp
    fn last_modified(&self) -> u64;

    /// the size of the file in bytes
    fn size(&self) -> u64;

    /// Change the size of the file, if the `new_size` is greater than the
    /// current size the extra bytes will be allocated and zeroed.
    fn set_len(&mut self, new_size: u64) -> Result<()>;
}

// Implementation of `Upcastable` taken from https://users.rust-lang.org/t/why-does-downcasting-not-work-for-subtraits/33286/7 .
/// Trait needed to get downcasting from `VirtualFile` to work.
pub trait Upcastable {
    fn upcast_any_ref(&'_ self) -> &'_ dyn Any;
    fn upcast_any_mut(&'_ mut self) -> &'_ mut dyn Any;
    fn upcast_any_box(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any + fmt::Debug + 'static> Upcastable for T {
    #[inline]
    fn upcast_any_ref(&'_ self) -> &'_ dyn Any {
        self
    }
    #[inline]
    fn upcast_any_mut(&'_ mut self) -> &'_ mut dyn Any {
        self
    }
    #[inline]
    fn upcast_any_box(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Error type for external users
#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum FsError {
    /// The requested file or directory could not be found
    #[error("entry not found")]
    NotFound,
    /// File exists
    #[error("entry already exists")]
    AlreadyExists,
    /// Expected a file but found a directory
    #[error("is a directory")]
    IsADirectory,
    /// Expected a directory but found a file
    #[error("not a directory")]
    NotADirectory,
    /// Caller was not allowed to perform this operation
    #[error("permission denied")]
    PermissionDenied,
    /// The provided path or flags are invalid
    #[error("invalid input")]
    InvalidInput,
    /// Stored metadata could not be decoded
    #[error("invalid metadata record")]
    InvalidData,
    /// The filesystem has failed to lock a resource.
    #[error("lock error")]
    Lock,
    /// A cooperative walk was interrupted by context cancellation
    #[error("operation interrupted")]
    Interrupted,
    /// The operation is recognized in the format but not implemented
    #[error("operation not supported")]
    Unsupported,
    /// Something failed when doing IO. These errors can generally not be
    /// handled. It may work if tried again.
    #[error("io error")]
    IOError,
    /// Some other unhandled error. If you see this, it's probably a bug.
    #[error("unknown error found")]
    UnknownError,
}

impl From<io::Error> for FsError {
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
            io::ErrorKind::NotFound => FsError::NotFound,
            io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
            io::ErrorKind::InvalidInput => FsError::InvalidInput,
            io::ErrorKind::InvalidData => FsError::InvalidData,
            io::ErrorKind::Interrupted => FsError::Interrupted,
            io::ErrorKind::Unsupported => FsError::Unsupported,
            io::ErrorKind::Other => FsError::IOError,
            _ => FsError::UnknownError,
        }
    }
}

impl From<FsError> for io::Error {
    fn from(val: FsError) -> Self {
        let kind = match val {
            FsError::NotFound => io::ErrorKind::NotFound,
            FsError::AlreadyExists => io::ErrorKind::AlreadyExists,
            FsError::PermissionDenied => io::ErrorKind::PermissionDenied,
            FsError::InvalidInput => io::ErrorKind::InvalidInput,
            FsError::InvalidData => io::ErrorKind::InvalidData,
            FsError::Interrupted => io::ErrorKind::Interrupted,
            FsError::Unsupported => io::ErrorKind::Unsupported,
            FsError::IsADirectory
            | FsError::NotADirectory
            | FsError::Lock
            | FsError::IOError
            | FsError::UnknownError => io::ErrorKind::Other,
        };
        kind.into()
    }
}

/// Cancellation handle handed to long filesystem walks (rename, remove).
///
/// The runtime core trips the flag when the owning context is cancelled;
/// walks check it every few iterations and bail out with
/// [`FsError::Interrupted`].
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that can never fire, for filesystems used outside a context.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_tripped() {
            Err(FsError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
pub struct ReadDir {
    data: Vec<DirEntry>,
    index: usize,
}

impl ReadDir {
    pub fn new(data: Vec<DirEntry>) -> Self {
        Self { data, index: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

impl Iterator for ReadDir {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Result<DirEntry>> {
        if let Some(v) = self.data.get(self.index).cloned() {
            self.index += 1;
            return Some(Ok(v));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: PathBuf,
    pub metadata: Result<Metadata>,
}

impl DirEntry {
    pub fn path(&self) -> PathBuf {
        self.path.clone()
    }

    pub fn metadata(&self) -> Result<Metadata> {
        self.metadata.clone()
    }

    pub fn file_type(&self) -> Result<FileType> {
        let metadata = self.metadata.clone()?;
        Ok(metadata.file_type())
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

#[allow(clippy::len_without_is_empty)] // Clippy thinks it's an iterator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub ft: FileType,
    /// POSIX-style mode bits, including the directory/symlink type bits.
    pub mode: u32,
    pub created: u64,
    pub modified: u64,
    pub len: u64,
}

impl Metadata {
    pub fn is_file(&self) -> bool {
        self.ft.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.ft.is_dir()
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn modified(&self) -> u64 {
        self.modified
    }

    pub fn file_type(&self) -> FileType {
        self.ft.clone()
    }

    pub fn len(&self) -> u64 {
        self.len
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileType {
    pub dir: bool,
    pub file: bool,
    pub symlink: bool,
}

impl FileType {
    pub fn new_dir() -> Self {
        Self {
            dir: true,
            ..Default::default()
        }
    }

    pub fn new_file() -> Self {
        Self {
            file: true,
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.dir
    }
    pub fn is_file(&self) -> bool {
        self.file
    }
    pub fn is_symlink(&self) -> bool {
        self.symlink
    }
}

/// Normalize a path to a canonical absolute form without consulting any
/// filesystem:
///
/// * A path must start with a root (`/`),
/// * A path can contain `..` or `.` components,
/// * A path must not contain a Windows prefix (`C:` or `\\server`).
pub fn canonicalize_unchecked(path: &Path) -> Result<PathBuf> {
    let mut components = path.components();

    match components.next() {
        Some(Component::RootDir) => {}
        _ => return Err(FsError::InvalidInput),
    }

    let mut new_path = PathBuf::with_capacity(path.as_os_str().len());
    new_path.push("/");

    for component in components {
        match component {
            // That's an error to get a `RootDir` a second time.
            Component::RootDir => return Err(FsError::UnknownError),
            Component::CurDir => (),
            Component::ParentDir => {
                if !new_path.pop() {
                    return Err(FsError::InvalidInput);
                }
            }
            Component::Normal(name) => {
                new_path.push(name);
            }
            // We don't support Windows path prefixes.
            Component::Prefix(_) => return Err(FsError::InvalidInput),
        }
    }

    Ok(new_path)
}

/// Current time in nanoseconds as a UNIX timestamp.
pub(crate) fn time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_unchecked() {
        assert_eq!(
            canonicalize_unchecked(Path::new("/a/b/../c/./d")),
            Ok(PathBuf::from("/a/c/d")),
        );
        assert_eq!(
            canonicalize_unchecked(Path::new("relative/path")),
            Err(FsError::InvalidInput),
        );
        assert_eq!(
            canonicalize_unchecked(Path::new("/..")),
            Err(FsError::InvalidInput),
        );
    }

    #[test]
    fn test_interrupt_handle() {
        let interrupt = Interrupt::new();
        assert_eq!(interrupt.check(), Ok(()));

        let clone = interrupt.clone();
        clone.trip();

        assert!(interrupt.is_tripped());
        assert_eq!(interrupt.check(), Err(FsError::Interrupted));
    }
}
