//! Filesystem trait implementation backed by the host OS, rooted at a base
//! directory. Virtual absolute paths (`/a/b`) are resolved under the root.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::{
    canonicalize_unchecked, time, DirEntry, FileOpener, FileSystem, FileType, FsError, Metadata,
    OpenOptions, OpenOptionsConfig, ReadDir, Result, VirtualFile,
};

#[derive(Debug, Clone)]
pub struct HostFileSystem {
    root: PathBuf,
}

impl HostFileSystem {
    /// Creates the filesystem rooted at `root`, creating the directory if
    /// needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a virtual absolute path onto the host path under the root.
    fn host_path(&self, path: &Path) -> Result<PathBuf> {
        let canonical = canonicalize_unchecked(path)?;
        let relative = canonical.strip_prefix("/").map_err(|_| FsError::InvalidInput)?;
        Ok(self.root.join(relative))
    }
}

fn metadata_from_host(host: &fs::Metadata) -> Metadata {
    let ft = if host.is_dir() {
        FileType::new_dir()
    } else if host.file_type().is_symlink() {
        FileType {
            symlink: true,
            ..Default::default()
        }
    } else {
        FileType::new_file()
    };

    let to_nanos = |time: io::Result<std::time::SystemTime>| {
        time.ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    };

    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        host.permissions().mode()
    };
    #[cfg(not(unix))]
    let mode = if host.is_dir() {
        crate::MODE_DIR | 0o755
    } else {
        0o644
    };

    Metadata {
        ft,
        mode,
        created: to_nanos(host.created()),
        modified: to_nanos(host.modified()),
        len: if host.is_dir() { 0 } else { host.len() },
    }
}

impl FileSystem for HostFileSystem {
    fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        let canonical = canonicalize_unchecked(path)?;
        let host_dir = self.host_path(path)?;

        let mut entries = Vec::new();
        for entry in fs::read_dir(host_dir)? {
            let entry = entry?;
            let metadata = entry.metadata().map(|m| metadata_from_host(&m));
            entries.push(DirEntry {
                path: canonical.join(entry.file_name()),
                metadata: metadata.map_err(Into::into),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(ReadDir::new(entries))
    }

    fn mkdir_all(&self, path: &Path, _mode: u32) -> Result<()> {
        fs::create_dir_all(self.host_path(path)?)?;
        Ok(())
    }

    fn rename<'a>(&'a self, from: &'a Path, to: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async {
            let from_host = self.host_path(from)?;
            let to_host = self.host_path(to)?;
            trace!(from = %from.display(), to = %to.display(), "host-fs rename");
            tokio::fs::rename(from_host, to_host).await?;
            Ok(())
        })
    }

    fn metadata(&self, path: &Path) -> Result<Metadata> {
        let host = fs::metadata(self.host_path(path)?)?;
        Ok(metadata_from_host(&host))
    }

    fn symlink_metadata(&self, path: &Path) -> Result<Metadata> {
        let host = fs::symlink_metadata(self.host_path(path)?)?;
        Ok(metadata_from_host(&host))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let host = self.host_path(path)?;
        let metadata = fs::metadata(&host)?;
        if metadata.is_dir() {
            fs::remove_dir_all(host)?;
        } else {
            fs::remove_file(host)?;
        }
        Ok(())
    }

    fn new_open_options(&self) -> OpenOptions {
        OpenOptions::new(self)
    }
}

impl FileOpener for HostFileSystem {
    fn open(
        &self,
        path: &Path,
        conf: &OpenOptionsConfig,
    ) -> Result<Box<dyn VirtualFile + Send + Sync + 'static>> {
        let host = self.host_path(path)?;

        if let Some(parent) = host.parent() {
            if conf.create() || conf.create_new() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = fs::OpenOptions::new()
            .read(conf.read())
            .write(conf.write())
            .create(conf.create())
            .create_new(conf.create_new())
            .append(conf.append())
            .truncate(conf.truncate())
            .open(&host)?;

        if file.metadata()?.is_dir() {
            return Err(FsError::IsADirectory);
        }

        Ok(Box::new(HostFile::new(file)?))
    }
}

/// An open host file exposed through the async [`VirtualFile`] interface.
#[derive(Debug)]
pub struct HostFile {
    handle: tokio::fs::File,
    sync: fs::File,
    created: u64,
    modified: u64,
}

impl HostFile {
    fn new(file: fs::File) -> Result<Self> {
        let sync = file.try_clone()?;
        let metadata = file.metadata()?;
        let to_nanos = |t: io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_else(time)
        };
        Ok(Self {
            handle: tokio::fs::File::from_std(file),
            sync,
            created: to_nanos(metadata.created()),
            modified: to_nanos(metadata.modified()),
        })
    }
}

impl VirtualFile for HostFile {
    fn created_time(&self) -> u64 {
        self.created
    }

    fn last_modified(&self) -> u64 {
        self.modified
    }

    fn size(&self) -> u64 {
        self.sync.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn set_len(&mut self, new_size: u64) -> Result<()> {
        self.sync.set_len(new_size)?;
        Ok(())
    }
}

impl AsyncRead for HostFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.handle).poll_read(cx, buf)
    }
}

impl AsyncWrite for HostFile {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let ret = Pin::new(&mut self.handle).poll_write(cx, buf);
        if matches!(ret, Poll::Ready(Ok(_))) {
            self.modified = time();
        }
        ret
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.handle).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.handle).poll_shutdown(cx)
    }
}

impl AsyncSeek for HostFile {
    fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.handle).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.handle).poll_complete(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFileSystem::new(dir.path()).unwrap();

        let mut file = fs
            .new_open_options()
            .write(true)
            .create(true)
            .open("/notes/today.txt")
            .unwrap();
        file.write_all(b"hello").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let metadata = fs.metadata(Path::new("/notes/today.txt")).unwrap();
        assert!(metadata.is_file());
        assert_eq!(metadata.len(), 5);

        let mut file = fs
            .new_open_options()
            .read(true)
            .open("/notes/today.txt")
            .unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "hello");
    }

    #[tokio::test]
    async fn remove_is_recursive_for_directories() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFileSystem::new(dir.path()).unwrap();

        fs.mkdir_all(Path::new("/a/b"), 0o755).unwrap();
        let mut file = fs
            .new_open_options()
            .write(true)
            .create(true)
            .open("/a/b/f.txt")
            .unwrap();
        file.write_all(b"x").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        fs.remove(Path::new("/a")).unwrap();
        assert_eq!(fs.metadata(Path::new("/a")), Err(FsError::NotFound));
    }

    #[tokio::test]
    async fn read_dir_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFileSystem::new(dir.path()).unwrap();

        for name in ["/c", "/a", "/b"] {
            fs.mkdir_all(Path::new(name), 0o755).unwrap();
        }

        let names: Vec<_> = fs
            .read_dir(Path::new("/"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
