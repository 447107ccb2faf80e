//! An open file of the meta filesystem.
//!
//! Reads and writes go straight to the underlying content blob; the
//! metadata record only has to be refreshed with a new modification time
//! once written data is flushed.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

use super::{MetaFilesystem, MetaFsState};
use crate::{time, Result, VirtualFile};

#[derive(Debug)]
pub struct MetaFile {
    state: Arc<MetaFsState>,
    path: PathBuf,
    handle: tokio::fs::File,
    sync: fs::File,
    created: u64,
    modified: u64,
    dirty: bool,
}

impl MetaFile {
    pub(super) fn new(
        state: Arc<MetaFsState>,
        path: PathBuf,
        file: fs::File,
        created: u64,
        modified: u64,
    ) -> Result<Self> {
        let sync = file.try_clone()?;
        Ok(Self {
            state,
            path,
            handle: tokio::fs::File::from_std(file),
            sync,
            created,
            modified,
            dirty: false,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn sync_metadata(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.modified = time();
        MetaFilesystem::touch(&self.state, &self.path, self.modified);
    }
}

impl VirtualFile for MetaFile {
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
        self.dirty = true;
        Ok(())
    }
}

impl AsyncRead for MetaFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.handle).poll_read(cx, buf)
    }
}

impl AsyncWrite for MetaFile {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let ret = Pin::new(&mut self.handle).poll_write(cx, buf);
        if matches!(ret, Poll::Ready(Ok(_))) {
            self.dirty = true;
        }
        ret
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let ret = Pin::new(&mut self.handle).poll_flush(cx);
        if matches!(ret, Poll::Ready(Ok(()))) {
            self.sync_metadata();
        }
        ret
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let ret = Pin::new(&mut self.handle).poll_shutdown(cx);
        if matches!(ret, Poll::Ready(Ok(()))) {
            self.sync_metadata();
        }
        ret
    }
}

impl AsyncSeek for MetaFile {
    fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.handle).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.handle).poll_complete(cx)
    }
}

impl Drop for MetaFile {
    fn drop(&mut self) {
        self.sync_metadata();
    }
}
