//! Context-checked filesystem access.
//!
//! Every sensitive call goes through here: the context is asked for the
//! filesystem permission matching the path, the limit engine is charged
//! (`fs/read` and `fs/write` byte rates, `fs/new-file` and
//! `fs/total-new-file` for creations), and only then is the operation
//! delegated to the context's filesystem handle.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use rill_vfs::{FileSystem, FsError, Metadata, ReadDir};

use crate::context::Context;
use crate::limits::{
    FS_NEW_FILE_RATE_LIMIT_NAME, FS_READ_LIMIT_NAME, FS_TOTAL_NEW_FILE_LIMIT_NAME,
    FS_WRITE_LIMIT_NAME,
};
use crate::pattern::AbsolutePath;
use crate::permissions::{PathSpec, Permission, PermissionKind};
use crate::RuntimeError;

impl Context {
    /// The permission- and limit-checked filesystem facade of this context.
    pub fn fs(&self) -> Result<CtxFs<'_>, RuntimeError> {
        let fs = self.filesystem().ok_or(FsError::Unsupported)?;
        Ok(CtxFs { ctx: self, fs })
    }
}

pub struct CtxFs<'a> {
    ctx: &'a Context,
    fs: Arc<dyn FileSystem>,
}

fn path_spec(path: &Path) -> PathSpec {
    PathSpec::Path(AbsolutePath::from(path.to_string_lossy().as_ref()))
}

impl CtxFs<'_> {
    fn require(&self, kind: PermissionKind, path: &Path) -> Result<(), RuntimeError> {
        self.ctx.check_alive()?;
        self.ctx.require_permission(&Permission::Fs {
            kind,
            entity: path_spec(path),
        })?;
        Ok(())
    }

    async fn charge(&self, limit: &'static str, n: i64) -> Result<(), RuntimeError> {
        if self.ctx.limiter().has_limit(limit) {
            self.ctx.take(limit, n).await?;
        }
        Ok(())
    }

    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>, RuntimeError> {
        self.require(PermissionKind::READ, path)?;

        let size = self.fs.metadata(path)?.len;
        self.charge(FS_READ_LIMIT_NAME, size as i64).await?;

        let mut file = self.fs.new_open_options().read(true).open(path)?;
        let mut contents = Vec::with_capacity(size as usize);
        file.read_to_end(&mut contents).await.map_err(FsError::from)?;

        trace!(path = %path.display(), bytes = contents.len(), "fs read");
        Ok(contents)
    }

    pub async fn write_file(&self, path: &Path, content: &[u8]) -> Result<(), RuntimeError> {
        self.require(PermissionKind::WRITE, path)?;

        let is_new = matches!(self.fs.metadata(path), Err(FsError::NotFound));
        if is_new {
            self.charge(FS_NEW_FILE_RATE_LIMIT_NAME, 1).await?;
            self.charge(FS_TOTAL_NEW_FILE_LIMIT_NAME, 1).await?;
        }
        self.charge(FS_WRITE_LIMIT_NAME, content.len() as i64).await?;

        let mut file = self
            .fs
            .new_open_options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(content).await.map_err(FsError::from)?;
        file.flush().await.map_err(FsError::from)?;

        trace!(path = %path.display(), bytes = content.len(), new = is_new, "fs write");
        Ok(())
    }

    pub fn metadata(&self, path: &Path) -> Result<Metadata, RuntimeError> {
        self.require(PermissionKind::READ, path)?;
        Ok(self.fs.metadata(path)?)
    }

    pub fn read_dir(&self, path: &Path) -> Result<ReadDir, RuntimeError> {
        self.require(PermissionKind::READ, path)?;
        Ok(self.fs.read_dir(path)?)
    }

    pub fn mkdir_all(&self, path: &Path, mode: u32) -> Result<(), RuntimeError> {
        self.require(PermissionKind::CREATE, path)?;
        Ok(self.fs.mkdir_all(path, mode)?)
    }

    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), RuntimeError> {
        self.require(PermissionKind::WRITE, from)?;
        self.require(PermissionKind::WRITE, to)?;
        Ok(self.fs.rename(from, to).await?)
    }

    pub fn remove(&self, path: &Path) -> Result<(), RuntimeError> {
        self.require(PermissionKind::DELETE, path)?;
        Ok(self.fs.remove(path)?)
    }

    /// Takes a snapshot of the whole filesystem; requires read access to
    /// the full tree. `cache` may return previously captured contents so
    /// identical blobs are shared across snapshots.
    pub fn take_filesystem_snapshot(
        &self,
        cache: &rill_vfs::SnapshotContentCache<'_>,
    ) -> Result<rill_vfs::FilesystemSnapshot, RuntimeError> {
        self.require(PermissionKind::READ, Path::new("/"))?;
        Ok(self.fs.take_snapshot(cache)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextConfig;
    use crate::limits::{Limit, LimitError};
    use crate::permissions::NotAllowedError;
    use rill_vfs::{Interrupt, MetaFilesystem};

    fn meta_fs(dir: &tempfile::TempDir) -> Arc<dyn FileSystem> {
        Arc::new(MetaFilesystem::open(Interrupt::never(), dir.path().join("fs")).unwrap())
    }

    fn ctx_with(
        fs: Arc<dyn FileSystem>,
        permissions: Vec<Permission>,
        limits: Vec<Limit>,
    ) -> Context {
        Context::new(ContextConfig {
            permissions,
            limits,
            filesystem: Some(fs),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn reads_and_writes_check_path_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(
            meta_fs(&dir),
            vec![
                Permission::fs_read("/data/..."),
                Permission::fs_write("/data/..."),
            ],
            vec![],
        );
        let fs = ctx.fs().unwrap();

        fs.write_file(Path::new("/data/a.txt"), b"hello").await.unwrap();
        assert_eq!(fs.read_file(Path::new("/data/a.txt")).await.unwrap(), b"hello");

        let err = fs.read_file(Path::new("/other/b.txt")).await.unwrap_err();
        let expected = NotAllowedError::new(Permission::fs_read("/other/b.txt"));
        assert!(matches!(err, RuntimeError::NotAllowed(actual) if actual == expected));

        let err = fs
            .write_file(Path::new("/other/b.txt"), b"no")
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotAllowed(_)));
    }

    #[tokio::test]
    async fn removing_requires_the_delete_permission() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(
            meta_fs(&dir),
            vec![Permission::fs_write("/data/...")],
            vec![],
        );
        let fs = ctx.fs().unwrap();

        fs.write_file(Path::new("/data/a.txt"), b"x").await.unwrap();
        let err = fs.remove(Path::new("/data/a.txt")).unwrap_err();
        assert!(matches!(err, RuntimeError::NotAllowed(_)));
    }

    #[tokio::test]
    async fn the_total_new_file_limit_caps_file_creations() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(
            meta_fs(&dir),
            vec![Permission::fs_write("/...")],
            vec![Limit::total(FS_TOTAL_NEW_FILE_LIMIT_NAME, 2)],
        );
        let fs = ctx.fs().unwrap();

        fs.write_file(Path::new("/a"), b"1").await.unwrap();
        fs.write_file(Path::new("/b"), b"2").await.unwrap();

        let err = fs.write_file(Path::new("/c"), b"3").await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Limit(LimitError::Exceeded { .. }),
        ));

        // overwriting an existing file is not a creation
        fs.write_file(Path::new("/a"), b"1 again").await.unwrap();
    }

    #[tokio::test]
    async fn operations_fail_on_a_cancelled_context() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(
            meta_fs(&dir),
            vec![Permission::fs_read("/...")],
            vec![],
        );
        let fs = ctx.fs().unwrap();

        ctx.cancel();
        let err = fs.read_file(Path::new("/a")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Context(_)));
    }
}
