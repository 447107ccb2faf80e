//! Point-in-time filesystem snapshots with content deduplicated by SHA-256.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::Metadata;

/// SHA-256 digest of a file content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::default();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({self})")
    }
}

/// Lookup consulted while a snapshot is being taken: returning a previously
/// captured content for a checksum makes the new snapshot share the blob
/// instead of keeping its own copy.
pub type SnapshotContentCache<'a> = dyn Fn(&Checksum) -> Option<Bytes> + Send + Sync + 'a;

/// An immutable view of a whole filesystem at one instant.
///
/// Directory and file metadata is keyed by absolute path; leaf contents are
/// stored once per distinct checksum.
#[derive(Debug, Clone, Default)]
pub struct FilesystemSnapshot {
    metadata: BTreeMap<PathBuf, Metadata>,
    path_checksums: BTreeMap<PathBuf, Checksum>,
    contents: HashMap<Checksum, Bytes>,
}

impl FilesystemSnapshot {
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder {
            snapshot: Self::default(),
        }
    }

    pub fn metadata(&self) -> &BTreeMap<PathBuf, Metadata> {
        &self.metadata
    }

    pub fn metadata_of(&self, path: &Path) -> Option<&Metadata> {
        self.metadata.get(path)
    }

    pub fn checksum_of(&self, path: &Path) -> Option<Checksum> {
        self.path_checksums.get(path).copied()
    }

    pub fn content_of(&self, path: &Path) -> Option<&Bytes> {
        self.contents.get(self.path_checksums.get(path)?)
    }

    /// All captured contents, keyed by checksum.
    pub fn contents(&self) -> &HashMap<Checksum, Bytes> {
        &self.contents
    }

    pub fn file_count(&self) -> usize {
        self.path_checksums.len()
    }
}

/// Write-side of a snapshot; dropped once the capture walk finishes.
#[derive(Debug)]
pub struct SnapshotBuilder {
    snapshot: FilesystemSnapshot,
}

impl SnapshotBuilder {
    pub fn add_dir(&mut self, path: PathBuf, metadata: Metadata) {
        self.snapshot.metadata.insert(path, metadata);
    }

    /// Records a leaf file. `cache` may substitute an equal, previously
    /// captured buffer so that back-to-back snapshots share blobs.
    pub fn add_file(
        &mut self,
        path: PathBuf,
        metadata: Metadata,
        content: Bytes,
        cache: &SnapshotContentCache<'_>,
    ) {
        let checksum = Checksum::of(&content);
        let content = cache(&checksum).unwrap_or(content);

        self.snapshot.metadata.insert(path.clone(), metadata);
        self.snapshot.path_checksums.insert(path, checksum);
        self.snapshot.contents.entry(checksum).or_insert(content);
    }

    pub fn build(self) -> FilesystemSnapshot {
        self.snapshot
    }
}

/// A cache that never shares anything; every snapshot keeps its own blobs.
pub fn no_content_cache(_checksum: &Checksum) -> Option<Bytes> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileType;

    fn file_metadata(len: u64) -> Metadata {
        Metadata {
            ft: FileType::new_file(),
            mode: 0o644,
            created: 1,
            modified: 1,
            len,
        }
    }

    #[test]
    fn checksum_is_stable_and_hex_formatted() {
        let a = Checksum::of(b"x");
        let b = Checksum::of(b"x");
        assert_eq!(a, b);
        assert_eq!(a.to_string().len(), 64);
        assert_ne!(a, Checksum::of(b"y"));
    }

    #[test]
    fn identical_contents_are_stored_once() {
        let mut builder = FilesystemSnapshot::builder();
        builder.add_file(
            PathBuf::from("/a"),
            file_metadata(3),
            Bytes::from_static(b"abc"),
            &no_content_cache,
        );
        builder.add_file(
            PathBuf::from("/b"),
            file_metadata(3),
            Bytes::from_static(b"abc"),
            &no_content_cache,
        );
        let snapshot = builder.build();

        assert_eq!(snapshot.file_count(), 2);
        assert_eq!(snapshot.contents().len(), 1);
        assert_eq!(
            snapshot.checksum_of(Path::new("/a")),
            snapshot.checksum_of(Path::new("/b")),
        );
    }

    #[test]
    fn cache_substitutes_previously_captured_blobs() {
        let previous = Bytes::from_static(b"abc");
        let previous_clone = previous.clone();
        let cache = move |checksum: &Checksum| {
            (*checksum == Checksum::of(b"abc")).then(|| previous_clone.clone())
        };

        let mut builder = FilesystemSnapshot::builder();
        builder.add_file(
            PathBuf::from("/a"),
            file_metadata(3),
            Bytes::copy_from_slice(b"abc"),
            &cache,
        );
        let snapshot = builder.build();

        let stored = snapshot.content_of(Path::new("/a")).unwrap();
        // Bytes tracks the backing allocation, so pointer equality proves sharing.
        assert_eq!(stored.as_ptr(), previous.as_ptr());
    }
}
