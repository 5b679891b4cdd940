//! Overlay manifests: on-disk layout, metadata parsing, transfer tracking.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::warn;

use crate::protocol::key;
use crate::value::{FieldError, Fields, Value};
use crate::wire::{self, FrameDecodeError};

/// Metadata file name inside an overlay directory.
pub const META_FILE_NAME: &str = "overlay-meta";

/// Keys of the metadata field map. Segment entries reuse the wire keys
/// `blob_uri` and `blob_size`.
pub mod meta_key {
    pub const BASE_VM_SHA256: &str = "base_vm_sha256";
    pub const SEGMENTS: &str = "segments";
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed metadata in {}: {source}", path.display())]
    Meta {
        path: PathBuf,
        #[source]
        source: FrameDecodeError,
    },
    #[error("metadata field: {0}")]
    Field(#[from] FieldError),
    #[error("metadata segment entries must be maps")]
    MalformedSegment,
    #[error("unknown overlay `{0}`")]
    OverlayNotFound(String),
    #[error("segment `{0}` not found in overlay")]
    SegmentNotFound(String),
}

/// One segment declared by the metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SegmentEntry {
    name: String,
    size: u64,
}

/// A declared segment resolved to a readable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// One application overlay: parsed metadata plus the record of which
/// segments have been sent so far.
#[derive(Debug)]
pub struct OverlayManifest {
    app_name: String,
    dir: PathBuf,
    meta_path: PathBuf,
    meta_size: u64,
    base_vm_sha256: String,
    segments: Vec<SegmentEntry>,
    sent: Mutex<Vec<String>>,
}

impl OverlayManifest {
    /// Parse the overlay rooted at `dir` from its metadata file.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, ManifestError> {
        let dir = dir.into();
        let meta_path = dir.join(META_FILE_NAME);
        let bytes = std::fs::read(&meta_path).map_err(|source| ManifestError::Io {
            path: meta_path.clone(),
            source,
        })?;
        let meta = wire::decode_fields(&bytes).map_err(|source| ManifestError::Meta {
            path: meta_path.clone(),
            source,
        })?;

        let base_vm_sha256 = meta.require_str(meta_key::BASE_VM_SHA256)?.to_owned();
        let mut segments = Vec::new();
        for entry in meta.require_array(meta_key::SEGMENTS)? {
            let Value::Map(entry) = entry else {
                return Err(ManifestError::MalformedSegment);
            };
            segments.push(SegmentEntry {
                name: entry.require_str(key::SEGMENT_URI)?.to_owned(),
                size: entry.require_u64(key::SEGMENT_SIZE)?,
            });
        }

        let app_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "overlay".to_owned());

        Ok(Self {
            app_name,
            meta_path,
            meta_size: bytes.len() as u64,
            base_vm_sha256,
            segments,
            sent: Mutex::new(Vec::new()),
            dir,
        })
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Size of the raw metadata file, the first payload of every session.
    pub fn meta_size(&self) -> u64 {
        self.meta_size
    }

    pub fn base_vm_sha256(&self) -> &str {
        &self.base_vm_sha256
    }

    pub fn expected_segments(&self) -> usize {
        self.segments.len()
    }

    /// Total payload bytes of a full transfer: metadata plus every declared
    /// segment.
    pub fn total_bytes(&self) -> u64 {
        self.meta_size
            + self
                .segments
                .iter()
                .map(|s| s.size)
                .sum::<u64>()
    }

    /// Resolve a server-requested segment. Only names declared by the
    /// metadata resolve; the server cannot name arbitrary paths. The size
    /// returned is the file's current size, which is what gets streamed.
    pub fn lookup_segment(&self, name: &str) -> Result<SegmentFile, ManifestError> {
        let entry = self
            .segments
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ManifestError::SegmentNotFound(name.to_owned()))?;
        let path = self.dir.join(&entry.name);
        let size = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!(segment = %name, error = %err, "declared segment unreadable");
                return Err(ManifestError::SegmentNotFound(name.to_owned()));
            }
        };
        if size != entry.size {
            warn!(
                segment = %name,
                declared = entry.size,
                actual = size,
                "segment size differs from metadata"
            );
        }
        Ok(SegmentFile {
            name: entry.name.clone(),
            path,
            size,
        })
    }

    /// Record a completed segment transfer. Recording the same name again
    /// moves it to the end of the sent list without growing it.
    pub fn record_sent(&self, name: &str) {
        let mut sent = self.sent_guard();
        if let Some(pos) = sent.iter().position(|s| s == name) {
            sent.remove(pos);
        }
        sent.push(name.to_owned());
    }

    pub fn sent_count(&self) -> usize {
        self.sent_guard().len()
    }

    /// Sent segment names in completion order.
    pub fn sent_segments(&self) -> Vec<String> {
        self.sent_guard().clone()
    }

    /// True once every declared segment has been sent at least once. This is
    /// an advisory signal; an explicit synthesis-done from the server remains
    /// authoritative while the connection lives.
    pub fn is_complete(&self) -> bool {
        self.sent_count() == self.segments.len()
    }

    fn sent_guard(&self) -> MutexGuard<'_, Vec<String>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Directory of overlays, one subdirectory per application.
#[derive(Debug, Clone)]
pub struct OverlaySource {
    root: PathBuf,
}

impl OverlaySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enumerate loadable overlays under the root, sorted by name.
    /// Subdirectories without a metadata file are skipped; ones with a
    /// broken metadata file are skipped with a warning.
    pub fn list(&self) -> Result<Vec<OverlayManifest>, ManifestError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| ManifestError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut overlays = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() || !dir.join(META_FILE_NAME).is_file() {
                continue;
            }
            match OverlayManifest::load(&dir) {
                Ok(manifest) => overlays.push(manifest),
                Err(err) => warn!(overlay = %dir.display(), error = %err, "skipping overlay"),
            }
        }
        overlays.sort_by(|a, b| a.app_name.cmp(&b.app_name));
        Ok(overlays)
    }

    /// Load the overlay for one application by directory name.
    pub fn find(&self, app_name: &str) -> Result<OverlayManifest, ManifestError> {
        let dir = self.root.join(app_name);
        if !dir.join(META_FILE_NAME).is_file() {
            return Err(ManifestError::OverlayNotFound(app_name.to_owned()));
        }
        OverlayManifest::load(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_overlay(root: &Path, app: &str, segments: &[(&str, &[u8])]) -> PathBuf {
        let dir = root.join(app);
        std::fs::create_dir_all(&dir).unwrap();
        let mut listed = Vec::new();
        for (name, data) in segments {
            std::fs::write(dir.join(name), data).unwrap();
            listed.push(Value::Map(
                Fields::new()
                    .with(key::SEGMENT_URI, *name)
                    .with(key::SEGMENT_SIZE, data.len() as u64),
            ));
        }
        let meta = Fields::new()
            .with(meta_key::BASE_VM_SHA256, "f00dfeed")
            .with(meta_key::SEGMENTS, listed);
        std::fs::write(dir.join(META_FILE_NAME), wire::encode_fields(&meta).unwrap()).unwrap();
        dir
    }

    #[test]
    fn load_parses_metadata_and_sizes() {
        let tmp = TempDir::new().unwrap();
        let dir = write_overlay(tmp.path(), "moped", &[("seg-a", b"aaaa"), ("seg-b", b"bb")]);
        let manifest = OverlayManifest::load(&dir).unwrap();
        assert_eq!(manifest.app_name(), "moped");
        assert_eq!(manifest.dir(), dir);
        assert_eq!(manifest.base_vm_sha256(), "f00dfeed");
        assert_eq!(manifest.expected_segments(), 2);
        assert_eq!(manifest.total_bytes(), manifest.meta_size() + 6);
        assert!(!manifest.is_complete());
    }

    #[test]
    fn lookup_resolves_only_declared_segments() {
        let tmp = TempDir::new().unwrap();
        let dir = write_overlay(tmp.path(), "moped", &[("seg-a", b"aaaa")]);
        std::fs::write(dir.join("stray"), b"x").unwrap();
        let manifest = OverlayManifest::load(&dir).unwrap();

        let seg = manifest.lookup_segment("seg-a").unwrap();
        assert_eq!(seg.size, 4);
        assert_eq!(seg.path, dir.join("seg-a"));

        assert!(matches!(
            manifest.lookup_segment("stray"),
            Err(ManifestError::SegmentNotFound(_))
        ));
        assert!(matches!(
            manifest.lookup_segment("../escape"),
            Err(ManifestError::SegmentNotFound(_))
        ));
    }

    #[test]
    fn declared_but_missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let dir = write_overlay(tmp.path(), "moped", &[("seg-a", b"aaaa")]);
        std::fs::remove_file(dir.join("seg-a")).unwrap();
        let manifest = OverlayManifest::load(&dir).unwrap();
        assert!(matches!(
            manifest.lookup_segment("seg-a"),
            Err(ManifestError::SegmentNotFound(_))
        ));
    }

    #[test]
    fn duplicate_record_does_not_double_count() {
        let tmp = TempDir::new().unwrap();
        let dir = write_overlay(tmp.path(), "moped", &[("seg-a", b"a"), ("seg-b", b"b")]);
        let manifest = OverlayManifest::load(&dir).unwrap();

        manifest.record_sent("seg-a");
        manifest.record_sent("seg-a");
        assert_eq!(manifest.sent_count(), 1);
        assert!(!manifest.is_complete());

        manifest.record_sent("seg-b");
        assert!(manifest.is_complete());
        assert_eq!(manifest.sent_segments(), ["seg-a", "seg-b"]);

        manifest.record_sent("seg-a");
        assert_eq!(manifest.sent_count(), 2);
        assert_eq!(manifest.sent_segments(), ["seg-b", "seg-a"]);
    }

    #[test]
    fn empty_metadata_file_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("broken");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(META_FILE_NAME), b"").unwrap();
        assert!(matches!(
            OverlayManifest::load(&dir),
            Err(ManifestError::Meta { .. })
        ));
    }

    #[test]
    fn source_lists_overlays_sorted_and_skips_broken() {
        let tmp = TempDir::new().unwrap();
        write_overlay(tmp.path(), "zebra", &[("s", b"z")]);
        write_overlay(tmp.path(), "apple", &[("s", b"a")]);
        let broken = tmp.path().join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(META_FILE_NAME), b"\xff\xff").unwrap();
        std::fs::create_dir_all(tmp.path().join("not-an-overlay")).unwrap();

        let source = OverlaySource::new(tmp.path());
        let names: Vec<String> = source
            .list()
            .unwrap()
            .iter()
            .map(|m| m.app_name().to_owned())
            .collect();
        assert_eq!(names, ["apple", "zebra"]);
    }

    #[test]
    fn source_find_unknown_overlay() {
        let tmp = TempDir::new().unwrap();
        let source = OverlaySource::new(tmp.path());
        assert!(matches!(
            source.find("ghost"),
            Err(ManifestError::OverlayNotFound(_))
        ));
    }
}
