pub mod decode;
pub mod encode;
pub mod path_guard;

use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use getset::{CopyGetters, Getters};
use std::ffi::{OsStr, OsString};
use std::fs::Metadata;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Node kinds an archive entry can describe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Anything else (fifo, device, hard link ...), named for diagnostics
    Unsupported(String),
}

/// One node serialized into the archive stream
///
/// `path` is archive-internal and relative; on decode it is the PathGuard-normalized form of the
/// raw header path. `size` is only meaningful for regular files and `link_target` is only set for
/// symlinks, where it holds the link text exactly as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub link_target: Option<PathBuf>,
}

impl ArchiveEntry {
    /// Reads the metadata of a tar entry, validating its path on the way.
    ///
    /// Header fields that cannot be parsed are reported as corruption, unsafe paths as a
    /// security violation.
    pub fn from_tar<R: Read>(entry: &tar::Entry<R>) -> Result<Self> {
        let path = path_guard::sanitize_bytes(&entry.path_bytes())?;
        let header = entry.header();
        let mode = header
            .mode()
            .map_err(|e| Error::corruption(format!("bad mode field for {path:?}"), e))?
            & 0o7777;
        let size = header
            .entry_size()
            .map_err(|e| Error::corruption(format!("bad size field for {path:?}"), e))?;

        let kind = match header.entry_type() {
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::File,
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Symlink => EntryKind::Symlink,
            tar::EntryType::Link => EntryKind::Unsupported("hard link".into()),
            tar::EntryType::Char => EntryKind::Unsupported("character device".into()),
            tar::EntryType::Block => EntryKind::Unsupported("block device".into()),
            tar::EntryType::Fifo => EntryKind::Unsupported("fifo".into()),
            other => EntryKind::Unsupported(format!("{other:?}")),
        };

        let link_target = match kind {
            EntryKind::Symlink => {
                let raw = entry.link_name_bytes().ok_or_else(|| {
                    Error::corruption_msg(format!("symlink {path:?} has no target"))
                })?;
                Some(path_guard::link_target_path(&raw))
            }
            _ => None,
        };

        Ok(Self {
            path,
            kind,
            size,
            mode,
            link_target,
        })
    }
}

/// The path being archived, resolved once before the walk starts
///
/// The path is made absolute without dereferencing its last component, so a symlink given as
/// the source is archived as a symlink.
#[derive(Debug, Clone, Getters)]
pub struct SourceRoot {
    #[getset(get = "pub")]
    path: PathBuf,
    #[getset(get = "pub")]
    parent: PathBuf,
    #[getset(get = "pub")]
    name: OsString,
    #[getset(get = "pub")]
    metadata: Metadata,
}

impl SourceRoot {
    pub fn resolve<P: AsRef<Path>>(source: P) -> Result<Self> {
        let absolute = std::path::absolute(source.as_ref())?;
        let path = match (absolute.parent(), absolute.file_name()) {
            (Some(parent), Some(name)) => parent.canonicalize()?.join(name),
            _ => absolute.canonicalize()?,
        };
        let metadata = std::fs::symlink_metadata(&path)?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.clone());
        let name = path
            .file_name()
            .map(OsStr::to_os_string)
            .unwrap_or_else(|| OsString::from("root"));
        tracing::debug!("Resolved source {:?} to {:?}", source.as_ref(), path);
        Ok(Self {
            path,
            parent,
            name,
            metadata,
        })
    }

    /// Basename used in the archive and in backup file names.
    pub fn basename(&self) -> String {
        self.name.to_string_lossy().into_owned()
    }

    pub fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }
}

/// Totals produced by the encoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct EncodeStats {
    entries: u64,
    payload_bytes: u64,
}

/// Totals produced by the decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct DecodeStats {
    entries: u64,
    files: u64,
    directories: u64,
    symlinks: u64,
    skipped: u64,
    payload_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_source_root_of_directory() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("project");
        std::fs::create_dir(&src).unwrap();

        let root = SourceRoot::resolve(&src).unwrap();
        assert_eq!(root.basename(), "project");
        assert!(root.is_dir());
        assert_eq!(root.parent(), &dir.path().canonicalize().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_source_root_does_not_follow_trailing_symlink() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink("real", dir.path().join("link")).unwrap();

        let root = SourceRoot::resolve(dir.path().join("link")).unwrap();
        assert_eq!(root.basename(), "link");
        assert!(root.metadata().file_type().is_symlink());
    }

    #[test]
    fn test_missing_source_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = SourceRoot::resolve(dir.path().join("missing")).unwrap_err();
        assert_eq!(
            err.kind(),
            crate::tarpipe::result_error::error::ErrorKind::Io
        );
    }
}
