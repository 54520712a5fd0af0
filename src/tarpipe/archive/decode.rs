use crate::tarpipe::archive::{ArchiveEntry, DecodeStats, EntryKind};
use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use crate::tarpipe::result_error::WithMsg;
use crate::tarpipe::stream::{copy_decoded, CancellationToken};
use bon::Builder;
use std::cmp::Reverse;
use std::fs;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, IntoInnerError, Read};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Builder)]
pub struct DecodeOptions {
    buffer_size: usize,
    #[builder(default)]
    cancel: CancellationToken,
}

/// Recreates the archived tree under `destination`, creating it if absent.
///
/// Entries are processed one at a time. Every entry path goes through the path guard before
/// anything touches the disk, and nothing is ever written through a symlinked directory.
/// Extraction is not transactional: on failure, entries already written stay on disk.
pub fn decode<R: Read>(input: R, destination: &Path, options: &DecodeOptions) -> Result<DecodeStats> {
    fs::create_dir_all(destination)?;
    let extractor = Extractor {
        root: destination.canonicalize()?,
        deferred_dirs: Vec::new(),
        buffer_size: options.buffer_size.max(1),
    };
    tracing::info!("Extracting archive into {:?}", extractor.root);
    run(input, Some(extractor), options)
}

/// Reads every entry, applying the same path checks as [`decode`], without writing anything.
pub fn validate<R: Read>(input: R, options: &DecodeOptions) -> Result<DecodeStats> {
    tracing::info!("Validating archive framing");
    run(input, None, options)
}

fn run<R: Read>(
    input: R,
    mut extractor: Option<Extractor>,
    options: &DecodeOptions,
) -> Result<DecodeStats> {
    let mut stats = DecodeStats::default();
    let mut archive = tar::Archive::new(input);

    for entry in archive.entries().map_err(Error::corruption_from_io)? {
        options.cancel.check()?;
        let mut entry = entry.map_err(Error::corruption_from_io)?;
        let meta = ArchiveEntry::from_tar(&entry)?;
        stats.entries += 1;

        if meta.path.as_os_str().is_empty() {
            tracing::debug!("Skipping entry naming the archive root");
            stats.skipped += 1;
            continue;
        }

        match &meta.kind {
            EntryKind::File => {
                let written = match extractor.as_mut() {
                    Some(extractor) => extractor.file(&meta, &mut entry),
                    None => copy_decoded(&mut entry, &mut io::sink(), options.buffer_size),
                }
                .with_msg(format!("extracting file {:?}", meta.path))?;
                stats.files += 1;
                stats.payload_bytes += written;
                tracing::trace!("Extracted file {:?} ({} bytes)", meta.path, written);
            }
            EntryKind::Directory => {
                if let Some(extractor) = extractor.as_mut() {
                    extractor
                        .directory(&meta)
                        .with_msg(format!("extracting directory {:?}", meta.path))?;
                }
                stats.directories += 1;
                tracing::trace!("Extracted directory {:?}", meta.path);
            }
            EntryKind::Symlink => {
                if let Some(extractor) = extractor.as_mut() {
                    extractor
                        .symlink(&meta)
                        .with_msg(format!("extracting symlink {:?}", meta.path))?;
                }
                stats.symlinks += 1;
                tracing::trace!("Extracted symlink {:?} -> {:?}", meta.path, meta.link_target);
            }
            EntryKind::Unsupported(kind) => {
                tracing::warn!("Skipping {:?}: unsupported entry type {}", meta.path, kind);
                stats.skipped += 1;
            }
        }
    }

    // Reading stops at the end-of-archive marker; upstream checksums are only verified once
    // the rest of the stream has been consumed.
    let mut rest = archive.into_inner();
    copy_decoded(&mut rest, &mut io::sink(), options.buffer_size)?;

    if let Some(extractor) = extractor {
        extractor.apply_directory_modes()?;
    }
    tracing::info!(
        "Processed {} entries: {} files, {} directories, {} symlinks, {} skipped",
        stats.entries,
        stats.files,
        stats.directories,
        stats.symlinks,
        stats.skipped
    );
    Ok(stats)
}

struct Extractor {
    root: PathBuf,
    deferred_dirs: Vec<(PathBuf, u32)>,
    buffer_size: usize,
}

impl Extractor {
    /// Joins `relative` onto the root and refuses targets that leave the root or that would be
    /// reached through an existing symlink.
    fn target(&self, relative: &Path) -> Result<PathBuf> {
        let target = self.root.join(relative);
        if !target.starts_with(&self.root) || target == self.root {
            return Err(Error::Security(format!(
                "entry {relative:?} resolves outside the destination"
            )));
        }

        let mut ancestor = self.root.clone();
        let mut components = relative.components().peekable();
        while let Some(component) = components.next() {
            if components.peek().is_none() {
                break;
            }
            ancestor.push(component);
            match fs::symlink_metadata(&ancestor) {
                Ok(m) if m.file_type().is_symlink() => {
                    return Err(Error::Security(format!(
                        "entry {relative:?} would be written through symlink {ancestor:?}"
                    )));
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(target)
    }

    fn prepare(&self, relative: &Path) -> Result<PathBuf> {
        let target = self.target(relative)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        remove_non_directory(&target)?;
        Ok(target)
    }

    fn file<R: Read>(&mut self, entry: &ArchiveEntry, data: &mut R) -> Result<u64> {
        let target = self.prepare(&entry.path)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target)?;
        let mut writer = BufWriter::with_capacity(self.buffer_size, file);
        let written = copy_decoded(data, &mut writer, self.buffer_size)?;
        let file = writer.into_inner().map_err(IntoInnerError::into_error)?;
        set_file_mode(&file, entry.mode)?;
        Ok(written)
    }

    fn directory(&mut self, entry: &ArchiveEntry) -> Result<()> {
        let target = self.target(&entry.path)?;
        remove_non_directory(&target)?;
        fs::create_dir_all(&target)?;
        self.deferred_dirs.push((target, entry.mode));
        Ok(())
    }

    fn symlink(&mut self, entry: &ArchiveEntry) -> Result<()> {
        let link = entry
            .link_target
            .as_deref()
            .ok_or_else(|| Error::corruption_msg("symlink entry without target"))?;
        let target = self.prepare(&entry.path)?;
        create_symlink(link, &target)?;
        Ok(())
    }

    /// Applied last and deepest first, so a read-only directory never blocks its own children.
    fn apply_directory_modes(mut self) -> Result<()> {
        self.deferred_dirs
            .sort_by_key(|(path, _)| Reverse(path.components().count()));
        for (path, mode) in self.deferred_dirs {
            match fs::symlink_metadata(&path) {
                Ok(m) if m.is_dir() => set_path_mode(&path, mode)?,
                _ => tracing::debug!("Not applying mode to {:?}: no longer a directory", path),
            }
        }
        Ok(())
    }
}

fn remove_non_directory(target: &Path) -> Result<()> {
    match fs::symlink_metadata(target) {
        Ok(m) if !m.is_dir() => {
            tracing::debug!("Replacing existing {:?}", target);
            fs::remove_file(target)?;
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(file: &File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_file_mode(_file: &File, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_path_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_path_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(windows)]
fn create_symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(link, target)
}

#[cfg(not(any(unix, windows)))]
fn create_symlink(_link: &Path, target: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot create symlink {target:?} on this platform"),
    ))
}
