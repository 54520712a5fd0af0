use crate::tarpipe::archive::{EncodeStats, SourceRoot};
use crate::tarpipe::function_path;
use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use crate::tarpipe::result_error::WithDebugObjectAndFnName;
use crate::tarpipe::stream::{CancellationToken, CountingReader};
use bon::Builder;
use derive_more::{Display, From};
use function_name::named;
use getset::Getters;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Formatter;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::result;
use tar::HeaderMode;
use walkdir::{DirEntry, WalkDir};

/// A glob naming paths to leave out of the archive
///
/// Matched against the path relative to the source root, with `*` not crossing `/`. An excluded
/// directory is pruned together with everything below it.
#[derive(Clone, Debug, From, Display, Serialize, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct ExcludePattern {
    glob: Glob,
}

impl ExcludePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map(ExcludePattern::from)
            .map_err(|e| Error::Configuration(format!("invalid exclude pattern: {e}")))
    }
}

struct ExcludePatternVisitor;

impl Visitor<'_> for ExcludePatternVisitor {
    type Value = ExcludePattern;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        GlobBuilder::new(v)
            .literal_separator(true)
            .build()
            .map(ExcludePattern::from)
            .map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for ExcludePattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(ExcludePatternVisitor)
    }
}

#[derive(Clone, Debug, Builder)]
pub struct EncodeOptions {
    #[builder(default)]
    exclude: Vec<ExcludePattern>,
    buffer_size: usize,
    #[builder(default)]
    cancel: CancellationToken,
}

impl EncodeOptions {
    fn exclude_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        self.exclude.iter().for_each(|p| {
            builder.add(p.glob.clone());
        });
        builder
            .build()
            .map_err(|e| Error::Configuration(format!("invalid exclude patterns: {e}")))
    }
}

fn is_excluded(excludes: &GlobSet, root: &Path, de: &DirEntry) -> bool {
    if de.depth() == 0 || excludes.is_empty() {
        return false;
    }
    match de.path().strip_prefix(root) {
        Ok(relative) if excludes.is_match(relative) => {
            tracing::debug!("Excluding {:?}", de.path());
            true
        }
        _ => false,
    }
}

/// Serializes `source` into `output` as a tar stream.
///
/// Every entry is named relative to the source's parent directory, so the source's basename
/// prefixes all of them. Symlinks are stored as links with their verbatim target, never
/// followed. Returns the writer once the end-of-archive marker has been written.
#[named]
pub fn encode<W: Write>(
    source: &SourceRoot,
    output: W,
    options: &EncodeOptions,
) -> Result<(W, EncodeStats)> {
    let excludes = options.exclude_set()?;
    tracing::info!(
        "Archiving {:?} with {} exclude pattern(s)",
        source.path(),
        options.exclude.len()
    );

    let mut builder = tar::Builder::new(output);
    builder.follow_symlinks(false);
    builder.mode(HeaderMode::Complete);

    let mut stats = EncodeStats::default();
    let walker = WalkDir::new(source.path())
        .follow_links(false)
        .follow_root_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|de| !is_excluded(&excludes, source.path(), de));

    for de in walker {
        options.cancel.check()?;
        let de = de?;
        let name = de
            .path()
            .strip_prefix(source.parent())
            .map_err(|e| Error::from(io::Error::other(e)))?;
        if name.as_os_str().is_empty() {
            continue;
        }
        let appended = append_entry(&mut builder, &de, name, options.buffer_size)
            .with_debug_object_and_fn_name(de.path().to_path_buf(), function_path!())?;
        if let Some(payload) = appended {
            stats.entries += 1;
            stats.payload_bytes += payload;
        }
    }

    let output = builder.into_inner()?;
    tracing::info!(
        "Archived {} entries, {} payload bytes",
        stats.entries,
        stats.payload_bytes
    );
    Ok((output, stats))
}

/// Appends one walked node. Returns the payload size, or `None` when the node was skipped.
fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    de: &DirEntry,
    name: &Path,
    buffer_size: usize,
) -> Result<Option<u64>> {
    let file_type = de.file_type();
    let metadata = de.metadata()?;
    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&metadata, HeaderMode::Complete);

    if file_type.is_file() {
        let size = metadata.len();
        let file = File::open(de.path())?;
        let mut reader =
            CountingReader::new(BufReader::with_capacity(buffer_size.max(1), file).take(size));
        builder.append_data(&mut header, name, &mut reader)?;
        if reader.count() != size {
            return Err(io::Error::other(format!(
                "file shrank from {size} to {} bytes while being archived",
                reader.count()
            ))
            .into());
        }
        tracing::trace!("Including file: {:?} ({} bytes)", name, size);
        return Ok(Some(size));
    }

    header.set_size(0);
    if file_type.is_dir() {
        builder.append_data(&mut header, name, io::empty())?;
        tracing::trace!("Including directory: {:?}", name);
    } else if file_type.is_symlink() {
        let target = std::fs::read_link(de.path())?;
        builder.append_link(&mut header, name, &target)?;
        tracing::trace!("Including symlink: {:?} -> {:?}", name, target);
    } else if is_special_file(&file_type) {
        builder.append_data(&mut header, name, io::empty())?;
        tracing::debug!("Including special file {:?} as metadata only", name);
    } else {
        tracing::warn!("Skipping {:?}: unsupported file type", de.path());
        return Ok(None);
    }
    Ok(Some(0))
}

#[cfg(unix)]
fn is_special_file(file_type: &std::fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_fifo() || file_type.is_char_device() || file_type.is_block_device()
}

#[cfg(not(unix))]
fn is_special_file(_file_type: &std::fs::FileType) -> bool {
    false
}
