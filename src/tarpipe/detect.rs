//! Backup file naming, and the reverse: inferring methods from a backup's file name.

use crate::tarpipe::compress::CompressionKind;
use crate::tarpipe::encrypt::EncryptionKind;
use crate::tarpipe::file_ext::FileExtProvider;
use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use chrono::{DateTime, TimeZone};
use itertools::Itertools;
use sanitize_filename::{is_sanitized, sanitize};
use std::cmp::Reverse;
use std::fmt::Display;
use std::path::Path;
use std::sync::OnceLock;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// `backup_<basename>_<YYYYMMDD>_<HHMMSS>.tar<compression-ext><encryption-ext>`
pub fn backup_file_name<Tz: TimeZone>(
    basename: &str,
    at: &DateTime<Tz>,
    compression: CompressionKind,
    encryption: EncryptionKind,
) -> String
where
    Tz::Offset: Display,
{
    let basename = if is_sanitized(basename) {
        basename.to_string()
    } else {
        let sanitized = sanitize(basename);
        tracing::debug!("Sanitized archive base name {:?} to {:?}", basename, sanitized);
        sanitized
    };
    format!(
        "backup_{}_{}.tar{}{}",
        basename,
        at.format(TIMESTAMP_FORMAT),
        compression.file_ext(),
        encryption.file_ext()
    )
}

type SuffixTable<K> = Vec<(&'static str, K)>;

/// Longest suffix first, so `.tar.gz` wins over `.gz`-like shorter spellings.
fn by_specificity<K: Copy>(table: &[(&'static str, K)]) -> SuffixTable<K> {
    table
        .iter()
        .copied()
        .sorted_by_key(|(suffix, _)| Reverse(suffix.len()))
        .collect()
}

fn encryption_suffixes() -> &'static SuffixTable<EncryptionKind> {
    static TABLE: OnceLock<SuffixTable<EncryptionKind>> = OnceLock::new();
    TABLE.get_or_init(|| {
        by_specificity(&[
            (".gpg", EncryptionKind::Gpg),
            (".pgp", EncryptionKind::Gpg),
            (".asc", EncryptionKind::Gpg),
            (".age", EncryptionKind::Age),
        ])
    })
}

fn compression_suffixes() -> &'static SuffixTable<CompressionKind> {
    static TABLE: OnceLock<SuffixTable<CompressionKind>> = OnceLock::new();
    TABLE.get_or_init(|| {
        by_specificity(&[
            (".tar", CompressionKind::None),
            (".tar.gz", CompressionKind::Gzip),
            (".tgz", CompressionKind::Gzip),
            (".tar.zst", CompressionKind::Zstd),
            (".tar.zstd", CompressionKind::Zstd),
            (".tzst", CompressionKind::Zstd),
            (".tar.lz4", CompressionKind::Lz4),
            (".tar.xz", CompressionKind::Xz),
            (".txz", CompressionKind::Xz),
        ])
    })
}

fn match_suffix<'a, K: Copy>(name: &'a str, table: &[(&'static str, K)]) -> Option<(&'a str, K)> {
    table.iter().find_map(|(suffix, kind)| {
        name.strip_suffix(suffix).map(|stem| (stem, *kind))
    })
}

fn lowercase_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .ok_or_else(|| {
            Error::user_actionable(
                format!("{path:?} does not name a file"),
                "pass the path of a backup file",
            )
        })
}

pub fn detect_encryption(path: &Path) -> Option<EncryptionKind> {
    let name = lowercase_name(path).ok()?;
    match_suffix(&name, encryption_suffixes()).map(|(_, kind)| kind)
}

/// Looks at what precedes the encryption extension, if there is one.
pub fn detect_compression(path: &Path) -> Option<CompressionKind> {
    let name = lowercase_name(path).ok()?;
    let stem = match_suffix(&name, encryption_suffixes())
        .map(|(stem, _)| stem)
        .unwrap_or(&name);
    match_suffix(stem, compression_suffixes()).map(|(_, kind)| kind)
}

/// Resolves both methods for a backup file; explicit choices win over the file name.
pub fn resolve_methods(
    path: &Path,
    compression: Option<CompressionKind>,
    encryption: Option<EncryptionKind>,
) -> Result<(CompressionKind, EncryptionKind)> {
    let encryption = match encryption.or_else(|| detect_encryption(path)) {
        Some(kind) => kind,
        None => {
            return Err(Error::user_actionable(
                format!("cannot tell the encryption method of {path:?} from its name"),
                "expected a name ending in .age or .gpg, or pass the encryption method explicitly",
            ))
        }
    };
    let compression = match compression.or_else(|| detect_compression(path)) {
        Some(kind) => kind,
        None => {
            return Err(Error::user_actionable(
                format!("cannot tell the compression method of {path:?} from its name"),
                "expected .tar, .tar.gz, .tar.zst, .tar.lz4 or .tar.xz before the encryption \
                 extension, or pass the compression method explicitly",
            ))
        }
    };
    tracing::debug!(
        "Using compression {} and encryption {} for {:?}",
        compression,
        encryption,
        path
    );
    Ok((compression, encryption))
}
