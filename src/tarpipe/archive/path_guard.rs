//! String-level checks on archive-internal paths, run before a path touches the filesystem.

use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use std::path::PathBuf;

fn is_separator(b: &u8) -> bool {
    *b == b'/' || *b == b'\\'
}

/// Absolute in either separator convention, or carrying a drive-letter prefix.
fn is_absolute(raw: &[u8]) -> bool {
    match raw {
        [first, ..] if is_separator(first) => true,
        [letter, b':', ..] if letter.is_ascii_alphabetic() => true,
        _ => false,
    }
}

#[cfg(unix)]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Converts a raw tar link target into a path without reinterpreting it.
pub fn link_target_path(raw: &[u8]) -> PathBuf {
    bytes_to_path(raw)
}

/// Resolves `.`, empty and `..` segments. `None` when a `..` climbs above the first segment.
fn normalize(raw: &[u8], separator: impl Fn(&u8) -> bool) -> Option<Vec<&[u8]>> {
    let mut parts: Vec<&[u8]> = Vec::new();
    for part in raw.split(separator) {
        match part {
            b"" | b"." => {}
            b".." => {
                parts.pop()?;
            }
            part => parts.push(part),
        }
    }
    Some(parts)
}

/// Validates a raw entry path and returns its normalized relative form.
///
/// `.` segments and empty segments are dropped and `..` cancels the preceding segment. The
/// path is rejected when it is absolute, contains a NUL byte, or when a `..` would climb above
/// the first segment. Both `/` and `\` count as separators for these checks, but only `/`
/// splits the returned path: a backslash is an ordinary file name byte on Unix. The result may
/// be empty (an entry naming the archive root itself).
pub fn sanitize_bytes(raw: &[u8]) -> Result<PathBuf> {
    let shown = String::from_utf8_lossy(raw);
    if raw.contains(&0) {
        return Err(Error::Security(format!(
            "entry path {shown:?} contains a NUL byte"
        )));
    }
    if is_absolute(raw) {
        return Err(Error::Security(format!(
            "entry path {shown:?} is absolute"
        )));
    }

    let escapes = || Error::Security(format!("entry path {shown:?} escapes the destination"));
    normalize(raw, is_separator).ok_or_else(escapes)?;
    let parts = normalize(raw, |b| *b == b'/').ok_or_else(escapes)?;

    let joined = parts.join(&b'/');
    Ok(bytes_to_path(&joined))
}

pub fn sanitize(path: &str) -> Result<PathBuf> {
    sanitize_bytes(path.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarpipe::result_error::error::ErrorKind;
    use std::path::Path;

    #[test]
    fn test_rejects_absolute_and_traversal() {
        for bad in [
            "/etc/passwd",
            "../../../etc/passwd",
            "dir/../../etc/passwd",
            "C:\\Windows\\System32",
            "c:/Windows",
            "\\\\server\\share\\file",
            "..",
            "a/b/../../..",
            "nul\0byte",
        ] {
            let err = sanitize(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Security, "{bad:?}");
        }
    }

    #[test]
    fn test_accepts_plain_relative_paths() {
        assert_eq!(sanitize("file.txt").unwrap(), Path::new("file.txt"));
        assert_eq!(sanitize("dir/file.txt").unwrap(), Path::new("dir/file.txt"));
        assert_eq!(
            sanitize("a/b/c/file.txt").unwrap(),
            Path::new("a/b/c/file.txt")
        );
    }

    #[test]
    fn test_normalizes_harmless_segments() {
        assert_eq!(sanitize("./dir//file.txt").unwrap(), Path::new("dir/file.txt"));
        assert_eq!(sanitize("a/../b").unwrap(), Path::new("b"));
        assert_eq!(sanitize("dir/").unwrap(), Path::new("dir"));
        assert_eq!(sanitize("./").unwrap(), Path::new(""));
    }

    #[test]
    fn test_backslash_only_guards_never_splits() {
        assert_eq!(sanitize("data/a\\b.txt").unwrap(), Path::new("data/a\\b.txt"));
        for bad in ["dir\\..\\..\\etc", "a\\b/../..", "..\\x"] {
            let err = sanitize(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Security, "{bad:?}");
        }
    }
}
