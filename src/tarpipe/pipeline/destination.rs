use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use std::io;
use std::path::Path;

/// Pre-flight check for a restore target.
///
/// A missing or empty directory always passes. A non-empty one passes only with `force`.
pub fn check_destination(destination: &Path, force: bool) -> Result<()> {
    let metadata = match std::fs::metadata(destination) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("Destination {:?} does not exist yet", destination);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_dir() {
        return Err(Error::user_actionable(
            format!("destination {destination:?} exists and is not a directory"),
            "choose a directory to restore into",
        ));
    }
    if std::fs::read_dir(destination)?.next().is_none() {
        return Ok(());
    }
    if force {
        tracing::warn!(
            "Destination {:?} is not empty, restoring over existing files",
            destination
        );
        Ok(())
    } else {
        Err(Error::user_actionable(
            format!("destination {destination:?} is not empty"),
            "pass --force to restore into it anyway; existing files may be overwritten",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarpipe::result_error::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_missing_and_empty_destinations_pass() {
        let dir = TempDir::new().unwrap();
        assert!(check_destination(&dir.path().join("new"), false).is_ok());
        assert!(check_destination(dir.path(), false).is_ok());
    }

    #[test]
    fn test_non_empty_destination_needs_force() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("existing.txt"), "x").unwrap();

        let err = check_destination(dir.path(), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserActionable);
        let text = err.to_string();
        assert!(text.contains("not empty"));
        assert!(text.contains("--force"));

        assert!(check_destination(dir.path(), true).is_ok());
    }

    #[test]
    fn test_file_destination_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        let err = check_destination(&file, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserActionable);
    }
}
