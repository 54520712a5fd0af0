//! Commit-or-nothing output file.
//!
//! Output goes to `<dir>/<name>.tmp` and is renamed to `<dir>/<name>` by [`AtomicFile::commit`].
//! An `AtomicFile` that is aborted or dropped before committing removes its temporary file, so a
//! failed run leaves neither the temporary nor the final file behind.

use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use crate::tarpipe::result_error::WithMsg;
use std::fs::File;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug)]
pub struct AtomicFile {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
}

impl AtomicFile {
    /// Creates the temporary file. Fails when the final file already exists, or when a
    /// temporary file of the same name is left over from another run.
    pub fn create<P: AsRef<Path>>(dir: P, name: &str) -> Result<Self> {
        let final_path = dir.as_ref().join(name);
        let tmp_path = dir.as_ref().join(format!("{name}{TMP_SUFFIX}"));
        if final_path.exists() {
            return Err(Error::user_actionable(
                format!("output file {final_path:?} already exists"),
                "remove it or wait a second before starting another backup",
            ));
        }
        let file = File::create_new(&tmp_path).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                Error::UserActionable {
                    message: format!("temporary file {tmp_path:?} already exists"),
                    hint: "another backup may be running; otherwise remove the stale file".into(),
                    cause: Some(Box::new(e.into())),
                }
            } else {
                Error::from(e)
            }
        })?;
        tracing::debug!("Created temporary output {:?}", tmp_path);
        Ok(Self {
            tmp_path,
            final_path,
            file: Some(file),
        })
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("output file already closed"))
    }

    /// Syncs the data to disk and renames the temporary file into place.
    pub fn commit(mut self) -> Result<PathBuf> {
        let synced = match self.file.take() {
            Some(mut file) => file.flush().and_then(|_| file.sync_all()),
            None => Err(io::Error::other("output file already closed")),
        };
        let committed = synced.and_then(|_| std::fs::rename(&self.tmp_path, &self.final_path));
        match committed {
            Ok(()) => {
                tracing::info!("Committed {:?}", self.final_path);
                Ok(std::mem::take(&mut self.final_path))
            }
            Err(e) => {
                let mut error = Error::from(e);
                if let Err(e2) = self.remove_tmp() {
                    error = error.chain(e2);
                }
                Err(error.with_msg(format!("committing {:?} failed", self.final_path)))
            }
        }
    }

    /// Discards everything written so far.
    pub fn abort(mut self) -> Result<()> {
        self.file.take();
        self.remove_tmp()
    }

    fn remove_tmp(&mut self) -> Result<()> {
        self.file.take();
        if self.tmp_path.as_os_str().is_empty() {
            return Ok(());
        }
        let tmp_path = std::mem::take(&mut self.tmp_path);
        match std::fs::remove_file(&tmp_path) {
            Ok(()) => {
                tracing::debug!("Removed temporary output {:?}", tmp_path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e).with_msg(format!("Delete tmp file {tmp_path:?} failed."))),
        }
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(e) = self.remove_tmp() {
                tracing::warn!("{}", e);
            }
        }
    }
}
