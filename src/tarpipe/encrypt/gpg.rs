use crate::tarpipe::encrypt::KeyMaterial;
use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use crate::tarpipe::stream::{copy_buffered, is_interruption};
use crate::tarpipe::transform::StreamTransform;
use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::ffi::OsString;
use std::io;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tempfile::NamedTempFile;
use validator::Validate;

static DEFAULT_GPG_PROGRAM: &str = "gpg";

/// Configuration for OpenPGP encryption through the `gpg` program
///
/// With a passphrase the stream is encrypted symmetrically (AES256); otherwise it is encrypted
/// to the configured recipients' public keys. Decryption of public-key backups relies on the
/// secret key being available in the keyring (`homedir`, or gpg's default).
#[skip_serializing_none]
#[derive(Clone, Default, Serialize, Deserialize, Debug, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct GpgConfig {
    #[serde(default)]
    #[validate(nested)]
    #[builder(default)]
    pub keys: KeyMaterial,
    /// The gpg executable, `gpg` from `PATH` when unset
    #[builder(into)]
    pub program: Option<PathBuf>,
    #[builder(into)]
    pub homedir: Option<PathBuf>,
}

enum Direction {
    Encrypt,
    Decrypt,
}

impl GpgConfig {
    fn program(&self) -> &Path {
        self.program
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_GPG_PROGRAM))
    }

    pub(crate) fn encrypt_args(&self) -> Result<Vec<OsString>> {
        let mut args: Vec<OsString> = Vec::new();
        if self.keys.passphrase.is_some() {
            args.extend(["--symmetric", "--cipher-algo", "AES256"].map(OsString::from));
        } else if !self.keys.recipients.is_empty() {
            args.extend(["--encrypt", "--trust-model", "always"].map(OsString::from));
            for recipient in &self.keys.recipients {
                args.push("--recipient".into());
                args.push(recipient.into());
            }
        } else {
            return Err(Error::Configuration(
                "gpg encryption needs a passphrase or at least one recipient".into(),
            ));
        }
        if self.keys.armor {
            args.push("--armor".into());
        }
        args.extend(["--output", "-"].map(OsString::from));
        Ok(args)
    }

    fn command(&self, passphrase_file: Option<&Path>) -> Command {
        let mut cmd = Command::new(self.program());
        cmd.args(["--batch", "--yes", "--quiet", "--no-tty"]);
        if let Some(homedir) = &self.homedir {
            cmd.arg("--homedir").arg(homedir);
        }
        if let Some(file) = passphrase_file {
            cmd.args(["--pinentry-mode", "loopback", "--passphrase-file"])
                .arg(file);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Writes the passphrase to a private temporary file that lives as long as the returned
    /// handle; gpg reads it from there instead of the command line.
    fn passphrase_file(&self) -> Result<Option<NamedTempFile>> {
        match &self.keys.passphrase {
            None => Ok(None),
            Some(passphrase) => {
                let mut file = NamedTempFile::new()?;
                file.write_all(passphrase.expose().as_bytes())?;
                file.flush()?;
                Ok(Some(file))
            }
        }
    }

    fn run<R: Read + Send, W: Write + Send>(
        &self,
        direction: Direction,
        mut input: R,
        mut output: W,
        buffer_size: usize,
    ) -> Result<W> {
        let passphrase_file = self.passphrase_file()?;
        let mut cmd = self.command(passphrase_file.as_ref().map(|f| f.path()));
        match direction {
            Direction::Encrypt => cmd.args(self.encrypt_args()?),
            Direction::Decrypt => cmd.args(["--decrypt", "--output", "-"]),
        };

        tracing::debug!("Spawning {:?}", cmd);
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::UserActionable {
                    message: format!("gpg program {:?} was not found", self.program()),
                    hint: "install GnuPG or set `program` in the gpg encryptor config".into(),
                    cause: Some(Box::new(e.into())),
                }
            } else {
                Error::from(e)
            }
        })?;
        let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            return Err(Error::from(io::Error::other("gpg stdio was not captured")));
        };

        let (fed, drained, diagnostics) = std::thread::scope(|s| {
            let feeder = s.spawn(move || {
                let fed = copy_buffered(&mut input, &mut stdin, buffer_size);
                drop(stdin);
                fed
            });
            let stderr_reader = s.spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                text
            });
            let drained = copy_buffered(&mut stdout, &mut output, buffer_size);
            if drained.is_err() {
                // gpg stalls on a full stdout otherwise, and the feeder with it.
                let _ = child.kill();
            }
            let fed = feeder
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("gpg input feeder panicked")));
            let diagnostics = stderr_reader.join().unwrap_or_default();
            (fed, drained, diagnostics)
        });
        let status = child.wait()?;

        if let Err(e) = drained {
            if is_interruption(&e) {
                return Err(e.into());
            }
            return Err(failure(&direction, status, &diagnostics, Some(e)));
        }
        if let Err(e) = fed {
            if is_interruption(&e) || status.success() {
                return Err(e.into());
            }
        }
        if !status.success() {
            return Err(failure(&direction, status, &diagnostics, None));
        }
        Ok(output)
    }
}

fn failure(
    direction: &Direction,
    status: ExitStatus,
    diagnostics: &str,
    io_error: Option<io::Error>,
) -> Error {
    let message = format!("gpg exited with {status}: {}", diagnostics.trim());
    match direction {
        Direction::Encrypt => Error::Configuration(message),
        Direction::Decrypt => match io_error {
            Some(e) => Error::corruption(message, e),
            None => Error::corruption_msg(message),
        },
    }
}

impl StreamTransform for GpgConfig {
    fn encode<R: Read + Send, W: Write + Send>(
        &self,
        input: R,
        output: W,
        buffer_size: usize,
    ) -> Result<W> {
        self.run(Direction::Encrypt, input, output, buffer_size)
    }

    fn decode<R: Read + Send, W: Write + Send>(
        &self,
        input: R,
        output: W,
        buffer_size: usize,
    ) -> Result<W> {
        self.run(Direction::Decrypt, input, output, buffer_size)
    }
}
