use crate::tarpipe::archive::decode::{validate, DecodeOptions};
use crate::tarpipe::compress::{CompressionKind, CompressorConfig};
use crate::tarpipe::detect::detect_encryption;
use crate::tarpipe::encrypt::{DecryptionSettings, EncryptionKind, EncryptorConfig};
use crate::tarpipe::pipeline::restore::{check_backup_file, resolve_transforms};
use crate::tarpipe::pipeline::{
    join_stage, read_stage, settle, transform_stage, Phase, PipelineObserver, PipelineOptions,
    Stage, StageRunner,
};
use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use crate::tarpipe::stream::{copy_decoded, CancellationToken, CountingReader};
use crate::tarpipe::transform::StreamTransform;
use bon::Builder;
use derive_more::Display;
use getset::CopyGetters;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

/// Bytes inspected by a quick verify.
pub const HEADER_WINDOW: usize = 64;
/// Smallest file that can hold any supported envelope.
pub const MIN_ENVELOPE_SIZE: u64 = 32;

const AGE_ARMOR_MARKER: &[u8] = b"-----BEGIN AGE ENCRYPTED FILE-----";
const PGP_ARMOR_MARKER: &[u8] = b"-----BEGIN PGP MESSAGE-----";
const AGE_BINARY_MARKER: &[u8] = b"age-encryption.org/";

/// Outermost container format of a backup file
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Envelope {
    #[display("age (armored)")]
    AgeArmored,
    #[display("age (binary)")]
    AgeBinary,
    #[display("pgp (armored)")]
    PgpArmored,
    #[display("pgp (binary)")]
    PgpBinary,
}

impl Envelope {
    pub fn classify(header: &[u8]) -> Option<Envelope> {
        let text = header.trim_ascii_start();
        if text.starts_with(AGE_ARMOR_MARKER) {
            Some(Envelope::AgeArmored)
        } else if text.starts_with(PGP_ARMOR_MARKER) {
            Some(Envelope::PgpArmored)
        } else if header.starts_with(AGE_BINARY_MARKER) {
            Some(Envelope::AgeBinary)
        } else if header.first().is_some_and(|b| b & 0x80 != 0) {
            // OpenPGP packet tag: the high bit is always set.
            Some(Envelope::PgpBinary)
        } else {
            None
        }
    }

    pub fn kind(&self) -> EncryptionKind {
        match self {
            Envelope::AgeArmored | Envelope::AgeBinary => EncryptionKind::Age,
            Envelope::PgpArmored | Envelope::PgpBinary => EncryptionKind::Gpg,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// Classify the envelope from the first bytes; no decryption
    #[default]
    #[display("quick")]
    Quick,
    /// Decrypt and decompress the whole file, discarding the output
    #[display("full")]
    Full,
}

#[derive(Builder)]
pub struct VerifyJob {
    #[builder(into)]
    backup: PathBuf,
    #[builder(default)]
    mode: VerifyMode,
    /// Explicit method; detected from the backup file name when unset
    compression: Option<CompressionKind>,
    #[builder(default)]
    decryption: DecryptionSettings,
    /// In full mode, also check the archive framing and entry paths
    #[builder(default)]
    validate_archive: bool,
    #[builder(default)]
    options: PipelineOptions,
    #[builder(default)]
    cancel: CancellationToken,
    observer: Option<Arc<dyn PipelineObserver>>,
}

#[derive(Debug, Clone, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct VerifyReport {
    mode: VerifyMode,
    /// Set by a quick verify
    envelope: Option<Envelope>,
    file_bytes: u64,
    /// Decompressed bytes read by a full verify
    verified_bytes: u64,
    /// Archive entries seen when the archive was validated
    entries: Option<u64>,
}

impl VerifyJob {
    pub fn run(&self) -> Result<VerifyReport> {
        self.execute().map_err(|e| e.in_phase(Phase::Verify))
    }

    fn execute(&self) -> Result<VerifyReport> {
        check_backup_file(&self.backup)?;
        match self.mode {
            VerifyMode::Quick => self.quick(),
            VerifyMode::Full => self.full(),
        }
    }

    fn quick(&self) -> Result<VerifyReport> {
        let file_bytes = std::fs::metadata(&self.backup)?.len();
        if file_bytes < MIN_ENVELOPE_SIZE {
            return Err(Error::corruption_msg(format!(
                "backup {:?} is too small ({file_bytes} bytes) to hold an encrypted envelope",
                self.backup
            )));
        }

        let mut header = Vec::with_capacity(HEADER_WINDOW);
        File::open(&self.backup)?
            .take(HEADER_WINDOW as u64)
            .read_to_end(&mut header)?;
        let envelope = Envelope::classify(&header).ok_or_else(|| {
            Error::corruption_msg(format!(
                "backup {:?} does not start with a known encryption envelope",
                self.backup
            ))
        })?;

        let expected = self
            .decryption
            .kind
            .or_else(|| detect_encryption(&self.backup));
        if let Some(expected) = expected {
            if expected != envelope.kind() {
                return Err(Error::corruption_msg(format!(
                    "expected a {expected} envelope but found {envelope}"
                )));
            }
        }

        tracing::info!("{:?} has a {} envelope", self.backup, envelope);
        Ok(VerifyReport {
            mode: VerifyMode::Quick,
            envelope: Some(envelope),
            file_bytes,
            verified_bytes: 0,
            entries: None,
        })
    }

    fn full(&self) -> Result<VerifyReport> {
        let file_bytes = std::fs::metadata(&self.backup)?.len();
        let (compressor, encryptor) =
            resolve_transforms(&self.backup, self.compression, &self.decryption)?;
        tracing::info!(
            "Verifying {:?} ({} compression, {} encryption)",
            self.backup,
            compressor.kind(),
            encryptor.kind()
        );
        let (verified_bytes, entries) = self.run_stages(&compressor, &encryptor)?;
        tracing::info!("Verified {} decompressed bytes", verified_bytes);
        Ok(VerifyReport {
            mode: VerifyMode::Full,
            envelope: None,
            file_bytes,
            verified_bytes,
            entries,
        })
    }

    fn run_stages(
        &self,
        compressor: &CompressorConfig,
        encryptor: &EncryptorConfig,
    ) -> Result<(u64, Option<u64>)> {
        let run = self.cancel.child();
        let buffer_size = self.options.buffer_size();
        let runner = StageRunner::new(self.observer.as_deref(), &run);
        let (read_tx, read_rx) = self.options.pipe(&run);
        let (decrypt_tx, decrypt_rx) = self.options.pipe(&run);
        let (decompress_tx, decompress_rx) = self.options.pipe(&run);
        let last_stage = if self.validate_archive {
            Stage::Validate
        } else {
            Stage::Discard
        };

        let (read, decrypted, decompressed, consumed) = std::thread::scope(|s| {
            let runner = &runner;
            let read = s.spawn(move || {
                runner.run(Stage::Read, || read_stage(&self.backup, read_tx, buffer_size))
            });
            let decrypt = s.spawn(move || {
                runner.run(Stage::Decrypt, || {
                    transform_stage(read_rx, decrypt_tx, |input, output| {
                        encryptor.decode(input, output, buffer_size)
                    })
                })
            });
            let decompress = s.spawn(move || {
                runner.run(Stage::Decompress, || {
                    transform_stage(decrypt_rx, decompress_tx, |input, output| {
                        compressor.decode(input, output, buffer_size)
                    })
                })
            });
            let consumed = runner.run(last_stage, || {
                let mut input = CountingReader::new(decompress_rx);
                let entries = if self.validate_archive {
                    let options = DecodeOptions::builder()
                        .buffer_size(buffer_size)
                        .cancel(run.clone())
                        .build();
                    Some(validate(&mut input, &options)?.entries())
                } else {
                    copy_decoded(&mut input, &mut io::sink(), buffer_size)?;
                    None
                };
                Ok(((input.count(), entries), input.count()))
            });
            (
                join_stage(Stage::Read, read),
                join_stage(Stage::Decrypt, decrypt),
                join_stage(Stage::Decompress, decompress),
                consumed,
            )
        });

        match (read, decrypted, decompressed, consumed) {
            (Ok(()), Ok(()), Ok(()), Ok(result)) => Ok(result),
            (r, d, c, v) => Err(settle([r.err(), d.err(), c.err(), v.err()], &self.cancel)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarpipe::encrypt::age::AgeConfig;
    use crate::tarpipe::pipeline::backup::BackupJob;
    use crate::tarpipe::pipeline::tests::age_keys;
    use crate::tarpipe::result_error::error::ErrorKind;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn make_backup(dir: &Path, armor: bool) -> (PathBuf, DecryptionSettings) {
        let data = dir.join("data");
        fs::create_dir_all(data.join("subdir")).unwrap();
        fs::write(data.join("file1.txt"), "Hello, World!").unwrap();
        fs::write(data.join("subdir/file3.txt"), "Nested file content").unwrap();
        let out = dir.join("backups");
        fs::create_dir_all(&out).unwrap();

        let mut keys = age_keys();
        keys.armor = armor;
        let path = BackupJob::builder()
            .source(&data)
            .destination(&out)
            .compressor(CompressorConfig::from_kind(CompressionKind::Zstd))
            .encryptor(EncryptorConfig::Age(AgeConfig::builder().keys(keys.clone()).build()))
            .build()
            .run()
            .unwrap()
            .completed()
            .unwrap()
            .output()
            .clone();
        (path, DecryptionSettings::builder().keys(keys).build())
    }

    fn quick(path: &Path) -> Result<VerifyReport> {
        VerifyJob::builder().backup(path).build().run()
    }

    #[test]
    fn test_classify_envelopes() {
        assert_eq!(
            Envelope::classify(b"-----BEGIN AGE ENCRYPTED FILE-----\nYWdl"),
            Some(Envelope::AgeArmored)
        );
        assert_eq!(
            Envelope::classify(b"\n-----BEGIN PGP MESSAGE-----\n\nhQEM"),
            Some(Envelope::PgpArmored)
        );
        assert_eq!(
            Envelope::classify(b"age-encryption.org/v1\n-> X25519"),
            Some(Envelope::AgeBinary)
        );
        assert_eq!(Envelope::classify(&[0x8c, 0x0d, 0x04]), Some(Envelope::PgpBinary));
        assert_eq!(Envelope::classify(b"PK\x03\x04 zip file"), None);
        assert_eq!(Envelope::AgeBinary.kind(), EncryptionKind::Age);
    }

    #[test]
    fn test_quick_rejects_tiny_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup_x.tar.age");
        fs::write(&path, b"age-encryption.org/").unwrap();
        let err = quick(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn test_quick_accepts_armored_marker_without_decrypting() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup_x.tar.gz.age");
        let mut content = AGE_ARMOR_MARKER.to_vec();
        content.extend_from_slice(b"\nnot really ciphertext, never decrypted\n");
        fs::write(&path, content).unwrap();

        let report = quick(&path).unwrap();
        assert_eq!(report.envelope(), Some(Envelope::AgeArmored));
        assert_eq!(report.verified_bytes(), 0);
    }

    #[test]
    fn test_quick_rejects_unknown_or_mismatched_envelope() {
        let dir = TempDir::new().unwrap();
        let garbage = dir.path().join("backup_x.tar.age");
        fs::write(&garbage, [b'x'; 100]).unwrap();
        assert_eq!(quick(&garbage).unwrap_err().kind(), ErrorKind::Corruption);

        let mismatched = dir.path().join("backup_x.tar.gpg");
        let mut content = AGE_BINARY_MARKER.to_vec();
        content.extend_from_slice(&[0u8; 64]);
        fs::write(&mismatched, content).unwrap();
        let err = quick(&mismatched).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
        assert!(err.to_string().starts_with("verify failed"));
    }

    #[test]
    fn test_quick_on_real_backups() {
        for armor in [false, true] {
            let dir = TempDir::new().unwrap();
            let (path, _) = make_backup(dir.path(), armor);
            let expected = if armor {
                Envelope::AgeArmored
            } else {
                Envelope::AgeBinary
            };
            assert_eq!(quick(&path).unwrap().envelope(), Some(expected));
        }
    }

    #[test]
    fn test_full_verify_counts_decompressed_bytes() {
        let dir = TempDir::new().unwrap();
        let (path, decryption) = make_backup(dir.path(), false);

        let report = VerifyJob::builder()
            .backup(&path)
            .mode(VerifyMode::Full)
            .decryption(decryption.clone())
            .options(PipelineOptions::builder().buffer_size(100).depth(1).build())
            .build()
            .run()
            .unwrap();
        assert!(report.verified_bytes() > 0);
        assert_eq!(report.verified_bytes() % 512, 0);
        assert_eq!(report.entries(), None);

        let report = VerifyJob::builder()
            .backup(&path)
            .mode(VerifyMode::Full)
            .decryption(decryption)
            .validate_archive(true)
            .build()
            .run()
            .unwrap();
        assert_eq!(report.entries(), Some(4));
    }

    #[test]
    fn test_full_verify_detects_damage() {
        let dir = TempDir::new().unwrap();
        let (path, decryption) = make_backup(dir.path(), false);
        let mut bytes = fs::read(&path).unwrap();
        let middle = bytes.len() - 40;
        bytes[middle] ^= 0x01;
        fs::write(&path, bytes).unwrap();

        let err = VerifyJob::builder()
            .backup(&path)
            .mode(VerifyMode::Full)
            .decryption(decryption)
            .build()
            .run()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
        assert_eq!(err.stage(), Some(Stage::Decrypt));
    }

    #[test]
    fn test_full_verify_observes_cancellation() {
        let dir = TempDir::new().unwrap();
        let (path, decryption) = make_backup(dir.path(), false);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = VerifyJob::builder()
            .backup(&path)
            .mode(VerifyMode::Full)
            .decryption(decryption)
            .cancel(cancel)
            .build()
            .run()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
