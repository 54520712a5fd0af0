use crate::tarpipe::archive::decode::{decode, DecodeOptions};
use crate::tarpipe::archive::DecodeStats;
use crate::tarpipe::compress::{CompressionKind, CompressorConfig};
use crate::tarpipe::detect::resolve_methods;
use crate::tarpipe::encrypt::{DecryptionSettings, EncryptorConfig};
use crate::tarpipe::pipeline::destination::check_destination;
use crate::tarpipe::pipeline::{
    join_stage, read_stage, settle, transform_stage, Outcome, Phase, PipelineObserver,
    PipelineOptions, Plan, Stage, StageRunner,
};
use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use crate::tarpipe::stream::{CancellationToken, CountingReader};
use crate::tarpipe::transform::StreamTransform;
use bon::Builder;
use getset::{CopyGetters, Getters};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One restore run: backup file → decrypt → decompress → extract into the destination.
///
/// A run that fails part way leaves whatever was already extracted in place.
#[derive(Builder)]
pub struct RestoreJob {
    #[builder(into)]
    backup: PathBuf,
    #[builder(into)]
    destination: PathBuf,
    /// Explicit method; detected from the backup file name when unset
    compression: Option<CompressionKind>,
    #[builder(default)]
    decryption: DecryptionSettings,
    #[builder(default)]
    force: bool,
    #[builder(default)]
    options: PipelineOptions,
    #[builder(default)]
    dry_run: bool,
    #[builder(default)]
    cancel: CancellationToken,
    observer: Option<Arc<dyn PipelineObserver>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct RestoreReport {
    #[getset(get = "pub")]
    destination: PathBuf,
    #[getset(get_copy = "pub")]
    entries: u64,
    #[getset(get_copy = "pub")]
    payload_bytes: u64,
}

/// Fails unless `path` is an existing regular file.
pub(crate) fn check_backup_file(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(m) if m.is_file() => Ok(()),
        Ok(_) => Err(Error::user_actionable(
            format!("backup {path:?} is not a file"),
            "pass the path of a backup file",
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::user_actionable(
            format!("backup file {path:?} does not exist"),
            "check the path of the backup file",
        )),
        Err(e) => Err(e.into()),
    }
}

/// Compressor and encryptor for an existing backup, from explicit settings or its file name.
pub(crate) fn resolve_transforms(
    backup: &Path,
    compression: Option<CompressionKind>,
    decryption: &DecryptionSettings,
) -> Result<(CompressorConfig, EncryptorConfig)> {
    let (compression, encryption) = resolve_methods(backup, compression, decryption.kind)?;
    Ok((
        CompressorConfig::from_kind(compression),
        decryption.for_kind(encryption),
    ))
}

impl RestoreJob {
    pub fn run(&self) -> Result<Outcome<RestoreReport>> {
        self.execute().map_err(|e| e.in_phase(Phase::Restore))
    }

    fn execute(&self) -> Result<Outcome<RestoreReport>> {
        check_backup_file(&self.backup)?;
        let (compressor, encryptor) =
            resolve_transforms(&self.backup, self.compression, &self.decryption)?;
        check_destination(&self.destination, self.force)?;

        if self.dry_run {
            tracing::info!("Dry run, not restoring {:?}", self.backup);
            return Ok(Outcome::Planned(Plan {
                phase: Phase::Restore,
                stages: vec![Stage::Read, Stage::Decrypt, Stage::Decompress, Stage::Extract],
                input: self.backup.clone(),
                output: self.destination.clone(),
            }));
        }

        tracing::info!(
            "Restoring {:?} into {:?} ({} compression, {} encryption)",
            self.backup,
            self.destination,
            compressor.kind(),
            encryptor.kind()
        );
        std::fs::create_dir_all(&self.destination)?;
        let stats = self.run_stages(&compressor, &encryptor)?;
        Ok(Outcome::Completed(RestoreReport {
            destination: self.destination.clone(),
            entries: stats.entries(),
            payload_bytes: stats.payload_bytes(),
        }))
    }

    fn run_stages(
        &self,
        compressor: &CompressorConfig,
        encryptor: &EncryptorConfig,
    ) -> Result<DecodeStats> {
        let run = self.cancel.child();
        let buffer_size = self.options.buffer_size();
        let runner = StageRunner::new(self.observer.as_deref(), &run);
        let (read_tx, read_rx) = self.options.pipe(&run);
        let (decrypt_tx, decrypt_rx) = self.options.pipe(&run);
        let (decompress_tx, decompress_rx) = self.options.pipe(&run);
        let decode_options = DecodeOptions::builder()
            .buffer_size(buffer_size)
            .cancel(run.clone())
            .build();

        let (read, decrypted, decompressed, extracted) = std::thread::scope(|s| {
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
            let extracted = runner.run(Stage::Extract, || {
                let mut input = CountingReader::new(decompress_rx);
                let stats = decode(&mut input, &self.destination, &decode_options)?;
                Ok((stats, input.count()))
            });
            (
                join_stage(Stage::Read, read),
                join_stage(Stage::Decrypt, decrypt),
                join_stage(Stage::Decompress, decompress),
                extracted,
            )
        });

        match (read, decrypted, decompressed, extracted) {
            (Ok(()), Ok(()), Ok(()), Ok(stats)) => Ok(stats),
            (r, d, c, x) => Err(settle([r.err(), d.err(), c.err(), x.err()], &self.cancel)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarpipe::compress::zstandard::ZstdConfig;
    use crate::tarpipe::encrypt::age::AgeConfig;
    use crate::tarpipe::encrypt::{EncryptionKind, KeyMaterial};
    use crate::tarpipe::pipeline::backup::BackupJob;
    use crate::tarpipe::pipeline::tests::{age_keys, RecordingObserver};
    use crate::tarpipe::result_error::error::ErrorKind;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        keys: KeyMaterial,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                temp: TempDir::new().unwrap(),
                keys: age_keys(),
            }
        }

        fn source(&self) -> PathBuf {
            let data = self.temp.path().join("data");
            fs::create_dir_all(data.join("subdir")).unwrap();
            fs::write(data.join("file1.txt"), "Hello, World!").unwrap();
            fs::write(data.join("file2.txt"), "...").unwrap();
            fs::write(data.join("subdir/file3.txt"), "Nested file content").unwrap();
            #[cfg(unix)]
            std::os::unix::fs::symlink("data.txt", data.join("alias.txt")).unwrap();
            data
        }

        fn backup(&self, compressor: CompressorConfig, armor: bool) -> PathBuf {
            let out = self.temp.path().join("backups");
            fs::create_dir_all(&out).unwrap();
            let mut keys = self.keys.clone();
            keys.armor = armor;
            BackupJob::builder()
                .source(self.source())
                .destination(&out)
                .compressor(compressor)
                .encryptor(EncryptorConfig::Age(AgeConfig::builder().keys(keys).build()))
                .options(PipelineOptions::builder().buffer_size(64).depth(4).build())
                .build()
                .run()
                .unwrap()
                .completed()
                .unwrap()
                .output()
                .clone()
        }

        fn decryption(&self) -> DecryptionSettings {
            DecryptionSettings::builder().keys(self.keys.clone()).build()
        }
    }

    #[test]
    fn test_end_to_end_backup_then_restore() {
        for (compressor, armor) in [
            (CompressorConfig::None, false),
            (CompressorConfig::from_kind(CompressionKind::Gzip), true),
            (CompressorConfig::Zstd(ZstdConfig::default()), false),
            (CompressorConfig::Lz4, true),
            (CompressorConfig::from_kind(CompressionKind::Xz), false),
        ] {
            let fixture = Fixture::new();
            let backup = fixture.backup(compressor, armor);
            let dest = fixture.temp.path().join("restored");
            let observer = Arc::new(RecordingObserver::default());

            let report = RestoreJob::builder()
                .backup(&backup)
                .destination(&dest)
                .decryption(fixture.decryption())
                .options(PipelineOptions::builder().buffer_size(32).depth(1).build())
                .observer(observer.clone())
                .build()
                .run()
                .unwrap()
                .completed()
                .unwrap();

            let out = dest.join("data");
            assert_eq!(fs::read_to_string(out.join("file1.txt")).unwrap(), "Hello, World!");
            assert_eq!(fs::read_to_string(out.join("file2.txt")).unwrap(), "...");
            assert_eq!(
                fs::read_to_string(out.join("subdir/file3.txt")).unwrap(),
                "Nested file content"
            );
            #[cfg(unix)]
            {
                let link = out.join("alias.txt");
                assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
                assert_eq!(fs::read_link(&link).unwrap(), Path::new("data.txt"));
            }
            assert_eq!(report.payload_bytes(), 13 + 3 + 19);
            assert_eq!(observer.finished().len(), 4);
        }
    }

    #[test]
    fn test_non_empty_destination_is_refused_without_force() {
        let fixture = Fixture::new();
        let backup = fixture.backup(CompressorConfig::Lz4, false);
        let dest = fixture.temp.path().join("busy");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("keep.txt"), "mine").unwrap();

        let job = |force| {
            RestoreJob::builder()
                .backup(&backup)
                .destination(&dest)
                .decryption(fixture.decryption())
                .force(force)
                .build()
                .run()
        };
        let err = job(false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserActionable);
        let text = err.to_string();
        assert!(text.contains("not empty"));
        assert!(text.contains("--force"));
        assert!(!dest.join("data").exists());

        job(true).unwrap();
        assert_eq!(fs::read_to_string(dest.join("keep.txt")).unwrap(), "mine");
        assert!(dest.join("data/file1.txt").exists());
    }

    #[test]
    fn test_dry_run_extracts_nothing() {
        let fixture = Fixture::new();
        let backup = fixture.backup(CompressorConfig::None, false);
        let dest = fixture.temp.path().join("restored");
        let outcome = RestoreJob::builder()
            .backup(&backup)
            .destination(&dest)
            .decryption(fixture.decryption())
            .dry_run(true)
            .build()
            .run()
            .unwrap();
        assert!(matches!(outcome, Outcome::Planned(ref plan) if plan.stages().len() == 4));
        assert!(!dest.exists());
    }

    #[test]
    fn test_wrong_identity_is_corruption_in_decrypt_stage() {
        let fixture = Fixture::new();
        let backup = fixture.backup(CompressorConfig::Lz4, false);
        let err = RestoreJob::builder()
            .backup(&backup)
            .destination(fixture.temp.path().join("restored"))
            .decryption(DecryptionSettings::builder().keys(age_keys()).build())
            .build()
            .run()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
        assert_eq!(err.stage(), Some(Stage::Decrypt));
        assert!(err.to_string().starts_with("restore failed"));
    }

    #[test]
    fn test_missing_backup_and_unknown_name_are_user_actionable() {
        let fixture = Fixture::new();
        let err = RestoreJob::builder()
            .backup(fixture.temp.path().join("missing.tar.age"))
            .destination(fixture.temp.path().join("restored"))
            .build()
            .run()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserActionable);

        let odd = fixture.temp.path().join("backup.bin");
        fs::write(&odd, b"whatever").unwrap();
        let err = RestoreJob::builder()
            .backup(&odd)
            .destination(fixture.temp.path().join("restored"))
            .build()
            .run()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserActionable);
    }

    #[test]
    fn test_explicit_methods_override_file_name() {
        let fixture = Fixture::new();
        let backup = fixture.backup(CompressorConfig::Lz4, false);
        let renamed = fixture.temp.path().join("renamed.bin");
        fs::rename(&backup, &renamed).unwrap();

        let dest = fixture.temp.path().join("restored");
        RestoreJob::builder()
            .backup(&renamed)
            .destination(&dest)
            .compression(CompressionKind::Lz4)
            .decryption(
                DecryptionSettings::builder()
                    .kind(EncryptionKind::Age)
                    .keys(fixture.keys.clone())
                    .build(),
            )
            .build()
            .run()
            .unwrap();
        assert!(dest.join("data/subdir/file3.txt").exists());
    }

    #[test]
    fn test_truncated_backup_fails() {
        let fixture = Fixture::new();
        let backup = fixture.backup(CompressorConfig::from_kind(CompressionKind::Gzip), false);
        let bytes = fs::read(&backup).unwrap();
        fs::write(&backup, &bytes[..bytes.len() / 2]).unwrap();

        let err = RestoreJob::builder()
            .backup(&backup)
            .destination(fixture.temp.path().join("restored"))
            .decryption(fixture.decryption())
            .build()
            .run()
            .unwrap_err();
        assert!(!err.is_interruption());
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }
}
