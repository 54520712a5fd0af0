use crate::tarpipe::archive::encode::{encode, EncodeOptions, ExcludePattern};
use crate::tarpipe::archive::{EncodeStats, SourceRoot};
use crate::tarpipe::commit::AtomicFile;
use crate::tarpipe::compress::CompressorConfig;
use crate::tarpipe::detect::backup_file_name;
use crate::tarpipe::encrypt::EncryptorConfig;
use crate::tarpipe::pipeline::{
    join_stage, settle, transform_stage, Outcome, Phase, PipelineObserver, PipelineOptions, Plan,
    Stage, StageRunner,
};
use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use crate::tarpipe::stream::{copy_buffered, CancellationToken, CountingWriter};
use crate::tarpipe::transform::StreamTransform;
use bon::Builder;
use getset::{CopyGetters, Getters};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// One backup run: source tree → archive → compress → encrypt → atomic output file.
#[derive(Builder)]
pub struct BackupJob {
    /// File or directory to back up
    #[builder(into)]
    source: PathBuf,
    /// Existing directory the backup file is written to
    #[builder(into)]
    destination: PathBuf,
    #[builder(default)]
    compressor: CompressorConfig,
    encryptor: EncryptorConfig,
    #[builder(default)]
    exclude: Vec<ExcludePattern>,
    #[builder(default)]
    options: PipelineOptions,
    #[builder(default)]
    dry_run: bool,
    #[builder(default)]
    cancel: CancellationToken,
    observer: Option<Arc<dyn PipelineObserver>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct BackupReport {
    #[getset(get = "pub")]
    output: PathBuf,
    /// Payload bytes of the archived files
    #[getset(get_copy = "pub")]
    source_bytes: u64,
    /// Size of the final backup file
    #[getset(get_copy = "pub")]
    artifact_bytes: u64,
    #[getset(get_copy = "pub")]
    entries: u64,
}

impl BackupJob {
    pub fn run(&self) -> Result<Outcome<BackupReport>> {
        self.execute().map_err(|e| e.in_phase(Phase::Backup))
    }

    fn resolve_source(&self) -> Result<SourceRoot> {
        SourceRoot::resolve(&self.source).map_err(|e| match e {
            Error::Io(io) if io.kind() == io::ErrorKind::NotFound => Error::UserActionable {
                message: format!("source {:?} does not exist", self.source),
                hint: "check the path of the file or directory to back up".into(),
                cause: Some(Box::new(io.into())),
            },
            e => e,
        })
    }

    fn check_destination(&self) -> Result<()> {
        match std::fs::metadata(&self.destination) {
            Ok(m) if m.is_dir() => Ok(()),
            Ok(_) => Err(Error::user_actionable(
                format!("backup destination {:?} is not a directory", self.destination),
                "pass a directory to write the backup file into",
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::user_actionable(
                format!("backup destination {:?} does not exist", self.destination),
                "create the directory first",
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn execute(&self) -> Result<Outcome<BackupReport>> {
        let source = self.resolve_source()?;
        self.check_destination()?;
        self.encryptor.check_can_encrypt()?;

        let name = backup_file_name(
            &source.basename(),
            &chrono::Local::now(),
            self.compressor.kind(),
            self.encryptor.kind(),
        );
        if self.dry_run {
            tracing::info!("Dry run, not writing {:?}", name);
            return Ok(Outcome::Planned(Plan {
                phase: Phase::Backup,
                stages: vec![Stage::Archive, Stage::Compress, Stage::Encrypt, Stage::Write],
                input: source.path().clone(),
                output: self.destination.join(&name),
            }));
        }

        tracing::info!(
            "Backing up {} {:?} to {:?} ({} compression, {} encryption)",
            if source.is_dir() { "directory" } else { "file" },
            source.path(),
            self.destination.join(&name),
            self.compressor.kind(),
            self.encryptor.kind()
        );
        let mut output = AtomicFile::create(&self.destination, &name)?;
        tracing::debug!("Writing to temporary file {:?}", output.tmp_path());
        match self.run_stages(&source, &mut output) {
            Ok((stats, artifact_bytes)) => {
                let output = output.commit()?;
                Ok(Outcome::Completed(BackupReport {
                    output,
                    source_bytes: stats.payload_bytes(),
                    artifact_bytes,
                    entries: stats.entries(),
                }))
            }
            Err(e) => Err(match output.abort() {
                Ok(()) => e,
                Err(e2) => e.chain(e2),
            }),
        }
    }

    fn run_stages(&self, source: &SourceRoot, output: &mut AtomicFile) -> Result<(EncodeStats, u64)> {
        let run = self.cancel.child();
        let buffer_size = self.options.buffer_size();
        let runner = StageRunner::new(self.observer.as_deref(), &run);
        let (archive_tx, archive_rx) = self.options.pipe(&run);
        let (compress_tx, compress_rx) = self.options.pipe(&run);
        let (encrypt_tx, mut encrypt_rx) = self.options.pipe(&run);
        let encode_options = EncodeOptions::builder()
            .exclude(self.exclude.clone())
            .buffer_size(buffer_size)
            .cancel(run.clone())
            .build();

        let (archived, compressed, encrypted, written) = std::thread::scope(|s| {
            let runner = &runner;
            let archive = s.spawn(move || {
                runner.run(Stage::Archive, || {
                    let (writer, stats) =
                        encode(source, CountingWriter::new(archive_tx), &encode_options)?;
                    let bytes = writer.count();
                    writer.into_inner().close()?;
                    Ok((stats, bytes))
                })
            });
            let compress = s.spawn(move || {
                runner.run(Stage::Compress, || {
                    transform_stage(archive_rx, compress_tx, |input, output| {
                        self.compressor.encode(input, output, buffer_size)
                    })
                })
            });
            let encrypt = s.spawn(move || {
                runner.run(Stage::Encrypt, || {
                    transform_stage(compress_rx, encrypt_tx, |input, output| {
                        self.encryptor.encode(input, output, buffer_size)
                    })
                })
            });
            let written = runner.run(Stage::Write, || {
                let bytes = copy_buffered(&mut encrypt_rx, output, buffer_size)?;
                Ok((bytes, bytes))
            });
            drop(encrypt_rx);
            (
                join_stage(Stage::Archive, archive),
                join_stage(Stage::Compress, compress),
                join_stage(Stage::Encrypt, encrypt),
                written,
            )
        });

        match (archived, compressed, encrypted, written) {
            (Ok(stats), Ok(()), Ok(()), Ok(bytes)) => Ok((stats, bytes)),
            (a, c, e, w) => Err(settle([a.err(), c.err(), e.err(), w.err()], &self.cancel)),
        }
    }
}
