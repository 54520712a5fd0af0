use clap::{ArgAction, Args, Parser, Subcommand};
use k_tarpipe::tarpipe::archive::encode::ExcludePattern;
use k_tarpipe::tarpipe::compress::{CompressionKind, CompressorConfig};
use k_tarpipe::tarpipe::config::ToolConfig;
use k_tarpipe::tarpipe::encrypt::{DecryptionSettings, EncryptionKind, EncryptorConfig, KeyMaterial};
use k_tarpipe::tarpipe::pipeline::backup::BackupJob;
use k_tarpipe::tarpipe::pipeline::restore::RestoreJob;
use k_tarpipe::tarpipe::pipeline::verify::{VerifyJob, VerifyMode};
use k_tarpipe::tarpipe::pipeline::{Outcome, PipelineEvent, PipelineObserver, PipelineOptions};
use k_tarpipe::tarpipe::redacted::RedactedString;
use k_tarpipe::tarpipe::result_error::error::{Error, ErrorKind};
use k_tarpipe::tarpipe::result_error::result::Result;
use k_tarpipe::tarpipe::result_error::WithMsg;
use k_tarpipe::tarpipe::stream::CancellationToken;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Level};
use validator::Validate;

static PASSPHRASE_ENV: &str = "K_TARPIPE_PASSPHRASE";

/// Encrypted, compressed tar backups
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Location of an optional YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Archive, compress and encrypt a file or directory into a new backup file
    Backup {
        source: PathBuf,
        /// Directory for the backup file, `backup_dir` from the config when unset
        destination: Option<PathBuf>,
        #[arg(long, value_parser = compression_kind)]
        compression: Option<CompressionKind>,
        #[arg(long, value_parser = encryption_kind)]
        encryption: Option<EncryptionKind>,
        /// Glob of paths to leave out, relative to the source; repeatable
        #[arg(long)]
        exclude: Vec<String>,
        /// Print the plan without writing anything
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        keys: KeyArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Decrypt, decompress and extract a backup file
    Restore {
        backup: PathBuf,
        destination: PathBuf,
        /// Restore into a non-empty destination, overwriting files
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, value_parser = compression_kind)]
        compression: Option<CompressionKind>,
        #[arg(long, value_parser = encryption_kind)]
        encryption: Option<EncryptionKind>,
        #[command(flatten)]
        keys: KeyArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Check a backup file without restoring it
    Verify {
        backup: PathBuf,
        /// Decrypt and decompress the whole file instead of checking its envelope
        #[arg(long)]
        full: bool,
        /// With --full, also walk the archive and check every entry path
        #[arg(long, requires = "full")]
        validate_archive: bool,
        #[arg(long, value_parser = compression_kind)]
        compression: Option<CompressionKind>,
        #[arg(long, value_parser = encryption_kind)]
        encryption: Option<EncryptionKind>,
        #[command(flatten)]
        keys: KeyArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}

#[derive(Args, Debug)]
struct KeyArgs {
    /// File holding the passphrase; K_TARPIPE_PASSPHRASE is read when unset
    #[arg(long)]
    passphrase_file: Option<PathBuf>,
    /// age or gpg recipient; repeatable
    #[arg(long)]
    recipient: Vec<String>,
    /// age identity file
    #[arg(long)]
    identity_file: Option<PathBuf>,
    /// ASCII-armored output
    #[arg(long)]
    armor: bool,
    #[arg(long)]
    gpg_program: Option<PathBuf>,
    #[arg(long)]
    gpg_homedir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Bytes per chunk handed between stages
    #[arg(long)]
    buffer_size: Option<usize>,
    /// Chunks queued between two stages
    #[arg(long)]
    depth: Option<usize>,
}

fn compression_kind(s: &str) -> std::result::Result<CompressionKind, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn encryption_kind(s: &str) -> std::result::Result<EncryptionKind, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

/// Logs stage events; shown with -v.
struct LogObserver;

impl PipelineObserver for LogObserver {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageStarted { stage } => debug!("stage {stage} started"),
            PipelineEvent::StageFinished { stage, bytes } => {
                debug!("stage {stage} finished after {bytes} bytes")
            }
            PipelineEvent::StageFailed { stage, message } => {
                debug!("stage {stage} failed: {message}")
            }
        }
    }
}

impl KeyArgs {
    /// Overlays the flags that were given onto the keys from the config file.
    fn apply(&self, mut keys: KeyMaterial) -> Result<KeyMaterial> {
        if let Some(file) = &self.passphrase_file {
            let text = std::fs::read_to_string(file)
                .map_err(Error::from)
                .with_msg(format!("Read passphrase file failed: {:?}", file))?;
            keys.passphrase = Some(RedactedString::new(text.trim_end_matches(['\r', '\n'])));
        } else if let Ok(text) = std::env::var(PASSPHRASE_ENV) {
            keys.passphrase = Some(RedactedString::new(text));
        }
        if !self.recipient.is_empty() {
            keys.recipients = self.recipient.clone();
        }
        if self.identity_file.is_some() {
            keys.identity_file = self.identity_file.clone();
        }
        keys.armor |= self.armor;
        keys.validate().map_err(Error::from)?;
        Ok(keys)
    }

    fn decryption(&self, kind: Option<EncryptionKind>, config: &ToolConfig) -> Result<DecryptionSettings> {
        let base = config.decryption();
        Ok(DecryptionSettings {
            kind: kind.or(base.kind),
            keys: self.apply(base.keys)?,
            gpg_program: self.gpg_program.clone().or(base.gpg_program),
            gpg_homedir: self.gpg_homedir.clone().or(base.gpg_homedir),
        })
    }

    fn encryptor(&self, kind: Option<EncryptionKind>, config: &ToolConfig) -> Result<EncryptorConfig> {
        let settings = self.decryption(kind, config)?;
        let kind = settings.kind.ok_or_else(|| {
            Error::user_actionable(
                "no encryption method configured",
                "pass --encryption age|gpg or set `encryptor` in the config file",
            )
        })?;
        Ok(settings.for_kind(kind))
    }
}

impl PipelineArgs {
    fn apply(&self, config: &ToolConfig) -> Result<PipelineOptions> {
        let options = PipelineOptions::builder()
            .buffer_size(self.buffer_size.unwrap_or(config.pipeline.buffer_size()))
            .depth(self.depth.unwrap_or(config.pipeline.depth()))
            .build();
        options.validate().map_err(Error::from)?;
        Ok(options)
    }
}

/// Cancels `token` on the first Ctrl-C; the running stages then wind down and clean up.
fn cancel_on_ctrl_c(token: CancellationToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::spawn(move || {
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping");
                token.cancel();
            }
        })
    });
    Ok(())
}

fn print_outcome<R>(outcome: Outcome<R>, report: impl FnOnce(R)) {
    match outcome {
        Outcome::Planned(plan) => println!("{plan}"),
        Outcome::Completed(r) => report(r),
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ToolConfig::load(path)?,
        None => ToolConfig::default(),
    };
    let observer: Arc<dyn PipelineObserver> = Arc::new(LogObserver);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone())?;

    match cli.command {
        Command::Backup {
            source,
            destination,
            compression,
            encryption,
            exclude,
            dry_run,
            keys,
            pipeline,
        } => {
            let destination = destination.or_else(|| config.backup_dir.clone()).ok_or_else(|| {
                Error::user_actionable(
                    "no backup destination given",
                    "pass a destination directory or set `backup_dir` in the config file",
                )
            })?;
            let compressor = match compression {
                Some(kind) if kind != config.compressor.kind() => CompressorConfig::from_kind(kind),
                _ => config.compressor.clone(),
            };
            let mut patterns = config.exclude.clone();
            for p in &exclude {
                patterns.push(ExcludePattern::new(p)?);
            }
            let outcome = BackupJob::builder()
                .source(source)
                .destination(destination)
                .compressor(compressor)
                .encryptor(keys.encryptor(encryption, &config)?)
                .exclude(patterns)
                .options(pipeline.apply(&config)?)
                .dry_run(dry_run)
                .cancel(cancel)
                .observer(observer)
                .build()
                .run()?;
            print_outcome(outcome, |report| {
                info!(
                    "Archived {} entries, {} source bytes, {} bytes written",
                    report.entries(),
                    report.source_bytes(),
                    report.artifact_bytes()
                );
                println!("{}", report.output().display());
            });
        }
        Command::Restore {
            backup,
            destination,
            force,
            dry_run,
            compression,
            encryption,
            keys,
            pipeline,
        } => {
            let outcome = RestoreJob::builder()
                .backup(backup)
                .destination(destination)
                .maybe_compression(compression)
                .decryption(keys.decryption(encryption, &config)?)
                .force(force)
                .options(pipeline.apply(&config)?)
                .dry_run(dry_run)
                .cancel(cancel)
                .observer(observer)
                .build()
                .run()?;
            print_outcome(outcome, |report| {
                println!(
                    "Restored {} entries ({} bytes) into {}",
                    report.entries(),
                    report.payload_bytes(),
                    report.destination().display()
                );
            });
        }
        Command::Verify {
            backup,
            full,
            validate_archive,
            compression,
            encryption,
            keys,
            pipeline,
        } => {
            let mode = if full { VerifyMode::Full } else { VerifyMode::Quick };
            let report = VerifyJob::builder()
                .backup(&backup)
                .mode(mode)
                .maybe_compression(compression)
                .decryption(keys.decryption(encryption, &config)?)
                .validate_archive(validate_archive)
                .options(pipeline.apply(&config)?)
                .cancel(cancel)
                .observer(observer)
                .build()
                .run()?;
            match report.envelope() {
                Some(envelope) => println!("{}: OK ({envelope})", backup.display()),
                None => println!(
                    "{}: OK ({} bytes decoded{})",
                    backup.display(),
                    report.verified_bytes(),
                    report
                        .entries()
                        .map(|n| format!(", {n} entries"))
                        .unwrap_or_default()
                ),
            }
        }
    }
    Ok(())
}

fn exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Io => 1,
        ErrorKind::UserActionable | ErrorKind::Configuration => 2,
        ErrorKind::Security => 3,
        ErrorKind::Corruption => 4,
        ErrorKind::Cancelled => 130,
    }
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        error!("{e}");
        exit(exit_code(e.kind()));
    }
}
