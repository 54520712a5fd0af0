//! Backup, restore and verify runs built from concurrently running stages.
//!
//! Adjacent stages are joined by a bounded [`pipe`](crate::tarpipe::stream::pipe). Every stage but the
//! last runs on its own scoped thread; the last one runs on the calling thread, which is the
//! only one touching the output file or the destination tree. A run returns only after every
//! stage has finished.

pub mod backup;
pub mod destination;
pub mod restore;
pub mod verify;

use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use crate::tarpipe::stream::{copy_buffered, panicked, pipe, CancellationToken, CountingWriter, PipeReader, PipeWriter};
use bon::Builder;
use derive_more::Display;
use getset::CopyGetters;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::thread::ScopedJoinHandle;
use validator::Validate;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_PIPE_DEPTH: usize = 16;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Stage {
    #[display("archive")]
    Archive,
    #[display("compress")]
    Compress,
    #[display("encrypt")]
    Encrypt,
    #[display("write")]
    Write,
    #[display("read")]
    Read,
    #[display("decrypt")]
    Decrypt,
    #[display("decompress")]
    Decompress,
    #[display("extract")]
    Extract,
    #[display("validate")]
    Validate,
    #[display("discard")]
    Discard,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Phase {
    #[display("backup")]
    Backup,
    #[display("restore")]
    Restore,
    #[display("verify")]
    Verify,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_depth() -> usize {
    DEFAULT_PIPE_DEPTH
}

/// Sizing of the streams between stages
///
/// Only throughput depends on these; any value of at least one byte and one chunk is correct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Validate, Builder, CopyGetters)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct PipelineOptions {
    /// Bytes per copy buffer and per chunk handed between stages
    #[serde(default = "default_buffer_size")]
    #[builder(default = DEFAULT_BUFFER_SIZE)]
    #[validate(range(min = 1, max = 67108864))]
    buffer_size: usize,
    /// Chunks that may be queued between two stages
    #[serde(default = "default_depth")]
    #[builder(default = DEFAULT_PIPE_DEPTH)]
    #[validate(range(min = 1, max = 4096))]
    depth: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PipelineOptions {
    pub(crate) fn pipe(&self, token: &CancellationToken) -> (PipeWriter, PipeReader) {
        pipe(self.buffer_size, self.depth, token.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineEvent {
    StageStarted { stage: Stage },
    StageFinished { stage: Stage, bytes: u64 },
    StageFailed { stage: Stage, message: String },
}

/// Receives stage events for progress or verbose output. Called from stage threads.
pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// What a dry run would have done
#[derive(Clone, Debug, PartialEq, Eq, CopyGetters)]
pub struct Plan {
    #[getset(get_copy = "pub")]
    phase: Phase,
    stages: Vec<Stage>,
    input: PathBuf,
    output: PathBuf,
}

impl Plan {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn input(&self) -> &PathBuf {
        &self.input
    }

    pub fn output(&self) -> &PathBuf {
        &self.output
    }
}

impl Display for Plan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} plan:", self.phase)?;
        writeln!(f, "  stages: {}", self.stages.iter().join(" -> "))?;
        writeln!(f, "  input:  {}", self.input.display())?;
        write!(f, "  output: {}", self.output.display())
    }
}

/// Result of a run that may have been a dry run
#[derive(Debug)]
pub enum Outcome<R> {
    Planned(Plan),
    Completed(R),
}

impl<R> Outcome<R> {
    pub fn completed(self) -> Option<R> {
        match self {
            Outcome::Completed(report) => Some(report),
            Outcome::Planned(_) => None,
        }
    }
}

/// Runs stage bodies, reporting them to the observer and stopping the run on real failures.
pub(crate) struct StageRunner<'a> {
    observer: Option<&'a dyn PipelineObserver>,
    token: &'a CancellationToken,
}

impl<'a> StageRunner<'a> {
    pub(crate) fn new(
        observer: Option<&'a dyn PipelineObserver>,
        token: &'a CancellationToken,
    ) -> Self {
        Self { observer, token }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(observer) = self.observer {
            observer.on_event(&event);
        }
    }

    /// `body` returns its value and the number of bytes it passed on.
    pub(crate) fn run<T>(&self, stage: Stage, body: impl FnOnce() -> Result<(T, u64)>) -> Result<T> {
        tracing::debug!("Stage `{}` started", stage);
        self.emit(PipelineEvent::StageStarted { stage });
        match body() {
            Ok((value, bytes)) => {
                tracing::debug!("Stage `{}` finished after {} bytes", stage, bytes);
                self.emit(PipelineEvent::StageFinished { stage, bytes });
                Ok(value)
            }
            Err(error) => {
                if error.is_interruption() {
                    tracing::debug!("Stage `{}` stopped: {}", stage, error);
                } else {
                    tracing::error!("Stage `{}` failed: {}", stage, error);
                    self.token.cancel();
                }
                self.emit(PipelineEvent::StageFailed {
                    stage,
                    message: error.to_string(),
                });
                Err(error.in_stage(stage))
            }
        }
    }
}

/// Body of a transform stage: feeds `input` through `transform` into `output`, then ends the
/// outgoing stream.
pub(crate) fn transform_stage<F>(input: PipeReader, output: PipeWriter, transform: F) -> Result<((), u64)>
where
    F: FnOnce(PipeReader, CountingWriter<PipeWriter>) -> Result<CountingWriter<PipeWriter>>,
{
    let writer = transform(input, CountingWriter::new(output))?;
    let bytes = writer.count();
    writer.into_inner().close()?;
    Ok(((), bytes))
}

/// Body of a source stage: copies a file into the first stream.
pub(crate) fn read_stage(path: &std::path::Path, output: PipeWriter, buffer_size: usize) -> Result<((), u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut writer = CountingWriter::new(output);
    copy_buffered(&mut file, &mut writer, buffer_size)?;
    let bytes = writer.count();
    writer.into_inner().close()?;
    Ok(((), bytes))
}

pub(crate) fn join_stage<T>(stage: Stage, handle: ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    handle.join().unwrap_or_else(|_| {
        Err(Error::from(panicked(format!("stage `{stage}` panicked"))).in_stage(stage))
    })
}

/// Picks the error to report for a failed run.
///
/// A run cancelled from outside reports the cancellation, whatever the stages saw while they
/// were torn down. Otherwise it is the first failure in pipeline order that is not merely a
/// reaction to a neighbour stopping, then a panicked stage.
pub(crate) fn settle<I: IntoIterator<Item = Option<Error>>>(
    errors: I,
    external: &CancellationToken,
) -> Error {
    if external.is_cancelled() {
        return Error::Cancelled;
    }
    let mut errors: Vec<Error> = errors.into_iter().flatten().collect();
    match errors.iter().position(|e| !e.is_interruption()) {
        Some(pos) => errors.swap_remove(pos),
        None if errors.is_empty() => Error::Cancelled,
        None => match errors.iter().position(Error::is_panic) {
            Some(pos) => errors.swap_remove(pos),
            None => errors.swap_remove(0),
        },
    }
}
