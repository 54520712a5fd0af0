use crate::tarpipe::pipeline::{Phase, Stage};
use crate::tarpipe::result_error::{WithDebugObjectAndFnName, WithMsg};
use crate::tarpipe::stream;
use itertools::Itertools;
use std::error::Error as StdError;
use std::fmt::Debug;
use thiserror::Error;

type BoxedCause = Box<dyn StdError + Send + Sync>;

/// Broad classification used by presentation layers to decide how an error is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserActionable,
    Security,
    Corruption,
    Io,
    Configuration,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{message}\nhint: {hint}")]
    UserActionable {
        message: String,
        hint: String,
        #[source]
        cause: Option<Box<Error>>,
    },
    #[error("security violation: {0}")]
    Security(String),
    #[error("corrupted data: {message}{}", cause_suffix(.cause))]
    Corruption {
        message: String,
        cause: Option<BoxedCause>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error("stage `{stage}` failed:\n{}", indent::indent_all_with("  ", .error.to_string()))]
    Stage { stage: Stage, error: Box<Error> },
    #[error("{phase} failed:\n{}", indent::indent_all_with("  ", .error.to_string()))]
    Phase { phase: Phase, error: Box<Error> },
    #[error("{}:\n{}", .msg, indent::indent_all_with("  ", .error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", .obj_debug, .fn_name, indent::indent_all_with("  ", .error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

fn cause_suffix(cause: &Option<BoxedCause>) -> String {
    match cause {
        Some(c) => format!(": {c}"),
        None => String::new(),
    }
}

impl<S: Into<String>, O: Debug + Send + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl From<age::EncryptError> for Error {
    fn from(value: age::EncryptError) -> Self {
        match value {
            age::EncryptError::Io(e) => Error::Io(e),
            e => Error::Configuration(format!("age encryption setup failed: {e}")),
        }
    }
}

impl From<age::DecryptError> for Error {
    fn from(value: age::DecryptError) -> Self {
        match value {
            age::DecryptError::Io(e) => Error::corruption_from_io(e),
            e => Error::corruption("age decryption failed", e),
        }
    }
}

impl Error {
    pub fn user_actionable<M: Into<String>, H: Into<String>>(message: M, hint: H) -> Error {
        Error::UserActionable {
            message: message.into(),
            hint: hint.into(),
            cause: None,
        }
    }

    pub fn corruption<M: Into<String>, E: Into<BoxedCause>>(message: M, cause: E) -> Error {
        Error::Corruption {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn corruption_msg<M: Into<String>>(message: M) -> Error {
        Error::Corruption {
            message: message.into(),
            cause: None,
        }
    }

    /// Maps an error raised while *reading* encoded data.
    ///
    /// Interruptions caused by a neighbouring stage and cancellation stay I/O errors so they
    /// are not mistaken for damage in the data itself.
    pub fn corruption_from_io(e: std::io::Error) -> Error {
        if stream::is_interruption(&e) {
            return Error::Io(e);
        }
        match e.kind() {
            std::io::ErrorKind::InvalidData
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::Other => Error::corruption("stream could not be decoded", e),
            _ => Error::Io(e),
        }
    }

    pub fn in_stage(self, stage: Stage) -> Error {
        Error::Stage {
            stage,
            error: Box::new(self),
        }
    }

    pub fn in_phase(self, phase: Phase) -> Error {
        Error::Phase {
            phase,
            error: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UserActionable { .. } => ErrorKind::UserActionable,
            Error::Security(_) => ErrorKind::Security,
            Error::Corruption { .. } => ErrorKind::Corruption,
            Error::Io(e) if stream::is_cancellation(e) => ErrorKind::Cancelled,
            Error::Io(_) | Error::WalkDir(_) => ErrorKind::Io,
            Error::Configuration(_) | Error::ValidationError(_) | Error::SerdeYml(_) => {
                ErrorKind::Configuration
            }
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Stage { error, .. }
            | Error::Phase { error, .. }
            | Error::WithMsg { error, .. }
            | Error::WithDebugObjAndFnName { error, .. } => error.kind(),
            Error::LotsOfError(v) => v.first().map(Error::kind).unwrap_or(ErrorKind::Io),
        }
    }

    /// True when this error only reports that a neighbouring stage went away or the run was
    /// cancelled, rather than describing a failure of its own.
    pub fn is_interruption(&self) -> bool {
        match self {
            Error::Io(e) => stream::is_interruption(e),
            Error::Cancelled => true,
            Error::Stage { error, .. }
            | Error::Phase { error, .. }
            | Error::WithMsg { error, .. }
            | Error::WithDebugObjAndFnName { error, .. } => error.is_interruption(),
            Error::LotsOfError(v) => v.iter().all(Error::is_interruption),
            _ => false,
        }
    }

    pub fn is_panic(&self) -> bool {
        match self {
            Error::Io(e) => stream::is_panic(e),
            Error::Stage { error, .. }
            | Error::Phase { error, .. }
            | Error::WithMsg { error, .. }
            | Error::WithDebugObjAndFnName { error, .. } => error.is_panic(),
            _ => false,
        }
    }

    /// The stage an error was raised in, if it was wrapped with one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            Error::Phase { error, .. }
            | Error::WithMsg { error, .. }
            | Error::WithDebugObjAndFnName { error, .. } => error.stage(),
            _ => None,
        }
    }

    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);

        match error {
            Error::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
        assert_eq!(
            Error::from(std::io::Error::other("x")).kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn test_error_with_msg() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error_with_msg = Error::from(io_error).with_msg("Custom message");

        match &error_with_msg {
            Error::WithMsg { msg, .. } => assert_eq!(msg, "Custom message"),
            _ => panic!("Expected WithMsg error"),
        }
        let error_str = error_with_msg.to_string();
        assert!(error_str.contains("Custom message"));
        assert!(error_str.contains("file not found"));
    }

    #[test]
    fn test_error_with_debug_object_and_fn_name() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error).with_debug_object_and_fn_name(42, "test_function");
        let error_str = error.to_string();

        assert!(error_str.contains("test_function"));
        assert!(error_str.contains("failed"));
        assert!(error_str.contains("file not found"));
    }

    #[test]
    fn test_user_actionable_display_has_hint() {
        let error = Error::user_actionable("destination is not empty", "pass --force");
        let error_str = error.to_string();
        assert!(error_str.contains("not empty"));
        assert!(error_str.contains("hint: pass --force"));
        assert_eq!(error.kind(), ErrorKind::UserActionable);
    }

    #[test]
    fn test_kind_survives_stage_and_phase_wrapping() {
        let error = Error::Security("absolute path".into())
            .in_stage(Stage::Extract)
            .in_phase(Phase::Restore);
        assert_eq!(error.kind(), ErrorKind::Security);
        assert_eq!(error.stage(), Some(Stage::Extract));
        let error_str = error.to_string();
        assert!(error_str.contains("restore failed"));
        assert!(error_str.contains("stage `extract` failed"));
        assert!(error_str.contains("absolute path"));
    }

    #[test]
    fn test_corruption_from_io_keeps_interruptions_as_io() {
        let e = Error::corruption_from_io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad crc",
        ));
        assert_eq!(e.kind(), ErrorKind::Corruption);

        let e = Error::corruption_from_io(stream::interruption("upstream went away"));
        assert_eq!(e.kind(), ErrorKind::Io);
        assert!(e.is_interruption());
    }

    #[test]
    fn test_chain_flattens() {
        let combined = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "error1"))
            .chain(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "error2",
            )));
        match &combined {
            Error::LotsOfError(v) => assert_eq!(v.len(), 2),
            _ => panic!("Expected LotsOfError"),
        }
        assert_eq!(combined.kind(), ErrorKind::Io);

        let chained = combined.chain(Error::Cancelled);
        assert_eq!(chained.into_iter().count(), 3);
    }
}
