use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag for every stage of one pipeline run.
///
/// Cloning hands out another handle to the same flag. Tripping it is permanent. A token made
/// with [`CancellationToken::child`] also reports cancellation once its parent is cancelled,
/// while cancelling the child leaves the parent untouched.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    parent: Option<Box<CancellationToken>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            cancelled: Arc::default(),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Fails with a cancellation error once the token has been tripped.
    pub fn check(&self) -> std::io::Result<()> {
        if self.is_cancelled() {
            Err(super::cancelled())
        } else {
            Ok(())
        }
    }
}
