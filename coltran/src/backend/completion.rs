use super::RemoteBuffer;
use crate::error::CoreError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

/// Completion state of one in-flight backend operation.
///
/// The backend keeps one reference and resolves it from `progress()`; the
/// caller keeps another inside a [`Request`](crate::Request) and polls it.
#[derive(Debug, Default)]
pub struct CompletionToken {
    done: AtomicBool,
    failure: Mutex<Option<CoreError>>,
    remote: OnceLock<RemoteBuffer>,
}

impl CompletionToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Resolve a control receive with the peer's buffer description.
    pub fn complete_with_remote(&self, remote: RemoteBuffer) {
        let _ = self.remote.set(remote);
        self.complete();
    }

    pub fn fail(&self, err: CoreError) {
        if let Ok(mut slot) = self.failure.lock() {
            slot.get_or_insert(err);
        }
        self.complete();
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Take the failure, if the operation failed. Subsequent calls return `None`.
    pub fn take_error(&self) -> Option<CoreError> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn remote(&self) -> Option<RemoteBuffer> {
        self.remote.get().copied()
    }
}
