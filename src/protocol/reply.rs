//! One-shot hand-off of a request's outcome from the I/O thread to a caller.
use std::{
    sync::mpsc::{self, RecvTimeoutError, TryRecvError},
    time::Duration,
};

use crate::ConnectionError;

use super::WireRecord;

pub type ReplyResult = Result<Vec<WireRecord>, ConnectionError>;

/// Creates a linked promise/reply pair.
pub fn channel() -> (Promise, Reply) {
    let (tx, rx) = mpsc::sync_channel(1);
    (Promise { tx }, Reply { rx })
}

/// Completing half, held by the protocol engine.
#[derive(Debug)]
pub struct Promise {
    tx: mpsc::SyncSender<ReplyResult>,
}

impl Promise {
    pub fn complete(self, result: ReplyResult) {
        // The caller may have dropped its reply; nobody is left to tell.
        let _ = self.tx.send(result);
    }

    pub fn fail(self, error: ConnectionError) {
        self.complete(Err(error));
    }
}

/// Waiting half, returned to the caller of `send_request`.
///
/// A reply whose promise was dropped without completion reports the
/// connection as terminated.
#[derive(Debug)]
pub struct Reply {
    rx: mpsc::Receiver<ReplyResult>,
}

impl Reply {
    /// Blocks until the request completes.
    pub fn wait(self) -> ReplyResult {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(abandoned()))
    }

    /// Waits at most `timeout`; `None` means the request is still pending.
    ///
    /// This bounds how long the caller waits, it does not cancel the request.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ReplyResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(abandoned())),
        }
    }

    /// Returns the outcome if it is already available.
    pub fn try_wait(&self) -> Option<ReplyResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(abandoned())),
        }
    }
}

fn abandoned() -> ConnectionError {
    ConnectionError::terminated("request abandoned by the I/O thread")
}
