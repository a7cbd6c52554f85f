use crossbeam_channel as channel;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{PubSubError, Result};

/// A named background thread that can be joined with a deadline.
///
/// The thread owns the sending half of a `done` channel; it disconnects when
/// the thread exits (normally or by panic), which lets the joiner wait with a
/// timeout before calling the blocking `join`.
pub(crate) struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    done_rx: channel::Receiver<()>,
}

impl Worker {
    pub(crate) fn spawn(name: &'static str, run: impl FnOnce() + Send + 'static) -> Result<Self> {
        let (done_tx, done_rx) = channel::bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name(format!("nimbus-{name}"))
            .spawn(move || {
                let _done = done_tx;
                run();
            })
            .map_err(|source| PubSubError::Spawn {
                worker: name,
                source,
            })?;
        Ok(Self {
            name,
            handle,
            done_rx,
        })
    }

    /// Wait up to `timeout` for the thread to finish.
    ///
    /// A thread still running at the deadline is detached and reported as
    /// [`PubSubError::JoinTimeout`].
    pub(crate) fn join_timeout(self, timeout: Duration) -> Result<()> {
        match self.done_rx.recv_timeout(timeout) {
            Err(channel::RecvTimeoutError::Timeout) => {
                tracing::error!(
                    target = "nimbus.pubsub",
                    worker = self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker thread did not exit in time"
                );
                Err(PubSubError::JoinTimeout {
                    worker: self.name,
                    timeout,
                })
            }
            Ok(()) | Err(channel::RecvTimeoutError::Disconnected) => {
                self.handle.join().map_err(|panic| {
                    let message = panic
                        .downcast_ref::<&'static str>()
                        .copied()
                        .or_else(|| panic.downcast_ref::<String>().map(|s| s.as_str()))
                        .unwrap_or("<non-string panic>")
                        .to_string();
                    tracing::error!(
                        target = "nimbus.pubsub",
                        worker = self.name,
                        panic = %message,
                        "worker thread panicked"
                    );
                    PubSubError::WorkerPanicked {
                        worker: self.name,
                        message,
                    }
                })
            }
        }
    }
}
