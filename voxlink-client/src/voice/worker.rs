//! Dedicated audio threads
//!
//! cpal's streams are not Send-safe, so every device stream is opened, polled
//! and dropped on its own OS thread. `AudioThread` owns that thread from the
//! async side: it waits for the thread to report that its device opened, and
//! on stop raises a cooperative cancel flag and waits a bounded time for the
//! thread to exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::VoiceError;

// =============================================================================
// Start Signal
// =============================================================================

/// Handed to the thread body to report whether its streams opened
pub struct StartSignal {
    tx: Option<oneshot::Sender<Result<(), String>>>,
}

impl StartSignal {
    /// Report that the device is open and the thread is running
    pub fn ready(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Report that the device could not be opened
    pub fn fail(&mut self, message: impl Into<String>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(message.into()));
        }
    }
}

/// Signals thread exit when dropped, including on panic
struct ExitGuard {
    alive: Arc<AtomicBool>,
    done_tx: Option<oneshot::Sender<()>>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(tx) = self.done_tx.take() {
            let _ = tx.send(());
        }
    }
}

// =============================================================================
// Audio Thread
// =============================================================================

/// Handle to a running audio thread
pub struct AudioThread {
    /// Thread name, for logging
    name: &'static str,
    /// Cooperative cancel flag; the body loops while this is true
    running: Arc<AtomicBool>,
    /// Cleared by the thread itself when it exits
    alive: Arc<AtomicBool>,
    /// Resolves when the thread exits
    done_rx: Option<oneshot::Receiver<()>>,
}

impl AudioThread {
    /// Spawn a named audio thread and wait for it to open its device
    ///
    /// The body receives a [`StartSignal`] and the running flag. It must call
    /// `ready()` once its streams are playing (or `fail()` and return), then
    /// loop until the running flag is cleared.
    ///
    /// # Arguments
    /// * `name` - OS thread name
    /// * `start_timeout` - How long to wait for the readiness report
    /// * `body` - Thread body
    ///
    /// # Returns
    /// * `Ok(AudioThread)` - The device opened and the thread is running
    /// * `Err(VoiceError)` - Spawn failed, the body reported failure, or it
    ///   didn't report within `start_timeout`
    pub async fn spawn<F>(
        name: &'static str,
        start_timeout: Duration,
        body: F,
    ) -> Result<Self, VoiceError>
    where
        F: FnOnce(StartSignal, Arc<AtomicBool>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let alive = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let thread_running = running.clone();
        let guard = ExitGuard {
            alive: alive.clone(),
            done_tx: Some(done_tx),
        };

        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                body(StartSignal { tx: Some(ready_tx) }, thread_running);
            })
            .map_err(|e| VoiceError::ThreadSpawn(e.to_string()))?;

        let handle = Self {
            name,
            running,
            alive,
            done_rx: Some(done_rx),
        };

        let failure = match timeout(start_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(thread = name, "audio thread started");
                return Ok(handle);
            }
            Ok(Ok(Err(message))) => message,
            Ok(Err(_)) => "audio thread exited before opening the device".to_string(),
            Err(_) => format!("device did not open within {:?}", start_timeout),
        };

        handle.stop(start_timeout).await;
        Err(VoiceError::DeviceUnavailable(failure))
    }

    /// Whether the thread body is still executing
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Cancel the thread and wait up to `limit` for it to exit
    ///
    /// A thread that doesn't exit in time is logged and abandoned; it will
    /// still see the cancel flag and exit on its own.
    pub async fn stop(mut self, limit: Duration) {
        self.running.store(false, Ordering::SeqCst);

        let Some(done_rx) = self.done_rx.take() else {
            return;
        };

        if timeout(limit, done_rx).await.is_err() {
            warn!(
                thread = self.name,
                "{}",
                VoiceError::ThreadJoinTimeout(limit)
            );
        } else {
            debug!(thread = self.name, "audio thread stopped");
        }
    }
}

impl Drop for AudioThread {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Tests
// =============================================================================
