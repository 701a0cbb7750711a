//! Cooperative shutdown signal.
//!
//! Set by OS-level interrupt delivery, observed by the worker loop between
//! jobs. Cancellation never interrupts a job mid-flight; it only prevents
//! starting a new one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide cancellation token.
///
/// Clones share the same underlying flag, so one handle can be wired to
/// signal delivery while others are observed by workers and handlers.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Idempotent.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Raise this signal when the process receives Ctrl-C.
    #[cfg(feature = "rt-tokio")]
    pub fn trigger_on_ctrl_c(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::debug!("interrupt received");
                signal.trigger();
            }
        });
    }
}
