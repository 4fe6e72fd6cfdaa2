//! One-shot initialization gate
//!
//! The gate starts Open (parameters may be initialized) and closes exactly
//! once when initialization finishes. Closing wakes every task waiting in
//! [`InitGate::wait_closed`].

use pserver_core::{Error, Result};
use tokio::sync::watch;

/// Open/Closed initialization state shared by the service operations
#[derive(Debug)]
pub struct InitGate {
    closed: watch::Sender<bool>,
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InitGate {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self { closed }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Fails with `AlreadyInitialized` once the gate has closed
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::AlreadyInitialized);
        }
        Ok(())
    }

    /// Fails with `Uninitialized` while the gate is open; never waits
    pub fn ensure_closed(&self) -> Result<()> {
        if !self.is_closed() {
            return Err(Error::Uninitialized);
        }
        Ok(())
    }

    /// Close the gate, releasing all waiters
    ///
    /// Only the first call succeeds; later calls fail with `AlreadyInitialized`.
    pub fn close(&self) -> Result<()> {
        let fired = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });

        if fired {
            Ok(())
        } else {
            Err(Error::AlreadyInitialized)
        }
    }

    /// Wait until the gate is closed
    pub async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
