//! Exactly-once teardown of the remote session.
//!
//! A [`LifecycleGuard`] exists before configuration starts. Configuration
//! registers the control-plane connection and the active transfer with it, the
//! read adapter registers its handle table, and [`LifecycleGuard::shutdown`]
//! releases all of them in order: open handles, then the transfer, then the
//! connection. Every registration is consumed on release, so a second shutdown
//! finds nothing left to do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::Result;

/// A server-side object that must be released once at exit.
#[async_trait]
pub trait RemoteResource: Send + Sync {
    fn describe(&self) -> String;

    async fn release(&self) -> Result<()>;
}

/// A table of open handles whose transports must be closed at exit.
#[async_trait]
pub trait OpenHandles: Send + Sync {
    /// Close every handle still open, returning how many there were.
    async fn close_all(&self) -> usize;
}

/// What a call to [`LifecycleGuard::shutdown`] actually did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub handles_closed: usize,
    pub transfer_finalized: bool,
    pub connection_closed: bool,
}

/// Owner of everything that must be released when the process exits.
#[derive(Default)]
pub struct LifecycleGuard {
    handles: Mutex<Vec<Arc<dyn OpenHandles>>>,
    transfer: Mutex<Option<Arc<dyn RemoteResource>>>,
    connection: Mutex<Option<Arc<dyn RemoteResource>>>,
    shut_down: AtomicBool,
}

impl LifecycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the handles in `handles` at exit.
    pub fn register_handles(&self, handles: Arc<dyn OpenHandles>) {
        lock(&self.handles).push(handles);
    }

    /// Set the transfer to finalize at exit.
    ///
    /// A transfer registered earlier and never forgotten is released right away.
    pub async fn register_transfer(&self, transfer: Arc<dyn RemoteResource>) {
        tracing::debug!(transfer = %transfer.describe(), "transfer registered for cleanup");
        let replaced = lock(&self.transfer).replace(transfer);
        if let Some(replaced) = replaced {
            tracing::warn!(transfer = %replaced.describe(), "releasing transfer left from an earlier attempt");
            if let Err(e) = replaced.release().await {
                tracing::warn!(transfer = %replaced.describe(), error = %e, "finalize failed");
            }
        }
    }

    /// Stop tracking the current transfer without releasing it.
    pub fn forget_transfer(&self) {
        if let Some(transfer) = lock(&self.transfer).take() {
            tracing::debug!(transfer = %transfer.describe(), "transfer no longer tracked");
        }
    }

    /// Close the control-plane login at exit, after the transfer.
    pub fn register_connection(&self, connection: Arc<dyn RemoteResource>) {
        *lock(&self.connection) = Some(connection);
    }

    pub fn has_transfer(&self) -> bool {
        lock(&self.transfer).is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Release everything registered so far.
    ///
    /// Failures are logged and swallowed; the process is on its way out. Only the
    /// first call does any work.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("shutdown already ran");
            return report;
        }
        tracing::info!("exit cleanup");

        let tables: Vec<_> = lock(&self.handles).drain(..).collect();
        for table in tables {
            report.handles_closed += table.close_all().await;
        }

        let transfer = lock(&self.transfer).take();
        if let Some(transfer) = transfer {
            match transfer.release().await {
                Ok(()) => {
                    tracing::info!(transfer = %transfer.describe(), "finalized");
                    report.transfer_finalized = true;
                }
                Err(e) => {
                    tracing::warn!(transfer = %transfer.describe(), error = %e, "finalize failed")
                }
            }
        }

        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            match connection.release().await {
                Ok(()) => report.connection_closed = true,
                Err(e) => {
                    tracing::warn!(connection = %connection.describe(), error = %e, "closing connection failed")
                }
            }
        }

        report
    }
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        if !self.is_shut_down() && self.has_transfer() {
            tracing::warn!(
                "lifecycle guard dropped without shutdown; transfer left to its inactivity timeout"
            );
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
