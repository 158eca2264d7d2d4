//! The block-device read surface: handles, size, and positioned reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{AdapterError, Result};
use crate::io::Transport;
use crate::lifecycle::{LifecycleGuard, OpenHandles};

/// Opaque handle identifier handed to the host.
pub type HandleId = u64;

struct HandleState<H> {
    /// `None` once the handle has been closed.
    transport: Option<H>,
}

type Entry<H> = Arc<AsyncMutex<HandleState<H>>>;

/// Open handles and the transport that serves them.
pub struct HandleTable<T: Transport> {
    transport: T,
    entries: Mutex<HashMap<HandleId, Entry<T::Handle>>>,
}

impl<T: Transport> HandleTable<T> {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<HandleId, Entry<T::Handle>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get(&self, id: HandleId) -> Result<Entry<T::Handle>> {
        self.entries()
            .get(&id)
            .cloned()
            .ok_or(AdapterError::UnknownHandle(id))
    }
}

#[async_trait]
impl<T: Transport> OpenHandles for HandleTable<T> {
    async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.entries().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            let transport = entry.lock().await.transport.take();
            if let Some(transport) = transport {
                tracing::debug!(handle = id, "closing handle left open at exit");
                self.transport.close(transport).await;
            }
        }
        count
    }
}

/// Read-only block device backed by a [`Transport`].
///
/// Each handle owns its transport state exclusively; two handles never share a
/// stream or connection. The device size is fixed at construction.
pub struct ReadAdapter<T: Transport> {
    disk_size: u64,
    table: Arc<HandleTable<T>>,
    next_id: AtomicU64,
}

impl<T: Transport + 'static> ReadAdapter<T> {
    /// Adapter serving a device of `disk_size` bytes through `transport`.
    pub fn new(disk_size: u64, transport: T) -> Self {
        Self {
            disk_size,
            table: Arc::new(HandleTable {
                transport,
                entries: Mutex::new(HashMap::new()),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Let `guard` close whatever handles are still open at exit.
    pub fn register_with(&self, guard: &LifecycleGuard) {
        guard.register_handles(self.table.clone());
    }

    pub fn transport(&self) -> &T {
        &self.table.transport
    }

    pub fn open_handles(&self) -> usize {
        self.table.entries().len()
    }

    pub async fn open(&self, readonly: bool) -> Result<HandleId> {
        let state = self.table.transport.open().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(handle = id, readonly, transport = self.table.transport.kind(), "open");

        self.table.entries().insert(
            id,
            Arc::new(AsyncMutex::new(HandleState {
                transport: Some(state),
            })),
        );
        Ok(id)
    }

    pub async fn close(&self, id: HandleId) -> Result<()> {
        let entry = self
            .table
            .entries()
            .remove(&id)
            .ok_or(AdapterError::UnknownHandle(id))?;
        tracing::debug!(handle = id, "close");

        let transport = entry.lock().await.transport.take();
        if let Some(transport) = transport {
            self.table.transport.close(transport).await;
        }
        Ok(())
    }

    pub fn get_size(&self, id: HandleId) -> Result<u64> {
        self.table.get(id)?;
        Ok(self.disk_size)
    }

    /// Writes are never supported, whatever the handle was opened with.
    pub fn can_write(&self, id: HandleId) -> Result<bool> {
        self.table.get(id)?;
        Ok(false)
    }

    /// Read exactly `count` bytes at `offset`.
    pub async fn pread(&self, id: HandleId, count: u32, offset: u64) -> Result<Vec<u8>> {
        if count == 0 {
            return Err(AdapterError::InvalidRequest("zero-length read".into()));
        }
        let end = offset.checked_add(u64::from(count));
        if end.is_none_or(|end| end > self.disk_size) {
            return Err(AdapterError::OutOfRange {
                offset,
                count: u64::from(count),
                size: self.disk_size,
            });
        }

        let entry = self.table.get(id)?;
        let mut state = entry.lock().await;
        let transport = state
            .transport
            .as_mut()
            .ok_or(AdapterError::UnknownHandle(id))?;

        tracing::debug!(handle = id, count, offset, "pread");
        let mut buf = vec![0u8; count as usize];
        self.table.transport.read_at(transport, offset, &mut buf).await?;
        Ok(buf)
    }

    /// Run `f` against a handle's transport state.
    pub async fn inspect<R>(&self, id: HandleId, f: impl FnOnce(&T::Handle) -> R) -> Result<R> {
        let entry = self.table.get(id)?;
        let state = entry.lock().await;
        state
            .transport
            .as_ref()
            .map(f)
            .ok_or(AdapterError::UnknownHandle(id))
    }
}
