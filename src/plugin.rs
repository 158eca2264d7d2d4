//! Callback surface driven by the block-device host.
//!
//! The host calls [`Plugin::config`] once per parameter, then
//! [`Plugin::config_complete`], then any number of `open`/`pread`/`close`
//! sequences, and finally [`Plugin::shutdown`] on its way out.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::adapter::{HandleId, ReadAdapter};
use crate::config::{Backend, Params};
use crate::error::{AdapterError, Result};
use crate::io::{RangedTransport, SequentialStreamTransport, Transport};
use crate::lifecycle::{LifecycleGuard, ShutdownReport};
use crate::session::{Session, SessionManager};

pub const PLUGIN_NAME: &str = "remote-blockdev";

/// The read adapter for whichever backend the session was configured with.
pub enum Adapter {
    Stream(ReadAdapter<SequentialStreamTransport>),
    Ranged(ReadAdapter<RangedTransport>),
}

macro_rules! dispatch {
    ($adapter:expr, $a:ident => $body:expr) => {
        match $adapter {
            Adapter::Stream($a) => $body,
            Adapter::Ranged($a) => $body,
        }
    };
}

impl Adapter {
    fn for_session(session: &Session) -> Result<Self> {
        let size = session.disk_size();
        if let Some(source) = session.stream_source() {
            return Ok(Adapter::Stream(ReadAdapter::new(
                size,
                SequentialStreamTransport::new(source),
            )));
        }
        if let Some(fetcher) = session.range_fetcher() {
            return Ok(Adapter::Ranged(ReadAdapter::new(size, RangedTransport::new(fetcher))));
        }
        Err(AdapterError::NotConfigured)
    }

    fn transport_kind(&self) -> &'static str {
        dispatch!(self, a => a.transport().kind())
    }
}

struct Configured {
    session: Arc<Session>,
    adapter: Adapter,
}

/// One plugin instance per process: parameters, the configured session and
/// the cleanup guard.
pub struct Plugin {
    params: Params,
    guard: Arc<LifecycleGuard>,
    configured: Option<Configured>,
}

impl Plugin {
    /// An unconfigured plugin for `backend`.
    pub fn new(backend: Backend) -> Self {
        Self {
            params: Params::new(backend),
            guard: Arc::new(LifecycleGuard::new()),
            configured: None,
        }
    }

    pub fn backend(&self) -> Backend {
        self.params.backend()
    }

    /// Exit hook; valid at any point, including before configuration.
    pub fn guard(&self) -> Arc<LifecycleGuard> {
        self.guard.clone()
    }

    pub fn session(&self) -> Option<&Session> {
        self.configured.as_ref().map(|c| c.session.as_ref())
    }

    pub fn adapter(&self) -> Result<&Adapter> {
        self.configured
            .as_ref()
            .map(|c| &c.adapter)
            .ok_or(AdapterError::NotConfigured)
    }

    /// Record one `key=value` parameter. Rejected once configuration completed.
    pub fn config(&mut self, key: &str, value: &str) -> Result<()> {
        if self.configured.is_some() {
            return Err(AdapterError::InvalidRequest(format!(
                "parameter {key} given after configuration completed"
            )));
        }
        self.params.set(key, value)
    }

    /// Validate parameters and establish the remote session.
    pub async fn config_complete(&mut self) -> Result<()> {
        if self.configured.is_some() {
            return Err(AdapterError::InvalidRequest("already configured".into()));
        }
        tracing::debug!(params = ?self.params.redacted(), "config complete");

        let config = self.params.validate()?;
        let session = SessionManager::configure(&config, &self.guard).await?;
        let adapter = Adapter::for_session(&session)?;
        dispatch!(&adapter, a => a.register_with(&self.guard));

        self.configured = Some(Configured {
            session: Arc::new(session),
            adapter,
        });
        Ok(())
    }

    pub async fn open(&self, readonly: bool) -> Result<HandleId> {
        dispatch!(self.adapter()?, a => a.open(readonly).await)
    }

    pub async fn close(&self, handle: HandleId) -> Result<()> {
        dispatch!(self.adapter()?, a => a.close(handle).await)
    }

    pub fn get_size(&self, handle: HandleId) -> Result<u64> {
        dispatch!(self.adapter()?, a => a.get_size(handle))
    }

    pub fn can_write(&self, handle: HandleId) -> Result<bool> {
        dispatch!(self.adapter()?, a => a.can_write(handle))
    }

    pub async fn pread(&self, handle: HandleId, count: u32, offset: u64) -> Result<Vec<u8>> {
        dispatch!(self.adapter()?, a => a.pread(handle, count, offset).await)
    }

    /// `key=value` diagnostics, one per line.
    pub fn dump_plugin_info(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "name={PLUGIN_NAME}");
        let _ = writeln!(out, "version={}", env!("CARGO_PKG_VERSION"));
        let _ = writeln!(out, "backend={}", self.backend().name());
        let _ = writeln!(out, "configured={}", self.configured.is_some());
        if let Some(configured) = &self.configured {
            let session = &configured.session;
            let _ = writeln!(out, "transport={}", configured.adapter.transport_kind());
            let _ = writeln!(
                out,
                "open_handles={}",
                dispatch!(&configured.adapter, a => a.open_handles())
            );
            let _ = writeln!(out, "target_id={}", session.target_id());
            let _ = writeln!(out, "size={}", session.disk_size());
            if let Some(transfer) = session.transfer() {
                let _ = writeln!(out, "transfer_id={}", transfer.id);
            }
        }
        out
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.guard.shutdown().await
    }
}
