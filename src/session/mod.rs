//! Authenticated session against the remote image service.
//!
//! [`SessionManager::configure`] runs once, after the host has delivered every
//! parameter. It resolves the target, establishes `disk_size` and, for the
//! transfer-proxy backend, negotiates the transfer that will serve reads. The
//! resulting [`Session`] is immutable and shared by every handle.

mod openstack;
mod ovirt;

pub use openstack::{GlanceImageSource, Image, ImageServiceClient};
pub use ovirt::{DiskStatus, EngineClient, Transfer, TransferFinalizer, TransferPhase};

use std::sync::Arc;

use reqwest::{Response, StatusCode};

use crate::config::{Backend, Config};
use crate::error::{AdapterError, Result};
use crate::io::{RangeFetcher, StreamSource};
use crate::lifecycle::LifecycleGuard;

/// Backend-specific state behind a [`Session`].
enum Remote {
    /// Whole-image downloads from an image service.
    Image {
        client: Arc<ImageServiceClient>,
        image: Image,
    },
    /// Ranged reads through a transfer proxy.
    Transfer {
        transfer: Transfer,
        fetcher: Arc<RangeFetcher>,
    },
}

/// Immutable result of configuration, shared by every handle.
pub struct Session {
    target_id: String,
    disk_size: u64,
    remote: Remote,
}

impl Session {
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    pub fn backend(&self) -> Backend {
        match self.remote {
            Remote::Image { .. } => Backend::Openstack,
            Remote::Transfer { .. } => Backend::Ovirt,
        }
    }

    /// Download source for the sequential backend.
    pub fn stream_source(&self) -> Option<Arc<dyn StreamSource>> {
        match &self.remote {
            Remote::Image { client, image } => Some(Arc::new(GlanceImageSource::new(
                client.clone(),
                image.id.clone(),
            ))),
            Remote::Transfer { .. } => None,
        }
    }

    /// Range fetcher for the transfer-proxy backend.
    pub fn range_fetcher(&self) -> Option<Arc<RangeFetcher>> {
        match &self.remote {
            Remote::Transfer { fetcher, .. } => Some(fetcher.clone()),
            Remote::Image { .. } => None,
        }
    }

    pub fn transfer(&self) -> Option<&Transfer> {
        match &self.remote {
            Remote::Transfer { transfer, .. } => Some(transfer),
            Remote::Image { .. } => None,
        }
    }
}

/// Builds the [`Session`] for the configured backend.
pub struct SessionManager;

impl SessionManager {
    /// Build the process-wide session.
    ///
    /// Server-side resources are registered with `guard` as soon as they exist so
    /// they get released at exit even if a later step fails. Authentication
    /// failures are the exception: nothing is cleaned up after them.
    pub async fn configure(config: &Config, guard: &LifecycleGuard) -> Result<Session> {
        tracing::debug!(?config, "configuration complete");
        let result = match config.backend {
            Backend::Openstack => Self::configure_image(config, guard).await,
            Backend::Ovirt => Self::configure_transfer(config, guard).await,
        };

        if let Err(AdapterError::Auth(reason)) = &result {
            tracing::debug!(url = %config.endpoint, %reason, "unable to log in");
            guard.forget_transfer();
        }

        let session = result?;
        tracing::info!(
            target_id = %session.target_id,
            size = session.disk_size,
            backend = session.backend().name(),
            "session ready"
        );
        Ok(session)
    }

    async fn configure_image(config: &Config, guard: &LifecycleGuard) -> Result<Session> {
        let client = Arc::new(ImageServiceClient::connect(config).await?);
        guard.register_connection(client.clone());

        let image = client.find_image(&config.target_id).await?;
        tracing::info!(
            image = %image.id,
            name = image.name.as_deref().unwrap_or(""),
            status = image.status.as_deref().unwrap_or("unknown"),
            "image found"
        );
        let disk_size = image
            .size
            .ok_or_else(|| AdapterError::NotFound(format!("image {} has no data yet", image.id)))?;

        Ok(Session {
            target_id: image.id.clone(),
            disk_size,
            remote: Remote::Image { client, image },
        })
    }

    async fn configure_transfer(config: &Config, guard: &LifecycleGuard) -> Result<Session> {
        let client = Arc::new(EngineClient::connect(config).await?);
        guard.register_connection(client.clone());
        let disk_id = config.target_id.as_str();

        // A short-lived transfer only to learn the size.
        let probe_id = client
            .create_transfer(disk_id, config.probe_inactivity_timeout)
            .await?;
        guard
            .register_transfer(Arc::new(TransferFinalizer::new(client.clone(), probe_id.clone())))
            .await;
        let probe = client.wait_until_transferring(&probe_id, &config.poll).await?;
        tracing::debug!(transfer = %probe.id, "probe transfer started");

        let disk_size = RangeFetcher::new(
            probe.proxy_url.clone(),
            probe.signed_ticket.clone(),
            config.insecure,
        )
        .probe_size()
        .await?;

        client.cancel_transfer(&probe_id).await?;
        client.finalize_transfer(&probe_id).await?;
        guard.forget_transfer();
        tracing::debug!(transfer = %probe_id, size = disk_size, "finalized probe transfer");

        client.wait_for_disk_ok(disk_id, &config.poll).await?;
        // Stale transfers on the same disk collide with a new one.
        client.wait_until_gone(&probe_id, &config.poll).await?;

        let transfer_id = client
            .create_transfer(disk_id, config.inactivity_timeout)
            .await?;
        guard
            .register_transfer(Arc::new(TransferFinalizer::new(
                client.clone(),
                transfer_id.clone(),
            )))
            .await;
        let transfer = client
            .wait_until_transferring(&transfer_id, &config.poll)
            .await?;
        tracing::info!(transfer = %transfer.id, proxy = %transfer.proxy_url, "transfer started");

        let fetcher = Arc::new(RangeFetcher::new(
            transfer.proxy_url.clone(),
            transfer.signed_ticket.clone(),
            config.insecure,
        ));
        Ok(Session {
            target_id: disk_id.to_string(),
            disk_size,
            remote: Remote::Transfer { transfer, fetcher },
        })
    }
}

/// Map an API response onto the error taxonomy, passing successes through.
pub(crate) fn check_status(resp: Response, context: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AdapterError::Auth(format!("{context}: HTTP {status}"))
        }
        StatusCode::NOT_FOUND => AdapterError::NotFound(context.to_string()),
        _ => AdapterError::HttpStatus {
            status: status.as_u16(),
            context: context.to_string(),
        },
    })
}

/// Append path segments to a base URL, keeping whatever path the base has.
pub(crate) fn join_path(base: &url::Url, path: &str) -> Result<url::Url> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Ok(url::Url::parse(&joined)?)
}
