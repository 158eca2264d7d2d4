//! oVirt engine REST client: SSO login, image transfers and disk status.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{check_status, join_path};
use crate::config::Config;
use crate::error::{AdapterError, Result};
use crate::io::build_client;
use crate::lifecycle::RemoteResource;
use crate::poll::PollPolicy;

/// Phase of a server-side image transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Initializing,
    Transferring,
    Resuming,
    PausedSystem,
    PausedUser,
    Cancelled,
    CancelledSystem,
    CancelledUser,
    FinalizingSuccess,
    FinalizingFailure,
    FinalizingCleanup,
    FinishedSuccess,
    FinishedFailure,
    FinishedCleanup,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskStatus {
    Ok,
    Locked,
    Illegal,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct TransferRecord {
    id: String,
    phase: Option<TransferPhase>,
    #[serde(default)]
    proxy_url: Option<String>,
    #[serde(default)]
    signed_ticket: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiskRecord {
    status: Option<DiskStatus>,
}

#[derive(Debug, Deserialize)]
struct SsoToken {
    access_token: String,
}

/// An image transfer that has reached the transferring phase.
#[derive(Clone)]
pub struct Transfer {
    pub id: String,
    pub phase: TransferPhase,
    pub proxy_url: Url,
    /// Bearer credential for every request to the proxy.
    pub signed_ticket: String,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("proxy_url", &self.proxy_url.as_str())
            .field("signed_ticket", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl TryFrom<TransferRecord> for Transfer {
    type Error = AdapterError;

    fn try_from(record: TransferRecord) -> Result<Self> {
        let missing = |field: &str| {
            AdapterError::Protocol(format!("transfer {} has no {field}", record.id))
        };
        let proxy_url = record.proxy_url.as_deref().ok_or_else(|| missing("proxy_url"))?;
        let signed_ticket = record
            .signed_ticket
            .clone()
            .ok_or_else(|| missing("signed_ticket"))?;

        Ok(Transfer {
            proxy_url: Url::parse(proxy_url)?,
            signed_ticket,
            phase: record.phase.unwrap_or(TransferPhase::Unknown),
            id: record.id,
        })
    }
}

/// Logged-in oVirt engine API session.
pub struct EngineClient {
    http: Client,
    api: Url,
    sso_base: Url,
    token: String,
}

impl EngineClient {
    /// Obtain an SSO access token with the password grant.
    pub async fn connect(config: &Config) -> Result<Self> {
        let http = build_client(config.insecure)?;
        let api = config.endpoint.clone();
        let sso_base = sso_base(&api)?;

        let resp = http
            .post(join_path(&sso_base, "sso/oauth/token")?)
            .header(ACCEPT, "application/json")
            .form(&[
                ("grant_type", "password"),
                ("scope", "ovirt-app-api"),
                ("username", config.username.as_str()),
                ("password", config.password.as_str()),
            ])
            .send()
            .await?;

        // The SSO endpoint rejects bad credentials with 400 as well as 401.
        let status = resp.status();
        if status.is_client_error() {
            return Err(AdapterError::Auth(format!(
                "unable to log in to {api}: HTTP {status}"
            )));
        }
        let token: SsoToken = check_status(resp, "sso login")?.json().await?;
        tracing::debug!(%api, "logged in to engine");

        Ok(Self {
            http,
            api,
            sso_base,
            token: token.access_token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder> {
        Ok(self
            .http
            .request(method, join_path(&self.api, path)?)
            .header(ACCEPT, "application/json")
            .bearer_auth(&self.token))
    }

    /// Create a download transfer for `disk_id`, returning its id.
    pub async fn create_transfer(&self, disk_id: &str, inactivity_timeout: u64) -> Result<String> {
        let resp = self
            .request(reqwest::Method::POST, "imagetransfers")?
            .json(&json!({
                "disk": { "id": disk_id },
                "direction": "download",
                "inactivity_timeout": inactivity_timeout,
            }))
            .send()
            .await?;
        let record: TransferRecord = check_status(resp, "create image transfer")?.json().await?;
        tracing::debug!(transfer = %record.id, disk = disk_id, inactivity_timeout, "transfer created");
        Ok(record.id)
    }

    async fn transfer_record(&self, id: &str) -> Result<TransferRecord> {
        let resp = self
            .request(reqwest::Method::GET, &format!("imagetransfers/{id}"))?
            .send()
            .await?;
        Ok(check_status(resp, &format!("image transfer {id}"))?.json().await?)
    }

    async fn transfer_action(&self, id: &str, action: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, &format!("imagetransfers/{id}/{action}"))?
            .json(&json!({}))
            .send()
            .await?;
        check_status(resp, &format!("{action} image transfer {id}"))?;
        Ok(())
    }

    pub async fn cancel_transfer(&self, id: &str) -> Result<()> {
        self.transfer_action(id, "cancel").await
    }

    /// Finalize a transfer. One that is already gone counts as finalized.
    pub async fn finalize_transfer(&self, id: &str) -> Result<()> {
        match self.transfer_action(id, "finalize").await {
            Err(AdapterError::NotFound(_)) => {
                tracing::debug!(transfer = id, "transfer already gone");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn disk_status(&self, disk_id: &str) -> Result<Option<DiskStatus>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("disks/{disk_id}"))?
            .send()
            .await?;
        let disk: DiskRecord = check_status(resp, &format!("disk {disk_id}"))?.json().await?;
        Ok(disk.status)
    }

    /// Wait for a transfer to leave the initializing phase.
    pub async fn wait_until_transferring(&self, id: &str, poll: &PollPolicy) -> Result<Transfer> {
        let record = poll
            .wait_for(&format!("transfer {id} to initialize"), move || async move {
                let record = self.transfer_record(id).await?;
                match record.phase {
                    Some(TransferPhase::Initializing) => Ok(None),
                    _ => Ok(Some(record)),
                }
            })
            .await?;

        match record.phase {
            Some(TransferPhase::Transferring) => Transfer::try_from(record),
            other => Err(AdapterError::Protocol(format!(
                "transfer {id} left initializing in phase {other:?}"
            ))),
        }
    }

    pub async fn wait_for_disk_ok(&self, disk_id: &str, poll: &PollPolicy) -> Result<()> {
        poll.wait_for(&format!("disk {disk_id} to become ok"), move || async move {
            let status = self.disk_status(disk_id).await?;
            if status != Some(DiskStatus::Ok) {
                tracing::debug!(disk = disk_id, ?status, "waiting for disk OK");
            }
            Ok((status == Some(DiskStatus::Ok)).then_some(()))
        })
        .await
    }

    /// Wait until the engine reports the transfer as not found.
    pub async fn wait_until_gone(&self, id: &str, poll: &PollPolicy) -> Result<()> {
        poll.wait_for(&format!("transfer {id} to go away"), move || async move {
            match self.transfer_record(id).await {
                Ok(_) => {
                    tracing::debug!(transfer = id, "waiting for old transfer to go away");
                    Ok(None)
                }
                Err(AdapterError::NotFound(_)) => Ok(Some(())),
                Err(e) => Err(e),
            }
        })
        .await?;
        tracing::debug!(transfer = id, "old transfer cleaned up");
        Ok(())
    }
}

#[async_trait]
impl RemoteResource for EngineClient {
    fn describe(&self) -> String {
        format!("engine session at {}", self.api)
    }

    /// Revoke the SSO token.
    async fn release(&self) -> Result<()> {
        let mut url = join_path(&self.sso_base, "services/sso-logout")?;
        url.query_pairs_mut()
            .append_pair("scope", "")
            .append_pair("token", &self.token);
        let resp = self.http.get(url).send().await?;
        check_status(resp, "sso logout")?;
        Ok(())
    }
}

/// Finalizes one transfer when the session ends.
pub struct TransferFinalizer {
    client: Arc<EngineClient>,
    transfer_id: String,
}

impl TransferFinalizer {
    pub fn new(client: Arc<EngineClient>, transfer_id: String) -> Self {
        Self {
            client,
            transfer_id,
        }
    }
}

#[async_trait]
impl RemoteResource for TransferFinalizer {
    fn describe(&self) -> String {
        format!("image transfer {}", self.transfer_id)
    }

    async fn release(&self) -> Result<()> {
        self.client.finalize_transfer(&self.transfer_id).await
    }
}

/// `https://host/ovirt-engine/api` → `https://host/ovirt-engine`.
fn sso_base(api: &Url) -> Result<Url> {
    let trimmed = api.as_str().trim_end_matches('/');
    let base = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    Ok(Url::parse(base)?)
}
