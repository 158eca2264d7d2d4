use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, HeaderName, RANGE};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

use super::{Transport, build_client};
use crate::error::{AdapterError, Result};

/// Prefix length requested when probing the image size.
const PROBE_LEN: u64 = 512;

/// Issues independent HTTP Range requests against a transfer proxy.
///
/// Every fetch builds its own client, so no connection is shared between reads.
pub struct RangeFetcher {
    url: Url,
    ticket: String,
    insecure: bool,
    transports_opened: AtomicU64,
}

impl RangeFetcher {
    /// Fetcher for the transfer at `url`, authorized by its signed `ticket`.
    pub fn new(url: Url, ticket: String, insecure: bool) -> Self {
        Self {
            url,
            ticket,
            insecure,
            transports_opened: AtomicU64::new(0),
        }
    }

    /// Proxy URL of the transfer.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Number of per-request transports created so far.
    pub fn transports_opened(&self) -> u64 {
        self.transports_opened.load(Ordering::Relaxed)
    }

    async fn send_range(&self, start: u64, end_inclusive: u64) -> Result<reqwest::Response> {
        let client = build_client(self.insecure)?;
        self.transports_opened.fetch_add(1, Ordering::Relaxed);

        let resp = client
            .get(self.url.clone())
            .header(RANGE, format!("bytes={start}-{end_inclusive}"))
            .header(AUTHORIZATION, &self.ticket)
            .send()
            .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT | StatusCode::OK => Ok(resp),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AdapterError::Auth(format!(
                "proxy rejected ticket with status {}",
                resp.status()
            ))),
            status => Err(AdapterError::HttpStatus {
                status: status.as_u16(),
                context: format!("GET {} bytes={start}-{end_inclusive}", self.url),
            }),
        }
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    pub async fn fetch(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let end = offset + buf.len() as u64 - 1;
        let mut resp = self.send_range(offset, end).await?;
        if resp.status() == StatusCode::PARTIAL_CONTENT {
            let start = resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(content_range_start);
            if start != Some(offset) {
                return Err(AdapterError::Protocol(format!(
                    "proxy answered bytes={offset}-{end} with range starting at {start:?}"
                )));
            }
        } else if offset != 0 {
            // A 200 carries the image from byte 0, useless for any other offset.
            return Err(AdapterError::Protocol(format!(
                "proxy ignored Range header (status {})",
                resp.status()
            )));
        }

        // Stop at `buf.len()`; a 200 would otherwise pull the whole image.
        let mut filled = 0;
        while filled < buf.len() {
            let Some(chunk) = resp.chunk().await? else {
                break;
            };
            let n = chunk.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&chunk[..n]);
            filled += n;
        }

        if filled < buf.len() {
            return Err(AdapterError::ShortRead {
                offset,
                expected: buf.len(),
                actual: filled,
            });
        }

        tracing::debug!(offset, count = buf.len(), "range fetched");
        Ok(())
    }

    /// Learn the full image size from a small prefix request.
    ///
    /// A `206` answer carries the size as the `Content-Range` total; a server that
    /// ignores the range replies `200` with the full `Content-Length`. The body is
    /// not read.
    pub async fn probe_size(&self) -> Result<u64> {
        let resp = self.send_range(0, PROBE_LEN - 1).await?;
        let header = |name: HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let size = if resp.status() == StatusCode::PARTIAL_CONTENT {
            header(CONTENT_RANGE)
                .as_deref()
                .and_then(content_range_total)
                .ok_or_else(|| AdapterError::Protocol("missing or unusable Content-Range".into()))?
        } else {
            header(CONTENT_LENGTH)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| AdapterError::Protocol("proxy did not return Content-Length".into()))?
        };
        tracing::debug!(size, status = %resp.status(), "probed image size");
        Ok(size)
    }
}

/// Total length from a `Content-Range: bytes start-end/total` header.
fn content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

/// First byte position from a `Content-Range: bytes start-end/total` header.
fn content_range_start(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (start, _) = rest.split_once('-')?;
    start.trim().parse().ok()
}

/// Transport for transfer proxies that serve arbitrary byte ranges.
///
/// Handles carry no state: each read opens, uses and drops its own connection.
pub struct RangedTransport {
    fetcher: Arc<RangeFetcher>,
}

impl RangedTransport {
    pub fn new(fetcher: Arc<RangeFetcher>) -> Self {
        Self { fetcher }
    }

    pub fn fetcher(&self) -> &RangeFetcher {
        &self.fetcher
    }
}

#[async_trait]
impl Transport for RangedTransport {
    type Handle = ();

    fn kind(&self) -> &'static str {
        "ranged-request"
    }

    async fn open(&self) -> Result<()> {
        tracing::debug!(proxy = %self.fetcher.url(), "handle will read through proxy");
        Ok(())
    }

    async fn read_at(&self, _handle: &mut (), offset: u64, buf: &mut [u8]) -> Result<()> {
        self.fetcher.fetch(offset, buf).await
    }

    async fn close(&self, _handle: ()) {}
}
