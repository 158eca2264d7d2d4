mod ranged;
mod stream;

pub use ranged::{RangeFetcher, RangedTransport};
pub use stream::{ByteStream, ResponseStream, SequentialStreamTransport, StreamSource, TransportCursor};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::Result;

/// Connect timeout for every HTTP client the adapter builds. Reads themselves are
/// not bounded: a stalled transfer blocks the reading handle.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Capability the read adapter needs from a backend: per-handle transport state
/// that can serve reads at arbitrary offsets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport state owned by one open handle.
    type Handle: Send;

    /// Short backend label used in logs and plugin info.
    fn kind(&self) -> &'static str;

    /// Prepare transport state for a newly opened handle.
    async fn open(&self) -> Result<Self::Handle>;

    /// Fill `buf` completely with the bytes starting at `offset`.
    ///
    /// Anything less than a full buffer is an error; the device size is fixed.
    async fn read_at(&self, handle: &mut Self::Handle, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Release whatever the handle holds.
    async fn close(&self, handle: Self::Handle);
}

pub(crate) fn build_client(insecure: bool) -> Result<Client> {
    Ok(Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .danger_accept_invalid_certs(insecure)
        .build()?)
}
