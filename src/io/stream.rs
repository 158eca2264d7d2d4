//! Random access emulated on top of a forward-only download.
//!
//! The image service only hands out the whole image as one stream starting at
//! byte 0. A [`TransportCursor`] remembers how far its stream has been consumed:
//! forward reads skip ahead by discarding bytes, backward reads restart the
//! download from the beginning. A backward seek near the end of a large image
//! therefore costs a re-download of everything before the target offset.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};

use super::Transport;
use crate::error::{AdapterError, Result};

/// Scratch size used while discarding bytes to move the cursor forward.
const DISCARD_CHUNK: usize = 64 * 1024;

/// A forward-only byte stream.
#[async_trait]
pub trait ByteStream: Send {
    /// Read up to `buf.len()` bytes; `Ok(0)` means the stream has ended.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Something that can start a fresh download of the whole image.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn start(&self) -> Result<Box<dyn ByteStream>>;
}

/// [`ByteStream`] over the body of an HTTP response.
pub struct ResponseStream {
    response: reqwest::Response,
    pending: Bytes,
}

impl ResponseStream {
    /// Wrap a response whose status has already been checked.
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            pending: Bytes::new(),
        }
    }
}

#[async_trait]
impl ByteStream for ResponseStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pending.is_empty() {
            match self.response.chunk().await? {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }

        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

/// Per-handle read position over a restartable forward-only stream.
#[derive(Default)]
pub struct TransportCursor {
    stream: Option<Box<dyn ByteStream>>,
    position: u64,
    streams_started: u64,
}

impl TransportCursor {
    /// A cursor with no stream; the first `ensure` starts one.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes already consumed from the current stream.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// How many downloads this cursor has issued, including the first one.
    pub fn streams_started(&self) -> u64 {
        self.streams_started
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Position the cursor at `offset`, restarting the download when the
    /// current stream has already moved past it.
    pub async fn ensure(&mut self, source: &dyn StreamSource, offset: u64) -> Result<()> {
        if self.stream.is_none() || offset < self.position {
            tracing::debug!(
                offset,
                position = self.position,
                "offset behind cursor, starting new download"
            );
            // The abandoned stream's connection closes when it is dropped here.
            self.stream = None;
            self.position = 0;
            self.stream = Some(source.start().await?);
            self.streams_started += 1;
        }

        let skip = offset - self.position;
        if skip > 0 {
            tracing::debug!(skip, "discarding bytes to reach offset");
            self.discard(skip).await?;
        }
        Ok(())
    }

    async fn discard(&mut self, mut remaining: u64) -> Result<()> {
        let mut scratch = vec![0u8; DISCARD_CHUNK.min(remaining as usize)];
        while remaining > 0 {
            let want = scratch.len().min(remaining as usize);
            let n = self.read_some(&mut scratch[..want]).await?;
            if n == 0 {
                self.stream = None;
                return Err(AdapterError::Transport(format!(
                    "stream ended at byte {} while skipping ahead",
                    self.position
                )));
            }
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Fill `buf` from the current position, advancing the cursor by the number
    /// of bytes actually read.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let start = self.position;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..]).await?;
            if n == 0 {
                self.stream = None;
                return Err(AdapterError::ShortRead {
                    offset: start,
                    expected: buf.len(),
                    actual: filled,
                });
            }
            filled += n;
        }
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| AdapterError::Transport("no active stream".into()))?;
        match stream.read(buf).await {
            Ok(n) => {
                self.position += n as u64;
                Ok(n)
            }
            Err(e) => {
                // A broken stream cannot be resumed; the next read starts over.
                self.stream = None;
                Err(e)
            }
        }
    }

    /// Drop the live stream, if any.
    pub fn release(&mut self) {
        self.stream = None;
    }
}

/// Transport for image services that only offer whole-image downloads.
pub struct SequentialStreamTransport {
    source: Arc<dyn StreamSource>,
}

impl SequentialStreamTransport {
    /// Every handle gets its own download from `source`.
    pub fn new(source: Arc<dyn StreamSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Transport for SequentialStreamTransport {
    type Handle = TransportCursor;

    fn kind(&self) -> &'static str {
        "sequential-stream"
    }

    async fn open(&self) -> Result<TransportCursor> {
        let mut cursor = TransportCursor::new();
        cursor.ensure(self.source.as_ref(), 0).await?;
        Ok(cursor)
    }

    async fn read_at(&self, cursor: &mut TransportCursor, offset: u64, buf: &mut [u8]) -> Result<()> {
        cursor.ensure(self.source.as_ref(), offset).await?;
        cursor.read_exact(buf).await
    }

    async fn close(&self, mut cursor: TransportCursor) {
        cursor.release();
    }
}
