use std::sync::Arc;
use std::time::Duration;

use loxy_net::{BodyDecoder, BodyFraming};
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::debug;

use crate::error::TransportError;
use crate::pool::{Pool, PoolKey};
use crate::stream::UpstreamStream;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// A response body, either held in memory or still arriving from the origin.
///
/// Upstream bodies are read on demand with [`Body::chunk`]. The connection
/// goes back to the pool once the last byte has been read; dropping a body
/// early closes it instead.
pub struct Body {
    kind: Kind,
    length: Option<u64>,
}

enum Kind {
    Full(Option<Vec<u8>>),
    Upstream(Box<UpstreamBody>),
}

impl Body {
    pub fn empty() -> Self {
        Self::from(Vec::new())
    }

    pub(crate) async fn upstream(
        stream: UpstreamStream,
        buffered: Vec<u8>,
        framing: BodyFraming,
        read_timeout: Duration,
        release: Option<Release>,
    ) -> Self {
        let mut upstream = UpstreamBody {
            stream: Some(stream),
            buffered,
            decoder: BodyDecoder::new(framing),
            read_timeout,
            release,
        };
        if upstream.decoder.is_done() {
            upstream.release().await;
            return Self::empty();
        }
        Self {
            kind: Kind::Upstream(Box::new(upstream)),
            length: framing.known_length(),
        }
    }

    /// Size of the decoded body when it is known before reading it.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// The next piece of payload, or `None` once the body is complete.
    pub async fn chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match &mut self.kind {
            Kind::Full(bytes) => Ok(bytes.take().filter(|bytes| !bytes.is_empty())),
            Kind::Upstream(upstream) => upstream.chunk().await,
        }
    }

    /// Reads whatever is left of the body into memory.
    pub async fn collect(mut self) -> Result<Vec<u8>, TransportError> {
        let mut collected = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            length: Some(bytes.len() as u64),
            kind: Kind::Full(Some(bytes)),
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Self::from(text.as_bytes().to_vec())
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.kind {
            Kind::Full(_) => "memory",
            Kind::Upstream(_) => "upstream",
        };
        f.debug_struct("Body")
            .field("source", &source)
            .field("length", &self.length)
            .finish()
    }
}

/// Where a drained connection is checked back in.
pub(crate) struct Release {
    pub(crate) pool: Arc<Pool>,
    pub(crate) key: PoolKey,
}

struct UpstreamBody {
    stream: Option<UpstreamStream>,
    buffered: Vec<u8>,
    decoder: BodyDecoder,
    read_timeout: Duration,
    release: Option<Release>,
}

impl UpstreamBody {
    async fn chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut out = Vec::new();
        loop {
            if !self.buffered.is_empty() && !self.decoder.is_done() {
                let consumed = self
                    .decoder
                    .decode(&self.buffered, &mut out)
                    .map_err(|err| TransportError::Parse(err.to_string()))?;
                self.buffered.drain(..consumed);
            }
            if self.decoder.is_done() {
                self.release().await;
                return Ok((!out.is_empty()).then_some(out));
            }
            if !out.is_empty() {
                return Ok(Some(out));
            }
            self.fill().await?;
        }
    }

    /// Reads more wire bytes. Each read gets the full `read_timeout`, so a
    /// slow body only fails when the origin goes quiet.
    async fn fill(&mut self) -> Result<(), TransportError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::Closed);
        };
        self.buffered.reserve(READ_BUFFER_SIZE);
        let n = timeout(self.read_timeout, stream.read_buf(&mut self.buffered))
            .await
            .map_err(|_| TransportError::Timeout("upstream body read"))??;
        if n == 0 {
            self.stream = None;
            self.release = None;
            self.decoder
                .finish()
                .map_err(|err| TransportError::Parse(format!("body cut short: {err}")))?;
        }
        Ok(())
    }

    async fn release(&mut self) {
        let (Some(release), Some(stream)) = (self.release.take(), self.stream.take()) else {
            return;
        };
        if !self.buffered.is_empty() {
            debug!(upstream = %release.key, "origin sent bytes past the body, not reusing");
            return;
        }
        release.pool.checkin(release.key, stream).await;
    }
}
