//! Framed JSON connections over the local sockets.
//!
//! ```text
//! +----------------------------+--------------------+
//! | Length (4 bytes, BE)       | JSON payload       |
//! +----------------------------+--------------------+
//! ```

use std::io;
use std::path::Path;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::UnixStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::credentials::PeerCredentials;
use super::error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// A framed local socket connection.
pub struct Connection {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
    credentials: Option<PeerCredentials>,
}

impl Connection {
    /// Wraps `stream` with known peer credentials.
    #[must_use]
    pub fn new_with_credentials(stream: UnixStream, credentials: Option<PeerCredentials>) -> Self {
        Self {
            framed: Framed::new(stream, codec()),
            credentials,
        }
    }

    /// Connects to a local socket as a client.
    ///
    /// # Errors
    ///
    /// Returns the connect error.
    pub async fn connect(path: impl AsRef<Path>) -> ProtocolResult<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::new_with_credentials(stream, None))
    }

    /// Peer credentials captured at accept time.
    #[must_use]
    pub const fn credentials(&self) -> Option<&PeerCredentials> {
        self.credentials.as_ref()
    }

    /// Serializes and sends one message.
    ///
    /// # Errors
    ///
    /// Fails on serialization, oversize payloads, or I/O.
    pub async fn send<T: Serialize + Sync>(&mut self, message: &T) -> ProtocolResult<()> {
        let payload = serde_json::to_vec(message)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::frame_too_large(payload.len(), MAX_FRAME_SIZE));
        }
        self.framed
            .send(Bytes::from(payload))
            .await
            .map_err(map_codec_error)
    }

    /// Receives one message; `Ok(None)` when the peer closed cleanly.
    ///
    /// # Errors
    ///
    /// Fails on oversize frames, malformed JSON, or I/O.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> ProtocolResult<Option<T>> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(serde_json::from_slice(&frame)?)),
            Some(Err(e)) => Err(map_codec_error(e)),
            None => Ok(None),
        }
    }

    /// Sends `request` and waits for the reply.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ConnectionClosed`] if the peer hangs up first.
    pub async fn request<Q, R>(&mut self, request: &Q) -> ProtocolResult<R>
    where
        Q: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.send(request).await?;
        self.recv().await?.ok_or(ProtocolError::ConnectionClosed)
    }
}

fn map_codec_error(e: io::Error) -> ProtocolError {
    // LengthDelimitedCodec reports oversize frames as InvalidData.
    if e.kind() == io::ErrorKind::InvalidData {
        ProtocolError::frame_too_large(MAX_FRAME_SIZE + 1, MAX_FRAME_SIZE)
    } else {
        ProtocolError::Io(e)
    }
}

/// Connection slot held for the lifetime of an accepted connection.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionPermit {
    /// Wraps a semaphore permit.
    #[must_use]
    pub const fn new(permit: OwnedSemaphorePermit) -> Self {
        Self { _permit: permit }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut client = Connection::new_with_credentials(a, None);
        let mut server = Connection::new_with_credentials(b, None);

        let echo = tokio::spawn(async move {
            let ping: Ping = server.recv().await.unwrap().unwrap();
            server.send(&Ping { seq: ping.seq + 1 }).await.unwrap();
        });

        let reply: Ping = client.request(&Ping { seq: 1 }).await.unwrap();
        assert_eq!(reply, Ping { seq: 2 });
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_close() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut server = Connection::new_with_credentials(b, None);
        drop(a);
        assert!(server.recv::<Ping>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_prefix_rejected() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut server = Connection::new_with_credentials(b, None);

        let len = u32::try_from(MAX_FRAME_SIZE + 1).unwrap();
        a.write_all(&len.to_be_bytes()).await.unwrap();

        let err = server.recv::<Ping>().await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_malformed_json_rejected() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut server = Connection::new_with_credentials(b, None);

        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{x}").await.unwrap();

        let err = server.recv::<Ping>().await.unwrap_err();
        assert!(err.is_protocol_violation());
    }
}
