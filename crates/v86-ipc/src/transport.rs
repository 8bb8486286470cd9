//! Byte transports between the caller and the engine.

use std::{future::Future, io, path::PathBuf};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{unix::OwnedWriteHalf, UnixStream},
    sync::{mpsc, Mutex},
};
use tracing::{debug, warn};

use crate::{envelope, Header, Request, TransportError};

/// Carries encoded envelopes to the engine and replies back.
pub trait Transport: Send + Sync + 'static {
    /// Sends one envelope. Fails with [`TransportError::NoListener`] when
    /// nothing is accepting requests.
    fn send(&self, frame: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Waits for the next envelope from the engine.
    fn recv(&self) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}

/// Reads one envelope; `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut head = [0u8; envelope::HEADER_LEN];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let header =
        Header::decode(&head).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let mut frame = head.to_vec();
    frame.resize(header.frame_len(), 0);
    reader.read_exact(&mut frame[envelope::HEADER_LEN..]).await?;
    Ok(Some(frame))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Client end of the engine's Unix stream socket.
///
/// The connection is opened on first use. A write that fails on the cached
/// connection is retried once on a fresh one, so an engine that restarted
/// is reached and an engine that is gone reports
/// [`TransportError::NoListener`]. Replies from every connection are
/// funnelled into one queue.
#[derive(Debug)]
pub struct UnixTransport {
    path: PathBuf,
    writer: Mutex<Option<OwnedWriteHalf>>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl UnixTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            path: path.into(),
            writer: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    async fn connect(&self) -> Result<OwnedWriteHalf, TransportError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(TransportError::from_connect)?;
        debug!(path = %self.path.display(), "connected to engine");
        let (mut reader, writer) = stream.into_split();
        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if inbound.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%err, "engine connection failed");
                        break;
                    }
                }
            }
        });
        Ok(writer)
    }
}

impl Transport for UnixTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        if let Some(stream) = writer.as_mut() {
            match write_frame(stream, &frame).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(%err, "engine connection lost, reconnecting");
                    *writer = None;
                }
            }
        }

        let mut stream = self.connect().await?;
        write_frame(&mut stream, &frame)
            .await
            .map_err(TransportError::from_write)?;
        *writer = Some(stream);
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

/// In-process transport feeding a [`Server::run`](crate::Server::run) loop.
#[derive(Debug)]
pub struct MemoryTransport {
    requests: mpsc::UnboundedSender<Request>,
    replies_tx: mpsc::UnboundedSender<Vec<u8>>,
    replies_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryTransport {
    /// The transport and the request queue a server consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Request>) {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let transport = Self {
            requests,
            replies_tx,
            replies_rx: Mutex::new(replies_rx),
        };
        (transport, requests_rx)
    }
}

impl Transport for MemoryTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.requests
            .send(Request {
                frame,
                reply: self.replies_tx.clone(),
            })
            .map_err(|_| TransportError::NoListener)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        self.replies_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelId, Envelope};
    use v86_task::Task;

    #[tokio::test]
    async fn frames_are_self_delimiting() {
        let a = Envelope::request(ChannelId::V86D, 1, 2, Task::default())
            .encode()
            .unwrap();
        let b = Envelope::request(ChannelId::V86D, 3, 4, Task::exit())
            .encode()
            .unwrap();
        let stream = [a.clone(), b.clone()].concat();

        let mut reader = &stream[..];
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(a));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(b));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let frame = Envelope::request(ChannelId::V86D, 1, 2, Task::exit())
            .encode()
            .unwrap();
        let mut reader = &frame[..frame.len() - 1];
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn missing_socket_means_no_listener() {
        let dir = tempfile::tempdir().unwrap();
        let transport = UnixTransport::new(dir.path().join("v86d.sock"));
        assert!(matches!(
            transport.send(vec![0; 20]).await,
            Err(TransportError::NoListener)
        ));
    }

    #[tokio::test]
    async fn memory_transport_without_server_has_no_listener() {
        let (transport, requests) = MemoryTransport::channel();
        drop(requests);
        assert!(matches!(
            transport.send(Vec::new()).await,
            Err(TransportError::NoListener)
        ));
    }
}
