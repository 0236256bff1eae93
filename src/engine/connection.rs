use super::reader::{FramedReader, ReadError};
use super::terminator::Terminator;
use crate::model::TlsInfo;
use crate::tls::{HandshakeError, TlsUpgrader};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

/// Anything a scan can talk over: the raw TCP stream, its TLS wrapper, or an
/// in-memory pipe in tests.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("write timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("TLS handshake timed out")]
    Timeout,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

/// One live stream owned by one scan. The TLS upgrade swaps the stream inside
/// the same slot, so the plaintext handle cannot be reached afterwards.
///
/// Every operation is bounded by `op_timeout` and, when set, by the scan's
/// overall deadline, whichever comes first.
pub struct Connection {
    slot: Option<BoxedStream>,
    reader: FramedReader,
    op_timeout: Duration,
    deadline: Option<Instant>,
    encrypted: bool,
}

impl Connection {
    pub fn new(stream: BoxedStream, max_bytes: usize, op_timeout: Duration) -> Self {
        Self {
            slot: Some(stream),
            reader: FramedReader::new(max_bytes),
            op_timeout,
            deadline: None,
            encrypted: false,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// True once the overall deadline has passed.
    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn op_deadline(&self) -> Instant {
        let per_op = Instant::now() + self.op_timeout;
        match self.deadline {
            Some(overall) => per_op.min(overall),
            None => per_op,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub async fn read_framed(&mut self, terminator: Terminator) -> Result<Vec<u8>, ReadError> {
        let until = self.op_deadline();
        let stream = live(&mut self.slot)?;
        self.reader.read_until(stream, terminator, until).await
    }

    /// Drops whatever is buffered but not yet framed.
    pub fn discard_pending(&mut self) -> Vec<u8> {
        self.reader.discard()
    }

    /// Writes `command` followed by CRLF in a single write.
    pub async fn send(&mut self, command: &str) -> Result<(), WriteError> {
        let mut payload = Vec::with_capacity(command.len() + 2);
        payload.extend_from_slice(command.as_bytes());
        payload.extend_from_slice(b"\r\n");

        let until = self.op_deadline();
        let stream = live(&mut self.slot)?;
        match timeout_at(until, async {
            stream.write_all(&payload).await?;
            stream.flush().await
        })
        .await
        {
            Ok(res) => res.map_err(WriteError::from),
            Err(_) => Err(WriteError::Timeout),
        }
    }

    /// Hands the plaintext stream to `upgrader` and installs the encrypted one
    /// in its place. Buffered plaintext is dropped, never replayed into the
    /// TLS session.
    pub async fn upgrade(
        &mut self,
        upgrader: &dyn TlsUpgrader,
        server_name: &str,
    ) -> Result<Option<TlsInfo>, UpgradeError> {
        self.reader.discard();
        let plain = self
            .slot
            .take()
            .ok_or(HandshakeError::Io(std::io::ErrorKind::NotConnected.into()))?;

        let until = self.op_deadline();
        let upgraded = match timeout_at(until, upgrader.upgrade(plain, server_name)).await {
            Ok(res) => res?,
            Err(_) => return Err(UpgradeError::Timeout),
        };
        self.slot = Some(upgraded.stream);
        self.encrypted = true;
        Ok(upgraded.info)
    }

    pub async fn shutdown(&mut self) {
        let until = Instant::now() + self.op_timeout;
        if let Some(stream) = self.slot.as_mut() {
            let _ = timeout_at(until, stream.shutdown()).await;
        }
    }
}

fn live(slot: &mut Option<BoxedStream>) -> std::io::Result<&mut BoxedStream> {
    slot.as_mut()
        .ok_or_else(|| std::io::ErrorKind::NotConnected.into())
}
