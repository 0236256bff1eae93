use super::terminator::Terminator;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};

const CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// Deadline elapsed before a complete message arrived. Bytes received so
    /// far stay buffered for the next read.
    #[error("read timed out with {pending} bytes pending")]
    Timeout { pending: usize },
    /// Peer closed the stream. `residue` holds any incomplete trailing bytes.
    #[error("connection closed by peer")]
    Eof { residue: Vec<u8> },
    #[error("no complete message within {limit} bytes")]
    Overflow { limit: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReadError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReadError::Timeout { .. })
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, ReadError::Eof { .. })
    }
}

/// Accumulates bytes from a stream and hands out one framed message at a time.
/// Bytes past the end of a match are kept for the next call.
pub struct FramedReader {
    buf: Vec<u8>,
    max_bytes: usize,
}

impl FramedReader {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_bytes: max_bytes.max(1),
        }
    }

    pub async fn read<T: AsyncRead + Unpin + ?Sized>(
        &mut self,
        stream: &mut T,
        terminator: Terminator,
        limit: Duration,
    ) -> Result<Vec<u8>, ReadError> {
        self.read_until(stream, terminator, Instant::now() + limit)
            .await
    }

    /// Like [`FramedReader::read`], but against an absolute deadline.
    pub async fn read_until<T: AsyncRead + Unpin + ?Sized>(
        &mut self,
        stream: &mut T,
        terminator: Terminator,
        deadline: Instant,
    ) -> Result<Vec<u8>, ReadError> {
        let mut chunk = [0u8; CHUNK];
        loop {
            if let Some(end) = terminator.find(&self.buf) {
                return Ok(self.buf.drain(..end).collect());
            }
            if self.buf.len() >= self.max_bytes {
                return Err(ReadError::Overflow {
                    limit: self.max_bytes,
                });
            }

            let room = (self.max_bytes - self.buf.len()).min(CHUNK);
            match timeout_at(deadline, stream.read(&mut chunk[..room])).await {
                Err(_) => {
                    return Err(ReadError::Timeout {
                        pending: self.buf.len(),
                    })
                }
                Ok(Ok(0)) => {
                    return Err(ReadError::Eof {
                        residue: std::mem::take(&mut self.buf),
                    })
                }
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(err)) => return Err(err.into()),
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drops everything buffered and returns it.
    pub fn discard(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const LIMIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn keeps_bytes_after_the_match() {
        let mut reader = FramedReader::new(64);
        let mut data: &[u8] = b"220 hi\r\n250 ok\r\n";
        let first = reader
            .read(&mut data, Terminator::SmtpReply, LIMIT)
            .await
            .unwrap();
        assert_eq!(first, b"220 hi\r\n");
        let second = reader
            .read(&mut data, Terminator::SmtpReply, LIMIT)
            .await
            .unwrap();
        assert_eq!(second, b"250 ok\r\n");
        assert_eq!(reader.pending(), 0);
    }

    async fn trickle(message: &'static [u8], terminator: Terminator) -> Vec<u8> {
        let (mut client, mut server) = tokio::io::duplex(8);
        tokio::spawn(async move {
            for byte in message.iter() {
                server.write_all(&[*byte]).await.unwrap();
                tokio::task::yield_now().await;
            }
            server
        });

        let mut reader = FramedReader::new(1024);
        reader.read(&mut client, terminator, LIMIT).await.unwrap()
    }

    #[tokio::test]
    async fn reassembles_byte_by_byte_delivery() {
        let cases: [(&'static [u8], Terminator); 5] = [
            (
                b"* CAPABILITY IMAP4rev1 STARTTLS\r\nA OK done\r\n",
                Terminator::ImapTagged,
            ),
            (
                b"250-mx.example.org\r\n250-PIPELINING\r\n250 STARTTLS\r\n",
                Terminator::SmtpReply,
            ),
            (b"* OK IMAP4rev1 ready\r\n", Terminator::ImapUntagged),
            (b"+OK POP3 ready\r\n", Terminator::Pop3Line),
            (
                b"+OK capability list\r\nUSER\r\nSTLS\r\n.\r\n",
                Terminator::Pop3MultiLine,
            ),
        ];
        for (message, terminator) in cases {
            let framed = trickle(message, terminator).await;
            assert_eq!(framed, message.to_vec(), "{terminator:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn read_until_honours_an_elapsed_deadline() {
        let (mut client, _server) = tokio::io::duplex(64);
        let mut reader = FramedReader::new(64);
        let err = reader
            .read_until(&mut client, Terminator::Line, Instant::now())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_not_eof() {
        let (mut client, _server) = tokio::io::duplex(64);
        let mut reader = FramedReader::new(64);
        let err = reader
            .read(&mut client, Terminator::Line, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Timeout { pending: 0 }));
        assert!(!err.is_eof());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_line_survives_timeout() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(b"250-ok\r\n").await.unwrap();

        let mut reader = FramedReader::new(64);
        let err = reader
            .read(&mut client, Terminator::SmtpReply, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Timeout { pending: 8 }));

        server.write_all(b"221 bye\r\n").await.unwrap();
        let framed = reader
            .read(&mut client, Terminator::SmtpReply, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(framed, b"250-ok\r\n221 bye\r\n");
    }

    #[tokio::test]
    async fn eof_carries_residue() {
        let mut reader = FramedReader::new(64);
        let mut empty: &[u8] = b"";
        let err = reader
            .read(&mut empty, Terminator::Line, LIMIT)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Eof { ref residue } if residue.is_empty()));

        let mut dangling: &[u8] = b"+OK no newline";
        let err = reader
            .read(&mut dangling, Terminator::Pop3Line, LIMIT)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Eof { ref residue } if residue == b"+OK no newline"));
    }

    #[tokio::test]
    async fn bounded_buffer_overflows() {
        let mut reader = FramedReader::new(8);
        let mut data: &[u8] = b"0123456789\r\n";
        let err = reader
            .read(&mut data, Terminator::Line, LIMIT)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Overflow { limit: 8 }));
    }
}
