use super::dialect::{is_blacklisted, Dialect};
use super::trace::Trace;
use super::ScanContext;
use crate::engine::connection::{BoxedStream, Connection, UpgradeError, WriteError};
use crate::engine::reader::ReadError;
use crate::engine::terminator::Terminator;
use crate::model::{ScanStatus, Step, TlsInfo};
use crate::tls::{is_peer_close, HandshakeError};
use std::io::ErrorKind;
use tracing::debug;

/// Why a scan stopped before running to the end. Clean stops (blacklisted,
/// wrong protocol, ...) carry no error.
#[derive(Debug)]
pub(crate) struct Halt {
    pub(crate) status: ScanStatus,
    pub(crate) error: Option<String>,
}

impl Halt {
    pub(crate) fn stop(status: ScanStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub(crate) fn read(step: Step, err: ReadError) -> Self {
        let status = match err {
            ReadError::Timeout { .. } => ScanStatus::Timeout,
            ReadError::Eof { .. } => ScanStatus::Eof(step),
            ReadError::Overflow { .. } | ReadError::Io(_) => ScanStatus::Error,
        };
        Self {
            status,
            error: Some(err.to_string()),
        }
    }

    pub(crate) fn write(step: Step, err: WriteError) -> Self {
        let status = match &err {
            WriteError::Timeout => ScanStatus::Timeout,
            WriteError::Io(io) if is_peer_close(io.kind()) || io.kind() == ErrorKind::ConnectionReset => {
                ScanStatus::Eof(step)
            }
            WriteError::Io(_) => ScanStatus::Error,
        };
        Self {
            status,
            error: Some(err.to_string()),
        }
    }

    pub(crate) fn upgrade(err: UpgradeError) -> Self {
        let status = match &err {
            UpgradeError::Timeout => ScanStatus::Timeout,
            UpgradeError::Handshake(HandshakeError::PeerClosed) => ScanStatus::Eof(Step::Handshake),
            UpgradeError::Handshake(_) => ScanStatus::Error,
        };
        Self {
            status,
            error: Some(err.to_string()),
        }
    }
}

/// One scan's connection plus everything it records along the way.
pub(crate) struct ProbeSession<'s> {
    pub(crate) ctx: &'s ScanContext<'s>,
    conn: Connection,
    pub(crate) trace: Trace,
    step: Step,
    tls_log: Option<TlsInfo>,
}

impl<'s> ProbeSession<'s> {
    pub(crate) fn new(stream: BoxedStream, ctx: &'s ScanContext<'s>) -> Self {
        Self {
            conn: Connection::new(stream, ctx.max_bytes, ctx.op_timeout)
                .with_deadline(ctx.deadline),
            ctx,
            trace: Trace::default(),
            step: Step::Connect,
            tls_log: None,
        }
    }

    pub(crate) fn dialect(&self) -> &'static Dialect {
        self.ctx.dialect
    }

    pub(crate) fn enter(&mut self, step: Step) {
        debug!(
            protocol = %self.ctx.dialect.protocol,
            step = step.name(),
            encrypted = self.conn.is_encrypted(),
            "entering step"
        );
        self.step = step;
    }

    pub(crate) fn step(&self) -> Step {
        self.step
    }

    /// True once the scan's overall deadline has passed.
    pub(crate) fn expired(&self) -> bool {
        self.conn.expired()
    }

    pub(crate) async fn send(&mut self, command: &str) -> Result<(), Halt> {
        self.trace.client(command);
        self.conn
            .send(command)
            .await
            .map_err(|err| Halt::write(self.step, err))
    }

    /// Reads one framed message and records it. An incomplete tail left by a
    /// closing peer is recorded as well.
    pub(crate) async fn read(&mut self, terminator: Terminator) -> Result<Vec<u8>, ReadError> {
        let res = self.conn.read_framed(terminator).await;
        match &res {
            Ok(frame) => self.trace.server(frame),
            Err(ReadError::Eof { residue }) if !residue.is_empty() => self.trace.server(residue),
            Err(_) => {}
        }
        res
    }

    /// Reads lines until the peer goes quiet or closes. Returns whether any
    /// line satisfied `evidence`.
    pub(crate) async fn drain(&mut self, mut evidence: impl FnMut(&[u8]) -> bool + Send) -> bool {
        let mut seen = false;
        loop {
            match self.read(Terminator::Line).await {
                Ok(line) => seen |= evidence(&line),
                Err(ReadError::Eof { residue }) => {
                    seen |= !residue.is_empty() && evidence(&residue);
                    self.trace.event("Connection closed");
                    return seen;
                }
                Err(err) => {
                    debug!(error = %err, "drain finished");
                    return seen;
                }
            }
        }
    }

    /// Greeting plus the checks that may end the scan before any command.
    pub(crate) async fn greet(&mut self) -> Result<Vec<u8>, Halt> {
        let dialect = self.dialect();
        let not_ours = Halt::stop(ScanStatus::NotThisProtocol(dialect.protocol));

        self.enter(Step::Greeting);
        let greeting = match self.read(dialect.greeting).await {
            Ok(frame) => frame,
            Err(err) if err.is_timeout() && self.expired() => {
                return Err(Halt::read(Step::Greeting, err))
            }
            Err(ReadError::Timeout { .. }) | Err(ReadError::Overflow { .. }) => {
                return Err(not_ours)
            }
            Err(ReadError::Eof { residue }) if !residue.is_empty() => return Err(not_ours),
            Err(err) => return Err(Halt::read(Step::Greeting, err)),
        };

        if !dialect.greeting_marker.matches(&greeting) {
            return Err(not_ours);
        }
        self.check_blacklist(&greeting)?;
        Ok(greeting)
    }

    pub(crate) fn check_blacklist(&self, frame: &[u8]) -> Result<(), Halt> {
        if self.dialect().blacklist && is_blacklisted(frame) {
            return Err(Halt::stop(ScanStatus::Blacklisted));
        }
        Ok(())
    }

    /// Swaps the plaintext stream for a TLS one. Unread plaintext is recorded
    /// and thrown away first.
    pub(crate) async fn upgrade(&mut self) -> Result<(), UpgradeError> {
        let leftover = self.conn.discard_pending();
        if !leftover.is_empty() {
            self.trace.server(&leftover);
            self.trace.event("Unread plaintext discarded");
        }

        self.trace.event("TLS Handshake");
        let info = self
            .conn
            .upgrade(self.ctx.upgrader, &self.ctx.server_name)
            .await?;
        if self.ctx.verbose {
            self.tls_log = info;
        }
        Ok(())
    }

    pub(crate) async fn finish(mut self) -> (Trace, Step, Option<TlsInfo>) {
        self.conn.shutdown().await;
        (self.trace, self.step, self.tls_log)
    }
}
