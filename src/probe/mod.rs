pub mod capabilities;
pub mod dialect;
mod session;
pub mod tag;
pub mod trace;

pub use capabilities::{scan_capabilities, scan_implicit_tls, CapabilityResult};

use crate::engine::connection::{BoxedStream, UpgradeError};
use crate::engine::reader::ReadError;
use crate::model::{ScanStatus, Step, TlsInfo};
use crate::tls::{HandshakeError, TlsUpgrader};
use dialect::Dialect;
use serde::Serialize;
use session::{Halt, ProbeSession};
use std::time::Duration;
use tag::TagGenerator;
use tokio::time::Instant;
use tracing::{debug, info};
use trace::Trace;

/// Everything one scan borrows from its caller.
pub struct ScanContext<'a> {
    pub dialect: &'static Dialect,
    pub upgrader: &'a dyn TlsUpgrader,
    pub tags: &'a TagGenerator,
    pub server_name: String,
    pub scan_domain: String,
    pub op_timeout: Duration,
    /// Overall deadline for the whole exchange. Each operation stops at
    /// whichever comes first, this or `op_timeout`.
    pub deadline: Option<Instant>,
    pub max_bytes: usize,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScanResult {
    pub vulnerable: bool,
    pub trace: Trace,
    /// Ordinal of the last step entered.
    #[serde(rename = "status")]
    pub step: u8,
    #[serde(rename = "tls", skip_serializing_if = "Option::is_none")]
    pub tls_log: Option<TlsInfo>,
}

/// A finished scan: terminal status, the data gathered, and the error text
/// when the status is not a clean outcome.
#[derive(Debug, Clone)]
pub struct ScanReport<R> {
    pub status: ScanStatus,
    pub result: R,
    pub error: Option<String>,
}

/// Pipelines STARTTLS with a tagged probe command in one write, upgrades, and
/// watches the encrypted channel for the probe's answer.
pub async fn scan_buffering(stream: BoxedStream, ctx: &ScanContext<'_>) -> ScanReport<ScanResult> {
    let mut session = ProbeSession::new(stream, ctx);
    let mut vulnerable = false;
    let outcome = run_buffering(&mut session, &mut vulnerable).await;
    let (status, error) = settle(outcome, session.expired());
    let (trace, step, tls_log) = session.finish().await;

    info!(
        protocol = %ctx.dialect.protocol,
        status = %status,
        vulnerable,
        step = step.name(),
        "buffering scan finished"
    );

    ScanReport {
        status,
        result: ScanResult {
            vulnerable,
            trace,
            step: step.ordinal(),
            tls_log,
        },
        error,
    }
}

/// Terminal status of a scan. Once the overall deadline has passed the scan
/// reports `timeout`, even when the step that hit it tolerated the timeout.
/// Clean stops reached for other reasons keep their own status.
pub(crate) fn settle(outcome: Result<(), Halt>, expired: bool) -> (ScanStatus, Option<String>) {
    match outcome {
        Ok(()) if !expired => (ScanStatus::Success, None),
        Err(halt) if !expired || halt.status != ScanStatus::Timeout => (halt.status, halt.error),
        _ => (ScanStatus::Timeout, Some("overall timeout".into())),
    }
}

async fn run_buffering(s: &mut ProbeSession<'_>, vulnerable: &mut bool) -> Result<(), Halt> {
    let ctx = s.ctx;
    let d = s.dialect();
    let domain = ctx.scan_domain.as_str();

    s.greet().await?;

    if let Some(hello) = d.hello {
        s.enter(Step::Hello);
        s.send(&hello.render(None, domain)).await?;
        let reply = s
            .read(d.response)
            .await
            .map_err(|err| Halt::read(Step::Hello, err))?;
        s.check_blacklist(&reply)?;
    }

    let probe = ctx.tags.next_tag();
    s.enter(Step::Pipeline);
    s.send(&d.pipeline.render(Some(&probe), domain)).await?;
    let reply = match s.read(d.response).await {
        Ok(reply) => reply,
        Err(ReadError::Eof { .. }) if d.close_proves_safe => {
            s.trace.event("Connection closed");
            return Ok(());
        }
        Err(err) => return Err(Halt::read(Step::Pipeline, err)),
    };
    if !d.accepted.matches(&reply) {
        debug!(protocol = %d.protocol, "STARTTLS refused");
        return say_goodbye(s).await;
    }

    if d.drain_pre_tls {
        s.enter(Step::PreTlsDrain);
        s.drain(|_| false).await;
    }

    s.enter(Step::Handshake);
    match s.upgrade().await {
        Ok(()) => {}
        Err(UpgradeError::Handshake(HandshakeError::PeerClosed)) if d.close_proves_safe => {
            s.trace.event("Connection closed");
            return Ok(());
        }
        Err(err) => return Err(Halt::upgrade(err)),
    }

    s.enter(Step::PostTlsRead);
    match s.read(d.response).await {
        Ok(frame) => {
            if !d.evidence.in_response(&frame, &probe) {
                return Err(Halt::stop(ScanStatus::Unknown));
            }
            *vulnerable = true;
        }
        // A slow server may still answer; the push step decides.
        Err(ReadError::Timeout { .. }) => {}
        Err(ReadError::Eof { residue }) => {
            *vulnerable |= d.evidence.in_response(&residue, &probe);
            return Err(Halt::read(Step::PostTlsRead, ReadError::Eof { residue }));
        }
        Err(err) => return Err(Halt::read(Step::PostTlsRead, err)),
    }

    let push_tag = ctx.tags.next_tag();
    s.enter(Step::Push);
    if let Err(halt) = s.send(&d.push.render(Some(&push_tag), domain)).await {
        return peer_gone(s, halt);
    }
    match s.read(d.response).await {
        Ok(frame) => *vulnerable |= d.evidence.in_push_reply(&frame, &probe),
        Err(ReadError::Eof { residue }) => {
            *vulnerable |= d.evidence.in_push_reply(&residue, &probe);
            s.trace.event("Connection closed");
            return Ok(());
        }
        Err(err) => return Err(Halt::read(Step::Push, err)),
    }

    s.enter(Step::PostTlsDrain);
    *vulnerable |= s.drain(|line| d.evidence.in_response(line, &probe)).await;
    Ok(())
}

/// Polite exit after STARTTLS was refused. A peer that hangs up instead of
/// answering is fine.
async fn say_goodbye(s: &mut ProbeSession<'_>) -> Result<(), Halt> {
    let d = s.dialect();
    let quit = d.quit.render(None, &s.ctx.scan_domain);
    if let Err(halt) = s.send(&quit).await {
        return peer_gone(s, halt);
    }
    match s.read(d.response).await {
        Ok(_) => Ok(()),
        Err(ReadError::Eof { .. }) => {
            s.trace.event("Connection closed");
            Ok(())
        }
        Err(err) => Err(Halt::read(s.step(), err)),
    }
}

/// A write that failed because the peer already left ends the scan cleanly.
fn peer_gone(s: &mut ProbeSession<'_>, halt: Halt) -> Result<(), Halt> {
    if halt.status == ScanStatus::Eof(s.step()) {
        s.trace.event("Connection closed");
        return Ok(());
    }
    Err(halt)
}
