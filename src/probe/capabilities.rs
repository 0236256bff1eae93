use super::dialect::Template;
use super::session::{Halt, ProbeSession};
use super::trace::Trace;
use super::{settle, ScanContext, ScanReport};
use crate::engine::connection::BoxedStream;
use crate::engine::reader::ReadError;
use crate::engine::terminator::Terminator;
use crate::model::{ScanStatus, Step, TlsInfo};
use crate::util::sanitize_text;
use serde::Serialize;
use tracing::info;

/// What a server advertises about itself, before and after TLS. Implicit-TLS
/// scans never see plaintext, so only the `post_tls` side is filled.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CapabilityResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_tls: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_tls_help: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_tls: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_tls_help: Option<String>,
    /// Server identification, when the server accepted the ID exchange.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub trace: Trace,
    #[serde(rename = "status")]
    pub step: u8,
    #[serde(rename = "tls", skip_serializing_if = "Option::is_none")]
    pub tls_log: Option<TlsInfo>,
}

/// Capability listing in plaintext, STARTTLS, then the listing again over TLS.
pub async fn scan_capabilities(
    stream: BoxedStream,
    ctx: &ScanContext<'_>,
) -> ScanReport<CapabilityResult> {
    let mut session = ProbeSession::new(stream, ctx);
    let mut result = CapabilityResult::default();
    let outcome = fetch(&mut session, &mut result).await;
    finish(session, result, outcome, "capabilities scan finished").await
}

/// Same questions on a port that speaks TLS from the first byte. The
/// handshake comes before the greeting.
pub async fn scan_implicit_tls(
    stream: BoxedStream,
    ctx: &ScanContext<'_>,
) -> ScanReport<CapabilityResult> {
    let mut session = ProbeSession::new(stream, ctx);
    let mut result = CapabilityResult::default();
    let outcome = fetch_implicit(&mut session, &mut result).await;
    finish(session, result, outcome, "implicit TLS scan finished").await
}

async fn finish(
    session: ProbeSession<'_>,
    mut result: CapabilityResult,
    outcome: Result<(), Halt>,
    message: &'static str,
) -> ScanReport<CapabilityResult> {
    let protocol = session.dialect().protocol;
    let (status, error) = settle(outcome, session.expired());
    let (trace, step, tls_log) = session.finish().await;
    info!(
        protocol = %protocol,
        status = %status,
        step = step.name(),
        "{}",
        message
    );

    result.trace = trace;
    result.step = step.ordinal();
    result.tls_log = tls_log;
    ScanReport {
        status,
        result,
        error,
    }
}

async fn fetch(s: &mut ProbeSession<'_>, result: &mut CapabilityResult) -> Result<(), Halt> {
    let d = s.dialect();

    let greeting = s.greet().await?;
    result.greeting = Some(sanitize_text(&greeting));

    s.enter(Step::Hello);
    let query = render(s, d.capability);
    let listing = ask(s, &query, d.capability_response).await?;
    s.check_blacklist(&listing)?;
    result.pre_tls = Some(sanitize_text(&listing));
    result.pre_tls_help = help(s).await?;

    s.enter(Step::Pipeline);
    let starttls = render(s, d.starttls);
    let reply = ask(s, &starttls, d.response).await?;
    if !d.starttls_accepted.matches(&reply) {
        return Err(Halt::stop(ScanStatus::NoStartTls));
    }

    s.enter(Step::Handshake);
    s.upgrade().await.map_err(Halt::upgrade)?;

    s.enter(Step::PostTlsRead);
    let listing = ask(s, &query, d.capability_response).await?;
    result.post_tls = Some(sanitize_text(&listing));
    result.post_tls_help = help(s).await?;
    result.id = identify(s).await?;

    sign_off(s).await
}

async fn fetch_implicit(
    s: &mut ProbeSession<'_>,
    result: &mut CapabilityResult,
) -> Result<(), Halt> {
    let d = s.dialect();

    s.enter(Step::Handshake);
    s.upgrade().await.map_err(Halt::upgrade)?;

    let greeting = s.greet().await?;
    result.greeting = Some(sanitize_text(&greeting));

    s.enter(Step::Hello);
    let query = render(s, d.capability);
    let listing = ask(s, &query, d.capability_response).await?;
    s.check_blacklist(&listing)?;
    result.post_tls = Some(sanitize_text(&listing));
    result.post_tls_help = help(s).await?;
    result.id = identify(s).await?;

    sign_off(s).await
}

/// Nothing left to learn; the server may answer the quit or just hang up.
async fn sign_off(s: &mut ProbeSession<'_>) -> Result<(), Halt> {
    let d = s.dialect();
    s.enter(Step::Push);
    let quit = render(s, d.quit);
    if s.send(&quit).await.is_err() {
        return Ok(());
    }
    match s.read(d.response).await {
        Ok(_) => {}
        Err(ReadError::Eof { .. }) => {
            s.trace.event("Connection closed");
            return Ok(());
        }
        Err(_) => return Ok(()),
    }

    s.enter(Step::PostTlsDrain);
    s.drain(|_| false).await;
    Ok(())
}

async fn help(s: &mut ProbeSession<'_>) -> Result<Option<String>, Halt> {
    let d = s.dialect();
    let Some(command) = d.help else {
        return Ok(None);
    };
    let command = render(s, command);
    let reply = ask(s, &command, d.response).await?;
    Ok(Some(sanitize_text(&reply)))
}

async fn identify(s: &mut ProbeSession<'_>) -> Result<Option<String>, Halt> {
    let d = s.dialect();
    let Some(query) = d.id else {
        return Ok(None);
    };
    let command = render(s, query.command);
    let reply = ask(s, &command, d.response).await?;
    Ok(query
        .accepted
        .matches(&reply)
        .then(|| sanitize_text(&reply)))
}

fn render(s: &ProbeSession<'_>, template: Template) -> String {
    template.render(None, &s.ctx.scan_domain)
}

async fn ask(
    s: &mut ProbeSession<'_>,
    command: &str,
    terminator: Terminator,
) -> Result<Vec<u8>, Halt> {
    let step = s.step();
    s.send(command).await?;
    s.read(terminator)
        .await
        .map_err(|err| Halt::read(step, err))
}
