pub mod connection;
pub mod rate;
pub mod reader;
pub mod terminator;

use crate::model::{Config, ScanData, ScanKind, ScanOutcome, ScanStatus, Target};
use crate::output::OutputChannel;
use crate::probe::dialect::dialect;
use crate::probe::tag::TagGenerator;
use crate::probe::{scan_buffering, scan_capabilities, scan_implicit_tls, ScanContext};
use crate::tls::TlsUpgrader;
use crate::util::now_iso8601;
use connection::BoxedStream;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rate::RateLimiter;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument, warn};

/// Fans scans out over every input target, bounded by the concurrency limit
/// and the connection rate.
pub struct Engine {
    cfg: Arc<Config>,
    sink: OutputChannel,
    limiter: RateLimiter,
    sem: Arc<Semaphore>,
    upgrader: Arc<dyn TlsUpgrader>,
    tags: Arc<TagGenerator>,
}

impl Engine {
    pub fn new(cfg: Config, sink: OutputChannel, upgrader: Arc<dyn TlsUpgrader>) -> Self {
        Self {
            limiter: RateLimiter::new(cfg.rate),
            sem: Arc::new(Semaphore::new(cfg.concurrency)),
            cfg: Arc::new(cfg),
            sink,
            upgrader,
            tags: Arc::new(TagGenerator::from_time()),
        }
    }

    #[instrument(skip(self), fields(protocol = %self.cfg.protocol, scan = %self.cfg.scan))]
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut stream = crate::input::stream_targets(&self.cfg)?;
        let mut tasks = FuturesUnordered::new();

        while let Some(target) = stream.next().await {
            self.limiter.acquire().await;
            let permit = self.sem.clone().acquire_owned().await?;
            let cfg = self.cfg.clone();
            let sink = self.sink.clone();
            let upgrader = self.upgrader.clone();
            let tags = self.tags.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = scan_target(&target, &cfg, upgrader.as_ref(), &tags).await;
                if let Err(err) = sink.emit(outcome).await {
                    warn!(target = %target.resolved, error = %err, "dropping scan outcome");
                }
            }));

            self.limiter.sleep_jitter().await;
        }

        while tasks.next().await.is_some() {}
        Ok(())
    }
}

/// Connects to one target and runs the configured scan. The overall timeout
/// is a deadline every network operation honours, so a scan that runs out of
/// time still reports what it saw. Always produces an outcome.
#[instrument(skip_all, fields(target = %target.resolved))]
pub async fn scan_target(
    target: &Target,
    cfg: &Config,
    upgrader: &dyn TlsUpgrader,
    tags: &TagGenerator,
) -> ScanOutcome {
    let start = Instant::now();
    let outcome = process_target(target, cfg, upgrader, tags, start + cfg.overall_timeout).await;
    debug!(
        status = %outcome.status,
        ms = start.elapsed().as_millis() as u64,
        "processed target"
    );
    outcome
}

async fn process_target(
    target: &Target,
    cfg: &Config,
    upgrader: &dyn TlsUpgrader,
    tags: &TagGenerator,
    deadline: Instant,
) -> ScanOutcome {
    let connect_by = deadline.min(Instant::now() + cfg.connect_timeout);
    let stream: BoxedStream = match timeout_at(connect_by, TcpStream::connect(target.resolved)).await {
        Ok(Ok(stream)) => Box::new(stream),
        Ok(Err(err)) => {
            return empty_outcome(target, cfg, ScanStatus::ConnectError, Some(err.to_string()))
        }
        Err(_) => {
            return empty_outcome(
                target,
                cfg,
                ScanStatus::Timeout,
                Some("connect timeout".into()),
            )
        }
    };

    let ctx = ScanContext {
        dialect: dialect(cfg.protocol),
        upgrader,
        tags,
        server_name: target.server_name(),
        scan_domain: cfg.scan_domain.clone(),
        op_timeout: cfg.read_timeout,
        deadline: Some(deadline),
        max_bytes: cfg.max_bytes,
        verbose: cfg.verbose,
    };

    let (status, result, error) = match cfg.scan {
        ScanKind::Buffering => {
            let report = scan_buffering(stream, &ctx).await;
            (report.status, ScanData::Buffering(report.result), report.error)
        }
        ScanKind::Capabilities => {
            let report = scan_capabilities(stream, &ctx).await;
            (report.status, ScanData::Capabilities(report.result), report.error)
        }
        ScanKind::ImplicitTls => {
            let report = scan_implicit_tls(stream, &ctx).await;
            (report.status, ScanData::Capabilities(report.result), report.error)
        }
    };

    ScanOutcome {
        target: target.view(),
        protocol: cfg.protocol,
        scan: cfg.scan,
        status,
        timestamp: now_iso8601(),
        result: Some(result),
        error,
    }
}

fn empty_outcome(
    target: &Target,
    cfg: &Config,
    status: ScanStatus,
    error: Option<String>,
) -> ScanOutcome {
    ScanOutcome {
        target: target.view(),
        protocol: cfg.protocol,
        scan: cfg.scan,
        status,
        timestamp: now_iso8601(),
        result: None,
        error,
    }
}
