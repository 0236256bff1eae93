use crate::model::{Config, Target, TargetSpec};
use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Resolves `--host` and every line of `--input` in the background and hands
/// out one target per resolved address.
pub fn stream_targets(cfg: &Config) -> anyhow::Result<ReceiverStream<Target>> {
    let (tx, rx) = mpsc::channel(256);
    let default_port = cfg.protocol.port_for(cfg.scan);

    if let Some(spec) = cfg.target.clone() {
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(err) = resolve_and_send(spec, tx).await {
                tracing::warn!(error = %err, "failed to resolve target");
            }
        });
    }

    if let Some(path) = cfg.input.clone() {
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(err) = read_file(path, default_port, tx).await {
                tracing::error!(error = %err, "failed to read input file");
            }
        });
    }

    drop(tx);
    Ok(ReceiverStream::new(rx))
}

async fn read_file(path: String, default_port: u16, tx: mpsc::Sender<Target>) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("cannot open input {}", path))?;
    let mut reader = BufReader::new(file).lines();
    while let Some(line) = reader.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(spec) = parse_target(trimmed, default_port) else {
            tracing::warn!(line = %trimmed, "skipping invalid target");
            continue;
        };
        if let Err(err) = resolve_and_send(spec, tx.clone()).await {
            tracing::warn!(line = %trimmed, error = %err, "failed to resolve target");
        }
    }
    Ok(())
}

/// Accepts `host`, `host:port`, a bare IPv6 address, or `[v6]:port`.
pub fn parse_target(line: &str, default_port: u16) -> Option<TargetSpec> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(rest) = line.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some(TargetSpec {
            host: host.to_string(),
            port,
        });
    }

    match line.rsplit_once(':') {
        // More than one colon without brackets: a bare IPv6 address.
        Some((host, _)) if host.contains(':') => Some(TargetSpec {
            host: line.to_string(),
            port: default_port,
        }),
        Some((host, port)) => Some(TargetSpec {
            host: host.trim().to_string(),
            port: port.parse().ok()?,
        }),
        None => Some(TargetSpec {
            host: line.to_string(),
            port: default_port,
        }),
    }
}

async fn resolve_and_send(spec: TargetSpec, tx: mpsc::Sender<Target>) -> anyhow::Result<()> {
    let lookup = lookup_host((spec.host.as_str(), spec.port)).await?;
    for addr in lookup {
        let target = Target {
            original: spec.clone(),
            resolved: addr,
        };
        tx.send(target).await.ok();
    }
    Ok(())
}
