mod capabilities;

use crate::model::{OutputConfig, OutputFormat, Protocol, ScanData, ScanKind, ScanOutcome, ScanStatus};
use serde::Serialize;
use serde_json::Value;
use std::io::{BufWriter, Write};

pub struct OutputSink {
    cfg: OutputConfig,
    writer: BufWriter<std::io::Stdout>,
}

#[derive(Serialize)]
struct Record<'a> {
    ip: &'a str,
    host: &'a str,
    port: u16,
    timestamp: &'a str,
    proto: Protocol,
    scan: ScanKind,
    status: ScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a ScanData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    capabilities: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl OutputSink {
    pub fn new(cfg: OutputConfig) -> Self {
        Self {
            cfg,
            writer: BufWriter::new(std::io::stdout()),
        }
    }

    pub fn write_outcome(&mut self, outcome: &ScanOutcome) -> anyhow::Result<()> {
        match self.cfg.format {
            OutputFormat::Jsonl => {
                let line = render_jsonl(outcome)?;
                writeln!(self.writer, "{line}")?;
            }
            OutputFormat::Pretty => write!(self.writer, "{}", render_pretty(outcome))?,
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

/// One JSON object per target.
pub fn render_jsonl(outcome: &ScanOutcome) -> anyhow::Result<String> {
    let capabilities = match &outcome.result {
        Some(ScanData::Capabilities(result)) => {
            Some(capabilities::summary(outcome.protocol, result))
        }
        _ => None,
    };
    let record = Record {
        ip: &outcome.target.addr,
        host: &outcome.target.host,
        port: outcome.target.port,
        timestamp: &outcome.timestamp,
        proto: outcome.protocol,
        scan: outcome.scan,
        status: outcome.status,
        result: outcome.result.as_ref(),
        capabilities,
        error: outcome.error.as_deref(),
    };
    Ok(serde_json::to_string(&record)?)
}

pub fn render_pretty(outcome: &ScanOutcome) -> String {
    let mut out = format!(
        "{} {} -> {}",
        outcome.target.host, outcome.target.port, outcome.status
    );
    let trace = match &outcome.result {
        Some(ScanData::Buffering(result)) => {
            if result.vulnerable {
                out.push_str(" [VULNERABLE]");
            }
            Some(&result.trace)
        }
        Some(ScanData::Capabilities(result)) => Some(&result.trace),
        None => None,
    };
    out.push('\n');
    if let Some(err) = &outcome.error {
        out.push_str(&format!("  error: {err}\n"));
    }
    for entry in trace.map(|t| t.entries()).unwrap_or_default() {
        for line in entry.lines() {
            out.push_str("  ");
            out.push_str(line.trim_end_matches('\r'));
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Step, TargetView};
    use crate::probe::trace::Trace;
    use crate::probe::ScanResult;

    fn outcome(result: Option<ScanData>, status: ScanStatus) -> ScanOutcome {
        ScanOutcome {
            target: TargetView {
                host: "mx.example.org".into(),
                addr: "192.0.2.10".into(),
                port: 25,
            },
            protocol: Protocol::Smtp,
            scan: ScanKind::Buffering,
            status,
            timestamp: "2024-01-01T00:00:00.000Z".into(),
            result,
            error: None,
        }
    }

    fn vulnerable_result() -> ScanData {
        let mut trace = Trace::default();
        trace.server(b"220 ok\r\n");
        trace.client("STARTTLS\r\nEHLO SCAN");
        ScanData::Buffering(ScanResult {
            vulnerable: true,
            trace,
            step: Step::PostTlsDrain.ordinal(),
            tls_log: None,
        })
    }

    #[test]
    fn jsonl_record_shape() {
        let line = render_jsonl(&outcome(Some(vulnerable_result()), ScanStatus::Success)).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["ip"], "192.0.2.10");
        assert_eq!(value["proto"], "smtp");
        assert_eq!(value["scan"], "buffering");
        assert_eq!(value["status"], "success");
        assert_eq!(value["result"]["vulnerable"], true);
        assert_eq!(value["result"]["status"], 8);
        assert_eq!(value["result"]["trace"][0], "S: 220 ok");
        assert!(value.get("error").is_none());
        assert!(value["result"].get("tls").is_none());
    }

    #[test]
    fn jsonl_without_result() {
        let mut failed = outcome(None, ScanStatus::ConnectError);
        failed.error = Some("connection refused".into());
        let value: Value = serde_json::from_str(&render_jsonl(&failed).unwrap()).unwrap();
        assert_eq!(value["status"], "connect-error");
        assert_eq!(value["error"], "connection refused");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn pretty_flags_vulnerable_hosts() {
        let text = render_pretty(&outcome(Some(vulnerable_result()), ScanStatus::Success));
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("mx.example.org 25 -> success [VULNERABLE]"));
        assert_eq!(lines.next(), Some("  S: 220 ok"));
        assert_eq!(lines.next(), Some("  C: STARTTLS"));
        assert_eq!(lines.next(), Some("  EHLO SCAN"));
    }
}
