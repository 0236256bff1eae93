use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::probe::{CapabilityResult, ScanResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub original: TargetSpec,
    pub resolved: SocketAddr,
}

impl Target {
    pub fn view(&self) -> TargetView {
        TargetView {
            host: self.original.host.clone(),
            addr: self.resolved.ip().to_string(),
            port: self.resolved.port(),
        }
    }

    /// Name presented in the TLS ClientHello; falls back to the address.
    pub fn server_name(&self) -> String {
        if self.original.host.is_empty() {
            self.resolved.ip().to_string()
        } else {
            self.original.host.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub target: Option<TargetSpec>,
    pub input: Option<String>,
    pub protocol: Protocol,
    pub scan: ScanKind,
    pub concurrency: usize,
    pub rate: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub overall_timeout: Duration,
    pub max_bytes: usize,
    pub scan_domain: String,
    pub verbose: bool,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Smtp,
    Imap,
    Pop3,
}

impl Protocol {
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Smtp => 25,
            Protocol::Imap => 143,
            Protocol::Pop3 => 110,
        }
    }

    /// Port where the protocol speaks TLS from the first byte.
    pub fn implicit_tls_port(&self) -> u16 {
        match self {
            Protocol::Smtp => 465,
            Protocol::Imap => 993,
            Protocol::Pop3 => 995,
        }
    }

    pub fn port_for(&self, scan: ScanKind) -> u16 {
        match scan {
            ScanKind::ImplicitTls => self.implicit_tls_port(),
            ScanKind::Buffering | ScanKind::Capabilities => self.default_port(),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Protocol::Smtp => "smtp",
            Protocol::Imap => "imap",
            Protocol::Pop3 => "pop3",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    Buffering,
    Capabilities,
    #[serde(rename = "implicit-tls")]
    ImplicitTls,
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanKind::Buffering => write!(f, "buffering"),
            ScanKind::Capabilities => write!(f, "capabilities"),
            ScanKind::ImplicitTls => write!(f, "implicit-tls"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jsonl,
    Pretty,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Jsonl => write!(f, "jsonl"),
            OutputFormat::Pretty => write!(f, "pretty"),
        }
    }
}

/// Where the state machine was when it stopped. The ordinal is reported as
/// the numeric `status` of a scan result.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum Step {
    Connect = 0,
    Greeting = 1,
    Hello = 2,
    Pipeline = 3,
    PreTlsDrain = 4,
    Handshake = 5,
    PostTlsRead = 6,
    Push = 7,
    PostTlsDrain = 8,
}

impl Step {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Step::Connect => "connect",
            Step::Greeting => "greeting",
            Step::Hello => "hello",
            Step::Pipeline => "starttls",
            Step::PreTlsDrain => "drain",
            Step::Handshake => "handshake",
            Step::PostTlsRead => "probe",
            Step::Push => "push",
            Step::PostTlsDrain => "drain",
        }
    }
}

/// Terminal status of one scan, surfaced to the orchestrator as a short label.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScanStatus {
    Success,
    NotThisProtocol(Protocol),
    Blacklisted,
    NoStartTls,
    ConnectError,
    Timeout,
    Eof(Step),
    Unknown,
    Error,
}

impl ScanStatus {
    pub fn label(&self) -> String {
        match self {
            ScanStatus::Success => "success".into(),
            ScanStatus::NotThisProtocol(protocol) => format!("no-{protocol}"),
            ScanStatus::Blacklisted => "blacklisted".into(),
            ScanStatus::NoStartTls => "no-starttls".into(),
            ScanStatus::ConnectError => "connect-error".into(),
            ScanStatus::Timeout => "timeout".into(),
            ScanStatus::Eof(step) => format!("eof-{}", step.name()),
            ScanStatus::Unknown => "unknown".into(),
            ScanStatus::Error => "error".into(),
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for ScanStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ScanData {
    Buffering(ScanResult),
    Capabilities(CapabilityResult),
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub target: TargetView,
    pub protocol: Protocol,
    pub scan: ScanKind,
    pub status: ScanStatus,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ScanData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetView {
    pub host: String,
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TlsInfo {
    pub cert_issuer: String,
    pub cert_subject: String,
    pub cert_valid_from: String,
    pub cert_valid_to: String,
    pub cipher: String,
    pub version: String,
}
