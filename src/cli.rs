use anyhow::Context;
use clap::{ArgAction, Parser, ValueEnum};
use starttls_probe::model::{
    Config, OutputConfig, OutputFormat, Protocol, ScanKind, TargetSpec,
};
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Checks mail servers for STARTTLS command injection",
    long_about = None
)]
pub struct Cli {
    /// Single host to scan
    #[arg(short = 'H', long = "host", value_name = "HOST")]
    pub host: Option<String>,

    /// Port to scan; defaults to the protocol's well-known port
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// File containing targets (one host[:port] per line)
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    pub input: Option<String>,

    /// Mail protocol spoken by the targets
    #[arg(long = "protocol", value_enum)]
    pub protocol: ProtocolArg,

    /// Which scan to run
    #[arg(long = "scan", value_enum, default_value_t = ScanArg::Buffering)]
    pub scan: ScanArg,

    /// Concurrency limit
    #[arg(long = "concurrency", default_value_t = 64)]
    pub concurrency: usize,

    /// New connections per second (token bucket fill rate)
    #[arg(long = "rate", default_value_t = 64)]
    pub rate: u32,

    /// Connect timeout in milliseconds
    #[arg(long = "connect-timeout", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Deadline for every single read, write and handshake, in milliseconds
    #[arg(long = "read-timeout", default_value_t = 5000)]
    pub read_timeout_ms: u64,

    /// Overall timeout per target in milliseconds
    #[arg(long = "overall-timeout", default_value_t = 60000)]
    pub overall_timeout_ms: u64,

    /// Largest framed message accepted from a server
    #[arg(long = "max-bytes", default_value_t = 65536)]
    pub max_bytes: usize,

    /// Domain announced in EHLO
    #[arg(long = "scan-domain", default_value = "SCAN")]
    pub scan_domain: String,

    /// Record TLS session details in results
    #[arg(long = "verbose", action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Output format
    #[arg(long = "output", value_enum, default_value_t = OutputArg::Jsonl)]
    pub output: OutputArg,

    /// Shorthand for --output pretty
    #[arg(long = "pretty", action = ArgAction::SetTrue)]
    pub pretty: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ProtocolArg {
    Smtp,
    Imap,
    Pop3,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ScanArg {
    Buffering,
    Capabilities,
    ImplicitTls,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputArg {
    Jsonl,
    Pretty,
}

impl Cli {
    pub fn into_config(self) -> anyhow::Result<Config> {
        if self.host.is_none() && self.input.is_none() {
            anyhow::bail!("either --host or --input is required");
        }

        if self.host.is_some() && self.input.is_some() {
            anyhow::bail!("--host and --input are mutually exclusive");
        }

        if self.port.is_some() && self.host.is_none() {
            anyhow::bail!("--port only applies together with --host");
        }

        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than zero");
        }

        if self.rate == 0 {
            anyhow::bail!("rate must be greater than zero");
        }

        if self.read_timeout_ms == 0 {
            anyhow::bail!("read timeout must be greater than zero");
        }

        let protocol = match self.protocol {
            ProtocolArg::Smtp => Protocol::Smtp,
            ProtocolArg::Imap => Protocol::Imap,
            ProtocolArg::Pop3 => Protocol::Pop3,
        };

        let scan = match self.scan {
            ScanArg::Buffering => ScanKind::Buffering,
            ScanArg::Capabilities => ScanKind::Capabilities,
            ScanArg::ImplicitTls => ScanKind::ImplicitTls,
        };

        let target = self
            .host
            .map(|host| {
                let host = host.trim().trim_start_matches('[').trim_end_matches(']');
                anyhow::ensure!(!host.is_empty(), "--host must not be empty");
                Ok(TargetSpec {
                    host: host.to_string(),
                    port: self.port.unwrap_or_else(|| protocol.port_for(scan)),
                })
            })
            .transpose()
            .context("invalid --host")?;

        Ok(Config {
            target,
            input: self.input,
            protocol,
            scan,
            concurrency: self.concurrency,
            rate: self.rate,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            overall_timeout: Duration::from_millis(self.overall_timeout_ms),
            max_bytes: self.max_bytes.max(1),
            scan_domain: self.scan_domain,
            verbose: self.verbose,
            output: OutputConfig {
                format: if self.pretty {
                    OutputFormat::Pretty
                } else {
                    match self.output {
                        OutputArg::Jsonl => OutputFormat::Jsonl,
                        OutputArg::Pretty => OutputFormat::Pretty,
                    }
                },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Config> {
        let mut argv = vec!["starttls-probe"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)?.into_config()
    }

    #[test]
    fn port_defaults_per_protocol() {
        let cfg = parse(&["-H", "mx.example.org", "--protocol", "imap"]).unwrap();
        let target = cfg.target.unwrap();
        assert_eq!(target.port, 143);
        assert_eq!(cfg.scan, ScanKind::Buffering);
        assert_eq!(cfg.scan_domain, "SCAN");
        assert_eq!(cfg.read_timeout, Duration::from_secs(5));
    }

    #[test]
    fn explicit_port_and_pretty() {
        let cfg = parse(&[
            "-H", "192.0.2.1", "-p", "587", "--protocol", "smtp", "--pretty", "--scan",
            "capabilities",
        ])
        .unwrap();
        assert_eq!(cfg.target.unwrap().port, 587);
        assert_eq!(cfg.output.format, OutputFormat::Pretty);
        assert_eq!(cfg.scan, ScanKind::Capabilities);
    }

    #[test]
    fn implicit_tls_uses_the_tls_port() {
        let cfg = parse(&["-H", "mx.example.org", "--protocol", "imap", "--scan", "implicit-tls"])
            .unwrap();
        assert_eq!(cfg.scan, ScanKind::ImplicitTls);
        assert_eq!(cfg.target.unwrap().port, 993);

        let cfg = parse(&["-H", "mx.example.org", "--protocol", "smtp", "--scan", "implicit-tls"])
            .unwrap();
        assert_eq!(cfg.target.unwrap().port, 465);
    }

    #[test]
    fn rejects_bad_combinations() {
        assert!(parse(&["--protocol", "smtp"]).is_err());
        assert!(parse(&["-H", "a", "-i", "targets.txt", "--protocol", "smtp"]).is_err());
        assert!(parse(&["-i", "targets.txt", "-p", "25", "--protocol", "smtp"]).is_err());
        assert!(parse(&["-H", "a", "--protocol", "smtp", "--concurrency", "0"]).is_err());
        assert!(parse(&["-H", "a", "--protocol", "smtp", "--read-timeout", "0"]).is_err());
        assert!(parse(&["-H", "a"]).is_err());
    }
}
