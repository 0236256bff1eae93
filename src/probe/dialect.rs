use super::tag::Tag;
use crate::engine::terminator::Terminator;
use crate::engine::terminator::compile;
use crate::model::Protocol;
use regex::bytes::Regex;
use std::sync::OnceLock;

/// Command text with optional `{tag}` and `{domain}` placeholders. CRLF is
/// appended when the command is written.
#[derive(Debug, Clone, Copy)]
pub struct Template(pub &'static str);

impl Template {
    pub fn render(&self, tag: Option<&Tag>, domain: &str) -> String {
        let mut out = self.0.replace("{domain}", domain);
        if let Some(tag) = tag {
            out = out.replace("{tag}", tag.as_str());
        }
        out
    }
}

/// Recognises a particular kind of server reply.
#[derive(Debug, Clone, Copy)]
pub enum Marker {
    /// Substring anywhere in the frame.
    Contains(&'static str),
    /// Frame starts with the given bytes.
    Prefix(&'static str),
    /// First line starts with a three digit reply code.
    ReplyCode,
    /// Last line carries exactly this reply code.
    FinalCode(&'static str),
    /// Tagged completion line `<tag> OK`, case-insensitive.
    TaggedOk(&'static str),
}

impl Marker {
    pub fn matches(&self, frame: &[u8]) -> bool {
        match self {
            Marker::Contains(needle) => contains(frame, needle.as_bytes()),
            Marker::Prefix(prefix) => frame.starts_with(prefix.as_bytes()),
            Marker::ReplyCode => frame.len() >= 3 && frame[..3].iter().all(u8::is_ascii_digit),
            Marker::FinalCode(code) => last_line(frame).is_some_and(|line| {
                line.starts_with(code.as_bytes())
                    && !matches!(line.get(code.len()), Some(&b'-'))
            }),
            Marker::TaggedOk(tag) => last_line(frame).is_some_and(|line| {
                let expected = format!("{tag} OK");
                line.len() >= expected.len()
                    && line[..expected.len()].eq_ignore_ascii_case(expected.as_bytes())
            }),
        }
    }
}

/// What, after the TLS upgrade, proves the pipelined command was executed.
#[derive(Debug, Clone, Copy)]
pub enum Evidence {
    /// A frame carries the probe tag.
    Tag,
    /// A line starts with the reply code the pipelined command earns.
    ReplyLine(&'static str),
    /// The server speaks at all without being asked.
    Unsolicited,
}

impl Evidence {
    /// Checks a frame the client did not solicit over TLS.
    pub fn in_response(&self, frame: &[u8], tag: &Tag) -> bool {
        match self {
            Evidence::Tag => tag.found_in(frame),
            Evidence::ReplyLine(code) => lines(frame).any(|line| line.starts_with(code.as_bytes())),
            Evidence::Unsolicited => !frame.is_empty(),
        }
    }

    /// Checks the reply read right after the push command, which the server
    /// is entitled to answer.
    pub fn in_push_reply(&self, frame: &[u8], tag: &Tag) -> bool {
        match self {
            Evidence::Unsolicited => false,
            _ => self.in_response(frame, tag),
        }
    }
}

/// A command whose reply is kept only when the server accepts it.
#[derive(Debug, Clone, Copy)]
pub struct Query {
    pub command: Template,
    pub accepted: Marker,
}

/// Everything that differs between the mail protocols.
#[derive(Debug)]
pub struct Dialect {
    pub protocol: Protocol,
    pub greeting: Terminator,
    pub greeting_marker: Marker,
    pub blacklist: bool,
    pub hello: Option<Template>,
    pub response: Terminator,
    /// STARTTLS and the probe command, sent in one write.
    pub pipeline: Template,
    pub accepted: Marker,
    pub quit: Template,
    pub push: Template,
    pub evidence: Evidence,
    pub drain_pre_tls: bool,
    /// A peer close right after the pipelined write, or during the
    /// handshake, means the probe line never ran.
    pub close_proves_safe: bool,
    pub capability: Template,
    pub capability_response: Terminator,
    /// Lone STARTTLS used by the capabilities scan, and its accept marker.
    pub starttls: Template,
    pub starttls_accepted: Marker,
    /// Asked right after the capability query, reply recorded verbatim.
    pub help: Option<Template>,
    /// Client identification exchange, recorded when accepted.
    pub id: Option<Query>,
}

pub static SMTP: Dialect = Dialect {
    protocol: Protocol::Smtp,
    greeting: Terminator::SmtpReply,
    greeting_marker: Marker::ReplyCode,
    blacklist: true,
    hello: Some(Template("EHLO {domain}")),
    response: Terminator::SmtpReply,
    pipeline: Template("STARTTLS\r\nEHLO {domain}"),
    accepted: Marker::FinalCode("220"),
    quit: Template("QUIT"),
    push: Template("QUIT"),
    evidence: Evidence::ReplyLine("250"),
    drain_pre_tls: false,
    close_proves_safe: true,
    capability: Template("EHLO {domain}"),
    capability_response: Terminator::SmtpReply,
    starttls: Template("STARTTLS"),
    starttls_accepted: Marker::FinalCode("220"),
    help: Some(Template("HELP")),
    id: None,
};

pub static IMAP: Dialect = Dialect {
    protocol: Protocol::Imap,
    greeting: Terminator::ImapUntagged,
    greeting_marker: Marker::Prefix("*"),
    blacklist: false,
    hello: None,
    response: Terminator::ImapTagged,
    pipeline: Template("A STARTTLS\r\n{tag} NOOP"),
    accepted: Marker::TaggedOk("A"),
    quit: Template("C LOGOUT"),
    push: Template("{tag} LOGOUT"),
    evidence: Evidence::Tag,
    drain_pre_tls: true,
    close_proves_safe: false,
    capability: Template("A CAPABILITY"),
    capability_response: Terminator::ImapTagged,
    starttls: Template("B STARTTLS"),
    starttls_accepted: Marker::TaggedOk("B"),
    help: None,
    id: Some(Query {
        command: Template(concat!(
            "D ID (\"name\" \"",
            env!("CARGO_PKG_NAME"),
            "\" \"version\" \"",
            env!("CARGO_PKG_VERSION"),
            "\")"
        )),
        accepted: Marker::TaggedOk("D"),
    }),
};

pub static POP3: Dialect = Dialect {
    protocol: Protocol::Pop3,
    greeting: Terminator::Pop3Line,
    greeting_marker: Marker::Prefix("+OK"),
    blacklist: false,
    hello: None,
    response: Terminator::Pop3Line,
    pipeline: Template("STLS\r\nCAPA"),
    accepted: Marker::Prefix("+OK"),
    quit: Template("QUIT"),
    push: Template("QUIT"),
    evidence: Evidence::Unsolicited,
    drain_pre_tls: false,
    close_proves_safe: true,
    capability: Template("CAPA"),
    capability_response: Terminator::Pop3MultiLine,
    starttls: Template("STLS"),
    starttls_accepted: Marker::Prefix("+OK"),
    help: None,
    id: None,
};

pub fn dialect(protocol: Protocol) -> &'static Dialect {
    match protocol {
        Protocol::Smtp => &SMTP,
        Protocol::Imap => &IMAP,
        Protocol::Pop3 => &POP3,
    }
}

/// Permanent-failure replies that mean the server refuses to talk to us.
pub fn is_blacklisted(frame: &[u8]) -> bool {
    static BLACKLIST: OnceLock<Regex> = OnceLock::new();
    BLACKLIST
        .get_or_init(|| compile(r"(?m)^(554|550|521|541|421|504|553)\s"))
        .is_match(frame)
}

fn lines(frame: &[u8]) -> impl Iterator<Item = &[u8]> {
    frame
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
}

fn last_line(frame: &[u8]) -> Option<&[u8]> {
    lines(frame).last()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
