use regex::bytes::Regex;
use std::sync::OnceLock;

/// Grammar deciding where one complete protocol message ends. Every pattern is
/// anchored at the start of the unconsumed buffer and requires the trailing
/// CRLF, so a dangling partial line never completes a frame.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Terminator {
    /// Any single line.
    Line,
    /// A single `*`-prefixed line.
    ImapUntagged,
    /// Zero or more `*` lines followed by one tagged completion line.
    ImapTagged,
    /// Reply lines up to the first `NNN ` (or bare `NNN`) final line.
    SmtpReply,
    /// One POP3 status line.
    Pop3Line,
    /// A `-ERR` line, or lines up to a lone `.` line.
    Pop3MultiLine,
}

impl Terminator {
    /// Length of the leading complete message in `buf`, if there is one.
    pub fn find(&self, buf: &[u8]) -> Option<usize> {
        self.pattern().find(buf).map(|m| m.end())
    }

    fn pattern(&self) -> &'static Regex {
        static LINE: OnceLock<Regex> = OnceLock::new();
        static IMAP_UNTAGGED: OnceLock<Regex> = OnceLock::new();
        static IMAP_TAGGED: OnceLock<Regex> = OnceLock::new();
        static SMTP_REPLY: OnceLock<Regex> = OnceLock::new();
        static POP3_LINE: OnceLock<Regex> = OnceLock::new();
        static POP3_MULTI: OnceLock<Regex> = OnceLock::new();

        let (cell, source) = match self {
            Terminator::Line => (&LINE, r"\A[^\n]*\n"),
            Terminator::ImapUntagged => (&IMAP_UNTAGGED, r"\A\*[^\r\n]*\r\n"),
            Terminator::ImapTagged => (
                &IMAP_TAGGED,
                r"\A(?:\*[^\r\n]*\r\n|\r\n)*[^*\r\n][^\r\n]*\r\n",
            ),
            Terminator::SmtpReply => (
                &SMTP_REPLY,
                r"\A(?:[^\r\n]*\r\n)*?[0-9]{3}(?: [^\r\n]*)?\r\n",
            ),
            Terminator::Pop3Line => (&POP3_LINE, r"\A[^\r\n]*\r\n"),
            Terminator::Pop3MultiLine => (
                &POP3_MULTI,
                r"\A(?:-ERR[^\r\n]*\r\n|(?:[^\r\n]*\r\n)*?\.\r\n)",
            ),
        };
        cell.get_or_init(|| compile(source))
    }
}

/// Compiles one of the built-in byte patterns. Unicode mode is off: servers
/// send arbitrary bytes and every byte must be matchable by the negated
/// classes. The sources are constants, so a failure is a bug and panics on
/// first use.
pub(crate) fn compile(source: &str) -> Regex {
    match Regex::new(&format!("(?-u){source}")) {
        Ok(regex) => regex,
        Err(err) => panic!("invalid built-in pattern {source}: {err}"),
    }
}
