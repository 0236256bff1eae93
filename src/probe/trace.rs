use crate::util::sanitize_text;
use serde::Serialize;

/// Chronological record of a scan's exchange: `C: ` for bytes sent, `S: ` for
/// framed messages received, `-- ... --` for events. Audit data only.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Trace(Vec<String>);

impl Trace {
    pub fn client(&mut self, command: &str) {
        self.0.push(format!("C: {}", trim_crlf(command)));
    }

    pub fn server(&mut self, bytes: &[u8]) {
        let text = sanitize_text(bytes);
        self.0.push(format!("S: {}", trim_crlf(&text)));
    }

    pub fn event(&mut self, what: &str) {
        self.0.push(format!("-- {what} --"));
    }

    pub fn entries(&self) -> &[String] {
        &self.0
    }
}

fn trim_crlf(text: &str) -> &str {
    text.trim_matches(|c: char| c == '\r' || c == '\n')
}
