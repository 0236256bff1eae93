//! Detection of STARTTLS command injection in SMTP, IMAP and POP3 servers.
//!
//! A scan pipelines `STARTTLS` with a tagged probe command in a single write,
//! completes the TLS handshake, and then watches the encrypted channel for the
//! probe's reply. A server that answers it kept plaintext bytes buffered
//! across the upgrade.

pub mod engine;
pub mod input;
pub mod model;
pub mod output;
pub mod probe;
pub mod tls;
pub mod util;
