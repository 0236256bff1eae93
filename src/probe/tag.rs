use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const TAG_LEN: usize = 8;

/// Correlation token embedded in a pipelined command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Tag(String);

impl Tag {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exact substring match against raw server output.
    pub fn found_in(&self, bytes: &[u8]) -> bool {
        let needle = self.0.as_bytes();
        !needle.is_empty() && bytes.windows(needle.len()).any(|w| w == needle)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared source of probe tags. One instance is handed to every scan; the
/// mutex makes it safe to draw from concurrently running scans.
pub struct TagGenerator {
    rng: Mutex<StdRng>,
    len: usize,
}

impl TagGenerator {
    /// Seeded once from the wall clock.
    pub fn from_time() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self::with_seed(nanos)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            len: TAG_LEN,
        }
    }

    pub fn next_tag(&self) -> Tag {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let tag = (0..self.len)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Tag(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_uppercase_and_fixed_length() {
        let tags = TagGenerator::with_seed(7);
        for _ in 0..32 {
            let tag = tags.next_tag();
            assert_eq!(tag.as_str().len(), TAG_LEN);
            assert!(tag.as_str().bytes().all(|b| b.is_ascii_uppercase()));
        }
    }

    #[test]
    fn consecutive_tags_differ() {
        let tags = TagGenerator::with_seed(42);
        let first = tags.next_tag();
        let second = tags.next_tag();
        assert_ne!(first, second);
    }

    #[test]
    fn substring_match_is_exact() {
        let tag = Tag::new("QWERTYUI");
        assert!(tag.found_in(b"* OK\r\nQWERTYUI OK NOOP completed\r\n"));
        assert!(!tag.found_in(b"QWERTYUX OK NOOP completed\r\n"));
        assert!(!tag.found_in(b"qwertyui OK\r\n"));
    }
}
