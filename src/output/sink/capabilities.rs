use crate::model::Protocol;
use crate::probe::CapabilityResult;
use serde_json::{json, Value};

/// Capability keywords before and after the upgrade, plus what changed.
pub(super) fn summary(protocol: Protocol, result: &CapabilityResult) -> Value {
    let before = result
        .pre_tls
        .as_deref()
        .map(|text| keywords(protocol, text))
        .unwrap_or_default();
    let after = result
        .post_tls
        .as_deref()
        .map(|text| keywords(protocol, text))
        .unwrap_or_default();

    // Without a plaintext listing (implicit TLS) there is nothing to compare.
    let added: Vec<&String> = if result.pre_tls.is_some() {
        after.iter().filter(|k| !before.contains(k)).collect()
    } else {
        Vec::new()
    };
    let removed: Vec<&String> = if result.post_tls.is_some() {
        before.iter().filter(|k| !after.contains(k)).collect()
    } else {
        Vec::new()
    };

    json!({
        "pre_tls": before,
        "post_tls": after,
        "added_after_tls": added,
        "removed_after_tls": removed,
    })
}

fn keywords(protocol: Protocol, text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let lines = text.lines().map(|line| line.trim_end_matches('\r'));
    match protocol {
        // First reply line is the server's hostname, the rest are extensions.
        Protocol::Smtp => {
            for line in lines.skip(1) {
                let coded = line.len() > 4 && line.as_bytes()[..3].iter().all(u8::is_ascii_digit);
                if let Some(rest) = line.get(4..).filter(|_| coded) {
                    push_unique(&mut out, rest.trim());
                }
            }
        }
        Protocol::Imap => {
            for line in lines {
                let Some(rest) = strip_prefix_ci(line, "* CAPABILITY ") else {
                    continue;
                };
                for token in rest.split_whitespace() {
                    push_unique(&mut out, token);
                }
            }
        }
        Protocol::Pop3 => {
            for line in lines.skip(1) {
                if line == "." {
                    break;
                }
                push_unique(&mut out, line.trim());
            }
        }
    }
    out
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

fn push_unique(out: &mut Vec<String>, keyword: &str) {
    let keyword = keyword.to_ascii_uppercase();
    if !keyword.is_empty() && !out.contains(&keyword) {
        out.push(keyword);
    }
}
