//! Structured view of a raw log line used for rule matching.
//!
//! Parsing is a pluggable capability: the filter only needs something that
//! turns raw bytes into a tag and a content field. The bundled parser
//! understands the BSD syslog shape (`<PRI>timestamp host tag: content`).

/// Parsed envelope: the program tag and the free-form message content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub tag: String,
    pub content: String,
}

pub trait EnvelopeParser: Send + Sync {
    /// Returns `None` when the input is not a well-formed envelope.
    fn parse(&self, raw: &[u8]) -> Option<Envelope>;
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// BSD-syslog flavored parser: `<PRI>` is required, the `Mmm dd hh:mm:ss`
/// timestamp and hostname are consumed when present, and the tag runs up to
/// the first `:` or `[pid]`. A line without a tag separator yields an empty
/// tag, which the filter treats as "keep".
pub struct SyslogParser;

impl EnvelopeParser for SyslogParser {
    fn parse(&self, raw: &[u8]) -> Option<Envelope> {
        let text = std::str::from_utf8(raw).ok()?;
        let rest = strip_priority(text)?;
        let rest = match strip_timestamp(rest) {
            Some(after_ts) => strip_hostname(after_ts),
            None => rest,
        };
        Some(split_tag(rest))
    }
}

fn strip_priority(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('<')?;
    let end = inner.find('>')?;
    if end == 0 || end > 3 {
        return None;
    }
    let pri: u16 = inner[..end].parse().ok()?;
    if pri > 191 {
        return None;
    }
    Some(&inner[end + 1..])
}

fn strip_timestamp(text: &str) -> Option<&str> {
    // "Oct 11 22:14:15 " is 16 bytes; day-of-month may be space padded.
    let ts = text.get(..16)?;
    let rest = text.get(16..)?;
    let bytes = ts.as_bytes();
    if !MONTHS.contains(&ts.get(..3)?) {
        return None;
    }
    if bytes[3] != b' ' || bytes[6] != b' ' || bytes[9] != b':' || bytes[12] != b':' {
        return None;
    }
    if bytes[15] != b' ' {
        return None;
    }
    Some(rest)
}

fn strip_hostname(text: &str) -> &str {
    match text.split_once(' ') {
        Some((_host, rest)) => rest,
        None => text,
    }
}

fn split_tag(text: &str) -> Envelope {
    let tag_end = text
        .find(|c: char| c == ':' || c == '[' || c == ' ')
        .unwrap_or(0);
    let sep = text.as_bytes().get(tag_end).copied();

    match sep {
        Some(b':') => Envelope {
            tag: text[..tag_end].to_string(),
            content: text[tag_end + 1..].trim_start().to_string(),
        },
        Some(b'[') => {
            // tag[pid]: content
            let after = &text[tag_end..];
            match after.find("]:") {
                Some(close) => Envelope {
                    tag: text[..tag_end].to_string(),
                    content: after[close + 2..].trim_start().to_string(),
                },
                None => Envelope {
                    tag: String::new(),
                    content: text.to_string(),
                },
            }
        }
        _ => Envelope {
            tag: String::new(),
            content: text.to_string(),
        },
    }
}
