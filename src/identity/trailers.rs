//! Commit message trailer codec.
//!
//! A message is a free-form body followed by an optional trailer block: the
//! last paragraph, when every line in it has the `Key: value` shape.
//! Parsing keeps unknown keys and their order so that
//! `CommitMessage::parse(m).to_string() == m` for any canonical message.

use std::fmt;

use crate::identity::change_id::ChangeId;
use crate::storage::CommitId;

pub const CHANGE_ID: &str = "Change-Id";
pub const TRACE_BASE: &str = "Trace-Base";
pub const TRACE_HEAD: &str = "Trace-Head";

pub const DRAFT_PREFIX: &str = "[draft]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub key: String,
    pub value: String,
}

impl Trailer {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    fn parse_line(line: &str) -> Option<Self> {
        let (key, value) = line.split_once(':')?;
        let mut chars = key.chars();
        let first = chars.next()?;
        if !first.is_ascii_alphanumeric() || !chars.all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return None;
        }
        // "Key: value" needs the space; bare "Key:" is allowed with an empty value
        let value = match value.strip_prefix(' ') {
            Some(v) => v,
            None if value.is_empty() => value,
            None => return None,
        };
        Some(Self::new(key, value.trim_end()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitMessage {
    pub body: String,
    pub trailers: Vec<Trailer>,
}

impl CommitMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into().trim_end().to_string(),
            trailers: Vec::new(),
        }
    }

    pub fn parse(message: &str) -> Self {
        let text = message.trim_end();
        // a lone paragraph is the subject, never a trailer block
        let (body, block) = match text.rfind("\n\n") {
            Some(split) => (&text[..split], &text[split + 2..]),
            None => (text, ""),
        };

        let lines: Vec<&str> = block.lines().collect();
        let trailers: Option<Vec<Trailer>> = if lines.is_empty() {
            None
        } else {
            lines.iter().map(|l| Trailer::parse_line(l)).collect()
        };

        match trailers {
            Some(trailers) => Self {
                body: body.trim_end().to_string(),
                trailers,
            },
            None => Self {
                body: text.to_string(),
                trailers: Vec::new(),
            },
        }
    }

    /// first value for `key`, matched case-insensitively
    pub fn get(&self, key: &str) -> Option<&str> {
        self.trailers
            .iter()
            .find(|t| t.key.eq_ignore_ascii_case(key))
            .map(|t| t.value.as_str())
    }

    /// replace every `key` entry with a single one, or append it
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.trailers.iter().position(|t| t.key.eq_ignore_ascii_case(key)) {
            Some(idx) => {
                self.trailers[idx] = Trailer::new(key, value);
                let mut seen = false;
                self.trailers.retain(|t| {
                    if !t.key.eq_ignore_ascii_case(key) {
                        return true;
                    }
                    let keep = !seen;
                    seen = true;
                    keep
                });
            }
            None => self.trailers.push(Trailer::new(key, value)),
        }
    }

    /// append `key` only when absent
    pub fn ensure(&mut self, key: &str, value: impl Into<String>) {
        if self.get(key).is_none() {
            self.trailers.push(Trailer::new(key, value));
        }
    }

    /// drop every `key` entry; returns how many were removed
    pub fn remove(&mut self, key: &str) -> usize {
        let before = self.trailers.len();
        self.trailers.retain(|t| !t.key.eq_ignore_ascii_case(key));
        before - self.trailers.len()
    }

    pub fn change_id(&self) -> Option<ChangeId> {
        self.get(CHANGE_ID).and_then(|v| ChangeId::parse(v).ok())
    }

    pub fn trace_base(&self) -> Option<CommitId> {
        self.get(TRACE_BASE).and_then(|v| CommitId::from_hex(v).ok())
    }

    pub fn trace_head(&self) -> Option<CommitId> {
        self.get(TRACE_HEAD).and_then(|v| CommitId::from_hex(v).ok())
    }
}

impl fmt::Display for CommitMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote_body = false;
        if !self.body.is_empty() {
            write!(f, "{}", self.body)?;
            wrote_body = true;
        }
        if self.trailers.is_empty() {
            return if wrote_body { writeln!(f) } else { Ok(()) };
        }
        if wrote_body {
            write!(f, "\n\n")?;
        }
        for trailer in &self.trailers {
            writeln!(f, "{}: {}", trailer.key, trailer.value)?;
        }
        Ok(())
    }
}

/// message of a draft commit
pub fn draft_message(change_id: &ChangeId) -> String {
    let mut message = CommitMessage::new("[draft] WIP");
    message.set(CHANGE_ID, change_id.as_str());
    message.to_string()
}

pub fn is_draft(message: &str) -> bool {
    message.trim().starts_with(DRAFT_PREFIX)
}

/// Append `Key: value` unless the message already carries that trailer.
pub fn ensure_trailer(message: &str, key: &str, value: &str) -> String {
    let mut parsed = CommitMessage::parse(message);
    parsed.ensure(key, value);
    parsed.to_string()
}

/// Change-Id found anywhere in the message (any case, `:` or space form).
pub fn extract_change_id(message: &str) -> Option<ChangeId> {
    message.lines().find_map(|line| {
        let trimmed = line.trim();
        let lower = trimmed.to_ascii_lowercase();
        if !(lower.starts_with("change-id:") || lower.starts_with("change-id ")) {
            return None;
        }
        let value = trimmed["change-id".len()..].trim_start_matches(':').trim();
        if ChangeId::is_valid(value) {
            ChangeId::parse(value).ok()
        } else {
            None
        }
    })
}

fn is_reserved_line(line: &str) -> bool {
    let lower = line.trim().to_ascii_lowercase();
    if lower.starts_with("change-id:") || lower.starts_with("trace-head:") || lower.starts_with("trace-base:") {
        return true;
    }
    match lower.strip_prefix("change-id ") {
        Some(rest) => {
            let rest = rest.trim();
            rest.len() == 41 && rest.starts_with('i')
        }
        None => false,
    }
}

/// Strip reserved trailers from an agent-written message. Every other line
/// is kept verbatim; `None` when nothing is left.
pub fn sanitize_generated(message: &str) -> Option<String> {
    let kept: Vec<&str> = message.lines().filter(|l| !is_reserved_line(l)).collect();
    let text = kept.join("\n");
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_and_trailers() {
        let msg = "Fix parser\n\nLonger body text.\n\nChange-Id: I0000000000000000000000000000000000000000\nCo-authored-by: Bob <bob@x>\n";
        let parsed = CommitMessage::parse(msg);
        assert_eq!(parsed.body, "Fix parser\n\nLonger body text.");
        assert_eq!(parsed.trailers.len(), 2);
        assert_eq!(parsed.get("change-id"), Some("I0000000000000000000000000000000000000000"));
        assert_eq!(parsed.to_string(), msg);
    }

    #[test]
    fn test_parse_without_trailers() {
        let parsed = CommitMessage::parse("Subject\n\nJust a body: with colon text\n");
        assert!(parsed.trailers.is_empty());
        assert_eq!(parsed.body, "Subject\n\nJust a body: with colon text");
    }

    #[test]
    fn test_set_remove_ensure() {
        let mut msg = CommitMessage::new("Subject");
        msg.set(TRACE_HEAD, "aaa");
        msg.set(TRACE_HEAD, "bbb");
        assert_eq!(msg.trailers.len(), 1);
        assert_eq!(msg.get(TRACE_HEAD), Some("bbb"));
        msg.ensure(TRACE_HEAD, "ccc");
        assert_eq!(msg.get(TRACE_HEAD), Some("bbb"));
        assert_eq!(msg.remove("trace-head"), 1);
        assert_eq!(msg.to_string(), "Subject\n");
    }

    #[test]
    fn test_draft_message() {
        let id = ChangeId::generate();
        let msg = draft_message(&id);
        assert_eq!(msg, format!("[draft] WIP\n\nChange-Id: {}\n", id));
        assert!(is_draft(&msg));
        assert!(is_draft("  [draft] anything"));
        assert!(!is_draft("feat: real work"));
        assert_eq!(extract_change_id(&msg), Some(id));
    }

    #[test]
    fn test_extract_change_id_variants() {
        let id = ChangeId::generate();
        assert_eq!(extract_change_id(&format!("x\n\nchange-id: {}\n", id)), Some(id.clone()));
        assert_eq!(extract_change_id(&format!("x\nCHANGE-ID {}\n", id)), Some(id));
        assert_eq!(extract_change_id("x\n\nChange-Id: bogus\n"), None);
    }

    #[test]
    fn test_sanitize_generated_keeps_other_lines() {
        let id = ChangeId::generate();
        let raw = format!(
            "Add retry loop\n\nExplain why.\nchange-id: {}\nTRACE-HEAD: abc\nTrace-Base: def\nchange-id {}\nCo-authored-by: Bot <bot@x>\n",
            id, id
        );
        let clean = sanitize_generated(&raw).unwrap();
        assert_eq!(clean, "Add retry loop\n\nExplain why.\nCo-authored-by: Bot <bot@x>");
    }

    #[test]
    fn test_sanitize_generated_empty() {
        assert_eq!(sanitize_generated("Change-Id: x\n  \n"), None);
    }

    #[test]
    fn test_ensure_trailer() {
        let once = ensure_trailer("Subject\n", CHANGE_ID, "I1");
        assert_eq!(once, "Subject\n\nChange-Id: I1\n");
        assert_eq!(ensure_trailer(&once, CHANGE_ID, "I2"), once);
    }
}
