//! Redaction of host details from captured output.
//!
//! Rules run in a fixed order: Windows paths, Unix paths, IPv4 addresses,
//! e-mail addresses. Each replaces matches with a fixed token, except text
//! captured by a rule's `keep` group, which passes through unchanged.

use regex::{Captures, Regex};

pub const PATH_TOKEN: &str = "[PATH_REDACTED]";
pub const IP_TOKEN: &str = "[IP_REDACTED]";
pub const EMAIL_TOKEN: &str = "[EMAIL_REDACTED]";

pub const OUTPUT_TRUNCATED: &str = "\n[Output truncated]";
pub const ERROR_TRUNCATED: &str = "\n[Error output truncated]";

const RULES: &[(&str, &str)] = &[
    (r#"\b[A-Za-z]:\\[^\s"'<>|]*"#, PATH_TOKEN),
    // Any run of two or more segments is a path. URLs with a host are kept
    // whole; `file:///x/y` has no host and loses its path.
    (
        r#"(?P<keep>[A-Za-z][A-Za-z0-9+.-]*://[^/\s"'<>]+[^\s"'<>]*)|(?:/[^/\s"'<>:;,(){}\[\]|`]+){2,}/?"#,
        PATH_TOKEN,
    ),
    (r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b", IP_TOKEN),
    (
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
        EMAIL_TOKEN,
    ),
];

struct Redaction {
    regex: Regex,
    replacement: &'static str,
}

pub struct OutputSanitizer {
    rules: Vec<Redaction>,
}

impl Default for OutputSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSanitizer {
    pub fn new() -> Self {
        let rules = RULES
            .iter()
            .filter_map(|&(pattern, replacement)| {
                Regex::new(pattern)
                    .ok()
                    .map(|regex| Redaction { regex, replacement })
            })
            .collect();
        Self { rules }
    }

    pub fn sanitize(&self, text: &str) -> String {
        let mut out = text.to_owned();
        for rule in &self.rules {
            if rule.regex.is_match(&out) {
                out = rule
                    .regex
                    .replace_all(&out, |caps: &Captures<'_>| {
                        caps.name("keep").map_or_else(
                            || rule.replacement.to_owned(),
                            |m| m.as_str().to_owned(),
                        )
                    })
                    .into_owned();
            }
        }
        out
    }
}

/// Cut `text` to at most `limit` bytes (on a char boundary) and append
/// `marker` if anything was dropped.
pub fn clamp(text: &str, limit: usize, marker: &str) -> String {
    if text.len() <= limit {
        return text.to_owned();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = text.get(..end).unwrap_or_default().to_owned();
    out.push_str(marker);
    out
}
