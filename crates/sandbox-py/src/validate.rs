use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use sandbox::{SandboxConfig, SandboxError};

/// One static check: a category label plus the pattern that triggers it.
#[derive(Debug, Clone)]
pub struct DenyRule {
    label: &'static str,
    regex: Regex,
}

impl DenyRule {
    /// Case-insensitive rule. Invalid patterns are a programming error and
    /// yield `None`.
    pub fn new(label: &'static str, pattern: &str) -> Option<Self> {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .ok()
            .map(|regex| Self { label, regex })
    }

    pub fn label(&self) -> &str {
        self.label
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    (
        "disallowed import",
        r"\bimport\s+(?:[\w.]+(?:\s+as\s+\w+)?\s*,\s*)*(os|subprocess|socket|urllib|sys|ctypes|posix)\b",
    ),
    (
        "disallowed import",
        r"\bfrom\s+(os|subprocess|socket|urllib|sys|ctypes|posix)\b",
    ),
    ("dynamic execution", r"\b(eval|exec|compile|__import__)\s*\("),
    ("file access", r"\bopen\s*\("),
    ("file access", r"\bfile\s*\("),
    ("interactive input", r"\binput\s*\("),
    ("interactive input", r"\braw_input\s*\("),
];

static DEFAULT_RULES: LazyLock<Vec<DenyRule>> = LazyLock::new(|| {
    DEFAULT_PATTERNS
        .iter()
        .filter_map(|&(label, pattern)| DenyRule::new(label, pattern))
        .collect()
});

/// Built-in pre-flight rules.
pub fn default_rules() -> &'static [DenyRule] {
    &DEFAULT_RULES
}

/// 1-based line number of byte offset `pos`.
fn line_of(script: &str, pos: usize) -> usize {
    script
        .get(..pos)
        .map_or(1, |prefix| prefix.matches('\n').count() + 1)
}

/// Pre-flight check run before anything touches the filesystem.
///
/// Size is checked first, then each rule in order; the first hit rejects the
/// script.
pub fn validate_script(
    script: &str,
    config: &SandboxConfig,
    rules: &[DenyRule],
) -> sandbox::Result<()> {
    if script.len() > config.max_file_size {
        return Err(SandboxError::ScriptTooLarge {
            size: script.len(),
            limit: config.max_file_size,
        });
    }
    for rule in rules {
        if let Some(m) = rule.regex.find(script) {
            return Err(SandboxError::ScriptRejected {
                rule: rule.label.to_string(),
                pattern: m.as_str().to_string(),
                line: line_of(script, m.start()),
            });
        }
    }
    Ok(())
}
