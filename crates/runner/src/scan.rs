//! Advisory scan of a script before it is handed to the sandbox.
//!
//! Broader than the sandbox's own pre-flight rules and never blocking on its
//! own: only an empty script is an error. Everything else is a warning shown
//! to the operator.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

const LONG_LINE_CHARS: usize = 1000;
const SUMMARY_WARNING: &str =
    "This Python file contains patterns that may be restricted in sandbox execution";

const DANGEROUS_PATTERNS: &[&str] = &[
    // system commands
    r"import\s+os",
    r"import\s+subprocess",
    r"import\s+sys",
    r"from\s+os\s+import",
    r"from\s+subprocess\s+import",
    r"from\s+sys\s+import",
    // network
    r"import\s+socket",
    r"import\s+urllib",
    r"import\s+requests",
    r"import\s+http",
    // filesystem
    r"open\s*\(",
    r"file\s*\(",
    r"with\s+open",
    // dynamic execution
    r"eval\s*\(",
    r"exec\s*\(",
    r"compile\s*\(",
    r"__import__\s*\(",
    // shell
    r"os\.system",
    r"subprocess\.",
    r"shell\s*=\s*True",
];

/// Compiled patterns, each paired with the source shown in warnings.
static PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    DANGEROUS_PATTERNS
        .iter()
        .filter_map(|&source| {
            RegexBuilder::new(source)
                .case_insensitive(true)
                .build()
                .ok()
                .map(|re| (source, re))
        })
        .collect()
});

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ScanReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn scan(content: &str) -> ScanReport {
    let mut report = ScanReport::default();
    if content.trim().is_empty() {
        report.errors.push("Python file is empty".to_string());
        return report;
    }

    let lines: Vec<&str> = content.split('\n').collect();
    for (index, line) in lines.iter().enumerate() {
        for (source, re) in PATTERNS.iter() {
            if re.is_match(line) {
                report.warnings.push(format!(
                    "Line {}: Potentially dangerous code detected - {source}",
                    index + 1
                ));
            }
        }
    }

    if content.contains("syntax error") || content.contains("SyntaxError") {
        report
            .warnings
            .push("File may contain syntax errors".to_string());
    }

    let long_lines = lines
        .iter()
        .filter(|line| line.chars().count() > LONG_LINE_CHARS)
        .count();
    if long_lines > 0 {
        report.warnings.push(format!(
            "{long_lines} very long lines detected (>{LONG_LINE_CHARS} chars)"
        ));
    }

    if !report.warnings.is_empty() {
        report.warnings.insert(0, SUMMARY_WARNING.to_string());
    }
    report
}
