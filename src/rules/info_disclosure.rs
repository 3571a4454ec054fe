//! Information disclosure detection in recorded response bodies

use regex::Regex;
use scraper::Selector;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::{PscanError, Result};
use crate::models::{Finding, Severity, Transaction};
use crate::rules::{AlertThreshold, PassiveScanRule, ResponseBody, RuleContext, RuleId};

pub const INFO_DISCLOSURE_RULE_ID: RuleId = 10030;

const ERROR_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)stack\s*trace", "Stack trace detected"),
    (r"(?i)exception\s+in\s+thread", "Java exception detected"),
    (
        r"(?i)traceback\s*\(most\s+recent",
        "Python traceback detected",
    ),
    (
        r"(?i)fatal\s+error.*on\s+line\s+\d+",
        "PHP fatal error detected",
    ),
    (r"(?i)uncaught\s+exception", "Uncaught exception detected"),
    (r"(?i)syntax\s+error.*\.php", "PHP syntax error"),
    (
        r"(?i)warning:.*\bon\s+line\s+\d+",
        "PHP warning with line number",
    ),
    (r"(?i)microsoft\s+ole\s+db", "OLE DB error"),
    (r"(?i)odbc\s+.*driver", "ODBC driver error"),
];

const SENSITIVE_COMMENT_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)password", "Password reference in comment"),
    (r"(?i)api[_\-]?key", "API key reference in comment"),
    (r"(?i)secret", "Secret reference in comment"),
    (r"(?i)username|user_name", "Username reference in comment"),
    (
        r"(?i)database|db_host|db_pass",
        "Database reference in comment",
    ),
    (r"(?i)token", "Token reference in comment"),
    (
        r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
        "IP address in comment",
    ),
];

/// Developer notes are noisy, only reported at LOW threshold
const DEVELOPER_NOTE_PATTERN: &str = r"(?i)\b(todo|fixme|hack)\b";

const DIR_LISTING_INDICATORS: &[&str] = &[
    "Index of /",
    "Directory listing for",
    "<title>Directory listing",
];

struct Patterns {
    errors: Vec<(Regex, &'static str)>,
    comments: Vec<(Regex, &'static str)>,
    developer_note: Regex,
    comment: Regex,
    generator: Selector,
}

impl Patterns {
    fn compile() -> Result<Self> {
        let compile_all = |list: &[(&str, &'static str)]| -> Result<Vec<(Regex, &'static str)>> {
            list.iter()
                .map(|(p, d)| Ok((Regex::new(p)?, *d)))
                .collect()
        };
        Ok(Self {
            errors: compile_all(ERROR_PATTERNS)?,
            comments: compile_all(SENSITIVE_COMMENT_PATTERNS)?,
            developer_note: Regex::new(DEVELOPER_NOTE_PATTERN)?,
            comment: Regex::new(r"<!--([\s\S]*?)-->")?,
            generator: Selector::parse("meta[name='generator']").map_err(|e| {
                PscanError::ConfigError(format!("invalid generator selector: {e:?}"))
            })?,
        })
    }
}

/// Detects error pages, sensitive HTML comments, directory listings and
/// generator tags.
///
/// Each task gets its own fork so the per-response deduplication set is
/// never shared between transactions.
pub struct InfoDisclosureRule {
    patterns: Arc<Patterns>,
    reported: Mutex<HashSet<&'static str>>,
}

impl InfoDisclosureRule {
    pub fn new() -> Result<Self> {
        Ok(Self {
            patterns: Arc::new(Patterns::compile()?),
            reported: Mutex::new(HashSet::new()),
        })
    }

    /// True the first time `what` is seen by this instance
    fn first_report(&self, what: &'static str) -> bool {
        self.reported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(what)
    }

    fn check_errors(&self, text: &str, url: &str, ctx: &RuleContext<'_>) {
        for (re, description) in &self.patterns.errors {
            let Some(m) = re.find(text) else {
                continue;
            };
            if !self.first_report(description) {
                continue;
            }
            let context = excerpt(text, m.start(), m.end(), 50);
            ctx.raise(
                Finding::new(
                    format!("Information Disclosure: {description}"),
                    "The application exposes detailed error messages revealing internal details.",
                    Severity::Medium,
                    "Information Disclosure",
                    url,
                )
                .with_evidence(format!("Pattern: {description}\nContext: ...{context}..."))
                .with_recommendation(
                    "Show generic error pages in production. Log details server-side only.",
                )
                .with_cwe("CWE-209")
                .with_owasp("A05:2021 Security Misconfiguration"),
            );
            // one error finding per response
            break;
        }
    }

    fn check_comments(&self, text: &str, url: &str, ctx: &RuleContext<'_>) {
        let low = ctx.alert_threshold() == AlertThreshold::Low;
        for cap in self.patterns.comment.captures_iter(text) {
            let Some(comment) = cap.get(1).map(|c| c.as_str()) else {
                continue;
            };
            let matched = self
                .patterns
                .comments
                .iter()
                .find(|(re, _)| re.is_match(comment))
                .map(|(_, d)| *d)
                .or_else(|| {
                    (low && self.patterns.developer_note.is_match(comment))
                        .then_some("Developer note in comment")
                });
            let Some(description) = matched else {
                continue;
            };
            if !self.first_report(description) {
                continue;
            }
            ctx.raise(
                Finding::new(
                    format!("Sensitive HTML Comment: {description}"),
                    "HTML comments contain potentially sensitive information visible in page source.",
                    Severity::Low,
                    "Information Disclosure",
                    url,
                )
                .with_evidence(format!("Comment: <!--{}-->", truncate(comment, 200)))
                .with_recommendation("Remove sensitive comments from production HTML.")
                .with_cwe("CWE-615")
                .with_owasp("A01:2021 Broken Access Control"),
            );
        }
    }
}

impl PassiveScanRule for InfoDisclosureRule {
    fn id(&self) -> RuleId {
        INFO_DISCLOSURE_RULE_ID
    }

    fn name(&self) -> &str {
        "Information Disclosure"
    }

    fn description(&self) -> &str {
        "Detects information disclosure through error messages, comments and exposed metadata"
    }

    fn scan_response(
        &self,
        transaction: &Transaction,
        body: &ResponseBody<'_>,
        ctx: &RuleContext<'_>,
    ) -> Result<()> {
        if body.is_empty() {
            return Ok(());
        }
        let url = transaction.url();
        let text = body.text();

        self.check_errors(text, url, ctx);

        let Some(document) = body.html() else {
            return Ok(());
        };

        self.check_comments(text, url, ctx);

        if let Some(indicator) = DIR_LISTING_INDICATORS.iter().find(|i| text.contains(*i)) {
            if self.first_report("directory listing") {
                ctx.raise(
                    Finding::new(
                        "Directory Listing Enabled",
                        "Directory listing is enabled, allowing attackers to browse and discover files.",
                        Severity::Medium,
                        "Information Disclosure",
                        url,
                    )
                    .with_evidence(format!("Page contains: '{indicator}'"))
                    .with_recommendation(
                        "Disable directory listing in the web server configuration.",
                    )
                    .with_cwe("CWE-548")
                    .with_owasp("A01:2021 Broken Access Control"),
                );
            }
        }

        let generator = document
            .select(&self.patterns.generator)
            .find_map(|el| el.value().attr("content"));
        if let Some(content) = generator {
            if self.first_report("generator") {
                ctx.raise(
                    Finding::new(
                        "Generator Meta Tag Reveals Technology",
                        "The meta generator tag reveals the CMS or framework used.",
                        Severity::Low,
                        "Information Disclosure",
                        url,
                    )
                    .with_evidence(format!("Meta generator: {content}"))
                    .with_recommendation("Remove the generator meta tag from production pages.")
                    .with_cwe("CWE-200")
                    .with_owasp("A05:2021 Security Misconfiguration"),
                );
            }
        }

        Ok(())
    }

    fn fork(&self) -> Option<Box<dyn PassiveScanRule>> {
        Some(Box::new(Self {
            patterns: Arc::clone(&self.patterns),
            reported: Mutex::new(HashSet::new()),
        }))
    }
}

/// `text[start..end]` widened by `pad` bytes each side, on char boundaries
fn excerpt(text: &str, start: usize, end: usize, pad: usize) -> &str {
    let mut from = start.saturating_sub(pad);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (end + pad).min(text.len());
    while !text.is_char_boundary(to) {
        to += 1;
    }
    &text[from..to]
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_compile() {
        assert!(InfoDisclosureRule::new().is_ok());
    }

    #[test]
    fn test_fork_starts_with_empty_state() {
        let rule = InfoDisclosureRule::new().expect("rule");
        assert!(rule.first_report("generator"));
        assert!(!rule.first_report("generator"));
        let fork = rule.fork().expect("stateful rule forks");
        assert_eq!(fork.id(), INFO_DISCLOSURE_RULE_ID);
        assert!(rule.reported.lock().expect("lock").contains("generator"));
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        let text = "ééééé stack trace ééééé";
        let start = text.find("stack").expect("match");
        let out = excerpt(text, start, start + 11, 3);
        assert!(out.contains("stack trace"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 4), "abcd...");
    }
}
