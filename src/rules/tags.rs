//! Regex driven auto-tagging of history records

use regex::Regex;

use crate::error::Result;
use crate::models::Transaction;
use crate::rules::{PassiveScanRule, ResponseBody, RuleContext, RuleId};

/// Ids of the default tag rules start here, one per tag
pub const TAG_RULE_BASE_ID: RuleId = 50000;

/// Part of the transaction a tag pattern is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagTarget {
    RequestHeader,
    ResponseHeader,
    ResponseBody,
}

/// (tag, target, pattern). Header patterns match `Name: value` lines.
pub const DEFAULT_TAGS: &[(&str, TagTarget, &str)] = &[
    ("FORM", TagTarget::ResponseBody, r"(?i)<form\b"),
    (
        "PASSWORD",
        TagTarget::ResponseBody,
        r#"(?i)<input\b[^>]*\btype\s*=\s*["']?password"#,
    ),
    ("SCRIPT", TagTarget::ResponseBody, r"(?i)<script\b"),
    ("SETCOOKIE", TagTarget::ResponseHeader, r"(?im)^set-cookie:"),
    (
        "HIDDEN",
        TagTarget::ResponseBody,
        r#"(?i)<input\b[^>]*\btype\s*=\s*["']?hidden"#,
    ),
    ("COMMENT", TagTarget::ResponseBody, r"<!--"),
    (
        "JSON",
        TagTarget::ResponseHeader,
        r"(?im)^content-type:.*\bjson\b",
    ),
];

/// Tags a record when `pattern` matches its target
pub struct RegexAutoTagRule {
    id: RuleId,
    name: String,
    tag: String,
    target: TagTarget,
    pattern: Regex,
}

impl RegexAutoTagRule {
    pub fn new(id: RuleId, tag: &str, target: TagTarget, pattern: &str) -> Result<Self> {
        Ok(Self {
            id,
            name: format!("Auto tag {tag}"),
            tag: tag.to_string(),
            target,
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn target(&self) -> TagTarget {
        self.target
    }

    fn tag_if_match(&self, haystack: &str, ctx: &RuleContext<'_>) {
        if self.pattern.is_match(haystack) {
            ctx.add_tag(&self.tag);
        }
    }
}

fn header_block(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl PassiveScanRule for RegexAutoTagRule {
    fn id(&self) -> RuleId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_tag_rule(&self) -> bool {
        true
    }

    fn scan_request(&self, transaction: &Transaction, ctx: &RuleContext<'_>) -> Result<()> {
        if self.target == TagTarget::RequestHeader {
            self.tag_if_match(&header_block(&transaction.request.headers), ctx);
        }
        Ok(())
    }

    fn scan_response(
        &self,
        transaction: &Transaction,
        body: &ResponseBody<'_>,
        ctx: &RuleContext<'_>,
    ) -> Result<()> {
        match self.target {
            TagTarget::RequestHeader => {}
            TagTarget::ResponseHeader => {
                if let Some(response) = transaction.response.as_ref() {
                    self.tag_if_match(&header_block(&response.headers), ctx);
                }
            }
            TagTarget::ResponseBody => self.tag_if_match(body.text(), ctx),
        }
        Ok(())
    }
}

/// One rule per entry of [`DEFAULT_TAGS`]
pub fn default_tag_rules() -> Result<Vec<RegexAutoTagRule>> {
    DEFAULT_TAGS
        .iter()
        .enumerate()
        .map(|(i, (tag, target, pattern))| {
            RegexAutoTagRule::new(TAG_RULE_BASE_ID + i as RuleId, tag, *target, pattern)
        })
        .collect()
}
