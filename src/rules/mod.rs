//! Passive scan rule trait and built-in rules

pub mod catalog;
pub mod cookies;
pub mod headers;
pub mod info_disclosure;
pub mod tags;

use crate::error::Result;
use crate::models::{Finding, HistoryKind, HttpResponse, Transaction};
use scraper::Html;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cell::OnceCell;
use std::fmt;
use std::sync::Arc;

pub use catalog::{RuleCatalog, RuleEntry};

/// Stable rule identifier used for alert bookkeeping
pub type RuleId = u32;

/// How eager a rule should be to report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertThreshold {
    /// Rule is switched off
    Off,
    #[default]
    Default,
    Low,
    Medium,
    High,
}

impl fmt::Display for AlertThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertThreshold::Off => write!(f, "OFF"),
            AlertThreshold::Default => write!(f, "DEFAULT"),
            AlertThreshold::Low => write!(f, "LOW"),
            AlertThreshold::Medium => write!(f, "MEDIUM"),
            AlertThreshold::High => write!(f, "HIGH"),
        }
    }
}

impl std::str::FromStr for AlertThreshold {
    type Err = crate::error::PscanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "OFF" => Ok(AlertThreshold::Off),
            "DEFAULT" => Ok(AlertThreshold::Default),
            "LOW" => Ok(AlertThreshold::Low),
            "MEDIUM" => Ok(AlertThreshold::Medium),
            "HIGH" => Ok(AlertThreshold::High),
            other => Err(crate::error::PscanError::ConfigError(format!(
                "unknown alert threshold '{other}'"
            ))),
        }
    }
}

/// Side effects a rule may request while it analyzes a transaction
pub trait ScanActions: Send + Sync {
    fn raise_alert(&self, transaction: &Transaction, finding: Finding);
    fn add_history_tag(&self, transaction: &Transaction, tag: &str);
}

/// Handed to a rule for one invocation
pub struct RuleContext<'a> {
    actions: &'a dyn ScanActions,
    transaction: &'a Transaction,
    rule_id: RuleId,
    threshold: AlertThreshold,
}

impl<'a> RuleContext<'a> {
    pub fn new(
        actions: &'a dyn ScanActions,
        transaction: &'a Transaction,
        rule_id: RuleId,
        threshold: AlertThreshold,
    ) -> Self {
        Self {
            actions,
            transaction,
            rule_id,
            threshold,
        }
    }

    /// Raises a finding against the transaction being scanned
    pub fn raise(&self, mut finding: Finding) {
        finding.rule_id = Some(self.rule_id);
        self.actions.raise_alert(self.transaction, finding);
    }

    /// Tags the transaction being scanned
    pub fn add_tag(&self, tag: &str) {
        self.actions.add_history_tag(self.transaction, tag);
    }

    pub fn alert_threshold(&self) -> AlertThreshold {
        self.threshold
    }
}

/// Response body decoded once per task and shared by every rule
pub struct ResponseBody<'a> {
    text: Cow<'a, str>,
    is_html: bool,
    html: OnceCell<Html>,
}

impl<'a> ResponseBody<'a> {
    pub fn new(response: &'a HttpResponse) -> Self {
        Self {
            text: String::from_utf8_lossy(&response.body),
            is_html: response.is_html(),
            html: OnceCell::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Parsed HTML document, built on first use. `None` for non-HTML bodies.
    pub fn html(&self) -> Option<&Html> {
        if !self.is_html {
            return None;
        }
        Some(self.html.get_or_init(|| Html::parse_document(&self.text)))
    }
}

/// A passive analysis unit. Rules never send traffic; they inspect a
/// recorded transaction and report through the [`RuleContext`].
pub trait PassiveScanRule: Send + Sync {
    /// Stable identifier
    fn id(&self) -> RuleId;

    /// Display name
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Whether the rule wants records of the given kind
    fn applies_to_history_kind(&self, kind: HistoryKind) -> bool {
        kind.is_default_scannable()
    }

    /// Tag rules only tag transactions and are gated by `enable_tags`
    fn is_tag_rule(&self) -> bool {
        false
    }

    fn scan_request(&self, _transaction: &Transaction, _ctx: &RuleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn scan_response(
        &self,
        _transaction: &Transaction,
        _body: &ResponseBody<'_>,
        _ctx: &RuleContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    /// Rules that keep per-invocation state return a fresh copy here. The
    /// copy is used for one task only. Stateless rules are shared.
    fn fork(&self) -> Option<Box<dyn PassiveScanRule>> {
        None
    }
}

/// All built-in rules, in registration order
pub fn builtin_rules() -> Result<Vec<Arc<dyn PassiveScanRule>>> {
    let mut rules: Vec<Arc<dyn PassiveScanRule>> = vec![
        Arc::new(cookies::CookieFlagsRule),
        Arc::new(headers::SecurityHeadersRule),
        Arc::new(info_disclosure::InfoDisclosureRule::new()?),
    ];
    for rule in tags::default_tag_rules()? {
        rules.push(Arc::new(rule));
    }
    Ok(rules)
}
