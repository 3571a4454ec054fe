//! Core data models for the passive scanner

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity level for security findings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::High => write!(f, "HIGH"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::Low => write!(f, "LOW"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

/// Confidence level for a finding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Confidence {
    /// Evidence in the recorded traffic proves the issue
    Confirmed,
    /// Strong indicators, not proven
    Tentative,
    /// Informational detection (technology identified, header missing, etc.)
    Informational,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Confirmed => write!(f, "confirmed"),
            Confidence::Tentative => write!(f, "tentative"),
            Confidence::Informational => write!(f, "informational"),
        }
    }
}

/// Which part of the tool produced a finding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum AlertSource {
    #[default]
    Unknown,
    Passive,
    Active,
    Manual,
}

/// A security finding raised against a recorded transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Unique identifier
    pub id: String,
    /// Name of the finding
    pub title: String,
    /// Detailed description
    pub description: String,
    /// Severity level
    pub severity: Severity,
    /// Confidence level
    pub confidence: Confidence,
    /// Category (Headers, Cookies, Information Disclosure, etc.)
    pub category: String,
    /// Technical evidence
    pub evidence: String,
    /// Remediation recommendation
    pub recommendation: String,
    /// CWE reference (e.g., CWE-79)
    pub cwe_id: Option<String>,
    /// OWASP Top 10 reference
    pub owasp_category: Option<String>,
    /// Affected URL
    pub url: String,
    /// ID of the rule that raised it, stamped by the registry
    #[serde(default)]
    pub rule_id: Option<u32>,
    /// History record the finding was raised on
    #[serde(default)]
    pub history_id: Option<u64>,
    #[serde(default)]
    pub source: AlertSource,
}

impl Finding {
    /// Creates a new Finding with a generated UUID
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        category: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        let cat: String = category.into();
        let confidence = Self::default_confidence(&cat);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            severity,
            confidence,
            category: cat,
            evidence: String::new(),
            recommendation: String::new(),
            cwe_id: None,
            owasp_category: None,
            url: url.into(),
            rule_id: None,
            history_id: None,
            source: AlertSource::Unknown,
        }
    }

    /// Sets the confidence level for this finding
    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }

    fn default_confidence(category: &str) -> Confidence {
        match category {
            "Information Disclosure" => Confidence::Tentative,
            _ => Confidence::Informational,
        }
    }

    /// Sets the evidence for this finding
    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }

    /// Sets the recommendation for this finding
    pub fn with_recommendation(mut self, rec: impl Into<String>) -> Self {
        self.recommendation = rec.into();
        self
    }

    /// Sets the CWE ID for this finding
    pub fn with_cwe(mut self, cwe: impl Into<String>) -> Self {
        self.cwe_id = Some(cwe.into());
        self
    }

    /// Sets the OWASP category for this finding
    pub fn with_owasp(mut self, owasp: impl Into<String>) -> Self {
        self.owasp_category = Some(owasp.into());
        self
    }
}

/// How a history record came to exist
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HistoryKind {
    Temporary,
    Proxied,
    Manual,
    Spider,
    SpiderAjax,
    SpiderTemporary,
    Scanner,
    ScannerTemporary,
    Fuzzer,
    Authentication,
    /// Kinds introduced by add-ons
    Custom(u16),
}

impl HistoryKind {
    /// Kinds every passive rule applies to unless it says otherwise
    pub const DEFAULT_SCANNABLE: [HistoryKind; 4] = [
        HistoryKind::Proxied,
        HistoryKind::Manual,
        HistoryKind::Spider,
        HistoryKind::SpiderAjax,
    ];

    pub fn is_default_scannable(self) -> bool {
        Self::DEFAULT_SCANNABLE.contains(&self)
    }

    /// Records of these kinds can be deleted at any time
    pub fn is_temporary(self) -> bool {
        matches!(
            self,
            HistoryKind::Temporary
                | HistoryKind::SpiderTemporary
                | HistoryKind::ScannerTemporary
                | HistoryKind::Authentication
        )
    }
}

impl fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryKind::Custom(n) => write!(f, "custom-{n}"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// Looks up a header value by name, ignoring case
fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// A recorded HTTP request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_https(&self) -> bool {
        self.url.starts_with("https://")
    }
}

/// A recorded HTTP response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
    /// False when the response was served from a cache or generated locally
    #[serde(default = "default_from_target")]
    pub from_target: bool,
}

fn default_from_target() -> bool {
    true
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// All values of a repeated header, e.g. Set-Cookie
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_html(&self) -> bool {
        self.content_type()
            .map(|ct| ct.to_lowercase().contains("html"))
            .unwrap_or(false)
    }
}

/// A fully loaded history record: request plus (optional) response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub history_id: u64,
    pub kind: HistoryKind,
    pub recorded_at: DateTime<Utc>,
    pub request: HttpRequest,
    /// None for CONNECT tunnels and requests that never got an answer
    pub response: Option<HttpResponse>,
}

impl Transaction {
    pub fn url(&self) -> &str {
        &self.request.url
    }
}

/// Findings collected by a passive scan session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    /// Unique session identifier
    pub scan_id: String,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub findings: Vec<Finding>,
    /// Number of history records that were scanned
    pub transactions_scanned: u64,
}

impl ScanReport {
    pub fn new() -> Self {
        Self {
            scan_id: uuid::Uuid::new_v4().to_string(),
            started_at: Local::now(),
            finished_at: None,
            findings: Vec::new(),
            transactions_scanned: 0,
        }
    }

    /// Returns count of findings by severity
    pub fn count_by_severity(&self, severity: &Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| &f.severity == severity)
            .count()
    }

    /// Marks the scan as finished
    pub fn finish(&mut self) {
        self.finished_at = Some(Local::now());
    }
}

impl Default for ScanReport {
    fn default() -> Self {
        Self::new()
    }
}
