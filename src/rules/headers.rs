//! Security headers analysis of recorded responses

use crate::error::Result;
use crate::models::{Finding, HttpResponse, Severity, Transaction};
use crate::rules::{AlertThreshold, PassiveScanRule, ResponseBody, RuleContext, RuleId};
use tracing::debug;

pub const SECURITY_HEADERS_RULE_ID: RuleId = 10020;

/// Flags missing or misconfigured security headers on responses
pub struct SecurityHeadersRule;

enum HeaderResult {
    Missing,
    Invalid(String),
    Weak(String),
    Ok,
}

fn validate_csp(value: Option<&str>) -> HeaderResult {
    match value {
        None => HeaderResult::Missing,
        Some(v) if v.contains("unsafe-inline") || v.contains("unsafe-eval") => {
            HeaderResult::Weak(format!("CSP contains unsafe directives: {v}"))
        }
        Some(_) => HeaderResult::Ok,
    }
}

fn validate_hsts(value: Option<&str>) -> HeaderResult {
    let Some(v) = value else {
        return HeaderResult::Missing;
    };
    let Some(max_age) = v
        .split(';')
        .find_map(|part| part.trim().strip_prefix("max-age="))
    else {
        return HeaderResult::Invalid("Missing max-age directive".to_string());
    };
    match max_age.trim().trim_matches('"').parse::<u64>() {
        Ok(age) if age < 31_536_000 => {
            HeaderResult::Weak(format!("HSTS max-age is {age} (should be >= 31536000)"))
        }
        Ok(_) if !v.to_lowercase().contains("includesubdomains") => {
            HeaderResult::Weak("HSTS missing includeSubDomains directive".to_string())
        }
        Ok(_) => HeaderResult::Ok,
        Err(_) => HeaderResult::Invalid("Invalid max-age value".to_string()),
    }
}

fn validate_x_content_type(value: Option<&str>) -> HeaderResult {
    match value {
        None => HeaderResult::Missing,
        Some(v) if v.trim().eq_ignore_ascii_case("nosniff") => HeaderResult::Ok,
        Some(v) => HeaderResult::Invalid(format!("Expected 'nosniff', got '{v}'")),
    }
}

fn validate_x_frame_options(value: Option<&str>) -> HeaderResult {
    match value {
        None => HeaderResult::Missing,
        Some(v) => {
            let upper = v.trim().to_uppercase();
            if upper == "DENY" || upper == "SAMEORIGIN" {
                HeaderResult::Ok
            } else {
                HeaderResult::Weak(format!("Unexpected value: {v}"))
            }
        }
    }
}

/// Which responses a header check is relevant for
#[derive(Clone, Copy)]
enum Applies {
    Always,
    HttpsOnly,
    HtmlOnly,
}

struct HeaderCheck {
    name: &'static str,
    severity: Severity,
    cwe: &'static str,
    owasp: &'static str,
    recommendation: &'static str,
    description: &'static str,
    applies: Applies,
    /// Missing headers are only reported at LOW threshold
    missing_low_only: bool,
    validator: fn(Option<&str>) -> HeaderResult,
}

const CHECKS: &[HeaderCheck] = &[
    HeaderCheck {
        name: "Content-Security-Policy",
        severity: Severity::Medium,
        cwe: "CWE-693",
        owasp: "A05:2021 Security Misconfiguration",
        recommendation: "Implement a strict Content-Security-Policy header. Avoid 'unsafe-inline' and 'unsafe-eval' directives.",
        description: "Content-Security-Policy (CSP) header is missing or misconfigured.",
        applies: Applies::HtmlOnly,
        missing_low_only: false,
        validator: validate_csp,
    },
    HeaderCheck {
        name: "Strict-Transport-Security",
        severity: Severity::High,
        cwe: "CWE-319",
        owasp: "A02:2021 Cryptographic Failures",
        recommendation: "Add 'Strict-Transport-Security: max-age=31536000; includeSubDomains' header.",
        description: "HSTS header is missing or misconfigured. Users may connect via HTTP.",
        applies: Applies::HttpsOnly,
        missing_low_only: false,
        validator: validate_hsts,
    },
    HeaderCheck {
        name: "X-Content-Type-Options",
        severity: Severity::Low,
        cwe: "CWE-693",
        owasp: "A05:2021 Security Misconfiguration",
        recommendation: "Add 'X-Content-Type-Options: nosniff' header.",
        description: "X-Content-Type-Options header is missing.",
        applies: Applies::Always,
        missing_low_only: true,
        validator: validate_x_content_type,
    },
    HeaderCheck {
        name: "X-Frame-Options",
        severity: Severity::Medium,
        cwe: "CWE-1021",
        owasp: "A05:2021 Security Misconfiguration",
        recommendation: "Add 'X-Frame-Options: DENY' or 'SAMEORIGIN' to prevent clickjacking.",
        description: "X-Frame-Options header is missing, enabling potential clickjacking.",
        applies: Applies::HtmlOnly,
        missing_low_only: false,
        validator: validate_x_frame_options,
    },
];

impl HeaderCheck {
    fn relevant(&self, transaction: &Transaction, response: &HttpResponse) -> bool {
        match self.applies {
            Applies::Always => true,
            Applies::HttpsOnly => transaction.request.is_https(),
            Applies::HtmlOnly => response.is_html(),
        }
    }
}

impl PassiveScanRule for SecurityHeadersRule {
    fn id(&self) -> RuleId {
        SECURITY_HEADERS_RULE_ID
    }

    fn name(&self) -> &str {
        "Security Headers"
    }

    fn description(&self) -> &str {
        "Flags missing or misconfigured security headers in responses"
    }

    fn scan_response(
        &self,
        transaction: &Transaction,
        _body: &ResponseBody<'_>,
        ctx: &RuleContext<'_>,
    ) -> Result<()> {
        let Some(response) = transaction.response.as_ref() else {
            return Ok(());
        };
        let url = transaction.url();
        let threshold = ctx.alert_threshold();

        for check in CHECKS.iter().filter(|c| c.relevant(transaction, response)) {
            let value = response.header(check.name);
            debug!("Checking header '{}': {:?}", check.name, value);

            let finding = match (check.validator)(value) {
                HeaderResult::Missing => {
                    if check.missing_low_only && threshold != AlertThreshold::Low {
                        continue;
                    }
                    Finding::new(
                        format!("Missing {} Header", check.name),
                        check.description,
                        check.severity.clone(),
                        "Security Headers",
                        url,
                    )
                    .with_evidence(format!(
                        "Header '{}' was not found in the response",
                        check.name
                    ))
                }
                HeaderResult::Invalid(detail) | HeaderResult::Weak(detail) => Finding::new(
                    format!("Misconfigured {} Header", check.name),
                    check.description,
                    check.severity.clone(),
                    "Security Headers",
                    url,
                )
                .with_evidence(detail),
                HeaderResult::Ok => continue,
            };
            ctx.raise(
                finding
                    .with_recommendation(check.recommendation)
                    .with_cwe(check.cwe)
                    .with_owasp(check.owasp),
            );
        }

        if let Some(server) = response.header("Server") {
            if server.chars().any(|c| c.is_ascii_digit()) {
                ctx.raise(
                    Finding::new(
                        "Server Header Information Disclosure",
                        "Server header reveals software version information.",
                        Severity::Low,
                        "Security Headers",
                        url,
                    )
                    .with_evidence(format!("Server header reveals version: {server}"))
                    .with_recommendation("Remove or genericize the Server header.")
                    .with_cwe("CWE-200")
                    .with_owasp("A01:2021 Broken Access Control"),
                );
            }
        }

        if let Some(powered_by) = response.header("X-Powered-By") {
            ctx.raise(
                Finding::new(
                    "X-Powered-By Header Information Disclosure",
                    "X-Powered-By header reveals the technology stack.",
                    Severity::Low,
                    "Security Headers",
                    url,
                )
                .with_evidence(format!("X-Powered-By reveals technology: {powered_by}"))
                .with_recommendation("Remove the X-Powered-By header from responses.")
                .with_cwe("CWE-200")
                .with_owasp("A01:2021 Broken Access Control"),
            );
        }

        Ok(())
    }
}
