//! Cookie security analysis of recorded responses

use crate::error::Result;
use crate::models::{Finding, Severity, Transaction};
use crate::rules::{PassiveScanRule, ResponseBody, RuleContext, RuleId};
use tracing::debug;

pub const COOKIE_FLAGS_RULE_ID: RuleId = 10010;

/// Checks the Secure, HttpOnly and SameSite attributes of every Set-Cookie
pub struct CookieFlagsRule;

/// Attribute names of one Set-Cookie value, lowercased
struct CookieAttributes<'a> {
    name: &'a str,
    attributes: Vec<String>,
}

impl<'a> CookieAttributes<'a> {
    fn parse(header: &'a str) -> Self {
        let mut parts = header.split(';');
        let name = parts
            .next()
            .and_then(|p| p.split('=').next())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("unknown");
        let attributes = parts.map(|p| p.trim().to_lowercase()).collect();
        Self { name, attributes }
    }

    fn has(&self, flag: &str) -> bool {
        self.attributes
            .iter()
            .any(|a| a == flag || a.starts_with(&format!("{flag}=")))
    }

    fn same_site(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find_map(|a| a.strip_prefix("samesite="))
            .map(str::trim)
    }

    fn is_session_cookie(&self) -> bool {
        let lower = self.name.to_lowercase();
        ["session", "sid", "token", "auth"]
            .iter()
            .any(|k| lower.contains(k))
    }
}

impl PassiveScanRule for CookieFlagsRule {
    fn id(&self) -> RuleId {
        COOKIE_FLAGS_RULE_ID
    }

    fn name(&self) -> &str {
        "Cookie Flags"
    }

    fn description(&self) -> &str {
        "Analyzes cookie security flags (Secure, HttpOnly, SameSite)"
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

        for header in response.header_values("set-cookie") {
            let cookie = CookieAttributes::parse(header);
            debug!("Checking cookie '{}' on {}", cookie.name, url);
            let severity = if cookie.is_session_cookie() {
                Severity::High
            } else {
                Severity::Medium
            };
            let evidence = format!("Set-Cookie: {header}");

            if transaction.request.is_https() && !cookie.has("secure") {
                ctx.raise(
                    Finding::new(
                        format!("Cookie '{}' Missing Secure Flag", cookie.name),
                        "Cookie can be sent over unencrypted HTTP connections.",
                        severity.clone(),
                        "Cookies",
                        url,
                    )
                    .with_evidence(evidence.clone())
                    .with_recommendation(
                        "Add the 'Secure' flag to ensure the cookie is only sent over HTTPS.",
                    )
                    .with_cwe("CWE-614")
                    .with_owasp("A05:2021 Security Misconfiguration"),
                );
            }

            if !cookie.has("httponly") {
                ctx.raise(
                    Finding::new(
                        format!("Cookie '{}' Missing HttpOnly Flag", cookie.name),
                        "Cookie is accessible to JavaScript, vulnerable to XSS-based theft.",
                        severity,
                        "Cookies",
                        url,
                    )
                    .with_evidence(evidence.clone())
                    .with_recommendation("Add the 'HttpOnly' flag to prevent JavaScript access.")
                    .with_cwe("CWE-1004")
                    .with_owasp("A05:2021 Security Misconfiguration"),
                );
            }

            match cookie.same_site() {
                None => ctx.raise(
                    Finding::new(
                        format!("Cookie '{}' Missing SameSite Attribute", cookie.name),
                        "Cookie lacks SameSite attribute, may allow CSRF attacks.",
                        Severity::Medium,
                        "Cookies",
                        url,
                    )
                    .with_evidence(evidence)
                    .with_recommendation("Add 'SameSite=Strict' or 'SameSite=Lax' attribute.")
                    .with_cwe("CWE-352")
                    .with_owasp("A01:2021 Broken Access Control"),
                ),
                Some("none") if !cookie.has("secure") => ctx.raise(
                    Finding::new(
                        format!("Cookie '{}' SameSite=None Without Secure", cookie.name),
                        "Cookie uses SameSite=None but lacks the Secure flag.",
                        Severity::Medium,
                        "Cookies",
                        url,
                    )
                    .with_evidence(evidence)
                    .with_recommendation(
                        "When using SameSite=None, the Secure flag must also be set.",
                    )
                    .with_cwe("CWE-614")
                    .with_owasp("A05:2021 Security Misconfiguration"),
                ),
                Some(_) => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attributes() {
        let c = CookieAttributes::parse("SESSIONID=abc; Path=/; Secure; HttpOnly; SameSite=Lax");
        assert_eq!(c.name, "SESSIONID");
        assert!(c.has("secure"));
        assert!(c.has("httponly"));
        assert_eq!(c.same_site(), Some("lax"));
        assert!(c.is_session_cookie());
    }

    #[test]
    fn test_secure_in_value_is_not_a_flag() {
        let c = CookieAttributes::parse("pref=secure; Path=/");
        assert!(!c.has("secure"));
        assert!(!c.is_session_cookie());
    }
}
