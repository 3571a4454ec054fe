//! JSON report of a passive scan session

use crate::error::Result;
use crate::models::{ScanReport, Severity};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// On-disk shape: the report plus per-severity totals
#[derive(Serialize)]
struct JsonReport<'a> {
    #[serde(flatten)]
    report: &'a ScanReport,
    severity_counts: BTreeMap<String, usize>,
}

fn severity_counts(report: &ScanReport) -> BTreeMap<String, usize> {
    [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ]
    .iter()
    .map(|s| (s.to_string(), report.count_by_severity(s)))
    .collect()
}

/// Writes the report as pretty-printed JSON
pub fn export(report: &ScanReport, output_path: &Path) -> Result<()> {
    let document = JsonReport {
        report,
        severity_counts: severity_counts(report),
    };
    std::fs::write(output_path, serde_json::to_string_pretty(&document)?)?;
    info!(
        "JSON report with {} findings saved to {}",
        report.findings.len(),
        output_path.display()
    );
    Ok(())
}

/// Reads a report written by [`export`]. Totals are recomputed on demand.
pub fn load(input_path: &Path) -> Result<ScanReport> {
    let content = std::fs::read_to_string(input_path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Finding;

    #[test]
    fn test_export_includes_severity_counts() {
        let mut report = ScanReport::new();
        report.findings = vec![
            Finding::new("a", "d", Severity::High, "Cookies", "http://app.test/"),
            Finding::new("b", "d", Severity::High, "Cookies", "http://app.test/"),
            Finding::new("c", "d", Severity::Low, "Security Headers", "http://app.test/"),
        ];
        report.transactions_scanned = 2;

        let dir = tempfile::tempdir().expect("dir");
        let path = dir.path().join("report.json");
        export(&report, &path).expect("export");

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["severity_counts"]["HIGH"], 2);
        assert_eq!(raw["severity_counts"]["LOW"], 1);

        let loaded = load(&path).expect("load");
        assert_eq!(loaded.scan_id, report.scan_id);
        assert_eq!(loaded.transactions_scanned, 2);
        assert_eq!(loaded.findings.len(), 3);
    }
}
