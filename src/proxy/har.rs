//! HAR 1.2 import
//!
//! Loads an HTTP Archive (Chrome DevTools, Firefox, other proxies) into the
//! history so it can be passively scanned offline.

use base64::Engine;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{PscanError, Result};
use crate::history::MemoryHistory;
use crate::models::{HistoryKind, HttpRequest, HttpResponse};

#[derive(Deserialize)]
struct Har {
    log: HarLog,
}

#[derive(Deserialize)]
struct HarLog {
    #[serde(default)]
    entries: Vec<HarEntry>,
}

#[derive(Deserialize)]
struct HarEntry {
    request: HarRequest,
    #[serde(default)]
    response: Option<HarResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HarRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: Vec<HarHeader>,
    #[serde(default)]
    post_data: Option<HarPostData>,
}

#[derive(Deserialize)]
struct HarResponse {
    status: u16,
    #[serde(default)]
    headers: Vec<HarHeader>,
    #[serde(default)]
    content: Option<HarContent>,
}

#[derive(Deserialize)]
struct HarHeader {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct HarPostData {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct HarContent {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

fn headers(list: Vec<HarHeader>) -> Vec<(String, String)> {
    list.into_iter().map(|h| (h.name, h.value)).collect()
}

fn content_bytes(content: Option<HarContent>) -> Result<Vec<u8>> {
    let Some(content) = content else {
        return Ok(Vec::new());
    };
    let text = content.text.unwrap_or_default();
    match content.encoding.as_deref() {
        Some(enc) if enc.eq_ignore_ascii_case("base64") => base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .map_err(|e| PscanError::ConfigError(format!("invalid base64 HAR content: {e}"))),
        _ => Ok(text.into_bytes()),
    }
}

/// Parses HAR JSON and records each entry, in file order. Returns the
/// number of records added.
pub fn import_har_str(json: &str, history: &MemoryHistory, kind: HistoryKind) -> Result<usize> {
    let har: Har = serde_json::from_str(json)?;
    let mut count = 0;
    for entry in har.log.entries {
        let request = HttpRequest {
            method: entry.request.method,
            url: entry.request.url,
            headers: headers(entry.request.headers),
            body: entry
                .request
                .post_data
                .and_then(|p| p.text)
                .unwrap_or_default()
                .into_bytes(),
        };
        // status 0 marks a request that never got an answer
        let response = match entry.response.filter(|r| r.status != 0) {
            Some(r) => Some(HttpResponse {
                status: r.status,
                headers: headers(r.headers),
                body: content_bytes(r.content)?,
                from_target: true,
            }),
            None => None,
        };
        let id = history.record(kind, request, response);
        debug!("Imported HAR entry as history {}", id);
        count += 1;
    }
    Ok(count)
}

/// Loads a HAR file into the history as proxied traffic
pub fn import_har(path: &Path, history: &MemoryHistory) -> Result<usize> {
    let content = std::fs::read_to_string(path)?;
    let count = import_har_str(&content, history, HistoryKind::Proxied)?;
    info!("Imported {} HAR entries from {}", count, path.display());
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryLog;

    const SAMPLE: &str = r#"{
      "log": {
        "version": "1.2",
        "entries": [
          {
            "request": {
              "method": "POST",
              "url": "http://example.test/login",
              "headers": [{"name": "Content-Type", "value": "application/x-www-form-urlencoded"}],
              "postData": {"mimeType": "application/x-www-form-urlencoded", "text": "u=a&p=b"}
            },
            "response": {
              "status": 200,
              "headers": [{"name": "Content-Type", "value": "text/html"}],
              "content": {"size": 11, "mimeType": "text/html", "text": "PGgxPmhpPC9oMT4=", "encoding": "base64"}
            }
          },
          {
            "request": {"method": "GET", "url": "https://example.test/"},
            "response": {"status": 0, "headers": []}
          }
        ]
      }
    }"#;

    #[test]
    fn test_import_entries_in_order() {
        let history = MemoryHistory::new();
        let n = import_har_str(SAMPLE, &history, HistoryKind::Proxied).expect("import");
        assert_eq!(n, 2);
        assert_eq!(history.highest_committed_id(), 2);

        let first = history.resolve(1).expect("first");
        let tx = history.load(&first).expect("load");
        assert_eq!(tx.request.method, "POST");
        assert_eq!(tx.request.body, b"u=a&p=b");
        let response = tx.response.expect("response");
        assert_eq!(response.body, b"<h1>hi</h1>");

        let second = history.load(&history.resolve(2).expect("second")).expect("load");
        assert!(second.response.is_none());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let history = MemoryHistory::new();
        assert!(import_har_str("{", &history, HistoryKind::Proxied).is_err());
        assert!(history.is_empty());
    }
}
