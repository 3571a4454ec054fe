//! HTTP proxy request handler
//!
//! Handles both regular HTTP requests (full capture) and CONNECT tunnels
//! (metadata only for HTTPS).

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Method, Request, Response};
use tokio::net::TcpStream;
use tracing::{debug, error};

use super::Recorder;
use crate::models::{HistoryKind, HttpRequest, HttpResponse};

/// Headers that describe one hop and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "host",
    "proxy-connection",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "upgrade",
    "proxy-authorization",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn header_pairs(headers: &hyper::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).to_string()))
        .collect()
}

/// Handle an incoming proxy request
pub async fn handle_request(
    req: Request<Incoming>,
    recorder: Recorder,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    if req.method() == Method::CONNECT {
        handle_connect(req, recorder).await
    } else {
        handle_http(req, recorder).await
    }
}

/// Handle a regular HTTP request: forward and capture full request/response
async fn handle_http(
    req: Request<Incoming>,
    recorder: Recorder,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().to_string();
    let uri = req.uri().to_string();

    let url = if uri.starts_with("http://") || uri.starts_with("https://") {
        uri
    } else {
        // Relative URI, rebuild from the Host header
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{}{}", host, uri)
    };

    let request_headers = header_pairs(req.headers());

    let request_body = match req.collect().await {
        Ok(body) => body.to_bytes(),
        Err(e) => {
            error!("Failed to read request body: {}", e);
            Bytes::new()
        }
    };

    let mut forward = recorder.client().request(
        reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET),
        &url,
    );
    for (k, v) in request_headers.iter().filter(|(k, _)| !is_hop_by_hop(k)) {
        forward = forward.header(k.as_str(), v.as_str());
    }
    if !request_body.is_empty() {
        forward = forward.body(request_body.clone());
    }

    let request = HttpRequest {
        method,
        url: url.clone(),
        headers: request_headers,
        body: request_body.to_vec(),
    };

    match forward.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let response_headers = header_pairs(resp.headers());
            let response_body = match resp.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Failed to read response body from {}: {}", url, e);
                    Bytes::new()
                }
            };

            let mut builder = Response::builder().status(status);
            for (k, v) in response_headers.iter().filter(|(k, _)| !is_hop_by_hop(k)) {
                builder = builder.header(k.as_str(), v.as_str());
            }

            let id = recorder.history().record(
                HistoryKind::Proxied,
                request,
                Some(HttpResponse {
                    status,
                    headers: response_headers,
                    body: response_body.to_vec(),
                    from_target: true,
                }),
            );
            recorder.recorded(id);

            Ok(builder
                .body(Full::new(response_body))
                .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("Proxy Error")))))
        }
        Err(e) => {
            error!("Failed to forward request to {}: {}", url, e);
            let id = recorder
                .history()
                .record(HistoryKind::Proxied, request, None);
            recorder.recorded(id);
            Ok(Response::builder()
                .status(502)
                .body(Full::new(Bytes::from(format!("Bad Gateway: {}", e))))
                .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("Bad Gateway")))))
        }
    }
}

/// Handle a CONNECT request: establish a TCP tunnel (HTTPS metadata only)
async fn handle_connect(
    req: Request<Incoming>,
    recorder: Recorder,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let target = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();

    debug!("CONNECT tunnel to {}", target);

    let id = recorder.history().record(
        HistoryKind::Proxied,
        HttpRequest {
            method: "CONNECT".to_string(),
            url: format!("https://{}", target),
            headers: header_pairs(req.headers()),
            body: Vec::new(),
        },
        None,
    );
    recorder.recorded(id);

    tokio::task::spawn(async move {
        match TcpStream::connect(&target).await {
            Ok(mut upstream) => match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut upgraded = hyper_util::rt::TokioIo::new(upgraded);
                    if let Err(e) = tokio::io::copy_bidirectional(&mut upgraded, &mut upstream).await
                    {
                        debug!("Tunnel to {} closed: {}", target, e);
                    }
                }
                Err(e) => {
                    error!("CONNECT upgrade failed: {}", e);
                }
            },
            Err(e) => {
                error!("Failed to connect to {}: {}", target, e);
            }
        }
    });

    Ok(Response::builder()
        .status(200)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}
