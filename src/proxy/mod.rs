//! HTTP/HTTPS intercept proxy
//!
//! Every forwarded transaction is appended to the history and the passive
//! scanner is woken. HTTP requests are fully captured (request + response).
//! HTTPS connections are recorded as metadata only (CONNECT tunnels).

pub mod handler;
pub mod har;

use crate::error::{PscanError, Result};
use crate::history::MemoryHistory;
use crate::pscan::ScanWaker;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Where the proxy writes what it captures
#[derive(Clone)]
pub struct Recorder {
    history: MemoryHistory,
    waker: Option<ScanWaker>,
    client: reqwest::Client,
}

impl Recorder {
    pub fn new(history: MemoryHistory, waker: Option<ScanWaker>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self {
            history,
            waker,
            client,
        })
    }

    pub fn history(&self) -> &MemoryHistory {
        &self.history
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Called once a record is fully written
    pub(crate) fn recorded(&self, id: u64) {
        debug!("Recorded history {}", id);
        if let Some(waker) = &self.waker {
            waker.notify();
        }
    }
}

/// Intercept proxy server
pub struct InterceptProxy {
    listener: TcpListener,
    recorder: Recorder,
}

impl InterceptProxy {
    /// Binds the proxy to `127.0.0.1:port`. Port 0 picks a free port.
    pub async fn bind(port: u16, recorder: Recorder) -> Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PscanError::ProxyError(format!("Failed to bind to {}: {}", addr, e)))?;
        Ok(Self { listener, recorder })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections until the surrounding task is cancelled
    pub async fn run(self) -> Result<()> {
        info!("Proxy listening on http://{}", self.local_addr()?);

        loop {
            let (stream, client_addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| PscanError::ProxyError(format!("Accept failed: {}", e)))?;

            let io = TokioIo::new(stream);
            let recorder = self.recorder.clone();

            debug!("New connection from {}", client_addr);

            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let recorder = recorder.clone();
                    handler::handle_request(req, recorder)
                });

                if let Err(e) = http1::Builder::new()
                    .preserve_header_case(true)
                    .title_case_headers(true)
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    // Connection closed errors are normal, only log real errors
                    let err_str = e.to_string();
                    if !err_str.contains("connection closed") && !err_str.contains("early eof") {
                        debug!("Connection error from {}: {}", client_addr, e);
                    }
                }
            });
        }
    }
}
