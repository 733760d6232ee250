//! Minimal HTTP/1.1 responder for the node's service port.
//!
//! | Endpoint             | Handler                               |
//! |----------------------|---------------------------------------|
//! | `GET /identity`      | static [`IdentityInfo`]               |
//! | `POST /pair/request` | [`PairingHandle::pair_request`]       |
//! | `POST /pair/confirm` | [`PairingHandle::confirm`]            |
//! | `GET /status`        | [`NodeStatus`]                        |
//!
//! One request per connection, always `Connection: close`. Request heads are
//! parsed with `httparse`; bodies are read up to `Content-Length`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use swaplink_core::protocol::{
    ConfirmRequest, IdentityInfo, PairRequest, IDENTITY_PATH, PAIR_CONFIRM_PATH, PAIR_REQUEST_PATH,
    STATUS_PATH,
};
use swaplink_pairing::PairingHandle;
use swaplink_transport::TransportStats;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace, warn};

use crate::node::NodeStatus;

const MAX_REQUEST: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a request handler may touch.
pub struct HttpContext {
    pub identity: IdentityInfo,
    pub pairing: PairingHandle,
    pub stats: Arc<TransportStats>,
}

impl HttpContext {
    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            identity: self.identity.id.clone(),
            device: self.identity.device.clone(),
            session: self.pairing.status().await,
            transport: self.stats.snapshot(),
        }
    }
}

// ── Server loop ───────────────────────────────────────────────────────────────

/// Accept connections forever, one task per connection.
pub async fn serve(listener: TcpListener, ctx: Arc<HttpContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ctx).await {
                        debug!("[Http] {}: {:#}", peer, e);
                    }
                });
            }
            Err(e) => {
                warn!("[Http] accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, ctx: Arc<HttpContext>) -> Result<()> {
    let response = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
        Err(_) => bail!("request read timed out"),
        Ok(Err(e)) => Response::error(400, &format!("{e:#}")),
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(req))) => {
            trace!("[Http] {} {} from {}", req.method, req.path, peer);
            route(&ctx, &req, peer).await
        }
    };
    stream.write_all(&response.to_bytes()).await.context("writing response")?;
    stream.shutdown().await.ok();
    Ok(())
}

// ── Request parsing ───────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

/// Read until a full request (head plus `Content-Length` body) is buffered.
/// `None` if the peer closed first.
async fn read_request(stream: &mut TcpStream) -> Result<Option<Request>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.context("reading request")?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(req) = parse_request(&buf)? {
            return Ok(Some(req));
        }
        if buf.len() > MAX_REQUEST {
            bail!("request exceeds {} bytes", MAX_REQUEST);
        }
    }
}

/// `Ok(None)` while more bytes are needed.
pub fn parse_request(buf: &[u8]) -> Result<Option<Request>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf).map_err(|e| anyhow!("malformed request: {e}"))? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let mut content_length = 0usize;
    for h in req.headers.iter() {
        if h.name.eq_ignore_ascii_case("Content-Length") {
            content_length = std::str::from_utf8(h.value)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| anyhow!("invalid Content-Length"))?;
        }
    }
    if content_length > MAX_REQUEST {
        bail!("body of {} bytes is too large", content_length);
    }
    if buf.len() < head_len + content_length {
        return Ok(None);
    }

    let path = req.path.unwrap_or("/");
    Ok(Some(Request {
        method: req.method.unwrap_or("").to_owned(),
        path: path.split('?').next().unwrap_or(path).to_owned(),
        body: buf[head_len..head_len + content_length].to_vec(),
    }))
}

// ── Routing ───────────────────────────────────────────────────────────────────

async fn route(ctx: &HttpContext, req: &Request, peer: SocketAddr) -> Response {
    match (req.method.as_str(), req.path.as_str()) {
        ("GET", IDENTITY_PATH) => Response::json(200, &ctx.identity),
        ("GET", STATUS_PATH) => Response::json(200, &ctx.status().await),
        ("POST", PAIR_REQUEST_PATH) => match serde_json::from_slice::<PairRequest>(&req.body) {
            Ok(body) => Response::json(200, &ctx.pairing.pair_request(&body.requester_id).await),
            Err(e) => Response::error(400, &format!("invalid pairing request: {e}")),
        },
        ("POST", PAIR_CONFIRM_PATH) => match serde_json::from_slice::<ConfirmRequest>(&req.body) {
            Ok(body) => Response::json(200, &ctx.pairing.confirm(peer.ip(), &body.peer_id).await),
            Err(e) => Response::error(400, &format!("invalid confirmation: {e}")),
        },
        (_, IDENTITY_PATH | STATUS_PATH | PAIR_REQUEST_PATH | PAIR_CONFIRM_PATH) => {
            Response::error(405, "method not allowed")
        }
        _ => Response::error(404, "not found"),
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(500, &e.to_string()),
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        let body = serde_json::json!({ "error": message }).to_string().into_bytes();
        Self { status, body }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            reason_phrase(self.status),
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    }
}
