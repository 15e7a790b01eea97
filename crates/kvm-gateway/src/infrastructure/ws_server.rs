//! WebSocket server: accept loop and per-socket task management.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Upgrading each connection to a WebSocket, rejecting unknown paths
//!    (404) and users the permission gate refuses (403) during the
//!    handshake.
//! 3. Binding the socket to its [`RealtimeChannel`] and feeding it every
//!    text frame until the viewer disconnects or the gateway closes it.
//! 4. Stopping the accept loop when the `running` flag is cleared.
//!
//! The user name is taken from the `x-gateway-user` header set by the API
//! layer in front of the gateway.
//!
//! # Scalability
//!
//! Each socket runs in its own tokio task.  Outgoing frames from broadcasts
//! and personal replies share the socket's write half behind a
//! `tokio::sync::Mutex`, so the read loop never waits on a slow writer.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use kvm_core::GatewayEvent;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::channels::{ChannelRoute, RealtimeChannel};
use crate::application::fanout::{FanoutError, Subscriber};
use crate::application::gateway::Gateway;

/// Header carrying the authenticated user name.
pub const USER_HEADER: &str = "x-gateway-user";

/// User name assumed when the header is missing.
pub const ANONYMOUS_USER: &str = "anonymous";

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `addr` and serves until `running` is cleared.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_server(
    gateway: Arc<Gateway>,
    addr: SocketAddr,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {addr}"))?;
    info!("gateway listening on {addr}");
    serve(listener, gateway, running).await
}

/// Runs the accept loop on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the flag is re-checked while idle.
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!("connection from {peer}");
                let gw = Arc::clone(&gateway);
                tokio::spawn(async move {
                    handle_connection(stream, peer, gw).await;
                });
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }
    Ok(())
}

// ── Per-socket handler ────────────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, peer: SocketAddr, gateway: Arc<Gateway>) {
    match run_connection(stream, peer, gateway).await {
        Ok(()) => debug!("socket {peer} closed"),
        Err(e) => warn!("socket {peer} closed with error: {e:#}"),
    }
}

async fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    gateway: Arc<Gateway>,
) -> anyhow::Result<()> {
    let mut accepted: Option<(ChannelRoute, String)> = None;
    let gw = Arc::clone(&gateway);
    let check = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let route = ChannelRoute::parse(req.uri().path())
            .ok_or_else(|| reject(StatusCode::NOT_FOUND, "unknown channel"))?;
        let user = req
            .headers()
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or(ANONYMOUS_USER)
            .to_string();
        route.authorize(&gw, &user).map_err(|e| {
            let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::FORBIDDEN);
            reject(status, &e.to_string())
        })?;
        accepted = Some((route, user));
        Ok(resp)
    };

    let ws = accept_hdr_async(stream, check)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer}"))?;
    let Some((route, user)) = accepted else {
        anyhow::bail!("handshake with {peer} finished without a route");
    };

    let (sink, mut source) = ws.split();
    let socket = Arc::new(WsSubscriber::new(sink));
    let channel = match RealtimeChannel::open(gateway, route, &user, socket.clone()).await {
        Ok(c) => c,
        Err(e) => {
            let frame = serde_json::to_string(&GatewayEvent::error(e.to_string()))?;
            let _ = socket.send_text(&frame).await;
            socket.close().await;
            return Ok(());
        }
    };
    info!("{user}@{peer} on {}", channel.route());

    while let Some(frame) = source.next().await {
        if socket.is_closed() {
            break;
        }
        match frame {
            Ok(WsMessage::Text(text)) => channel.handle_text(&text).await,
            Ok(WsMessage::Close(_)) => break,
            Ok(WsMessage::Binary(_)) => {
                debug!("{peer}: binary frame ignored");
            }
            Ok(_) => {}
            Err(WsError::ConnectionClosed | WsError::Protocol(_)) => break,
            Err(e) => {
                warn!("{peer}: WebSocket error: {e}");
                break;
            }
        }
    }

    channel.close().await;
    socket.close().await;
    Ok(())
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(message.to_string()));
    *resp.status_mut() = status;
    resp
}

// ── Socket adapter ────────────────────────────────────────────────────────────

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// The write half of an accepted socket, shared with the fanouts.
pub struct WsSubscriber {
    id: Uuid,
    sink: Mutex<WsSink>,
    closed: AtomicBool,
}

impl WsSubscriber {
    fn new(sink: WsSink) -> Self {
        Self {
            id: Uuid::new_v4(),
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subscriber for WsSubscriber {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn send_text(&self, text: &str) -> Result<(), FanoutError> {
        if self.is_closed() {
            return Err(FanoutError::SendFailed("socket closed".to_string()));
        }
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text.to_string()))
            .await
            .map_err(|e| FanoutError::SendFailed(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sink = self.sink.lock().await;
        let _ = sink.send(WsMessage::Close(None)).await;
        let _ = sink.close().await;
    }
}
