//! HTTP→websocket upgrade handler for `GET /q/ws`.
//!
//! Grounded in `events/websocket.go`'s `WSHandler`: subscribe with the
//! peer's IP, replay the last-known state for the UI's bootstrap topics
//! (handled by the broker itself on subscribe, see `broker.rs`), then pump
//! packets out while draining inbound frames purely to detect disconnect.
//! The daemon workspace's own websocket code
//! (`crates/daemon/src/adapters/agent/docker/ws.rs`) is client-side, but
//! establishes the `tokio-tungstenite` + `futures_util::StreamExt` idiom
//! this reuses on the server side via `hyper::upgrade`.

use crate::broker::BrokerHandle;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("not a websocket upgrade request")]
    NotAnUpgrade,
    #[error("handshake response build failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Handle a `GET /q/ws` request: validate and accept the upgrade, then
/// hand the connection off to a spawned task once hyper completes it.
pub fn handle(
    req: http::Request<hyper::body::Incoming>,
    broker: BrokerHandle,
    client_ip: String,
) -> Result<http::Response<Full<Bytes>>, WsError> {
    if !is_upgrade_request(&req) {
        return Err(WsError::NotAnUpgrade);
    }

    let response = tokio_tungstenite::tungstenite::handshake::server::create_response_with_body(&req, || Full::new(Bytes::new()))?;

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let io = hyper_util::rt::TokioIo::new(upgraded);
                let ws_stream = WebSocketStream::from_raw_socket(io, tokio_tungstenite::tungstenite::protocol::Role::Server, None).await;
                serve(ws_stream, broker, client_ip).await;
            }
            Err(e) => tracing::warn!(error = %e, "websocket upgrade failed"),
        }
    });

    Ok(response)
}

fn is_upgrade_request(req: &http::Request<hyper::body::Incoming>) -> bool {
    let has_token = |header: &str, token: &str| {
        req.headers().get(header).and_then(|v| v.to_str().ok()).map(|v| v.to_ascii_lowercase().contains(token)).unwrap_or(false)
    };
    has_token(http::header::CONNECTION.as_str(), "upgrade") && has_token(http::header::UPGRADE.as_str(), "websocket")
}

async fn serve<S>(ws_stream: WebSocketStream<S>, broker: BrokerHandle, client_ip: String)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut subscription = broker.subscribe(client_ip.clone()).await;
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            packet = subscription.rx.recv() => {
                let Some(packet) = packet else { break };
                let text = match serde_json::to_string(&packet) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize packet for websocket");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Inbound frames carry no protocol meaning; this socket
                    // is read-only drained purely to notice disconnects.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    broker.unsubscribe(subscription.id, client_ip).await;
}
