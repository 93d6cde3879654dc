use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{GapFillerError, GapFillerResult};

/// Subprotocols spoken by GraphQL subscription clients.
pub const GRAPHQL_WS_PROTOCOLS: [&str; 2] = ["graphql-transport-ws", "graphql-ws"];

/// Maps an `http(s)://` GraphQL endpoint to its `ws(s)://` counterpart.
pub fn websocket_url(target: &Url) -> GapFillerResult<Url> {
    let mut url = target.clone();
    let scheme = match target.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url),
        other => {
            return Err(GapFillerError::Config(format!(
                "unsupported scheme for WebSocket upstream: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| GapFillerError::Config(format!("cannot use {} over {}", target, scheme)))?;
    Ok(url)
}

/// Copies frames both ways between a subscription client and `upstream`.
pub async fn bridge(client: WebSocket, upstream: Url, protocol: Option<String>) {
    let mut request = match upstream.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            warn!(%upstream, "invalid WebSocket upstream: {}", e);
            return;
        }
    };
    if let Some(value) = protocol.as_deref().and_then(|p| HeaderValue::from_str(p).ok()) {
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }

    let (upstream_socket, _) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(%upstream, "failed to open upstream WebSocket: {}", e);
            let mut client = client;
            let _ = client.send(Message::Close(None)).await;
            return;
        }
    };
    info!(%upstream, ?protocol, "subscription bridge open");

    let (mut upstream_tx, mut upstream_rx) = upstream_socket.split();
    let (mut client_tx, mut client_rx) = client.split();

    let to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let closing = matches!(msg, Message::Close(_));
            if upstream_tx.send(to_upstream_message(msg)).await.is_err() || closing {
                break;
            }
        }
    };
    let to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let Some(msg) = to_client_message(msg) else {
                continue;
            };
            let closing = matches!(msg, Message::Close(_));
            if client_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    };

    tokio::select! {
        _ = to_upstream => debug!("client side closed"),
        _ = to_client => debug!("upstream side closed"),
    }
    info!(%upstream, "subscription bridge closed");
}

fn to_upstream_message(msg: Message) -> UpstreamMessage {
    match msg {
        Message::Text(text) => UpstreamMessage::Text(text),
        Message::Binary(data) => UpstreamMessage::Binary(data),
        Message::Ping(data) => UpstreamMessage::Ping(data),
        Message::Pong(data) => UpstreamMessage::Pong(data),
        Message::Close(frame) => UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: f.code.into(),
            reason: f.reason,
        })),
    }
}

fn to_client_message(msg: UpstreamMessage) -> Option<Message> {
    match msg {
        UpstreamMessage::Text(text) => Some(Message::Text(text)),
        UpstreamMessage::Binary(data) => Some(Message::Binary(data)),
        UpstreamMessage::Ping(data) => Some(Message::Ping(data)),
        UpstreamMessage::Pong(data) => Some(Message::Pong(data)),
        UpstreamMessage::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        }))),
        UpstreamMessage::Frame(_) => None,
    }
}
