//! Relay channel over WebSocket.
//!
//! Each upgraded socket is split into a reader loop, which feeds text
//! frames to the coordinator, and a writer task, which drains the
//! connection's outbound channel onto the socket.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::get,
    Extension, Router,
};
use courier_core::{ConnectionId, Identity, OpenConnection, OutboundFrame};
use futures::{Sink, SinkExt, StreamExt};
use std::{borrow::Cow, fmt::Display, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{require_identity, ErrorResponse};
use crate::server::AppState;

/// Create the WebSocket router. Every route requires a verified identity.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/connect", get(connect_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_identity,
        ))
        .with_state(state)
}

/// GET /connect
///
/// Upgrades to a relay channel bound to the caller's identity.
async fn connect_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = ws else {
        debug!(identity = %identity, "Connect without upgrade");
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("Not a WebSocket request")),
        )
            .into_response();
    };

    info!(identity = %identity, "WebSocket connection request");
    ws.on_upgrade(move |socket| drive_connection(socket, state, identity))
}

/// Run one connection from Open to Closed.
async fn drive_connection(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let coordinator = Arc::clone(&state.coordinator);
    let OpenConnection { id, outbound, .. } = coordinator.open(identity);
    let guard = coordinator.guard(id);

    let (ws_sender, mut ws_receiver) = socket.split();
    let mut writer = tokio::spawn(writer_task(
        ws_sender,
        outbound,
        state.config.send_timeout,
        id,
    ));

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    coordinator.handle_frame(id, &text);
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!(connection = %id, len = data.len(), "Dropping malformed binary frame");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %id, "Client closed connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!(connection = %id, error = %e, "WebSocket error");
                    break;
                }
                None => break,
            },
            _ = &mut writer => {
                debug!(connection = %id, "Writer stopped");
                break;
            }
        }
    }

    writer.abort();
    drop(guard);
}

/// Forward outbound frames to the socket until the channel closes, a write
/// fails or times out, or a close frame has been sent.
async fn writer_task<S>(
    mut ws_sender: S,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    send_timeout: Duration,
    id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(frame) = outbound.recv().await {
        let (message, closing) = match frame {
            OutboundFrame::Text(text) => (Message::Text(text.to_string()), false),
            OutboundFrame::Close => (
                Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: Cow::from("Disconnected by server"),
                })),
                true,
            ),
        };

        match tokio::time::timeout(send_timeout, ws_sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection = %id, error = %e, "Failed to send frame");
                break;
            }
            Err(_) => {
                warn!(
                    connection = %id,
                    timeout_ms = send_timeout.as_millis() as u64,
                    "Send timed out, dropping client"
                );
                break;
            }
        }

        if closing {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use courier_core::QueueSink;
    use futures::channel::mpsc as futures_mpsc;
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Start the full router on a random port.
    async fn start_test_server() -> (SocketAddr, Arc<AppState>) {
        let (sink, consumer) = QueueSink::channel(64);
        tokio::spawn(consumer.run(tokio_util::sync::CancellationToken::new()));
        let state = Arc::new(AppState::new(ServerConfig::test(), Arc::new(sink)));

        let app = crate::server::create_router(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr, state)
    }

    async fn connect(addr: SocketAddr, state: &AppState, identity: &str) -> Client {
        let token = state.tokens.issue(Identity::from(identity)).unwrap().token;
        let url = format!("ws://{}/connect?token={}", addr, token);
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("WebSocket handshake failed");
        ws
    }

    /// Poll until `check` holds; the server registers after the handshake.
    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    async fn next_json(ws: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("WebSocket error");
            if let ClientMessage::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    fn online(state: &AppState) -> BTreeSet<String> {
        state
            .coordinator
            .online_identities()
            .into_iter()
            .map(|identity| identity.as_str().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_relay_between_sockets_and_cleanup_on_close() {
        let (addr, state) = start_test_server().await;

        let mut phone = connect(addr, &state, "A1").await;
        let mut laptop = connect(addr, &state, "A1").await;
        let mut sender = connect(addr, &state, "B1").await;
        eventually(|| state.coordinator.connection_count() == 3).await;
        assert_eq!(online(&state), BTreeSet::from(["A1".to_string(), "B1".to_string()]));

        // Malformed frames, text or binary, leave the connection open
        sender.send(ClientMessage::binary(vec![1u8, 2, 3])).await.unwrap();
        sender.send(ClientMessage::text("garbage")).await.unwrap();
        sender
            .send(ClientMessage::text(
                r#"{"from":"evil","to":"A1","content":"hi"}"#,
            ))
            .await
            .unwrap();

        let expected = json!({"from": "B1", "to": "A1", "content": "hi"});
        assert_eq!(next_json(&mut phone).await, expected);
        assert_eq!(next_json(&mut laptop).await, expected);

        // One device drops without a close handshake, the other closes cleanly
        drop(phone);
        laptop.send(ClientMessage::Close(None)).await.unwrap();

        eventually(|| state.coordinator.connection_count() == 1).await;
        assert_eq!(online(&state), BTreeSet::from(["B1".to_string()]));
    }

    #[tokio::test]
    async fn test_server_disconnect_sends_close_frame() {
        let (addr, state) = start_test_server().await;

        let mut a = connect(addr, &state, "A1").await;
        let mut b = connect(addr, &state, "B1").await;
        eventually(|| state.coordinator.connection_count() == 2).await;

        assert_eq!(state.coordinator.disconnect(&Identity::from("A1")), 1);

        let msg = tokio::time::timeout(Duration::from_secs(2), a.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended")
            .expect("WebSocket error");
        match msg {
            ClientMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close frame, got {:?}", other),
        }

        eventually(|| online(&state) == BTreeSet::from(["B1".to_string()])).await;

        assert_eq!(state.coordinator.disconnect_all(), 1);
        let msg = tokio::time::timeout(Duration::from_secs(2), b.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended")
            .expect("WebSocket error");
        assert!(matches!(msg, ClientMessage::Close(Some(_))));
        eventually(|| state.coordinator.connection_count() == 0).await;
    }

    /// A sink that never becomes ready, like a client that stopped reading.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_writer_gives_up_on_hung_client() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(OutboundFrame::Text(Arc::from("{}"))).await.unwrap();

        let writer = tokio::spawn(writer_task(
            StalledSink,
            rx,
            Duration::from_millis(50),
            ConnectionId::new(),
        ));

        // The outbound sender is still alive, so only the timeout ends the writer
        tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer did not time out")
            .unwrap();
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_writer_stops_after_close_frame() {
        let (tx, rx) = mpsc::channel(4);
        let (sink, mut written) = futures_mpsc::unbounded::<Message>();

        tx.send(OutboundFrame::Text(Arc::from("first"))).await.unwrap();
        tx.send(OutboundFrame::Close).await.unwrap();
        tx.send(OutboundFrame::Text(Arc::from("after close"))).await.unwrap();

        writer_task(sink, rx, Duration::from_secs(1), ConnectionId::new()).await;

        assert_eq!(written.next().await, Some(Message::Text("first".to_string())));
        match written.next().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::AWAY),
            other => panic!("expected close frame, got {:?}", other),
        }
        // The writer dropped its sink without forwarding the trailing frame
        assert_eq!(written.next().await, None);
    }
}
