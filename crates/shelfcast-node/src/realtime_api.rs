//! Real-time HTTP endpoints.
//!
//! - `/events/progress`, `/events/notifications` - SSE streams fed by the bridge
//!   (`/events/notification` is accepted too)
//! - `/ws/chat` - chat rooms over WebSocket
//! - `/api/realtime/status` - peer counts, room membership, bridge state
//!
//! Browsers cannot set headers on EventSource or WebSocket requests, so
//! these endpoints take the token as `?token=…`.
//!
//! ## Chat protocol
//!
//! ```json
//! {"type": "join", "room": "book-42"}
//! {"type": "message", "message": "loved chapter 3"}
//! {"type": "get_users"}
//! {"type": "leave"}
//! ```
//!
//! The server answers with `message`, `join`, `leave`, `user_list` and
//! `error` frames; sender identity always comes from the token.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::get,
    Json, Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use shelfcast_realtime::{BridgeSnapshot, ChatSession, Connection, FrameSink, RoomSnapshot, SseFrame};
use shelfcast_types::{EventKind, Identity};
use std::convert::Infallible;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AppState, Authenticated};

/// Create the real-time API routes.
pub fn realtime_routes() -> Router<AppState> {
    Router::new()
        .route("/events/{feed}", get(feed_events))
        .route("/ws/chat", get(chat_handler))
        .route("/api/realtime/status", get(get_status))
}

#[derive(Deserialize)]
struct EventsQuery {
    /// Stable id for this stream; a new stream with the same id replaces the old one.
    client_id: Option<String>,
}

async fn feed_events(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(feed): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let kind: EventKind = feed.parse().map_err(ApiError::NotFound)?;
    subscribe(state, identity, query, kind).await
}

async fn subscribe(
    state: AppState,
    identity: Identity,
    query: EventsQuery,
    kind: EventKind,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let tab = query
        .client_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let client_id = format!("{}/{}", identity.user_id, tab);
    let subscription = state.sse.subscribe(kind, client_id).await?;
    info!(identity = %identity, kind = %kind, "Event stream opened");

    let stream = subscription
        .into_stream()
        .map(|frame| Ok::<_, Infallible>(to_sse_event(&frame)));
    Ok(Sse::new(stream))
}

fn to_sse_event(frame: &SseFrame) -> Event {
    match frame.event_name() {
        Some(name) => Event::default().event(name).data(frame.data()),
        None => Event::default().comment("keepalive"),
    }
}

/// WebSocket upgrade handler.
async fn chat_handler(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_chat(socket, identity, state))
}

/// Write half of a chat WebSocket.
struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait::async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: &str) -> std::io::Result<()> {
        self.0
            .send(Message::Text(frame.to_owned().into()))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

/// Handle a chat WebSocket connection.
async fn handle_chat(socket: WebSocket, identity: Identity, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (conn, mut closed) = Connection::new(identity.clone(), WsSink(ws_sender));
    let mut session = ChatSession::new(state.rooms.clone(), conn, state.chat_write_deadline);
    let conn_id = session.id();
    info!(conn_id = %conn_id, identity = %identity, "Chat client connected");

    loop {
        tokio::select! {
            _ = &mut closed => {
                debug!(conn_id = %conn_id, "Chat connection dropped by its room");
                break;
            }
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let text_str: &str = &text;
                    if let Err(e) = session.handle_text(text_str).await {
                        debug!(conn_id = %conn_id, error = %e, "Chat session ended");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => {
                    debug!(conn_id = %conn_id, "Binary message ignored");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    session.close().await;
    info!(conn_id = %conn_id, "Chat client disconnected");
}

/// SSE subscriber counts.
#[derive(Debug, Serialize)]
pub struct SseSubscribers {
    pub progress: usize,
    pub notification: usize,
}

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub stream_peers: usize,
    pub datagram_peers: usize,
    pub sse_subscribers: SseSubscribers,
    pub rooms: RoomSnapshot,
    pub bridge: BridgeSnapshot,
}

/// Get real-time connection status.
async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let sse = state.sse.stats().await?;
    Ok(Json(StatusResponse {
        stream_peers: state.stream.peer_count().await?,
        datagram_peers: state.datagram.client_count().await?,
        sse_subscribers: SseSubscribers {
            progress: sse.progress,
            notification: sse.notification,
        },
        rooms: state.rooms.snapshot().await?,
        bridge: state.bridge.snapshot(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfcast_realtime::UpstreamState;
    use std::collections::BTreeMap;

    #[test]
    fn test_status_serialization() {
        let mut rooms = BTreeMap::new();
        rooms.insert("book-1".to_string(), vec!["alice".to_string()]);
        let status = StatusResponse {
            stream_peers: 3,
            datagram_peers: 1,
            sse_subscribers: SseSubscribers {
                progress: 2,
                notification: 0,
            },
            rooms,
            bridge: BridgeSnapshot {
                stream: UpstreamState::Online,
                datagram: UpstreamState::Connecting,
            },
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["stream_peers"], 3);
        assert_eq!(json["sse_subscribers"]["progress"], 2);
        assert_eq!(json["rooms"]["book-1"][0], "alice");
        assert_eq!(json["bridge"]["stream"], "online");
        assert_eq!(json["bridge"]["datagram"], "connecting");
    }
}
