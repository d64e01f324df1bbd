//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "WebSocket fan-out of telemetry frames."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Clients receive every update until they send a request:
//!
//! - `{"action": "subscribe", "channels": ["panel"], "ids": [1, 2]}` narrows
//!   the stream to the listed asset kinds. With `ids`, those assets are
//!   watched and a `snapshot` frame with their current reads follows.
//! - `{"action": "unsubscribe", "channels": ["panel"]}` removes kinds.
//! - `{"action": "unsubscribe_all"}` restores the unfiltered stream.
//!
//! Rejected requests are answered with an `error` frame and leave the
//! filter untouched.
use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use deaas_telemetry::{AssetId, AssetKind};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::dispatcher::{AssetReading, Dispatcher};

/// Event name carried by every telemetry frame.
pub const TELEMETRY_EVENT: &str = "telemetry";

/// Telemetry frame distributed to connected WebSocket clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryFrame {
    pub event: String,
    pub channel: AssetKind,
    pub payload: serde_json::Value,
}

impl TelemetryFrame {
    pub fn new(channel: AssetKind, payload: serde_json::Value) -> Self {
        Self {
            event: TELEMETRY_EVENT.to_owned(),
            channel,
            payload,
        }
    }
}

/// Frames produced for a single client rather than the whole fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionFrame {
    /// Current reads for assets named in a subscribe request.
    Snapshot {
        channel: AssetKind,
        data: Vec<AssetReading>,
    },
    /// The client fell behind and `skipped` updates were discarded.
    Lagged { skipped: u64 },
    Error { message: String },
}

/// Broadcasts telemetry frames to all connected clients.
#[derive(Clone)]
pub struct TelemetryBroadcaster {
    tx: broadcast::Sender<TelemetryFrame>,
}

impl TelemetryBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send a frame to subscribers. Returns the number of peers reached.
    pub fn send(
        &self,
        frame: TelemetryFrame,
    ) -> Result<usize, broadcast::error::SendError<TelemetryFrame>> {
        self.tx.send(frame)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryFrame> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Router serving `/ws`.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .with_state(dispatcher)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<Dispatcher>>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| serve_client(socket, dispatcher))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientRequest {
    Subscribe {
        #[serde(default)]
        channels: Vec<String>,
        #[serde(default)]
        ids: Vec<AssetId>,
    },
    Unsubscribe {
        #[serde(default)]
        channels: Vec<String>,
    },
    UnsubscribeAll,
}

/// Asset kinds a client wants; `None` means everything.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ChannelFilter(Option<BTreeSet<AssetKind>>);

impl ChannelFilter {
    fn admits(&self, kind: AssetKind) -> bool {
        self.0.as_ref().map_or(true, |kinds| kinds.contains(&kind))
    }
}

/// Per-connection state: the filter and the dispatcher used for snapshots.
struct Session {
    dispatcher: Arc<Dispatcher>,
    filter: ChannelFilter,
}

impl Session {
    fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            filter: ChannelFilter::default(),
        }
    }

    fn forward(&self, frame: &TelemetryFrame) -> Option<String> {
        if !self.filter.admits(frame.channel) {
            return None;
        }
        encode(frame)
    }

    /// Apply a text request and return the frames to answer with.
    fn handle_text(&mut self, text: &str) -> Vec<String> {
        let request = match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "rejected websocket request");
                return reply_error(format!("invalid request: {err}"));
            }
        };
        match request {
            ClientRequest::Subscribe { channels, ids } => {
                let kinds = match parse_channels(&channels) {
                    Ok(kinds) if kinds.is_empty() => {
                        return reply_error("subscribe needs at least one channel".into())
                    }
                    Ok(kinds) => kinds,
                    Err(message) => return reply_error(message),
                };
                self.filter
                    .0
                    .get_or_insert_with(BTreeSet::new)
                    .extend(kinds.iter().copied());
                if ids.is_empty() {
                    return Vec::new();
                }
                kinds
                    .into_iter()
                    .filter_map(|kind| {
                        encode(&SessionFrame::Snapshot {
                            channel: kind,
                            data: self.dispatcher.telemetry(kind, &ids),
                        })
                    })
                    .collect()
            }
            ClientRequest::Unsubscribe { channels } => match parse_channels(&channels) {
                Ok(kinds) => {
                    let remaining = self
                        .filter
                        .0
                        .get_or_insert_with(|| AssetKind::ALL.into_iter().collect());
                    for kind in kinds {
                        remaining.remove(&kind);
                    }
                    Vec::new()
                }
                Err(message) => reply_error(message),
            },
            ClientRequest::UnsubscribeAll => {
                self.filter = ChannelFilter::default();
                Vec::new()
            }
        }
    }
}

fn parse_channels(channels: &[String]) -> Result<BTreeSet<AssetKind>, String> {
    channels
        .iter()
        .map(|channel| {
            channel
                .parse::<AssetKind>()
                .map_err(|_| format!("unknown channel '{channel}'; expected 'panel' or 'inverter'"))
        })
        .collect()
}

fn reply_error(message: String) -> Vec<String> {
    encode(&SessionFrame::Error { message }).into_iter().collect()
}

fn encode<T: Serialize>(frame: &T) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(error = %err, "failed to encode websocket frame");
            None
        }
    }
}

async fn serve_client(mut socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    let mut updates = dispatcher.broadcaster().subscribe();
    let mut session = Session::new(dispatcher);
    debug!(
        clients = session.dispatcher.broadcaster().receiver_count(),
        "websocket client connected"
    );

    'session: loop {
        let outgoing: Vec<String> = tokio::select! {
            update = updates.recv() => match update {
                Ok(frame) => session.forward(&frame).into_iter().collect(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "websocket client lagging; updates discarded");
                    encode(&SessionFrame::Lagged { skipped }).into_iter().collect()
                }
                Err(broadcast::error::RecvError::Closed) => break 'session,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => session.handle_text(&text),
                Some(Ok(Message::Binary(_))) => {
                    reply_error("binary frames are not supported".into())
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break 'session,
                // Pings are answered by the websocket layer.
                Some(Ok(_)) => Vec::new(),
            },
        };
        for text in outgoing {
            if socket.send(Message::Text(text)).await.is_err() {
                break 'session;
            }
        }
    }
    debug!("websocket client disconnected");
}
