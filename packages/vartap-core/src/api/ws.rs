//! WebSocket handler and the transport it backs.
//!
//! One socket carries both planes: JSON text messages are control requests
//! and responses, binary messages are data frames prefixed with the shared
//! 16-byte header so either end can demultiplex by buffer id.
//!
//! [`WsTransport`] queues outbound messages on a broadcast channel. The RT
//! thread's `send_buffer` copies the frame and returns; slow or absent
//! receivers drop messages (the stream plane is best-effort by contract —
//! the log file is the durable record).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::{BufMut, Bytes, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use tokio::sync::broadcast;

use crate::api::{AppState, WsConnectionManager};
use crate::transport::Transport;
use crate::value::ValueKind;
use crate::wire::{FrameHeader, WIRE_HEADER_LEN};

/// Outbound fan-out depth per connection before lagging clients drop.
const OUTBOUND_CAPACITY: usize = 256;

/// One outbound message, cheap to clone across receivers.
#[derive(Clone)]
pub enum OutboundMsg {
    /// Header-prefixed binary frame.
    Frame(Bytes),
    /// Serialized JSON control response.
    Control(Arc<str>),
}

/// The WebSocket-backed [`Transport`].
pub struct WsTransport {
    tx: broadcast::Sender<OutboundMsg>,
    connections: Arc<WsConnectionManager>,
}

impl WsTransport {
    pub fn new(connections: Arc<WsConnectionManager>) -> Self {
        let (tx, _) = broadcast::channel(OUTBOUND_CAPACITY);
        Self { tx, connections }
    }

    /// Subscribes one connection to the outbound fan-out.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMsg> {
        self.tx.subscribe()
    }
}

impl Transport for WsTransport {
    fn active_connections(&self) -> usize {
        self.connections.connection_count()
    }

    fn send_buffer(&self, buffer_id: u32, kind: ValueKind, payload: &[u8]) {
        let header = FrameHeader::for_kind(
            buffer_id,
            kind,
            (payload.len() / kind.size()) as u32,
        );
        let mut buf = BytesMut::with_capacity(WIRE_HEADER_LEN + payload.len());
        buf.put_slice(&header.encode());
        buf.put_slice(payload);
        // No receivers just means no host; the frame is dropped.
        let _ = self.tx.send(OutboundMsg::Frame(buf.freeze()));
    }

    fn send_control(&self, body: serde_json::Value) {
        match serde_json::to_string(&body) {
            Ok(text) => {
                let _ = self.tx.send(OutboundMsg::Control(text.into()));
            }
            Err(e) => log::error!("[WS] serializing control response: {e}"),
        }
    }
}

/// Upgrades `/ws` requests into the combined control/data socket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let guard = state.connections.register();
    let mut outbound = state.transport.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            _ = guard.cancel_token().cancelled() => break,

            out = outbound.recv() => match out {
                Ok(OutboundMsg::Frame(frame)) => {
                    if sender.send(Message::Binary(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(OutboundMsg::Control(text)) => {
                    if sender.send(Message::Text(text.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("[WS] ws-{} lagged, dropped {n} message(s)", guard.id());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => state.hub.handle_control(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => {
                    if let Err(e) = state.inbound.dispatch(&bytes) {
                        log::warn!("[WS] inbound frame rejected: {e}");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong handled by axum
                Some(Err(e)) => {
                    log::debug!("[WS] ws-{} receive error: {e}", guard.id());
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> (WsTransport, Arc<WsConnectionManager>) {
        let connections = Arc::new(WsConnectionManager::new());
        (WsTransport::new(Arc::clone(&connections)), connections)
    }

    #[test]
    fn send_buffer_prefixes_the_wire_header() {
        let (transport, _) = transport();
        let mut rx = transport.subscribe();

        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
        transport.send_buffer(3, ValueKind::F32, &payload);

        let OutboundMsg::Frame(frame) = rx.try_recv().unwrap() else {
            panic!("expected a frame");
        };
        let header = FrameHeader::parse(&frame).unwrap();
        assert_eq!(header.buffer_id, 3);
        assert_eq!(header.kind(), Some(ValueKind::F32));
        assert_eq!(header.buffer_len, 2);
        assert_eq!(&frame[WIRE_HEADER_LEN..], &payload);
    }

    #[test]
    fn send_without_receivers_is_a_silent_no_op() {
        let (transport, _) = transport();
        transport.send_buffer(0, ValueKind::Char, &[0]);
        transport.send_control(serde_json::json!({"watcher": {}}));
    }

    #[test]
    fn connection_count_reflects_guards() {
        let (transport, connections) = transport();
        assert_eq!(transport.active_connections(), 0);
        let guard = connections.register();
        assert_eq!(transport.active_connections(), 1);
        drop(guard);
        assert_eq!(transport.active_connections(), 0);
    }
}
