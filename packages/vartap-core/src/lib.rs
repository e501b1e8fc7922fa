//! vartap core - watched-variable instrumentation for real-time audio runtimes.
//!
//! Application code declares *watched variables*: named, typed scalars whose
//! assignments a central manager observes. Depending on per-variable
//! commands from a remote host, the manager monitors throttled change
//! notifications, streams timestamped frames over the control connection,
//! logs the same frames to binary files, and accepts remote control of a
//! variable's value. A symmetric binary channel pushes typed frames from
//! the host back into the runtime.
//!
//! # Architecture
//!
//! The crate is split along the real-time boundary:
//!
//! - [`watcher`]: the RT half — clock ticks, notify, frame hand-off
//! - [`hub`]: the shared half — registry snapshot, control entry point,
//!   manager worker
//! - [`var`]: per-variable shared cells and the typed [`Watched`] handle
//! - [`frame`]: the fixed-size frame buffer and its wire decoder
//! - [`channel`]: the per-channel scheduled state machine
//! - [`pipe`]: SPSC command/event pipes crossing the RT boundary
//! - [`control`]: the JSON control protocol codec
//! - [`wire`]: binary channel framing and the inbound stream table
//! - [`logwriter`]: the durable binary log writer
//! - [`transport`]: the host-connection seam
//! - [`api`]: the axum WebSocket server implementing that seam
//! - [`error`]: centralized error types

#![warn(clippy::all)]

pub mod api;
pub mod channel;
mod control;
pub mod error;
pub mod frame;
pub mod hub;
pub mod logwriter;
pub mod pipe;
pub mod transport;
pub mod value;
pub mod var;
pub mod watcher;
pub mod wire;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, ServerError, WsConnectionManager, WsTransport};
pub use channel::{ChannelState, NEVER};
pub use error::{WatchError, WatchResult};
pub use frame::{StreamFrame, FRAME_LEN};
pub use hub::WatchHub;
pub use logwriter::BinaryLogger;
pub use transport::{NullTransport, Transport};
pub use value::{TimestampMode, ValueKind, WatchKind};
pub use var::{VarHandle, VarShared, Watched};
pub use watcher::{Watcher, WatcherConfig};
pub use wire::{FrameHeader, InboundFrame, InboundRegistry};
