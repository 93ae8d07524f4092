//! Transport layer for execution event streams.
//!
//! Provides:
//! - Wire protocol (inbound frames, outbound client messages)
//! - WebSocket stream client with resumption (feature: websocket)
//! - REST command client (feature: rest)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "rest")]
pub mod commands;

pub use protocol::{ClientMessage, ProtocolError, StartFrom};

#[cfg(feature = "websocket")]
pub use websocket::{ConnectionStatus, InboundFrame, TransportError, TransportManager};

#[cfg(feature = "rest")]
pub use commands::{CommandClient, CommandError};
