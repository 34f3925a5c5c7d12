//! Study-runner protocol
//!
//! Types exchanged between a running study and the experiment server:
//! channel frames (JSON over WebSocket), JSON-patch operations and the
//! properties returned by the `initData` endpoint.

pub mod client;
pub mod server;
pub mod types;

pub use client::OutboundFrame;
pub use server::{ChannelAction, Heartbeat, InboundFrame};
pub use types::*;
