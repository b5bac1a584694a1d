//! `Polychat` broker library.
//!
//! Exposes the broker server for use in tests and embedding. The broker
//! accepts WebSocket connections that act either as publishers appending to
//! named channels or as cursors reading those channels.

pub mod config;
pub mod server;
pub mod topics;
