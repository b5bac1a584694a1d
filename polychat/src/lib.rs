//! `Polychat` — multi-channel chat over a publish/subscribe broker.

pub mod broker;
pub mod command;
pub mod config;
pub mod fetch;
pub mod identity;
pub mod session;
