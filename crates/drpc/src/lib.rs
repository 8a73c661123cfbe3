//! Rich-presence client daemon: persistent local IPC connection with a
//! line-delimited JSON control API.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Host events and the statuses they compose into.
pub mod activity;
/// Additive backoff for login retries.
pub mod backoff;
/// RPC client with nonce correlation.
pub mod client;
/// CLI parsing and TOML configuration.
pub mod config;
/// Discovery of the peer's local HTTP endpoint.
pub mod endpoint;
/// Line-delimited JSON API over TCP/Unix sockets.
pub mod local_api;
/// Login retry state machine.
pub mod reconnect;
/// Presence service actor.
pub mod service;
/// Rate limiting for status updates.
pub mod throttle;
/// Framed IPC channel to the peer.
pub mod transport;
