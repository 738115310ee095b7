//! shelly-rpc - JSON-RPC over WebSocket for Shelly Gen2 devices
//!
//! One [`Client`] per device owns a single WebSocket to `ws://<host>/rpc`
//! and multiplexes every component's calls over it.
//!
//! ## Architecture
//!
//! ```text
//!  Handle("Switch") ─┐                     ┌─► ingress reader ─► call registry
//!  Handle("Sys")    ─┼─► outbox (mpsc) ───►│
//!  Handle("WiFi")   ─┘                     └─◄ egress writer
//!                          connection manager (dial, fault, back off, redial)
//! ```
//!
//! - **Calls** get a fresh wire id; responses are routed back by id
//! - **Retries** republish an unanswered frame up to `send_trys` times
//! - **Auth** answers a 401 digest challenge once and caches the credential
//!   for the life of the connection
//! - **Reconnects** happen in the background; callers only see timeouts

pub mod auth;
pub mod client;
pub mod component;
pub mod config;
pub mod connection;
pub mod error;
pub mod handle;
pub mod protocol;
pub mod transport;

pub use auth::{AuthChallenge, AuthCredential};
pub use client::Client;
pub use component::{Component, ComponentClient, MessageHandler, MessageHandlerFactory};
pub use config::ClientConfig;
pub use connection::ConnectionState;
pub use error::{ErrorKind, Result, RpcError};
pub use handle::Handle;
pub use protocol::{ErrorBody, Request, Response};
