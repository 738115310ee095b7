//! Component Clients
//!
//! Capability traits consumed by component-specific code, and a small typed
//! wrapper that turns `<Component>.<Verb>` calls into decoded results.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, RpcError};
use crate::handle::Handle;
use crate::protocol::{ErrorBody, Request};

/// Something that can carry one RPC call.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Perform the call and return the raw response bytes.
    async fn send(&self, ctx: &CancellationToken, request: &Request) -> Result<Vec<u8>>;
}

/// Source of named message handlers.
#[async_trait]
pub trait MessageHandlerFactory: Send + Sync {
    async fn new_handle(&self, name: &str) -> Arc<dyn MessageHandler>;

    async fn is_auth_enabled(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
impl MessageHandler for Handle {
    async fn send(&self, ctx: &CancellationToken, request: &Request) -> Result<Vec<u8>> {
        Handle::send(self, ctx, request).await
    }
}

/// Device components addressable over RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Shelly,
    Sys,
    Wifi,
    Eth,
    Ble,
    Cloud,
    Mqtt,
    Ws,
    Input,
    Switch,
    Light,
}

impl Component {
    /// Method prefix used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shelly => "Shelly",
            Self::Sys => "Sys",
            Self::Wifi => "WiFi",
            Self::Eth => "Eth",
            Self::Ble => "BLE",
            Self::Cloud => "Cloud",
            Self::Mqtt => "MQTT",
            Self::Ws => "WS",
            Self::Input => "Input",
            Self::Switch => "Switch",
            Self::Light => "Light",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
struct Reply<R> {
    result: Option<R>,
    error: Option<ErrorBody>,
}

/// Typed calls against one component.
#[derive(Clone)]
pub struct ComponentClient {
    name: String,
    handler: Arc<dyn MessageHandler>,
}

impl ComponentClient {
    pub fn new(name: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call `<name>.<verb>` and decode its `result`.
    ///
    /// # Errors
    /// - [`RpcError::MissingResult`] when the response has neither result nor error
    /// - Everything [`Handle::send`] returns
    pub async fn call<P, R>(&self, ctx: &CancellationToken, verb: &str, params: Option<P>) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let method = format!("{}.{}", self.name, verb);
        let mut request = Request::new(method.clone());
        if let Some(params) = params {
            request = request.with_params(params)?;
        }

        let raw = self.handler.send(ctx, &request).await?;
        debug!(method = %method, len = raw.len(), "Decoding result");

        let reply: Reply<R> = serde_json::from_slice(&raw)?;
        if let Some(error) = reply.error {
            return Err(error.into());
        }
        reply.result.ok_or(RpcError::MissingResult(method))
    }

    /// `<name>.GetConfig`
    pub async fn get_config<R: DeserializeOwned>(&self, ctx: &CancellationToken) -> Result<R> {
        self.call::<(), R>(ctx, "GetConfig", None).await
    }

    /// `<name>.GetStatus`
    pub async fn get_status<R: DeserializeOwned>(&self, ctx: &CancellationToken) -> Result<R> {
        self.call::<(), R>(ctx, "GetStatus", None).await
    }
}
