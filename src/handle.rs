//! Handles and Call Correlation
//!
//! A [`Handle`] is a named channel over the shared connection, one per device
//! component. Every `send` gets a fresh wire id and a slot in the
//! [`CallRegistry`]; the ingress reader routes responses by that id, so
//! overlapping calls on one handle never see each other's answers.
//!
//! # Send State Machine
//!
//! ```text
//!   publish ──► wait ──► response ──► error 401? ──► compute credential
//!     ▲          │                        │                 │
//!     └─timeout──┘                        no                ▼
//!   (up to send_trys)                     │           republish once
//!                                         ▼                 │
//!                                   bytes / device error ◄──┘
//! ```

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::auth::{AuthChallenge, AuthCredential};
use crate::client::Shared;
use crate::error::{Result, RpcError};
use crate::protocol::{ErrorBody, Request, Response};

/// Responses buffered per in-flight call.
const CALL_INBOX_CAPACITY: usize = 16;

/// A response frame routed to the call that owns its id.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub response: Response,
    pub raw: Vec<u8>,
}

/// What the ingress reader did with a frame.
#[derive(Debug)]
pub(crate) enum Route {
    Delivered(u64),
    /// No id: a device notification, not an answer
    Unaddressed,
    Unknown(u64),
    InboxFull(u64),
    Malformed(RpcError),
}

/// In-flight calls keyed by wire id.
#[derive(Default)]
pub(crate) struct CallRegistry {
    calls: DashMap<u64, mpsc::Sender<Inbound>>,
}

impl CallRegistry {
    /// Reserve `id`; the slot is released when the returned guard drops.
    pub fn register(self: &Arc<Self>, id: u64) -> PendingCall {
        let (tx, rx) = mpsc::channel(CALL_INBOX_CAPACITY);
        self.calls.insert(id, tx);
        PendingCall {
            id,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver a raw frame to the call waiting on its id.
    pub fn route(&self, raw: Vec<u8>) -> Route {
        let response = match Response::parse(&raw) {
            Ok(response) => response,
            Err(e) => return Route::Malformed(e),
        };

        let Some(id) = response.id else {
            return Route::Unaddressed;
        };

        let Some(inbox) = self.calls.get(&id) else {
            return Route::Unknown(id);
        };

        match inbox.try_send(Inbound { response, raw }) {
            Ok(()) => Route::Delivered(id),
            Err(mpsc::error::TrySendError::Full(_)) => Route::InboxFull(id),
            // Receiver is dropping; the guard removes the slot right after
            Err(mpsc::error::TrySendError::Closed(_)) => Route::Unknown(id),
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Registration of one in-flight call.
pub(crate) struct PendingCall {
    id: u64,
    rx: mpsc::Receiver<Inbound>,
    registry: Weak<CallRegistry>,
}

impl PendingCall {
    async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    /// Drop answers to earlier attempts still sitting in the inbox.
    fn discard_buffered(&mut self) -> usize {
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.calls.remove(&self.id);
        }
    }
}

pub(crate) struct HandleInner {
    id: u64,
    name: String,
    done: CancellationToken,
    shared: Arc<Shared>,
}

/// A named channel over the shared device connection.
///
/// Cheap to clone; clones share the same id and done signal.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Handle {
    pub(crate) fn new(id: u64, name: &str, shared: Arc<Shared>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                name: name.to_string(),
                done: shared.shutdown.child_token(),
                shared,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn done_token(&self) -> CancellationToken {
        self.inner.done.clone()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Component name this handle was created for.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Close this handle alone. Blocked and future sends fail with [`RpcError::Closed`].
    pub async fn close(&self) {
        debug!(handle = %self.inner.name, id = self.inner.id, "Closing handle");
        self.inner.done.cancel();
        self.inner.shared.unregister(self.inner.id).await;
    }

    /// Perform one RPC call and return the raw response bytes.
    ///
    /// `id` and `auth` of `request` are overwritten. Cancelling `ctx` abandons
    /// this call only.
    ///
    /// # Errors
    /// - [`RpcError::Timeout`] after `send_trys` unanswered attempts
    /// - [`RpcError::Device`] when the response carries an error
    /// - [`RpcError::Closed`] / [`RpcError::Cancelled`] on shutdown or caller cancellation
    /// - auth errors when a challenge cannot be answered
    pub async fn send(&self, ctx: &CancellationToken, request: &Request) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }

        let shared = &self.inner.shared;
        let call_id = shared.next_call_id();

        let mut outgoing = request.clone();
        outgoing.id = Some(call_id);
        outgoing.auth = shared.credential().await;

        debug!(
            handle = %self.inner.name,
            id = call_id,
            method = %outgoing.method,
            authenticated = outgoing.auth.is_some(),
            "Sending request"
        );

        // Encoded once; every retry republishes the same frame
        let frame = outgoing.to_frame()?;
        trace!(frame = %frame, "Send");

        let mut pending = shared.calls.register(call_id);
        let send_trys = shared.config.send_trys.max(1);

        let mut attempts = 0;
        let inbound = loop {
            attempts += 1;
            if let Some(inbound) = self.attempt(ctx, &mut pending, &frame).await? {
                break inbound;
            }
            if attempts >= send_trys {
                warn!(
                    handle = %self.inner.name,
                    id = call_id,
                    method = %outgoing.method,
                    attempts = attempts,
                    "Giving up on request"
                );
                return Err(RpcError::Timeout {
                    method: outgoing.method,
                    attempts,
                });
            }
            debug!(id = call_id, attempt = attempts, "No response, republishing");
        };

        match inbound.response.error {
            None => Ok(inbound.raw),
            Some(error) if error.is_auth_challenge() => {
                self.answer_challenge(ctx, &mut pending, outgoing, error)
                    .await
            }
            Some(error) => Err(error.into()),
        }
    }

    /// Publish `frame` and wait for one correlated response.
    ///
    /// `Ok(None)` means the attempt timed out.
    async fn attempt(
        &self,
        ctx: &CancellationToken,
        pending: &mut PendingCall,
        frame: &str,
    ) -> Result<Option<Inbound>> {
        let shared = &self.inner.shared;
        let done = &self.inner.done;
        let deadline = Instant::now() + shared.config.send_timeout();

        tokio::select! {
            biased;
            _ = done.cancelled() => return Err(RpcError::Closed),
            _ = ctx.cancelled() => return Err(RpcError::Cancelled),
            published = shared.outbox.send(frame.to_string()) => {
                published.map_err(|_| RpcError::Closed)?;
            }
            _ = sleep_until(deadline) => return Ok(None),
        }

        tokio::select! {
            biased;
            _ = done.cancelled() => Err(RpcError::Closed),
            _ = ctx.cancelled() => Err(RpcError::Cancelled),
            inbound = pending.recv() => inbound.map(Some).ok_or(RpcError::Closed),
            _ = sleep_until(deadline) => Ok(None),
        }
    }

    /// Answer a 401 challenge and republish exactly once.
    async fn answer_challenge(
        &self,
        ctx: &CancellationToken,
        pending: &mut PendingCall,
        mut outgoing: Request,
        challenge: ErrorBody,
    ) -> Result<Vec<u8>> {
        let shared = &self.inner.shared;
        let config = &shared.config;

        debug!(handle = %self.inner.name, method = %outgoing.method, "Device requested authentication");

        if config.username.is_empty() {
            return Err(RpcError::CredentialsRequired("username"));
        }
        let password = config
            .password
            .as_deref()
            .ok_or(RpcError::CredentialsRequired("password"))?;

        let challenge = AuthChallenge::parse(&challenge.message)?;
        let credential = AuthCredential::compute(&challenge, &config.username, password);
        shared.set_credential(credential.clone()).await;

        outgoing.auth = Some(credential.clone());
        let frame = outgoing.to_frame()?;

        let stale = pending.discard_buffered();
        if stale > 0 {
            debug!(discarded = stale, "Discarded answers to earlier attempts");
        }

        let inbound = self
            .attempt(ctx, pending, &frame)
            .await?
            .ok_or_else(|| RpcError::Timeout {
                method: outgoing.method.clone(),
                attempts: 1,
            })?;

        match inbound.response.error {
            None => Ok(inbound.raw),
            Some(error) if error.is_auth_challenge() => {
                warn!(realm = %credential.realm, "Device rejected credential");
                shared.clear_credential_if(&credential).await;
                Err(RpcError::AuthRejected(error.message))
            }
            Some(error) => Err(error.into()),
        }
    }
}
