//! Connection Manager
//!
//! Maintains the single WebSocket to the device. One long-lived task dials,
//! runs an ingress reader and an egress writer for the life of each socket,
//! and redials after `retry_wait` whenever either side faults.
//!
//! The outbox receiver outlives every socket: the egress writer takes it for
//! one connection and hands it back when that connection ends.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::client::Shared;
use crate::error::RpcError;
use crate::handle::{CallRegistry, Route};
use crate::transport::{Transport, WsSink, WsStream};

/// Upper bound on writing the close frame during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Observable state of the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not yet dialing
    Idle,
    Connecting,
    Connected,
    /// Waiting `retry_wait` before the next dial
    Backoff,
    /// Client closed; no further dials
    Closed,
}

enum SessionEnd {
    Fault(RpcError),
    Shutdown,
}

/// Reconnect loop. Runs until the client's shutdown token fires.
pub(crate) async fn run(shared: Arc<Shared>, mut outbox: mpsc::Receiver<String>) {
    let url = shared.config.endpoint_url();
    let retry_wait = shared.config.retry_wait();
    let shutdown = shared.shutdown.clone();

    loop {
        shared.set_state(ConnectionState::Connecting);
        info!("Connecting to device at {}", url);

        let dialed = tokio::select! {
            _ = shutdown.cancelled() => break,
            dialed = Transport::connect(&url, shared.config.send_timeout()) => dialed,
        };

        match dialed {
            Ok(transport) => {
                shared.set_state(ConnectionState::Connected);
                info!("Connected to device");

                let (end, returned) = run_session(&shared, transport, outbox).await;
                outbox = match returned {
                    Some(outbox) => outbox,
                    None => {
                        error!("Egress writer lost the outbox, stopping");
                        shared.set_state(ConnectionState::Closed);
                        return;
                    }
                };

                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Fault(e) => {
                        warn!(error = %e, in_flight = shared.calls.len(), "Device connection lost");
                        if shared.clear_credential().await {
                            debug!("Cleared cached credential");
                        }
                        let dropped = discard_queued(&mut outbox);
                        if dropped > 0 {
                            debug!(dropped = dropped, "Discarded frames queued before the fault");
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to connect to device: {}", e);
            }
        }

        shared.set_state(ConnectionState::Backoff);
        warn!("Reconnecting to device in {:?}...", retry_wait);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(retry_wait) => {}
        }
    }

    outbox.close();
    shared.set_state(ConnectionState::Closed);
    debug!("Connection manager stopped");
}

/// Drive one connected socket until it faults or the client shuts down.
///
/// Returns the outbox so the next connection can reuse it.
async fn run_session(
    shared: &Arc<Shared>,
    transport: Transport,
    outbox: mpsc::Receiver<String>,
) -> (SessionEnd, Option<mpsc::Receiver<String>>) {
    let (sink, stream) = transport.split();
    let scope = shared.shutdown.child_token();

    // Single slot: the first fault wins, later ones are redundant
    let (fault_tx, mut fault_rx) = mpsc::channel::<RpcError>(1);

    let ingress = tokio::spawn(ingress_reader(
        stream,
        Arc::clone(&shared.calls),
        scope.clone(),
        fault_tx.clone(),
    ));
    let egress = tokio::spawn(egress_writer(sink, outbox, scope.clone(), fault_tx));

    let end = tokio::select! {
        fault = fault_rx.recv() => match fault {
            Some(e) => SessionEnd::Fault(e),
            None => SessionEnd::Shutdown,
        },
        _ = scope.cancelled() => SessionEnd::Shutdown,
    };

    scope.cancel();

    if let Err(e) = ingress.await {
        error!(error = %e, "Ingress reader panicked");
    }
    let outbox = match egress.await {
        Ok(outbox) => Some(outbox),
        Err(e) => {
            error!(error = %e, "Egress writer panicked");
            None
        }
    };

    (end, outbox)
}

/// Read frames and route each to the call waiting on its id.
async fn ingress_reader(
    mut stream: WsStream,
    calls: Arc<CallRegistry>,
    scope: CancellationToken,
    fault: mpsc::Sender<RpcError>,
) {
    debug!("Ingress reader started");

    loop {
        let next = tokio::select! {
            _ = scope.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => route(&calls, text.into_bytes()),
            Some(Ok(Message::Binary(data))) => route(&calls, data),
            Some(Ok(Message::Close(frame))) => {
                info!(frame = ?frame, "Device closed connection");
                let _ = fault.try_send(RpcError::Transport("closed by device".into()));
                break;
            }
            Some(Ok(_)) => {
                // Ping/pong handled by tungstenite
            }
            Some(Err(e)) => {
                let _ = fault.try_send(e.into());
                break;
            }
            None => {
                let _ = fault.try_send(RpcError::Transport("stream ended".into()));
                break;
            }
        }
    }

    debug!("Ingress reader ended");
}

fn route(calls: &CallRegistry, raw: Vec<u8>) {
    trace!(len = raw.len(), "Recv");
    match calls.route(raw) {
        Route::Delivered(id) => trace!(id = id, "Routed response"),
        Route::Unaddressed => debug!("Dropping frame without id"),
        Route::Unknown(id) => warn!(id = id, "Dropping response for unknown id"),
        Route::InboxFull(id) => warn!(id = id, "Call inbox full, dropping response"),
        Route::Malformed(e) => warn!(error = %e, "Dropping malformed frame"),
    }
}

/// Write queued frames in order until the scope ends or the socket fails.
async fn egress_writer(
    mut sink: WsSink,
    mut outbox: mpsc::Receiver<String>,
    scope: CancellationToken,
    fault: mpsc::Sender<RpcError>,
) -> mpsc::Receiver<String> {
    debug!("Egress writer started");

    loop {
        tokio::select! {
            biased;
            _ = scope.cancelled() => {
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                }));
                if let Ok(Err(e)) = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(close)).await {
                    debug!(error = %e, "Close frame not delivered");
                }
                break;
            }
            frame = outbox.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        let _ = fault.try_send(e.into());
                        break;
                    }
                }
                None => {
                    let _ = fault.try_send(RpcError::Closed);
                    break;
                }
            },
        }
    }

    debug!("Egress writer ended");
    outbox
}

/// Empty the outbox without blocking; returns how many frames were dropped.
fn discard_queued(outbox: &mut mpsc::Receiver<String>) -> usize {
    let mut dropped = 0;
    while outbox.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discard_queued_empties_outbox() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send("a".to_string()).await.unwrap();
        tx.send("b".to_string()).await.unwrap();

        assert_eq!(discard_queued(&mut rx), 2);
        assert_eq!(discard_queued(&mut rx), 0);

        // Still usable afterwards
        tx.send("c".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("c"));
    }
}
