//! In-process Shelly device for integration tests
//!
//! Accepts WebSocket connections on a random local port and answers each
//! request frame through a test-supplied responder.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shelly_rpc::{AuthChallenge, AuthCredential, Client, ClientConfig, ConnectionState};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

pub const DEVICE_ID: &str = "shellyplus1-a8032ab12345";
pub const DEVICE_NONCE: u64 = 1_700_000_000;

/// Maps one request to the frames sent back. An empty vec means silence.
pub type Responder = Arc<dyn Fn(&Value) -> Vec<Message> + Send + Sync>;

pub struct MockDevice {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    kill: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MockDevice {
    pub async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let (kill, _) = broadcast::channel(4);

        let task = {
            let requests = Arc::clone(&requests);
            let connections = Arc::clone(&connections);
            let kill = kill.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        Arc::clone(&responder),
                        Arc::clone(&requests),
                        kill.subscribe(),
                    ));
                }
            })
        };

        Self {
            addr,
            requests,
            connections,
            kill,
            task,
        }
    }

    /// Client config pointing at this device with short test timings.
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            send_timeout_ms: 500,
            retry_wait_ms: 50,
            ..ClientConfig::new(self.addr.to_string())
        }
    }

    /// Request frames received so far, across all connections.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Abruptly drop every open connection without a close frame.
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.task.abort();
        let _ = self.kill.send(());
    }
}

async fn serve(
    stream: TcpStream,
    responder: Responder,
    requests: Arc<Mutex<Vec<Value>>>,
    mut kill: broadcast::Receiver<()>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut tx, mut rx) = ws.split();

    loop {
        let msg = tokio::select! {
            _ = kill.recv() => return,
            msg = rx.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                let request: Value = serde_json::from_str(&text).unwrap();
                requests.lock().unwrap().push(request.clone());
                for frame in responder(&request) {
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    }
}

pub fn text(frame: Value) -> Message {
    Message::Text(frame.to_string())
}

pub fn binary(frame: Value) -> Message {
    Message::Binary(serde_json::to_vec(&frame).unwrap())
}

/// Answers every request with its own method and params.
pub fn echo() -> Responder {
    Arc::new(|request: &Value| {
        vec![text(json!({
            "id": request["id"],
            "src": DEVICE_ID,
            "result": { "method": request["method"], "params": request["params"] },
        }))]
    })
}

/// Never answers.
pub fn silent() -> Responder {
    Arc::new(|_: &Value| Vec::new())
}

pub fn device_challenge() -> AuthChallenge {
    AuthChallenge {
        auth_type: "digest".into(),
        nonce: DEVICE_NONCE,
        nc: 1,
        realm: DEVICE_ID.into(),
        algorithm: "SHA-256".into(),
    }
}

fn challenge_frame(id: &Value) -> Message {
    let challenge = serde_json::to_string(&device_challenge()).unwrap();
    text(json!({
        "id": id,
        "src": DEVICE_ID,
        "error": { "code": 401, "message": challenge },
    }))
}

/// Echo device that demands digest auth for `admin` / `password`.
///
/// `challenges` counts the 401 answers sent.
pub fn authenticated(password: &'static str, challenges: Arc<AtomicUsize>) -> Responder {
    Arc::new(move |request: &Value| {
        let valid = serde_json::from_value::<AuthCredential>(request["auth"].clone())
            .map(|credential| {
                let expected = AuthCredential::compute_with_cnonce(
                    &device_challenge(),
                    "admin",
                    password,
                    credential.cnonce,
                );
                credential == expected
            })
            .unwrap_or(false);

        if !valid {
            challenges.fetch_add(1, Ordering::SeqCst);
            return vec![challenge_frame(&request["id"])];
        }

        vec![text(json!({
            "id": request["id"],
            "src": DEVICE_ID,
            "result": { "method": request["method"] },
        }))]
    })
}

/// Wait until the client reports `state`.
pub async fn wait_for_state(client: &Client, state: ConnectionState) {
    let mut rx = client.state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for connection state")
        .unwrap();
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
