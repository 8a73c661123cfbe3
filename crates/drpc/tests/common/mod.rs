#![allow(dead_code)]

use drp_common::frame::{Frame, FrameDecoder, Opcode};
use drpc::client::{Client, ClientOptions, Connect};
use drpc::config::{PresenceSettings, RetryConfig};
use drpc::service::ServiceOptions;
use drpc::transport::TransportError;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const CLIENT_ID: &str = "594190466782724099";
pub const PID: u32 = 4242;

/// Hands out queued in-memory streams; an empty queue fails discovery.
#[derive(Clone, Default)]
pub struct QueueConnector(Arc<Mutex<VecDeque<DuplexStream>>>);

impl QueueConnector {
    /// Queues one stream and returns the peer end.
    pub fn push(&self) -> MockPeer {
        let (ours, theirs) = duplex(64 * 1024);
        self.0.lock().unwrap().push_back(ours);
        MockPeer::new(theirs)
    }
}

impl Connect for QueueConnector {
    type Stream = DuplexStream;

    fn connect(&self) -> impl Future<Output = Result<DuplexStream, TransportError>> + Send {
        let next = self.0.lock().unwrap().pop_front();
        async move { next.ok_or(TransportError::Discovery { tried: 10 }) }
    }
}

/// The far side of the IPC channel.
pub struct MockPeer {
    io: DuplexStream,
    decoder: FrameDecoder,
}

impl MockPeer {
    pub fn new(io: DuplexStream) -> Self {
        Self {
            io,
            decoder: FrameDecoder::new(),
        }
    }

    /// Next frame from the client, or `None` once it hangs up.
    pub async fn try_next(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                return Some(frame);
            }
            let n = self.io.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                return None;
            }
            self.decoder.push(&buf[..n]);
        }
    }

    pub async fn next(&mut self) -> Frame {
        self.try_next().await.expect("client hung up")
    }

    /// Next data frame; panics on any other opcode.
    pub async fn next_request(&mut self) -> Value {
        let frame = self.next().await;
        assert_eq!(frame.opcode, Opcode::Frame, "unexpected {frame:?}");
        frame.payload
    }

    pub async fn send(&mut self, body: Value) {
        self.io
            .write_all(&Frame::data(body).encode().unwrap())
            .await
            .unwrap();
    }

    /// Answers `request` with `data`.
    pub async fn reply(&mut self, request: &Value, data: Value) {
        self.send(json!({
            "cmd": request["cmd"],
            "nonce": request["nonce"],
            "data": data,
        }))
        .await;
    }

    /// Reads the handshake and announces readiness with `username`.
    pub async fn accept(&mut self, username: &str) -> Frame {
        let hs = self.next().await;
        assert_eq!(hs.opcode, Opcode::Handshake);
        self.send(json!({
            "cmd": "DISPATCH",
            "evt": "READY",
            "data": {"v": 1, "user": {"id": "80351110224678912", "username": username}},
        }))
        .await;
        hs
    }

    /// Whether the client sends anything within `wait`.
    pub async fn silent_for(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.try_next()).await.is_err()
    }
}

pub fn client(connector: QueueConnector) -> Client {
    Client::new(connector, ClientOptions::new(CLIENT_ID))
}

/// A client whose first connect reaches a fresh peer.
pub fn client_with_peer() -> (Client, MockPeer, QueueConnector) {
    let connector = QueueConnector::default();
    let peer = connector.push();
    (client(connector.clone()), peer, connector)
}

/// Client connected to a peer that announced `alice`.
pub async fn connected() -> (Client, MockPeer, QueueConnector) {
    let (client, mut peer, connector) = client_with_peer();
    let connect = client.connect();
    peer.accept("alice").await;
    connect.await.unwrap();
    (client, peer, connector)
}

pub fn service_options(attempts: i32) -> ServiceOptions {
    ServiceOptions {
        retry: RetryConfig {
            attempts,
            ..RetryConfig::default()
        },
        throttle_window: Duration::from_secs(5),
        settings: PresenceSettings::default(),
        art: HashMap::new(),
        pid: PID,
    }
}
