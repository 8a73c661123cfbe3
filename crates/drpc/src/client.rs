//! RPC client: nonce correlation, readiness tracking and lifecycle events.
//!
//! [`Client`] is a cheap cloneable handle. The connection itself, the
//! pending-request table and the connection status belong to a single actor
//! task that serializes every mutation; handles talk to it over a command
//! channel.

use crate::endpoint::EndpointProbe;
use crate::transport::{self, CloseReason, IpcStream, Transport, TransportError, TransportEvent};
use drp_common::message::{AuthenticateData, ReadyData};
use drp_common::presence::PresenceError;
use drp_common::types::command;
use drp_common::{Ref, RemoteStatus, RpcMessage, User};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 64;

/// Errors surfaced to callers of [`Client`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// A command was issued before the peer signalled readiness.
    #[error("not connected")]
    NotConnected,
    /// The peer did not send `READY` within the connect timeout.
    #[error("connection timed out")]
    ConnectionTimeout,
    /// No IPC channel could be opened.
    #[error("discovery failed: {0}")]
    Discovery(String),
    /// The channel closed while the call was outstanding.
    #[error("connection closed")]
    TransportClosed,
    /// The peer answered with `evt: ERROR`.
    #[error("rpc error {code}: {message}")]
    Protocol {
        /// Peer error code.
        code: i64,
        /// Peer error message.
        message: String,
    },
    /// The client actor has stopped.
    #[error("client is gone")]
    ClientGone,
    /// Scoped login needs an OAuth2 code exchange, which this client does not
    /// perform. Carries the one-time authorization code.
    #[error("authorization code must be exchanged for an access token")]
    CodeExchangeRequired(String),
    /// An outbound frame could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),
    /// The status cannot be mapped onto command arguments.
    #[error(transparent)]
    Presence(#[from] PresenceError),
}

/// Connection status of the IPC link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// No channel.
    Disconnected,
    /// Channel open or being opened, `READY` not yet seen.
    Connecting,
    /// `READY` received; commands may be issued.
    Connected,
}

/// Lifecycle and peer-pushed events.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The peer signalled readiness.
    Connected,
    /// The channel closed.
    Disconnected,
    /// Login finished, with the user known at that point.
    Ready(Option<User>),
    /// A `FRAME` that answered no pending request.
    Unsolicited {
        /// The frame's `evt`, empty if absent.
        event: String,
        /// The frame's `data`, `null` if absent.
        data: Value,
    },
    /// An `ERROR` frame that answered no pending request.
    ProtocolError {
        /// Peer error code.
        code: i64,
        /// Peer error message.
        message: String,
    },
    /// A background failure reported for visibility only.
    Error(String),
}

/// Opens a byte stream to the peer. Implemented for the real IPC channel by
/// [`IpcConnector`]; tests substitute in-memory streams.
pub trait Connect: Send + Sync + 'static {
    /// Stream type handed to the transport.
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Opens one stream.
    fn connect(&self) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;
}

/// Discovers the peer over the platform's numbered IPC channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcConnector;

impl Connect for IpcConnector {
    type Stream = IpcStream;

    fn connect(&self) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send {
        transport::discover()
    }
}

/// Static parameters of a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Application id sent in the handshake.
    pub client_id: String,
    /// Time allowed from starting discovery to receiving `READY`.
    pub connect_timeout: Duration,
    /// HTTP endpoint probe started after authorization.
    pub probe: Option<EndpointProbe>,
}

impl ClientOptions {
    /// Options with the default 10 second connect timeout and no probe.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            connect_timeout: Duration::from_secs(10),
            probe: None,
        }
    }
}

/// Parameters of [`Client::login`].
#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    /// OAuth2 scopes. Empty means plain presence access: connect only.
    pub scopes: Vec<String>,
    /// Previously obtained access token.
    pub access_token: Option<String>,
    /// RPC token forwarded with `AUTHORIZE`.
    pub rpc_token: Option<String>,
    /// Authorization prompt behaviour (`consent` or `none`).
    pub prompt: Option<String>,
}

/// Outcome of a connect attempt, shared between concurrent callers.
pub type ConnectFuture = Shared<BoxFuture<'static, Result<(), ClientError>>>;

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

enum Command {
    Connect(Reply<()>),
    Request {
        cmd: String,
        args: Value,
        evt: Option<String>,
        reply: Reply<Value>,
    },
    Ping(Reply<String>),
    HttpEndpoint(oneshot::Sender<Option<String>>),
    Destroy(oneshot::Sender<()>),
}

/// Handle to the RPC client actor.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnStatus>,
    user: watch::Receiver<Option<User>>,
    events: broadcast::Sender<ClientEvent>,
    connecting: Arc<Mutex<Option<ConnectFuture>>>,
    client_id: Arc<str>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Client over the platform IPC channel.
    #[must_use]
    pub fn ipc(options: ClientOptions) -> Self {
        Self::new(IpcConnector, options)
    }

    /// Spawns the actor on the current runtime.
    #[must_use]
    pub fn new<C: Connect>(connector: C, options: ClientOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status_rx) = watch::channel(ConnStatus::Disconnected);
        let (user_tx, user_rx) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE);
        let (dial_tx, dial_rx) = mpsc::channel(4);
        let client_id = Arc::from(options.client_id.as_str());

        let actor = Actor {
            connector: Arc::new(connector),
            options,
            status: status_tx,
            user: user_tx,
            events: events_tx.clone(),
            transport: None,
            transport_events: None,
            pending: HashMap::new(),
            connect_waiters: Vec::new(),
            connect_deadline: None,
            close_waiters: Vec::new(),
            attempt: 0,
            dial_tx,
        };
        tokio::spawn(actor.run(cmd_rx, dial_rx));

        Self {
            commands: cmd_tx,
            status: status_rx,
            user: user_rx,
            events: events_tx,
            connecting: Arc::new(Mutex::new(None)),
            client_id,
        }
    }

    /// Connects and waits for readiness.
    ///
    /// While an attempt is outstanding, or after it succeeded and the link is
    /// still up, every call returns the same shared future (compare with
    /// [`Shared::ptr_eq`]). A failed or dropped connection makes the next call
    /// start over.
    pub fn connect(&self) -> ConnectFuture {
        let mut slot = self
            .connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            match existing.peek() {
                None => return existing.clone(),
                Some(Ok(())) if self.status() == ConnStatus::Connected => {
                    return existing.clone();
                }
                Some(_) => {}
            }
        }

        let commands = self.commands.clone();
        let task = tokio::spawn(async move {
            let (reply, rx) = oneshot::channel();
            commands
                .send(Command::Connect(reply))
                .await
                .map_err(|_| ClientError::ClientGone)?;
            rx.await.map_err(|_| ClientError::ClientGone)?
        });
        let attempt = async move { task.await.unwrap_or(Err(ClientError::ClientGone)) }
            .boxed()
            .shared();
        *slot = Some(attempt.clone());
        attempt
    }

    /// Connects, then performs the login flow selected by `options`.
    ///
    /// With no scopes this resolves as soon as the link is ready. With an
    /// access token it authenticates. Scopes without a token run the
    /// `AUTHORIZE` half and return [`ClientError::CodeExchangeRequired`].
    ///
    /// # Errors
    ///
    /// Any connect, authorization or authentication failure.
    pub async fn login(&self, options: LoginOptions) -> Result<Option<User>, ClientError> {
        self.connect().await?;

        if !options.scopes.is_empty() {
            match options.access_token.as_deref() {
                Some(token) => {
                    self.authenticate(token).await?;
                }
                None => {
                    let code = self
                        .authorize(&options.scopes, options.rpc_token, options.prompt)
                        .await?;
                    return Err(ClientError::CodeExchangeRequired(code));
                }
            }
        }

        let user = self.user();
        let _ = self.events.send(ClientEvent::Ready(user.clone()));
        Ok(user)
    }

    /// Issues one command and waits for the frame carrying its nonce.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConnected`] before readiness,
    /// [`ClientError::Protocol`] when the peer answers `ERROR`,
    /// [`ClientError::TransportClosed`] if the channel drops first.
    pub async fn request(
        &self,
        cmd: &str,
        args: Value,
        evt: Option<&str>,
    ) -> Result<Value, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                cmd: cmd.to_string(),
                args,
                evt: evt.map(str::to_string),
                reply,
            })
            .await
            .map_err(|_| ClientError::ClientGone)?;
        rx.await.map_err(|_| ClientError::ClientGone)?
    }

    /// Requests a one-time authorization code for `scopes`.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn authorize(
        &self,
        scopes: &[String],
        rpc_token: Option<String>,
        prompt: Option<String>,
    ) -> Result<String, ClientError> {
        let mut args = json!({ "scopes": scopes, "client_id": &*self.client_id });
        if let Some(token) = rpc_token {
            args["rpc_token"] = Value::String(token);
        }
        if let Some(prompt) = prompt {
            args["prompt"] = Value::String(prompt);
        }
        let data = self.request(command::AUTHORIZE, args, None).await?;
        Ok(data
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Authenticates the channel. The returned user becomes [`Client::user`].
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn authenticate(&self, access_token: &str) -> Result<AuthenticateData, ClientError> {
        let data = self
            .request(
                command::AUTHENTICATE,
                json!({ "access_token": access_token }),
                None,
            )
            .await?;
        serde_json::from_value(data).map_err(|e| ClientError::Encode(e.to_string()))
    }

    /// Sets the displayed activity for process `pid`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Presence`] for unmappable timestamps, otherwise see
    /// [`Client::request`].
    pub async fn set_activity(&self, status: &RemoteStatus, pid: u32) -> Result<Value, ClientError> {
        let args = status.activity_args(pid)?;
        self.request(command::SET_ACTIVITY, args, None).await
    }

    /// Clears the displayed activity for process `pid`.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn clear_activity(&self, pid: u32) -> Result<Value, ClientError> {
        self.set_activity(&RemoteStatus::Empty, pid).await
    }

    /// Subscribes to a peer event. Dispatches arrive as
    /// [`ClientEvent::Unsolicited`].
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn subscribe(&self, event: &str, args: Value) -> Result<Subscription, ClientError> {
        self.request(command::SUBSCRIBE, args.clone(), Some(event))
            .await?;
        Ok(Subscription {
            client: self.clone(),
            event: event.to_string(),
            args,
        })
    }

    /// Invites `user` to join the current activity.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn send_join_invite(&self, user: impl Into<Ref>) -> Result<Value, ClientError> {
        self.user_command(command::SEND_ACTIVITY_JOIN_INVITE, user.into())
            .await
    }

    /// Accepts a join request from `user`.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn send_join_request(&self, user: impl Into<Ref>) -> Result<Value, ClientError> {
        self.user_command(command::SEND_ACTIVITY_JOIN_REQUEST, user.into())
            .await
    }

    /// Rejects a join request from `user`.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn close_join_request(&self, user: impl Into<Ref>) -> Result<Value, ClientError> {
        self.user_command(command::CLOSE_ACTIVITY_JOIN_REQUEST, user.into())
            .await
    }

    async fn user_command(&self, cmd: &str, user: Ref) -> Result<Value, ClientError> {
        self.request(cmd, json!({ "user_id": user.id() }), None).await
    }

    /// Sends a keepalive `PING`; returns its token.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConnected`] if there is no channel.
    pub async fn ping(&self) -> Result<String, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Ping(reply))
            .await
            .map_err(|_| ClientError::ClientGone)?;
        rx.await.map_err(|_| ClientError::ClientGone)?
    }

    /// Closes the channel and waits until its close has been processed.
    ///
    /// # Errors
    ///
    /// [`ClientError::ClientGone`] if the actor has already stopped.
    pub async fn destroy(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Destroy(reply))
            .await
            .map_err(|_| ClientError::ClientGone)?;
        rx.await.map_err(|_| ClientError::ClientGone)
    }

    /// HTTP endpoint found after authorization, if any.
    pub async fn http_endpoint(&self) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::HttpEndpoint(reply)).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnStatus {
        *self.status.borrow()
    }

    /// Watch channel tracking [`Client::status`].
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<ConnStatus> {
        self.status.clone()
    }

    /// User captured from `READY` or `AUTHENTICATE`.
    #[must_use]
    pub fn user(&self) -> Option<User> {
        self.user.borrow().clone()
    }

    /// Subscribes to lifecycle and peer events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

/// An active event subscription.
#[derive(Debug)]
pub struct Subscription {
    client: Client,
    event: String,
    args: Value,
}

impl Subscription {
    /// Event name this subscription covers.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Sends `UNSUBSCRIBE` with the original arguments.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn unsubscribe(self) -> Result<Value, ClientError> {
        self.client
            .request(command::UNSUBSCRIBE, self.args, Some(&self.event))
            .await
    }
}

/// Random nonce in UUID v4 textual form.
fn new_nonce() -> String {
    let mut bytes: [u8; 16] = rand::random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let mut out = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

async fn next_event(rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

type Dialed<S> = (u64, Result<S, TransportError>);

enum Input<S> {
    Command(Command),
    Transport(TransportEvent),
    Dialed(Dialed<S>),
    ConnectTimeout,
}

struct Actor<C: Connect> {
    connector: Arc<C>,
    options: ClientOptions,
    status: watch::Sender<ConnStatus>,
    user: watch::Sender<Option<User>>,
    events: broadcast::Sender<ClientEvent>,
    transport: Option<Transport>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    pending: HashMap<String, Reply<Value>>,
    connect_waiters: Vec<Reply<()>>,
    connect_deadline: Option<Instant>,
    close_waiters: Vec<oneshot::Sender<()>>,
    attempt: u64,
    dial_tx: mpsc::Sender<Dialed<C::Stream>>,
}

impl<C: Connect> Actor<C> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut dialed: mpsc::Receiver<Dialed<C::Stream>>,
    ) {
        loop {
            let deadline = self.connect_deadline;
            let input = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => Input::Command(cmd),
                    None => break,
                },
                Some(event) = next_event(&mut self.transport_events) => Input::Transport(event),
                Some(result) = dialed.recv() => Input::Dialed(result),
                () = sleep_until(deadline) => Input::ConnectTimeout,
            };

            match input {
                Input::Command(cmd) => self.handle_command(cmd).await,
                Input::Transport(TransportEvent::Message(msg)) => self.handle_message(msg),
                Input::Transport(TransportEvent::Error(message)) => {
                    self.emit(ClientEvent::Error(message));
                }
                Input::Transport(TransportEvent::Close(reason)) => self.handle_close(&reason),
                Input::Dialed((attempt, result)) => self.handle_dialed(attempt, result),
                Input::ConnectTimeout => {
                    warn!(
                        timeout_ms = u64::try_from(self.options.connect_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                        "peer did not become ready in time"
                    );
                    self.fail_connect(&ClientError::ConnectionTimeout);
                }
            }
        }

        if let Some(transport) = self.transport.take() {
            let _ = transport.close().await;
        }
        debug!("client actor stopped");
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn current_status(&self) -> ConnStatus {
        *self.status.borrow()
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(reply) => self.start_connect(reply),
            Command::Request {
                cmd,
                args,
                evt,
                reply,
            } => self.send_request(cmd, args, evt, reply).await,
            Command::Ping(reply) => {
                let result = match &self.transport {
                    Some(t) => t.ping().await.map_err(|_| ClientError::TransportClosed),
                    None => Err(ClientError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Command::HttpEndpoint(reply) => {
                let _ = reply.send(self.transport.as_ref().and_then(Transport::http_endpoint));
            }
            Command::Destroy(reply) => match &self.transport {
                Some(t) => {
                    self.close_waiters.push(reply);
                    let t = t.clone();
                    tokio::spawn(async move {
                        let _ = t.close().await;
                    });
                }
                None => {
                    if self.current_status() == ConnStatus::Connecting {
                        self.fail_connect(&ClientError::TransportClosed);
                    }
                    let _ = reply.send(());
                }
            },
        }
    }

    fn start_connect(&mut self, reply: Reply<()>) {
        match self.current_status() {
            ConnStatus::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnStatus::Connecting => self.connect_waiters.push(reply),
            ConnStatus::Disconnected => {
                self.connect_waiters.push(reply);
                self.status.send_replace(ConnStatus::Connecting);
                self.connect_deadline = Some(Instant::now() + self.options.connect_timeout);
                self.attempt += 1;

                let attempt = self.attempt;
                let connector = Arc::clone(&self.connector);
                let tx = self.dial_tx.clone();
                tokio::spawn(async move {
                    let result = connector.connect().await;
                    let _ = tx.send((attempt, result)).await;
                });
                debug!(attempt, "connecting");
            }
        }
    }

    fn handle_dialed(&mut self, attempt: u64, result: Result<C::Stream, TransportError>) {
        if attempt != self.attempt || self.current_status() != ConnStatus::Connecting {
            debug!(attempt, "discarding stale dial result");
            return;
        }
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "ipc discovery failed");
                self.fail_connect(&ClientError::Discovery(e.to_string()));
                return;
            }
        };
        match Transport::open(stream, &self.options.client_id, self.options.probe.clone()) {
            Ok((transport, events)) => {
                self.transport = Some(transport);
                self.transport_events = Some(events);
            }
            Err(e) => self.fail_connect(&ClientError::Encode(e.to_string())),
        }
    }

    /// Rejects the outstanding connect attempt and tears down any half-open
    /// channel without emitting `Disconnected`.
    fn fail_connect(&mut self, err: &ClientError) {
        self.connect_deadline = None;
        self.attempt += 1;
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        self.fail_pending(&ClientError::TransportClosed);
        self.transport_events = None;
        if let Some(transport) = self.transport.take() {
            tokio::spawn(async move {
                let _ = transport.close().await;
            });
        }
        self.status.send_replace(ConnStatus::Disconnected);
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn fail_pending(&mut self, err: &ClientError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(err.clone()));
        }
    }

    async fn send_request(&mut self, cmd: String, args: Value, evt: Option<String>, reply: Reply<Value>) {
        let Some(transport) = self.transport.clone() else {
            let _ = reply.send(Err(ClientError::NotConnected));
            return;
        };
        if self.current_status() != ConnStatus::Connected {
            let _ = reply.send(Err(ClientError::NotConnected));
            return;
        }

        let mut nonce = new_nonce();
        while self.pending.contains_key(&nonce) {
            nonce = new_nonce();
        }
        let msg = RpcMessage::request(&cmd, args, evt.as_deref(), nonce.clone());

        match transport.send_message(&msg).await {
            Ok(()) => {
                debug!(cmd = %cmd, nonce = %nonce, "request sent");
                self.pending.insert(nonce, reply);
            }
            Err(TransportError::Encode(e)) => {
                let _ = reply.send(Err(ClientError::Encode(e.to_string())));
            }
            Err(_) => {
                let _ = reply.send(Err(ClientError::TransportClosed));
            }
        }
    }

    fn handle_message(&mut self, msg: RpcMessage) {
        if msg.is_ready() {
            let ready: ReadyData = msg
                .data
                .and_then(|d| serde_json::from_value(d).ok())
                .unwrap_or_default();
            if ready.user.is_some() {
                self.user.send_replace(ready.user);
            }
            self.connect_deadline = None;
            self.status.send_replace(ConnStatus::Connected);
            for waiter in self.connect_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
            info!("peer ready");
            self.emit(ClientEvent::Connected);
            return;
        }

        if let Some(reply) = msg.nonce.as_ref().and_then(|n| self.pending.remove(n)) {
            if msg.is_error() {
                let body = msg.error_body();
                debug!(cmd = %msg.cmd, code = body.code, "request failed");
                let _ = reply.send(Err(ClientError::Protocol {
                    code: body.code,
                    message: body.message,
                }));
                return;
            }
            let data = msg.data.unwrap_or(Value::Null);
            if msg.cmd == command::AUTHENTICATE {
                if let Ok(auth) = serde_json::from_value::<AuthenticateData>(data.clone()) {
                    if auth.user.is_some() {
                        self.user.send_replace(auth.user);
                    }
                }
            }
            let _ = reply.send(Ok(data));
            return;
        }

        if msg.is_error() {
            let body = msg.error_body();
            warn!(code = body.code, message = %body.message, "unsolicited rpc error");
            self.emit(ClientEvent::ProtocolError {
                code: body.code,
                message: body.message,
            });
            return;
        }

        self.emit(ClientEvent::Unsolicited {
            event: msg.evt.unwrap_or_default(),
            data: msg.data.unwrap_or(Value::Null),
        });
    }

    fn handle_close(&mut self, reason: &CloseReason) {
        let was = self.current_status();
        match reason {
            CloseReason::Local => info!("ipc connection closed"),
            other => warn!(reason = ?other, "ipc connection lost"),
        }

        self.transport = None;
        self.transport_events = None;
        self.fail_pending(&ClientError::TransportClosed);
        if was == ConnStatus::Connecting {
            self.connect_deadline = None;
            self.attempt += 1;
            for waiter in self.connect_waiters.drain(..) {
                let _ = waiter.send(Err(ClientError::TransportClosed));
            }
        }
        self.status.send_replace(ConnStatus::Disconnected);
        self.emit(ClientEvent::Disconnected);

        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drp_common::frame::{Frame, FrameDecoder, Opcode};
    use std::collections::VecDeque;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[derive(Clone, Default)]
    struct Streams(Arc<Mutex<VecDeque<DuplexStream>>>);

    impl Connect for Streams {
        type Stream = DuplexStream;

        fn connect(&self) -> impl Future<Output = Result<DuplexStream, TransportError>> + Send {
            let next = self.0.lock().unwrap().pop_front();
            async move { next.ok_or(TransportError::Discovery { tried: 10 }) }
        }
    }

    struct Peer {
        io: DuplexStream,
        decoder: FrameDecoder,
    }

    impl Peer {
        async fn next(&mut self) -> Frame {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(frame) = self.decoder.next_frame().unwrap() {
                    return frame;
                }
                let n = self.io.read(&mut buf).await.unwrap();
                assert!(n > 0, "client hung up");
                self.decoder.push(&buf[..n]);
            }
        }

        async fn send(&mut self, body: Value) {
            self.io
                .write_all(&Frame::data(body).encode().unwrap())
                .await
                .unwrap();
        }
    }

    fn client_with_peer() -> (Client, Peer) {
        let (ours, theirs) = duplex(8192);
        let streams = Streams::default();
        streams.0.lock().unwrap().push_back(ours);
        let client = Client::new(streams, ClientOptions::new("594190466782724099"));
        (
            client,
            Peer {
                io: theirs,
                decoder: FrameDecoder::new(),
            },
        )
    }

    async fn ready(client: &Client, peer: &mut Peer) {
        let connect = client.connect();
        let hs = peer.next().await;
        assert_eq!(hs.opcode, Opcode::Handshake);
        peer.send(json!({"cmd": "DISPATCH", "evt": "READY", "data": {"v": 1}}))
            .await;
        connect.await.unwrap();
    }

    #[test]
    fn nonce_has_uuid_v4_shape() {
        let nonce = new_nonce();
        let parts: Vec<&str> = nonce.split('-').collect();
        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![8, 4, 4, 4, 12]);
        assert!(parts[2].starts_with('4'));
        assert!(matches!(parts[3].chars().next(), Some('8' | '9' | 'a' | 'b')));
        assert_ne!(new_nonce(), nonce);
    }

    #[tokio::test]
    async fn request_before_ready_is_rejected() {
        let (client, _peer) = client_with_peer();
        let err = client.request("SET_ACTIVITY", json!({}), None).await;
        assert_eq!(err, Err(ClientError::NotConnected));
    }

    #[tokio::test]
    async fn discovery_failure_rejects_connect() {
        let client = Client::new(Streams::default(), ClientOptions::new("1"));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Discovery(_)));
        assert_eq!(client.status(), ConnStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ready_times_out() {
        let (client, mut peer) = client_with_peer();
        let connect = client.connect();
        peer.next().await;

        assert_eq!(connect.await, Err(ClientError::ConnectionTimeout));
        assert_eq!(client.status(), ConnStatus::Disconnected);
        assert_eq!(peer.next().await.opcode, Opcode::Close);
    }

    #[tokio::test]
    async fn unmatched_frames_become_events() {
        let (client, mut peer) = client_with_peer();
        let mut events = client.events();
        ready(&client, &mut peer).await;
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Connected);

        peer.send(json!({"cmd": "DISPATCH", "evt": "ACTIVITY_JOIN", "data": {"secret": "s"}}))
            .await;
        peer.send(json!({"cmd": "SET_ACTIVITY", "evt": "ERROR", "nonce": "unknown", "data": {"code": 4000, "message": "bad"}}))
            .await;

        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::Unsolicited {
                event: "ACTIVITY_JOIN".into(),
                data: json!({"secret": "s"})
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::ProtocolError {
                code: 4000,
                message: "bad".into()
            }
        );
    }

    #[tokio::test]
    async fn error_response_rejects_only_its_request() {
        let (client, mut peer) = client_with_peer();
        ready(&client, &mut peer).await;

        let c = client.clone();
        let call = tokio::spawn(async move { c.request("SET_ACTIVITY", json!({"pid": 1}), None).await });
        let req = peer.next().await;
        let nonce = req.payload["nonce"].clone();
        peer.send(json!({"cmd": "SET_ACTIVITY", "evt": "ERROR", "nonce": nonce, "data": {"code": 4000, "message": "invalid"}}))
            .await;

        assert_eq!(
            call.await.unwrap(),
            Err(ClientError::Protocol {
                code: 4000,
                message: "invalid".into()
            })
        );
        assert_eq!(client.status(), ConnStatus::Connected);
    }

    #[tokio::test]
    async fn ready_user_is_captured() {
        let (client, mut peer) = client_with_peer();
        let connect = client.connect();
        peer.next().await;
        peer.send(json!({"cmd": "DISPATCH", "evt": "READY", "data": {"user": {"id": "1", "username": "alice"}}}))
            .await;
        connect.await.unwrap();

        assert_eq!(client.user().map(|u| u.username), Some("alice".to_string()));
        let user = client.login(LoginOptions::default()).await.unwrap();
        assert_eq!(user.map(|u| u.id), Some("1".to_string()));
    }

    #[tokio::test]
    async fn scoped_login_without_token_needs_code_exchange() {
        let (client, mut peer) = client_with_peer();
        ready(&client, &mut peer).await;

        let c = client.clone();
        let login = tokio::spawn(async move {
            c.login(LoginOptions {
                scopes: vec!["rpc".into()],
                ..LoginOptions::default()
            })
            .await
        });
        let req = peer.next().await;
        assert_eq!(req.payload["cmd"], "AUTHORIZE");
        assert_eq!(req.payload["args"]["client_id"], "594190466782724099");
        assert_eq!(req.payload["args"]["scopes"], json!(["rpc"]));
        let nonce = req.payload["nonce"].clone();
        peer.send(json!({"cmd": "AUTHORIZE", "nonce": nonce, "data": {"code": "abc"}}))
            .await;

        assert_eq!(
            login.await.unwrap(),
            Err(ClientError::CodeExchangeRequired("abc".into()))
        );
    }

    #[tokio::test]
    async fn authenticate_updates_user() {
        let (client, mut peer) = client_with_peer();
        ready(&client, &mut peer).await;

        let c = client.clone();
        let auth = tokio::spawn(async move { c.authenticate("tok").await });
        let req = peer.next().await;
        assert_eq!(req.payload["args"]["access_token"], "tok");
        let nonce = req.payload["nonce"].clone();
        peer.send(json!({"cmd": "AUTHENTICATE", "nonce": nonce, "data": {"user": {"id": "2", "username": "bob"}, "scopes": ["rpc"]}}))
            .await;

        let data = auth.await.unwrap().unwrap();
        assert_eq!(data.scopes, vec!["rpc".to_string()]);
        assert_eq!(client.user().map(|u| u.username), Some("bob".to_string()));
    }

    #[tokio::test]
    async fn join_commands_normalize_refs() {
        let (client, mut peer) = client_with_peer();
        ready(&client, &mut peer).await;

        let c = client.clone();
        let call = tokio::spawn(async move {
            let user = User {
                id: "77".into(),
                username: "carol".into(),
                ..User::default()
            };
            c.send_join_invite(&user).await
        });
        let req = peer.next().await;
        assert_eq!(req.payload["cmd"], "SEND_ACTIVITY_JOIN_INVITE");
        assert_eq!(req.payload["args"], json!({"user_id": "77"}));
        let nonce = req.payload["nonce"].clone();
        peer.send(json!({"cmd": "SEND_ACTIVITY_JOIN_INVITE", "nonce": nonce}))
            .await;
        assert_eq!(call.await.unwrap(), Ok(Value::Null));
    }

    #[tokio::test]
    async fn subscription_round_trips_event_name() {
        let (client, mut peer) = client_with_peer();
        ready(&client, &mut peer).await;

        let c = client.clone();
        let sub = tokio::spawn(async move { c.subscribe("ACTIVITY_JOIN", json!({})).await });
        let req = peer.next().await;
        assert_eq!(req.payload["cmd"], "SUBSCRIBE");
        assert_eq!(req.payload["evt"], "ACTIVITY_JOIN");
        let nonce = req.payload["nonce"].clone();
        peer.send(json!({"cmd": "SUBSCRIBE", "evt": "ACTIVITY_JOIN", "nonce": nonce}))
            .await;
        let sub = sub.await.unwrap().unwrap();
        assert_eq!(sub.event(), "ACTIVITY_JOIN");

        let unsub = tokio::spawn(sub.unsubscribe());
        let req = peer.next().await;
        assert_eq!(req.payload["cmd"], "UNSUBSCRIBE");
        let nonce = req.payload["nonce"].clone();
        peer.send(json!({"cmd": "UNSUBSCRIBE", "evt": "ACTIVITY_JOIN", "nonce": nonce}))
            .await;
        assert!(unsub.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn destroy_waits_for_close_event() {
        let (client, mut peer) = client_with_peer();
        let mut events = client.events();
        ready(&client, &mut peer).await;
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Connected);

        client.destroy().await.unwrap();

        assert_eq!(client.status(), ConnStatus::Disconnected);
        assert_eq!(events.try_recv().unwrap(), ClientEvent::Disconnected);
        assert_eq!(peer.next().await.opcode, Opcode::Close);
    }
}
