//! Presence service: owns the retry controller, the throttle and the
//! applied status, and drives the [`Client`] from host requests.
//!
//! Everything here is mutated from a single actor task. Login attempts and
//! `SET_ACTIVITY` calls run as spawned tasks that report back over an
//! internal channel, so the actor never blocks on the peer.

use crate::activity::{ActivityState, HostEvent};
use crate::client::{Client, ClientError, ClientEvent, ConnStatus, LoginOptions};
use crate::config::{ClientConfig, PresenceSettings, RetryConfig};
use crate::reconnect::{ReconnectController, ReconnectState};
use crate::throttle::{PresenceThrottle, ThrottleDecision};
use drp_common::{Presence, RemoteStatus, User};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Parameters of a [`PresenceService`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Backoff and default retry budget.
    pub retry: RetryConfig,
    /// Throttle window length.
    pub throttle_window: Duration,
    /// Initial presence toggles.
    pub settings: PresenceSettings,
    /// Game id → large image key.
    pub art: HashMap<String, String>,
    /// Process id reported with `SET_ACTIVITY`.
    pub pid: u32,
}

impl ServiceOptions {
    /// Options taken from the loaded configuration, reporting this process.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            throttle_window: config.throttle_window(),
            settings: config.presence,
            art: config.art.clone(),
            pid: std::process::id(),
        }
    }
}

/// Point-in-time view of the service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSnapshot {
    /// Login state machine.
    pub connection: ReconnectState,
    /// Whether the client is ready for commands.
    pub connected: bool,
    /// Status last sent to the peer.
    pub applied: Option<Presence>,
    /// Whether a status is waiting for the throttle window.
    pub pending: bool,
    /// Current toggles.
    pub settings: PresenceSettings,
    /// Logged-in user.
    pub user: Option<User>,
    /// Milliseconds until the armed retry fires.
    pub retry_in_ms: Option<u64>,
}

enum ServiceCommand {
    Login {
        retry_limit: i32,
        reply: oneshot::Sender<bool>,
    },
    SetStatus(RemoteStatus),
    UpdateSettings(PresenceSettings),
    Host(HostEvent),
    Dispose(oneshot::Sender<()>),
}

enum Internal {
    LoginFinished(Result<Option<User>, ClientError>),
    Applied {
        status: RemoteStatus,
        result: Result<(), ClientError>,
    },
}

/// Handle to the presence service actor.
#[derive(Debug, Clone)]
pub struct PresenceService {
    commands: mpsc::Sender<ServiceCommand>,
    snapshot: watch::Receiver<ServiceSnapshot>,
    client: Client,
}

impl PresenceService {
    /// Spawns the actor driving `client`.
    #[must_use]
    pub fn spawn(client: Client, options: ServiceOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::channel(64);

        let actor = Service {
            client: client.clone(),
            controller: ReconnectController::new(options.retry.backoff()),
            throttle: PresenceThrottle::new(options.throttle_window),
            applied: RemoteStatus::Empty,
            settings: options.settings,
            activity: ActivityState::new(),
            art: options.art,
            pid: options.pid,
            default_budget: options.retry.attempts,
            login_in_flight: false,
            login_waiters: Vec::new(),
            deferred: None,
            disposed: false,
            internal: internal_tx,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(actor.snapshot());
        tokio::spawn(actor.run(cmd_rx, internal_rx, snapshot_tx));

        Self {
            commands: cmd_tx,
            snapshot: snapshot_rx,
            client,
        }
    }

    async fn send(&self, cmd: ServiceCommand) -> Result<(), ClientError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| ClientError::ClientGone)
    }

    /// Logs in with a retry budget (`-1` retries forever). Resolves with
    /// whether this attempt succeeded; retries continue in the background.
    ///
    /// # Errors
    ///
    /// [`ClientError::ClientGone`] if the service has stopped.
    pub async fn login(&self, retry_limit: i32) -> Result<bool, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServiceCommand::Login { retry_limit, reply })
            .await?;
        rx.await.map_err(|_| ClientError::ClientGone)
    }

    /// Requests a status update through the throttle.
    ///
    /// # Errors
    ///
    /// [`ClientError::ClientGone`] if the service has stopped.
    pub async fn set_activity(&self, status: RemoteStatus) -> Result<(), ClientError> {
        self.send(ServiceCommand::SetStatus(status)).await
    }

    /// Requests the empty status through the throttle.
    ///
    /// # Errors
    ///
    /// [`ClientError::ClientGone`] if the service has stopped.
    pub async fn clear_activity(&self) -> Result<(), ClientError> {
        self.set_activity(RemoteStatus::Empty).await
    }

    /// Replaces the presence toggles.
    ///
    /// # Errors
    ///
    /// [`ClientError::ClientGone`] if the service has stopped.
    pub async fn update_settings(&self, settings: PresenceSettings) -> Result<(), ClientError> {
        self.send(ServiceCommand::UpdateSettings(settings)).await
    }

    /// Feeds a host notification to the activity composer.
    ///
    /// # Errors
    ///
    /// [`ClientError::ClientGone`] if the service has stopped.
    pub async fn host_event(&self, event: HostEvent) -> Result<(), ClientError> {
        self.send(ServiceCommand::Host(event)).await
    }

    /// Cancels timers, drops any queued status and closes the client.
    ///
    /// # Errors
    ///
    /// [`ClientError::ClientGone`] if the service has stopped.
    pub async fn dispose(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServiceCommand::Dispose(reply)).await?;
        rx.await.map_err(|_| ClientError::ClientGone)
    }

    /// Latest snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ServiceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch channel tracking [`PresenceService::snapshot`].
    #[must_use]
    pub fn snapshot_watch(&self) -> watch::Receiver<ServiceSnapshot> {
        self.snapshot.clone()
    }

    /// The underlying RPC client.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_client_event(rx: &mut Option<broadcast::Receiver<ClientEvent>>) -> Option<ClientEvent> {
    let Some(inner) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match inner.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(n)) => debug!(skipped = n, "client events lagged"),
            Err(RecvError::Closed) => {
                *rx = None;
                return None;
            }
        }
    }
}

struct Service {
    client: Client,
    controller: ReconnectController,
    throttle: PresenceThrottle,
    applied: RemoteStatus,
    settings: PresenceSettings,
    activity: ActivityState,
    art: HashMap<String, String>,
    pid: u32,
    default_budget: i32,
    login_in_flight: bool,
    login_waiters: Vec<oneshot::Sender<bool>>,
    /// Dispatched while not connected; sent once the on-demand login lands.
    deferred: Option<RemoteStatus>,
    /// Set by [`Service::dispose`]; no login is started afterwards.
    disposed: bool,
    internal: mpsc::Sender<Internal>,
}

impl Service {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ServiceCommand>,
        mut internal: mpsc::Receiver<Internal>,
        snapshot: watch::Sender<ServiceSnapshot>,
    ) {
        let mut client_events = Some(self.client.events());

        loop {
            let retry_at = self.controller.retry_deadline();
            let window_closes = self.throttle.deadline();

            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd).await;
                }
                Some(msg) = internal.recv() => self.handle_internal(msg),
                Some(event) = next_client_event(&mut client_events) => self.handle_client_event(event),
                () = sleep_until(retry_at) => {
                    if !self.may_retry() {
                        self.controller.cancel();
                    } else if let Some(budget) = self.controller.take_due_retry() {
                        info!(attempts_remaining = budget, "retrying login");
                        self.login(budget, None);
                    }
                }
                () = sleep_until(window_closes) => {
                    if let Some(next) = self.throttle.on_window_closed() {
                        debug!("throttle window closed, sending queued status");
                        self.set_status(next);
                    }
                }
            }

            snapshot.send_replace(self.snapshot());
        }

        self.dispose().await;
        debug!("presence service stopped");
    }

    fn snapshot(&self) -> ServiceSnapshot {
        let now = Instant::now();
        ServiceSnapshot {
            connection: self.controller.state(),
            connected: self.client.status() == ConnStatus::Connected,
            applied: self.applied.presence().cloned(),
            pending: self.throttle.has_pending() || self.deferred.is_some(),
            settings: self.settings,
            user: self.client.user(),
            retry_in_ms: self.controller.retry_deadline().map(|at| {
                u64::try_from(at.saturating_duration_since(now).as_millis()).unwrap_or(u64::MAX)
            }),
        }
    }

    async fn handle_command(&mut self, cmd: ServiceCommand) {
        match cmd {
            ServiceCommand::Login { retry_limit, reply } => self.login(retry_limit, Some(reply)),
            ServiceCommand::SetStatus(status) => self.set_status(status),
            ServiceCommand::UpdateSettings(settings) => self.update_settings(settings),
            ServiceCommand::Host(event) => {
                let status = self
                    .activity
                    .apply(event, &self.settings, &self.art, &self.applied);
                if let Some(status) = status {
                    self.set_status(status);
                }
            }
            ServiceCommand::Dispose(reply) => {
                self.dispose().await;
                let _ = reply.send(());
            }
        }
    }

    /// Background retries stop once the service is disposed or disabled.
    const fn may_retry(&self) -> bool {
        !self.disposed && self.settings.enabled
    }

    fn login(&mut self, budget: i32, reply: Option<oneshot::Sender<bool>>) {
        if self.disposed {
            debug!("service disposed, refusing login");
            if let Some(reply) = reply {
                let _ = reply.send(false);
            }
            return;
        }
        if !self.login_in_flight && self.client.status() == ConnStatus::Connected {
            if let Some(reply) = reply {
                let _ = reply.send(true);
            }
            return;
        }

        self.controller.begin_attempt(budget);
        if let Some(reply) = reply {
            self.login_waiters.push(reply);
        }
        if self.login_in_flight {
            return;
        }
        self.login_in_flight = true;

        let client = self.client.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = client.login(LoginOptions::default()).await;
            let _ = internal.send(Internal::LoginFinished(result)).await;
        });
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::LoginFinished(result) => {
                self.login_in_flight = false;
                let ok = result.is_ok();
                for waiter in self.login_waiters.drain(..) {
                    let _ = waiter.send(ok);
                }

                match result {
                    Ok(_) if self.disposed => {
                        debug!("login finished after dispose, closing");
                        let client = self.client.clone();
                        tokio::spawn(async move {
                            let _ = client.destroy().await;
                        });
                    }
                    Ok(user) => {
                        self.controller.on_success();
                        match &user {
                            Some(u) => info!(user = %u.username, id = %u.id, "logged in"),
                            None => info!("logged in"),
                        }
                        if let Some(status) = self.deferred.take() {
                            self.send_now(status);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "login failed");
                        if self.deferred.take().is_some() {
                            warn!("status not applied: login failed");
                        }
                        if !self.may_retry() {
                            debug!("presence stopped, not retrying");
                            self.controller.cancel();
                        } else if let Some(delay) = self.controller.on_failure(Instant::now()) {
                            info!(
                                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                attempts_remaining = self.controller.attempts_remaining(),
                                "login retry scheduled"
                            );
                        }
                    }
                }
            }
            Internal::Applied { status, result } => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to set activity");
                    if self.applied == status {
                        self.applied = RemoteStatus::Empty;
                    }
                }
            }
        }
    }

    fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected => debug!("client connected"),
            ClientEvent::Disconnected => {
                debug!("client disconnected");
                self.controller.on_disconnect();
                // A new channel starts out showing nothing.
                self.applied = RemoteStatus::Empty;
            }
            ClientEvent::Ready(_) => debug!("client ready"),
            ClientEvent::Unsolicited { event, .. } => debug!(event = %event, "peer event"),
            ClientEvent::ProtocolError { code, message } => {
                warn!(code, message = %message, "peer reported an error");
            }
            ClientEvent::Error(message) => warn!(error = %message, "client error"),
        }
    }

    fn set_status(&mut self, status: RemoteStatus) {
        if !self.settings.enabled {
            debug!("presence disabled, ignoring status update");
            return;
        }
        match self.throttle.request(status, &self.applied, Instant::now()) {
            ThrottleDecision::Skip => {
                debug!("status unchanged, skipping");
                self.deferred = None;
            }
            ThrottleDecision::Queued => debug!("status queued behind throttle window"),
            ThrottleDecision::Dispatch(status) => self.dispatch(status),
        }
    }

    fn dispatch(&mut self, status: RemoteStatus) {
        if self.client.status() == ConnStatus::Connected {
            self.send_now(status);
            return;
        }
        self.deferred = Some(status);
        self.login(self.default_budget, None);
    }

    fn send_now(&mut self, status: RemoteStatus) {
        self.applied = status.clone();
        let client = self.client.clone();
        let internal = self.internal.clone();
        let pid = self.pid;
        tokio::spawn(async move {
            let result = client.set_activity(&status, pid).await.map(|_| ());
            let _ = internal.send(Internal::Applied { status, result }).await;
        });
    }

    fn update_settings(&mut self, settings: PresenceSettings) {
        let old = std::mem::replace(&mut self.settings, settings);
        debug!(?old, new = ?settings, "presence settings updated");

        if settings.enabled != old.enabled {
            if settings.enabled {
                self.login(self.default_budget, None);
                self.refresh();
            } else {
                self.disable();
            }
            return;
        }
        if settings.show_mods != old.show_mods {
            self.refresh();
        }
        if old.show_collections && !settings.show_collections {
            let showing_collection = self
                .applied
                .presence()
                .and_then(|p| p.details.as_deref())
                .is_some_and(|d| d.contains("collection"));
            if showing_collection {
                self.refresh();
            }
        }
    }

    fn refresh(&mut self) {
        let status = self.activity.refresh(&self.settings, &self.art);
        self.set_status(status);
    }

    /// Clears the shown status, then tears down like [`Service::dispose`].
    fn disable(&mut self) {
        self.reset();
        let client = self.client.clone();
        let pid = self.pid;
        tokio::spawn(async move {
            if client.status() == ConnStatus::Connected {
                if let Err(e) = client.clear_activity(pid).await {
                    warn!(error = %e, "could not clear activity");
                }
            }
            let _ = client.destroy().await;
        });
    }

    fn reset(&mut self) {
        self.controller.cancel();
        self.throttle.reset();
        self.deferred = None;
        self.applied = RemoteStatus::Empty;
        for waiter in self.login_waiters.drain(..) {
            let _ = waiter.send(false);
        }
    }

    async fn dispose(&mut self) {
        self.disposed = true;
        self.reset();
        if let Err(e) = self.client.destroy().await {
            debug!(error = %e, "client already gone");
        }
    }
}
