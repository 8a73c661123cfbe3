use crate::activity::HostEvent;
use crate::client::{ClientEvent, ConnStatus};
use crate::config::PresenceSettings;
use crate::reconnect::UNBOUNDED;
use crate::service::PresenceService;
use drp_common::{Presence, RemoteStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Maximum command line length (1 MB). Prevents unbounded memory allocation
/// from a misbehaving local process sending an enormous line.
const MAX_CMD_LEN: usize = 1_048_576;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum ApiCommand {
    Status,
    User,
    Login {
        retries: Option<i32>,
    },
    SetActivity {
        activity: Presence,
    },
    ClearActivity,
    Settings {
        enabled: Option<bool>,
        show_mods: Option<bool>,
        show_collections: Option<bool>,
        hide_on_game_launch: Option<bool>,
    },
    HostEvent {
        event: HostEvent,
    },
    Subscribe,
}

#[derive(Debug, Clone, Serialize)]
struct StatusResponse {
    status: &'static str,
    #[serde(flatten)]
    service: crate::service::ServiceSnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct LoginResponse {
    status: &'static str,
    connected: bool,
}

/// Serves the control API on `listen` (`unix://path` or `tcp://addr:port`).
///
/// # Errors
///
/// Returns an error if binding the local API listener fails.
pub async fn start_local_api(listen: &str, service: PresenceService) -> anyhow::Result<()> {
    if let Some(path) = listen.strip_prefix("unix://") {
        serve_unix(path, service).await
    } else if let Some(addr) = listen.strip_prefix("tcp://") {
        let listener = TcpListener::bind(addr).await?;
        info!("Local API listening on TCP: {}", addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let (reader, writer) = stream.into_split();
            spawn_client(reader, writer, service.clone());
        }
    } else {
        anyhow::bail!(
            "Invalid listen address format: {listen}. Use unix://path or tcp://addr:port"
        );
    }
}

#[cfg(unix)]
async fn serve_unix(path: &str, service: PresenceService) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    // A stale socket from a previous run blocks bind.
    let _ = std::fs::remove_file(path);
    let listener = tokio::net::UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    info!("Local API listening on unix socket: {}", path);

    loop {
        let (stream, _) = listener.accept().await?;
        let (reader, writer) = stream.into_split();
        spawn_client(reader, writer, service.clone());
    }
}

#[cfg(not(unix))]
async fn serve_unix(path: &str, _service: PresenceService) -> anyhow::Result<()> {
    anyhow::bail!("unix sockets are not supported on this platform: {path}")
}

fn spawn_client<R, W>(reader: R, writer: W, service: PresenceService)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = handle_local_client(reader, writer, &service).await {
            debug!("Client handler error: {}", e);
        }
    });
}

fn line<T: Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string(value)? + "\n")
}

fn error_line(message: impl std::fmt::Display) -> anyhow::Result<String> {
    line(&json!({ "error": message.to_string() }))
}

async fn handle_local_client<R, W>(
    reader: R,
    mut writer: W,
    service: &PresenceService,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line_buf = String::new();
    loop {
        line_buf.clear();
        let mut limited = (&mut reader).take(MAX_CMD_LEN as u64 + 1);
        match tokio::io::AsyncBufReadExt::read_line(&mut limited, &mut line_buf).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        if line_buf.len() > MAX_CMD_LEN {
            let error = error_line(format!(
                "command exceeds maximum length ({MAX_CMD_LEN} bytes)"
            ))?;
            writer.write_all(error.as_bytes()).await?;
            continue;
        }

        let cmd: ApiCommand = match serde_json::from_str(&line_buf) {
            Ok(cmd) => cmd,
            Err(e) => {
                writer.write_all(error_line(e)?.as_bytes()).await?;
                continue;
            }
        };

        let response = match cmd {
            ApiCommand::Subscribe => {
                handle_subscribe(service.client().events(), &mut writer).await?;
                return Ok(());
            }
            cmd => match handle_command(cmd, service).await {
                Ok(json) => json,
                Err(e) => error_line(e)?,
            },
        };

        writer.write_all(response.as_bytes()).await?;
    }

    Ok(())
}

async fn handle_command(cmd: ApiCommand, service: &PresenceService) -> anyhow::Result<String> {
    match cmd {
        ApiCommand::Status => {
            let status = match service.client().status() {
                ConnStatus::Disconnected => "disconnected",
                ConnStatus::Connecting => "connecting",
                ConnStatus::Connected => "connected",
            };
            line(&StatusResponse {
                status,
                service: service.snapshot(),
            })
        }
        ApiCommand::User => line(&json!({ "user": service.client().user() })),
        ApiCommand::Login { retries } => {
            let ok = service.login(retries.unwrap_or(UNBOUNDED)).await?;
            line(&LoginResponse {
                status: if ok { "ok" } else { "failed" },
                connected: service.client().status() == ConnStatus::Connected,
            })
        }
        ApiCommand::SetActivity { activity } => {
            service
                .set_activity(RemoteStatus::Shown(activity))
                .await?;
            line(&json!({ "status": "queued" }))
        }
        ApiCommand::ClearActivity => {
            service.clear_activity().await?;
            line(&json!({ "status": "queued" }))
        }
        ApiCommand::Settings {
            enabled,
            show_mods,
            show_collections,
            hide_on_game_launch,
        } => {
            let current = service.snapshot().settings;
            let settings = PresenceSettings {
                enabled: enabled.unwrap_or(current.enabled),
                show_mods: show_mods.unwrap_or(current.show_mods),
                show_collections: show_collections.unwrap_or(current.show_collections),
                hide_on_game_launch: hide_on_game_launch.unwrap_or(current.hide_on_game_launch),
            };
            if settings != current {
                service.update_settings(settings).await?;
            }
            line(&json!({ "settings": settings }))
        }
        ApiCommand::HostEvent { event } => {
            service.host_event(event).await?;
            line(&json!({ "status": "accepted" }))
        }
        ApiCommand::Subscribe => error_line("subscribe must be the last command on a connection"),
    }
}

fn event_json(event: &ClientEvent) -> Value {
    match event {
        ClientEvent::Connected => json!({ "event": "connected" }),
        ClientEvent::Disconnected => json!({ "event": "disconnected" }),
        ClientEvent::Ready(user) => json!({ "event": "ready", "user": user }),
        ClientEvent::Unsolicited { event, data } => {
            json!({ "event": "dispatch", "evt": event, "data": data })
        }
        ClientEvent::ProtocolError { code, message } => {
            json!({ "event": "protocol_error", "code": code, "message": message })
        }
        ClientEvent::Error(message) => json!({ "event": "error", "message": message }),
    }
}

async fn handle_subscribe<W>(
    mut events: broadcast::Receiver<ClientEvent>,
    writer: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match events.recv().await {
            Ok(event) => {
                let json = line(&event_json(&event))?;
                if writer.write_all(json.as_bytes()).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "subscribe stream lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}
