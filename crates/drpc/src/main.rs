#![forbid(unsafe_code)]

use drpc::activity::HostEvent;
use drpc::client::{Client, ClientOptions};
use drpc::config::{load_config, Cli, Commands};
use drpc::endpoint::EndpointProbe;
use drpc::local_api;
use drpc::service::{PresenceService, ServiceOptions};

use clap::Parser;
use drp_common::Presence;
use std::io::IsTerminal;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}

// ── Daemon ──────────────────────────────────────────────────────────

async fn run_daemon(cli: &Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref())?;

    if let Some(ref listen) = cli.listen {
        config.listen = listen.clone();
    }
    if let Some(ref client_id) = cli.client_id {
        config.client_id = client_id.clone();
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    if std::io::stderr().is_terminal() {
        let v = env!("CARGO_PKG_VERSION");
        eprintln!();
        eprintln!("  {BOLD}◈ Presence Client{RESET} {DIM}v{v}{RESET}");
        eprintln!("  {DIM}Client id{RESET}  {CYAN}{}{RESET}", config.client_id);
        eprintln!("  {DIM}Listen{RESET}     {}", config.listen);
        eprintln!();
    }

    info!(client_id = %config.client_id, "starting drpc daemon");

    let probe = match EndpointProbe::new(&config.endpoint) {
        Ok(probe) => Some(probe),
        Err(e) => {
            warn!(error = %e, "HTTP endpoint probe unavailable");
            None
        }
    };
    let client = Client::ipc(ClientOptions {
        client_id: config.client_id.clone(),
        connect_timeout: config.connect_timeout(),
        probe,
    });
    let service = PresenceService::spawn(client, ServiceOptions::from_config(&config));

    if config.presence.enabled {
        // Shows the idle status, which logs in on demand.
        service
            .host_event(HostEvent::GameActive {
                game: None,
                profile: None,
            })
            .await?;
    }

    let api_handle = tokio::spawn({
        let listen = config.listen.clone();
        let service = service.clone();
        async move {
            if let Err(e) = local_api::start_local_api(&listen, service).await {
                error!("Local API error: {}", e);
            }
        }
    });

    tokio::select! {
        _ = api_handle => {
            info!("Local API server exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    if let Err(e) = service.dispose().await {
        warn!(error = %e, "shutdown incomplete");
    }

    Ok(())
}

// ── Daemon IPC ──────────────────────────────────────────────────────

async fn exchange<S>(stream: S, cmd: &str) -> anyhow::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = tokio::io::BufReader::new(reader);

    writer.write_all(cmd.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;

    Ok(line)
}

async fn daemon_cmd(listen: &str, cmd: &serde_json::Value) -> anyhow::Result<String> {
    let cmd = serde_json::to_string(cmd)?;
    let result = match listen.strip_prefix("unix://") {
        #[cfg(unix)]
        Some(path) => match tokio::net::UnixStream::connect(path).await {
            Ok(stream) => Ok(exchange(stream, &cmd).await?),
            Err(e) => Err(e),
        },
        #[cfg(not(unix))]
        Some(_) => anyhow::bail!("unix sockets are not supported on this platform"),
        None => {
            let addr = listen.strip_prefix("tcp://").unwrap_or(listen);
            match TcpStream::connect(addr).await {
                Ok(stream) => Ok(exchange(stream, &cmd).await?),
                Err(e) => Err(e),
            }
        }
    };

    match result {
        Ok(line) => Ok(line),
        Err(e) => {
            if tty() {
                eprintln!();
                eprintln!("  {RED}✗{RESET} Could not connect to daemon");
                eprintln!("    {DIM}{e}{RESET}");
                eprintln!();
                eprintln!("    Is drpc running? Try: {BOLD}drpc start{RESET}");
                eprintln!();
            } else {
                eprintln!("Failed to connect to daemon: {e}");
            }
            std::process::exit(1);
        }
    }
}

// ── Pretty formatters ───────────────────────────────────────────────

fn fmt_status(json: &serde_json::Value) {
    let status = json["status"].as_str().unwrap_or("unknown");

    let (dot, label) = match status {
        "connected" => (format!("{GREEN}●{RESET}"), "connected"),
        "connecting" => (format!("{YELLOW}●{RESET}"), "connecting"),
        _ => (format!("{RED}●{RESET}"), "disconnected"),
    };

    let v = env!("CARGO_PKG_VERSION");

    println!();
    println!("  {BOLD}◈ Presence Client{RESET} {DIM}v{v}{RESET}");
    println!();
    println!("  {DIM}Status{RESET}     {dot} {label}");

    if let Some(name) = json["user"]["username"].as_str() {
        println!("  {DIM}User{RESET}       {CYAN}{name}{RESET}");
    }
    if let Some(details) = json["applied"]["details"].as_str() {
        let state = json["applied"]["state"].as_str().unwrap_or("");
        println!("  {DIM}Showing{RESET}    {details} {DIM}{state}{RESET}");
    }
    if let Some(ms) = json["retry_in_ms"].as_u64() {
        println!("  {DIM}Retry in{RESET}   {}s", ms.div_ceil(1000));
    }
    if json["settings"]["enabled"] == false {
        println!("  {DIM}Presence{RESET}   {YELLOW}disabled{RESET}");
    }

    println!();
}

fn fmt_user(json: &serde_json::Value) {
    match json["user"]["username"].as_str() {
        Some(name) => {
            let id = json["user"]["id"].as_str().unwrap_or("?");
            println!("  {GREEN}●{RESET} {BOLD}{name}{RESET} {DIM}({id}){RESET}");
        }
        None => println!("  {DIM}Not logged in{RESET}"),
    }
}

fn fmt_result(json: &serde_json::Value, ok_label: &str) {
    if let Some(msg) = json["error"].as_str() {
        println!("  {RED}✗{RESET} {msg}");
        return;
    }
    match json["status"].as_str() {
        Some("failed") => println!("  {RED}✗{RESET} Login failed, retrying in the background"),
        _ => println!("  {GREEN}✓{RESET} {ok_label}"),
    }
}

fn print_response(resp: &str, pretty: impl FnOnce(&serde_json::Value)) -> anyhow::Result<()> {
    if tty() {
        let json: serde_json::Value = serde_json::from_str(resp.trim())?;
        pretty(&json);
    } else {
        print!("{resp}");
    }
    Ok(())
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli)?;

    let listen = match cli.listen.clone() {
        Some(listen) => listen,
        None => load_config(cli.config.as_deref())
            .map(|c| c.listen)
            .unwrap_or_else(|_| "tcp://127.0.0.1:7710".to_string()),
    };

    match &cli.command {
        Commands::Start => run_daemon(&cli).await?,

        Commands::Status => {
            let resp = daemon_cmd(&listen, &serde_json::json!({"cmd": "status"})).await?;
            print_response(&resp, fmt_status)?;
        }

        Commands::User => {
            let resp = daemon_cmd(&listen, &serde_json::json!({"cmd": "user"})).await?;
            print_response(&resp, fmt_user)?;
        }

        Commands::Login { retries } => {
            let cmd = serde_json::json!({"cmd": "login", "retries": retries});
            let resp = daemon_cmd(&listen, &cmd).await?;
            print_response(&resp, |json| fmt_result(json, "Logged in"))?;
        }

        Commands::Set {
            details,
            state,
            large_image,
            large_text,
            small_image,
            small_text,
            start_now,
        } => {
            let activity = Presence {
                details: details.clone(),
                state: state.clone(),
                large_image_key: large_image.clone(),
                large_image_text: large_text.clone(),
                small_image_key: small_image.clone(),
                small_image_text: small_text.clone(),
                start_timestamp: start_now.then(|| chrono::Utc::now().timestamp_millis()),
                ..Presence::default()
            };
            let cmd = serde_json::json!({"cmd": "set_activity", "activity": activity});
            let resp = daemon_cmd(&listen, &cmd).await?;
            print_response(&resp, |json| fmt_result(json, "Activity queued"))?;
        }

        Commands::Clear => {
            let resp = daemon_cmd(&listen, &serde_json::json!({"cmd": "clear_activity"})).await?;
            print_response(&resp, |json| fmt_result(json, "Activity cleared"))?;
        }
    }
    Ok(())
}
