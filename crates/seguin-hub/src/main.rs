mod client_sink;
mod loom_link;
mod loom_server;
mod mock_loom;
mod serial_device;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use client_sink::{CloseCode, Outbound};
use futures_util::{SinkExt, StreamExt};
use loom_link::LoomTarget;
use loom_server::{LoomServer, LoomServerConfig, LoomServerHandle};
use seguin_core::loom_protocol::BAUD_RATE;
use std::{
    fs::{File, OpenOptions},
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::Mutex,
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_ADDR: &str = "0.0.0.0:8000";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    target: LoomTarget,
    debug: bool,
    write_timeout: Duration,
    queue_capacity: usize,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "seguin-hub", about = "Drive a Seguin dobby loom from a web client")]
struct Args {
    /// Serial device of the loom, or "mock" for the built-in emulator.
    serial_port: String,
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    verbose: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
}

#[derive(Clone)]
struct AppState {
    server: LoomServerHandle,
    config: Config,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    if let LoomTarget::Serial(path) = &config.target {
        info!(event = "serial_target", path = %path.display(), baud_rate = BAUD_RATE);
    }
    let (server, server_task) = LoomServer::spawn(LoomServerConfig {
        target: config.target.clone(),
        write_timeout: config.write_timeout,
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(AppState {
            server: server.clone(),
            config: config.clone(),
        });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            server.close().await;
            return;
        }
    };

    info!(event = "hub_start", addr = %config.addr, loom = %config.target);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
    server.close().await;
    let _ = server_task.await;
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state).await;
    })
}

/// Bridge one websocket to the session: a writer task drains the session's
/// outbound queue while this task forwards text frames inbound.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.config.queue_capacity);
    let write_timeout = state.config.write_timeout;

    let write_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let (message, closing) = match outbound {
                Outbound::Text(text) => (Message::Text(text), false),
                Outbound::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code: code.code(),
                        reason: reason.into(),
                    })),
                    true,
                ),
            };
            match tokio::time::timeout(write_timeout, ws_sender.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(event = "ws_write_error", error = %err);
                    break;
                }
                Err(_) => {
                    warn!(event = "ws_write_timeout");
                    break;
                }
            }
            if closing {
                break;
            }
        }
    });

    // Kept to close the socket with an error if the session goes away.
    let fault_tx = tx.clone();
    let attachment = match state.server.attach(tx).await {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "client_attach_failed", error = %err);
            close_with_error(fault_tx).await;
            let _ = write_task.await;
            return;
        }
    };
    let conn_id = attachment.conn_id;
    let mut done = attachment.done;

    let mut session_lost = false;
    loop {
        let msg = tokio::select! {
            _ = &mut done => break,
            msg = ws_receiver.next() => msg,
        };
        let msg = match msg {
            Some(Ok(value)) => value,
            Some(Err(err)) => {
                warn!(event = "read_error", conn_id = conn_id, error = %err);
                break;
            }
            None => break,
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(event = "message_not_utf8", conn_id = conn_id);
                    continue;
                }
            },
            Message::Close(_) => {
                info!(event = "client_close", conn_id = conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if let Err(err) = state.server.client_message(conn_id, text).await {
            error!(event = "session_lost", conn_id = conn_id, error = %err);
            session_lost = true;
            break;
        }
    }

    if session_lost {
        close_with_error(fault_tx).await;
    } else {
        drop(fault_tx);
        state.server.client_gone(conn_id).await;
    }
    let _ = write_task.await;
}

async fn close_with_error(sender: mpsc::Sender<Outbound>) {
    let frame = Outbound::Close {
        code: CloseCode::Error,
        reason: "loom session stopped".to_string(),
    };
    if tokio::time::timeout(client_sink::CLIENT_CLOSE_TIMEOUT, sender.send(frame))
        .await
        .is_err()
    {
        warn!(event = "client_close_timeout");
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        target: LoomTarget::from_arg(&args.serial_port),
        debug: args.verbose || env_true("SEGUIN_HUB_DEBUG"),
        write_timeout: Duration::from_secs(args.write_timeout),
        queue_capacity: args.queue_capacity.max(1),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

/// Log to stdout, and also to `seguin-hub.log` when a log directory is set.
fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else {
        std::env::var("SEGUIN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match open_log_file(&config.log_dir) {
        Ok(file) => file.map(|file| {
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
        }),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
    {
        eprintln!("logging_init_error: {err}");
    }
}

fn open_log_file(log_dir: &str) -> io::Result<Option<File>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("seguin-hub.log"))
        .map(Some)
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("SEGUIN_HUB_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_ADDR.to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    std::env::var("SEGUIN_LOG_DIR").unwrap_or_default()
}
