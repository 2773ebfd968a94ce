//! swarm-cli — operator client for the swarm control server.
//!
//! Speaks the server's JSON envelope protocol over WebSocket: one-shot
//! commands correlate their `ack`/`error` by `request_id` and exit non-zero
//! on rejection; `subscribe` streams filtered events to stdout until the
//! connection ends.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("websocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket transport failed: {0}")]
    Transport(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket closed")]
    Closed,
    #[error("timed out waiting for server reply")]
    Timeout,
    #[error("invalid JSON from server: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("server rejected {kind}: [{code}] {message}")]
    Rejected {
        kind: String,
        code: String,
        message: String,
    },
}

#[derive(Parser, Debug)]
#[command(name = "swarm-cli", about = "Operator client for the swarm control server")]
struct Cli {
    /// WebSocket endpoint of the control server.
    #[arg(long, env = "SWARM_SERVER_URL", default_value = "ws://127.0.0.1:8765/ws")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream filtered server events to stdout until interrupted.
    Subscribe(SubscribeArgs),
    /// Drive cubes with independent wheel speeds.
    Drive {
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long, allow_negative_numbers = true, default_value_t = 0)]
        left: i64,
        #[arg(long, allow_negative_numbers = true, default_value_t = 0)]
        right: i64,
    },
    /// Stop cubes (drive 0 0).
    Stop {
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// Set cube LED colors.
    Led {
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long, default_value_t = 0)]
        r: u8,
        #[arg(long, default_value_t = 0)]
        g: u8,
        #[arg(long, default_value_t = 0)]
        b: u8,
    },
    /// Assign a goal pose to cubes.
    Goal {
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long)]
        x: f64,
        #[arg(long)]
        y: f64,
        #[arg(long)]
        angle: Option<f64>,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long)]
        keep_history: bool,
    },
    /// Define a cube group alias usable as a command target.
    Group {
        group_id: String,
        #[arg(required = true)]
        members: Vec<String>,
    },
    /// Print a full state snapshot.
    Snapshot {
        #[arg(long)]
        history: bool,
    },
}

#[derive(Args, Debug)]
struct SubscribeArgs {
    /// Streams to receive (relay_status, cube_update, fleet_state, log).
    /// Defaults to all.
    #[arg(long = "stream")]
    streams: Vec<String>,
    /// Restrict cube updates to these cubes. Defaults to all cubes.
    #[arg(long = "cube")]
    cubes: Vec<String>,
    /// Include the change history in the initial snapshot.
    #[arg(long)]
    history: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let (mut stream, _) = connect_async(cli.url.as_str())
        .await
        .map_err(|error| CliError::Connect(Box::new(error)))?;

    match cli.command {
        Command::Subscribe(args) => subscribe(&mut stream, &args).await,
        Command::Drive { targets, left, right } => {
            request(
                &mut stream,
                "manual_drive",
                json!({ "targets": targets, "left": left, "right": right }),
            )
            .await
        }
        Command::Stop { targets } => {
            request(
                &mut stream,
                "manual_drive",
                json!({ "targets": targets, "left": 0, "right": 0 }),
            )
            .await
        }
        Command::Led { targets, r, g, b } => {
            request(
                &mut stream,
                "set_led",
                json!({ "targets": targets, "color": { "r": r, "g": g, "b": b } }),
            )
            .await
        }
        Command::Goal { targets, x, y, angle, priority, keep_history } => {
            let mut goal = json!({ "x": x, "y": y });
            if let Some(angle) = angle {
                goal["angle"] = json!(angle);
            }
            request(
                &mut stream,
                "set_goal",
                json!({
                    "targets": targets,
                    "goal": goal,
                    "priority": priority,
                    "keep_history": keep_history,
                }),
            )
            .await
        }
        Command::Group { group_id, members } => {
            request(
                &mut stream,
                "set_group",
                json!({ "group_id": group_id, "members": members }),
            )
            .await
        }
        Command::Snapshot { history } => snapshot(&mut stream, history).await,
    }
}

/// Send one command and wait for its correlated ack or error.
async fn request(stream: &mut WsStream, kind: &str, payload: Value) -> Result<(), CliError> {
    let request_id = send_command(stream, kind, payload).await?;
    let reply = wait_for_reply(stream, &request_id, kind).await?;
    if let Some(details) = reply["payload"].get("details") {
        print_json(details)?;
    }
    Ok(())
}

/// Replace the subscription, then print every event as it arrives.
async fn subscribe(stream: &mut WsStream, args: &SubscribeArgs) -> Result<(), CliError> {
    let request_id = send_command(
        stream,
        "subscribe",
        json!({
            "streams": args.streams,
            "cube_filter": args.cubes,
            "include_history": args.history,
        }),
    )
    .await?;
    wait_for_reply(stream, &request_id, "subscribe").await?;

    loop {
        let Some(envelope) = recv_envelope(stream, None).await? else {
            return Ok(());
        };
        print_json(&envelope)?;
    }
}

async fn snapshot(stream: &mut WsStream, history: bool) -> Result<(), CliError> {
    let request_id =
        send_command(stream, "request_snapshot", json!({ "include_history": history })).await?;
    wait_for_reply(stream, &request_id, "request_snapshot").await?;

    // The requested snapshot follows the ack; skip unrelated events,
    // including the snapshot the server pushed when the session opened.
    loop {
        let envelope = recv_envelope(stream, Some(REPLY_TIMEOUT))
            .await?
            .ok_or(CliError::Closed)?;
        if envelope["type"] == "snapshot" {
            print_json(&envelope["payload"])?;
            return Ok(());
        }
    }
}

async fn send_command(
    stream: &mut WsStream,
    kind: &str,
    payload: Value,
) -> Result<String, CliError> {
    let request_id = format!("cli-{}", std::process::id());
    let envelope = json!({ "type": kind, "request_id": request_id, "payload": payload });
    stream
        .send(Message::Text(envelope.to_string().into()))
        .await
        .map_err(|error| CliError::Transport(Box::new(error)))?;
    Ok(request_id)
}

async fn wait_for_reply(
    stream: &mut WsStream,
    request_id: &str,
    kind: &str,
) -> Result<Value, CliError> {
    loop {
        let envelope = recv_envelope(stream, Some(REPLY_TIMEOUT))
            .await?
            .ok_or(CliError::Closed)?;
        if envelope["payload"]["request_id"] != request_id {
            continue;
        }
        match envelope["type"].as_str() {
            Some("ack") => return Ok(envelope),
            Some("error") => {
                return Err(CliError::Rejected {
                    kind: kind.to_string(),
                    code: envelope["payload"]["code"].as_str().unwrap_or("-").to_string(),
                    message: envelope["payload"]["message"].as_str().unwrap_or("-").to_string(),
                });
            }
            _ => {}
        }
    }
}

/// Read the next text frame as JSON. `None` means the peer closed cleanly.
async fn recv_envelope(
    stream: &mut WsStream,
    timeout: Option<Duration>,
) -> Result<Option<Value>, CliError> {
    let read = async {
        loop {
            let Some(message) = stream.next().await else {
                return Ok(None);
            };
            match message.map_err(|error| CliError::Transport(Box::new(error)))? {
                Message::Text(text) => return Ok(Some(serde_json::from_str::<Value>(&text)?)),
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
    };
    match timeout {
        Some(limit) => tokio::time::timeout(limit, read).await.map_err(|_| CliError::Timeout)?,
        None => read.await,
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
