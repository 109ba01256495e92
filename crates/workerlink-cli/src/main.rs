//! workerlink: drive a worker subprocess from JSON lines.
//!
//! Each stdin line is one command:
//! `{"command": "quickinfo", "arguments": {...}, "async": false, "expects_reply": true}`
//!
//! Each outcome is printed to stdout as one JSON line, and so is every worker
//! event. Logs go to stderr.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use workerlink::{
    ClientEvent, CommandKind, EngineConfig, LogTracer, ProcessSpawner, SpawnConfig,
    SubmitOptions, WorkerClient,
};

#[derive(Debug, PartialEq)]
struct Args {
    async_commands: HashSet<String>,
    trace: bool,
    executable: PathBuf,
    worker_args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InputLine {
    command: String,
    #[serde(default)]
    arguments: serde_json::Value,
    #[serde(default, rename = "async")]
    is_async: Option<bool>,
    #[serde(default = "default_expects_reply")]
    expects_reply: bool,
}

fn default_expects_reply() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OutputLine {
    Outcome {
        id: usize,
        command: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: workerlink [--async <command>]... [--trace] -- <executable> [args...]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --async <command>  Submit <command> as asynchronous unless a line says otherwise");
            eprintln!("  --trace            Log every request, response and event");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// Initialize tracing with WORKERLINK_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("WORKERLINK_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        let filter_str = format!(
            "workerlink={level},workerlink_cli={level}",
            level = base_level
        );

        EnvFilter::new(filter_str)
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut async_commands = HashSet::new();
    let mut trace = false;
    let mut command: Option<&[String]> = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--async" => {
                i += 1;
                async_commands.insert(args.get(i).ok_or("--async requires a value")?.clone());
            }
            "--trace" => trace = true,
            "--help" | "-h" => return Err("".to_string()),
            "--" => {
                command = Some(&args[i + 1..]);
                break;
            }
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => return Err(format!("unexpected argument: {arg} (worker command goes after --)")),
        }
        i += 1;
    }

    let (executable, worker_args) = command
        .and_then(|c| c.split_first())
        .ok_or("missing worker command after --")?;

    Ok(Args {
        async_commands,
        trace,
        executable: PathBuf::from(executable),
        worker_args: worker_args.to_vec(),
    })
}

impl InputLine {
    fn options(&self, async_commands: &HashSet<String>) -> SubmitOptions {
        let is_async = self
            .is_async
            .unwrap_or_else(|| async_commands.contains(&self.command));
        SubmitOptions {
            kind: if is_async {
                CommandKind::Async
            } else {
                CommandKind::Sync
            },
            expects_reply: self.expects_reply,
            cancellation: None,
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env();
    if args.trace {
        config = config.with_tracer(Arc::new(LogTracer));
    }

    let spawn_config = SpawnConfig::new(&args.executable).with_args(&args.worker_args);
    let client = WorkerClient::spawn(&ProcessSpawner, &spawn_config, config)
        .with_context(|| format!("failed to start worker {}", args.executable.display()))?;

    let (out_tx, out_rx) = mpsc::unbounded_channel::<OutputLine>();
    let printer = tokio::spawn(print_lines(out_rx));
    let forwarder = tokio::spawn(forward_events(client.subscribe(), out_tx.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut outcomes = JoinSet::new();
    let mut id = 0;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, disposing worker");
                client.dispose().await;
                break;
            }
        };
        let Some(line) = line else {
            tracing::debug!("stdin closed, waiting for outstanding commands");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        id += 1;

        let input: InputLine = match serde_json::from_str(&line) {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(id, error = %e, "Ignoring invalid input line");
                let _ = out_tx.send(OutputLine::Outcome {
                    id,
                    command: String::new(),
                    success: false,
                    body: None,
                    error: Some(format!("invalid input: {e}")),
                });
                continue;
            }
        };

        let options = input.options(&args.async_commands);
        let outcome = client.submit(&input.command, input.arguments, options);
        let out_tx = out_tx.clone();
        let command = input.command;
        outcomes.spawn(async move {
            let line = match outcome.await {
                Ok(body) => OutputLine::Outcome {
                    id,
                    command,
                    success: true,
                    body: Some(body),
                    error: None,
                },
                Err(e) => OutputLine::Outcome {
                    id,
                    command,
                    success: false,
                    body: None,
                    error: Some(e.to_string()),
                },
            };
            let _ = out_tx.send(line);
        });
    }

    while outcomes.join_next().await.is_some() {}
    client.dispose().await;

    // Last sender gone: the forwarder drains buffered events, then sees `Closed`.
    drop(client);
    forwarder.await.context("event forwarder failed")?;
    drop(out_tx);
    printer.await.context("output task failed")??;
    Ok(())
}

async fn forward_events(
    mut events: broadcast::Receiver<ClientEvent>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Event(event)) => {
                let _ = out_tx.send(OutputLine::Event {
                    event: event.event,
                    body: event.body,
                });
            }
            Ok(ClientEvent::Exited { code }) => {
                tracing::warn!(?code, "Worker exited");
                break;
            }
            Ok(ClientEvent::Error { message }) => {
                tracing::error!(error = %message, "Worker failed");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Dropped worker events, output too slow");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_lines(mut lines: mpsc::UnboundedReceiver<OutputLine>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.recv().await {
        let mut json = serde_json::to_vec(&line).context("failed to serialize output")?;
        json.push(b'\n');
        stdout.write_all(&json).await.context("failed to write stdout")?;
        stdout.flush().await.context("failed to flush stdout")?;
    }
    Ok(())
}
