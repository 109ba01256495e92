//! Worker client - owns the worker subprocess and drives its engine.
//!
//! Flow:
//! 1. Spawn worker subprocess (or adopt an existing stdio pair)
//! 2. Frame stdin/stdout with [`JsonCodec`]
//! 3. Run the event loop: submissions, cancellations and worker output all
//!    funnel into one [`Engine`]
//! 4. Hand requests to a dedicated stdin writer task, so stdin has a single
//!    writer and a worker that stops reading never stalls the loop
//! 5. On worker exit or I/O error: notify subscribers, fail all outcomes, stop

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Request, WorkerMessage};
use crate::config::EngineConfig;
use crate::engine::{ClientEvent, Engine, RequestWriter, SubmitOptions, SubmitRequest};
use crate::outcome::{CancellationToken, CommandError, Outcome};
use crate::supervisor::{self, SpawnConfig, SpawnError, WorkerSpawner};

/// Anything that accepts commands: a single worker client or a router.
///
/// This abstraction lets routing and callers be tested without a real
/// worker subprocess.
pub trait CommandExecutor: Send + Sync {
    fn submit(&self, name: &str, arguments: serde_json::Value, options: SubmitOptions) -> Outcome;
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker {0} not captured")]
    StdioNotCaptured(&'static str),
}

enum ClientRequest {
    Submit {
        request: SubmitRequest,
        cancellation: Option<CancellationToken>,
    },
    Dispose {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running worker. Cheap to clone; the worker is disposed when
/// [`WorkerClient::dispose`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct WorkerClient {
    requests: mpsc::UnboundedSender<ClientRequest>,
    events: broadcast::Sender<ClientEvent>,
}

impl WorkerClient {
    /// Spawns the worker and starts its event loop. Must be called inside a
    /// tokio runtime.
    pub fn spawn(
        spawner: &dyn WorkerSpawner,
        spawn_config: &SpawnConfig,
        config: EngineConfig,
    ) -> Result<Self, ClientError> {
        let mut child = spawner.spawn(spawn_config)?;
        let stdin = child
            .stdin
            .take()
            .ok_or(ClientError::StdioNotCaptured("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ClientError::StdioNotCaptured("stdout"))?;
        Ok(Self::start(stdout, stdin, Some(child), config))
    }

    /// Runs the protocol over an existing stdio pair with no process attached.
    /// End of `reader` is treated as the worker exiting.
    pub fn from_stdio<R, W>(reader: R, writer: W, config: EngineConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(reader, writer, None, config)
    }

    fn start<R, W>(reader: R, writer: W, child: Option<Child>, config: EngineConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (events, _) = broadcast::channel(config.event_capacity);
        let (requests, requests_rx) = mpsc::unbounded_channel();

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let writer = FramedWrite::new(writer, JsonCodec::<Request>::new());
        let writer_task = tokio::spawn(run_stdin_writer(writer, stdin_rx, failures_tx));

        let reader = FramedRead::new(reader, JsonCodec::<WorkerMessage>::new());
        let engine = Engine::with_events(StdinWriter { requests: stdin_tx }, config, events.clone());

        tokio::spawn(run_event_loop(
            engine,
            reader,
            child,
            requests_rx,
            failures_rx,
            writer_task,
        ));

        Self { requests, events }
    }

    /// Submits a command. Never blocks; await the returned outcome for the
    /// result.
    pub fn submit(
        &self,
        name: &str,
        arguments: serde_json::Value,
        options: SubmitOptions,
    ) -> Outcome {
        if options
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Outcome::ready(Err(CommandError::Cancelled));
        }

        let (request, outcome) = SubmitRequest::new(name, arguments, &options);
        let cancellation = options.cancellation;
        // If the loop is gone the request is dropped with its responder and
        // the outcome resolves to `EngineStopped`.
        let _ = self.requests.send(ClientRequest::Submit {
            request,
            cancellation,
        });
        outcome
    }

    /// Worker events, exit and error notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Fails all outstanding commands with [`CommandError::Disposed`] and
    /// kills the worker. Safe to call repeatedly and after the worker exited.
    pub async fn dispose(&self) {
        let (done, done_rx) = oneshot::channel();
        if self.requests.send(ClientRequest::Dispose { done }).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Whether the event loop has stopped (worker gone or disposed).
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

impl CommandExecutor for WorkerClient {
    fn submit(&self, name: &str, arguments: serde_json::Value, options: SubmitOptions) -> Outcome {
        WorkerClient::submit(self, name, arguments, options)
    }
}

impl<T: CommandExecutor + ?Sized> CommandExecutor for Arc<T> {
    fn submit(&self, name: &str, arguments: serde_json::Value, options: SubmitOptions) -> Outcome {
        (**self).submit(name, arguments, options)
    }
}

/// A write that did not reach the worker.
type WriteFailure = (u64, String);

/// Engine-side handle to the stdin writer task. Never waits on the worker.
struct StdinWriter {
    requests: mpsc::UnboundedSender<Request>,
}

#[async_trait]
impl RequestWriter for StdinWriter {
    async fn write(&mut self, request: Request) -> io::Result<()> {
        self.requests
            .send(request)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stdin writer stopped"))
    }
}

/// Owns the worker's stdin and writes requests in the order they were handed over.
async fn run_stdin_writer<W>(
    mut writer: FramedWrite<W, JsonCodec<Request>>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    failures: mpsc::UnboundedSender<WriteFailure>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(request) = requests.recv().await {
        let seq = request.seq;
        if let Err(e) = writer.send(request).await
            && failures.send((seq, e.to_string())).is_err()
        {
            break;
        }
    }
    tracing::debug!("Stdin writer exiting");
}

async fn run_event_loop<R>(
    mut engine: Engine<StdinWriter>,
    mut reader: FramedRead<R, JsonCodec<WorkerMessage>>,
    mut child: Option<Child>,
    mut requests: mpsc::UnboundedReceiver<ClientRequest>,
    mut write_failures: mpsc::UnboundedReceiver<WriteFailure>,
    writer_task: tokio::task::JoinHandle<()>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    // Owned by the loop so watchers never keep the request channel open.
    let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel::<u64>();
    let mut disposed = None;

    loop {
        tokio::select! {
            biased;

            msg = reader.next() => {
                match msg {
                    Some(Ok(Ok(message))) => engine.dispatch(message).await,
                    Some(Ok(Err(malformed))) => engine.report_malformed(&malformed),
                    Some(Err(e)) => {
                        engine.on_worker_error(format!("worker output error: {}", e));
                        if let Some(child) = child.as_mut() {
                            supervisor::kill(child).await;
                        }
                        break;
                    }
                    None => {
                        tracing::warn!("Worker output closed (worker exited?)");
                        let code = match child.as_mut() {
                            Some(child) => supervisor::reap(child, supervisor::REAP_TIMEOUT).await,
                            None => None,
                        };
                        engine.on_worker_exit(code);
                        break;
                    }
                }
            }

            Some((seq, error)) = write_failures.recv() => {
                engine.on_write_failed(seq, error).await;
            }

            Some(seq) = cancel_rx.recv() => {
                engine.cancel(seq).await;
            }

            request = requests.recv() => {
                match request {
                    Some(ClientRequest::Submit { request, cancellation }) => {
                        let settled = request.pending.as_ref().map(|p| p.settled_token());
                        let seq = engine.enqueue(request);
                        engine.drain().await;

                        if let (Some(seq), Some(token), Some(settled)) = (seq, cancellation, settled)
                            && !settled.is_cancelled()
                        {
                            tokio::spawn(watch_cancellation(seq, token, settled, cancel_tx.clone()));
                        }
                    }
                    Some(ClientRequest::Dispose { done }) => {
                        tracing::info!("Disposing worker client");
                        engine.dispose();
                        if let Some(child) = child.as_mut() {
                            supervisor::kill(child).await;
                        }
                        disposed = Some(done);
                        break;
                    }
                    None => {
                        tracing::debug!("All client handles dropped, disposing");
                        engine.dispose();
                        if let Some(child) = child.as_mut() {
                            supervisor::kill(child).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    // A write may still be parked on a worker that stopped reading.
    writer_task.abort();

    // Close the request channel before acknowledging a dispose so the
    // handle reports closed once `dispose` returns.
    drop(requests);
    if let Some(done) = disposed {
        let _ = done.send(());
    }
    tracing::info!("Event loop exiting");
}

/// Forwards a caller's cancellation to the loop unless the command settles first.
async fn watch_cancellation(
    seq: u64,
    token: CancellationToken,
    settled: CancellationToken,
    cancel_tx: mpsc::UnboundedSender<u64>,
) {
    tokio::select! {
        _ = token.cancelled() => {
            let _ = cancel_tx.send(seq);
        }
        _ = settled.cancelled() => {}
    }
}
