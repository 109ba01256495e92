//! workerlink: request/response engine for a language-service worker process
//! speaking framed JSON over stdin/stdout.

pub mod bridge;
pub mod cancellation;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod outcome;
pub mod queue;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod tracer;

pub use bridge::protocol::{Event, REQUEST_COMPLETED_EVENT, Request, Response, WorkerMessage};
pub use cancellation::{CancellationSignaller, FileCancellation};
pub use client::{ClientError, CommandExecutor, WorkerClient};
pub use config::EngineConfig;
pub use diagnostics::{DiagnosticsSink, ErrorReport, NoopDiagnostics, TracingDiagnostics};
pub use engine::{ClientEvent, Engine, RequestWriter, SubmitOptions};
pub use outcome::{CancellationToken, CommandError, CommandKind, CommandResult, Outcome, WorkerFailure};
pub use router::{Route, RouteTable, RoutedClient};
pub use supervisor::{ProcessSpawner, SpawnConfig, SpawnError, WorkerSpawner};
pub use tracer::{CancelPath, LogTracer, NoopTracer, Tracer};
