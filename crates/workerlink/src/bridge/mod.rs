//! IPC bridge between the engine and its worker subprocess.
//!
//! This module provides the wire protocol and codec for communication over
//! the worker's stdin/stdout.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, WorkerMessage = Response | Event)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
