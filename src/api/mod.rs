//! Endpoint lifecycle and the public submission interface.
//!
//! An endpoint is built for one of two modes, [`server`] (bind, listen,
//! accept, and re-accept after a dropped connection) or [`client`] (connect
//! once), then started with [`Endpoint::run`]. A connection supervisor task
//! owns the pipeline: it constructs fresh queues and pools per connection,
//! starts the seven stages, waits for a stop or a stage failure, tears
//! everything down in order, and (in server mode) loops back to accept.

mod endpoint;
mod supervisor;

pub use endpoint::{Endpoint, EndpointBuilder, Submission};

use std::{io, net::SocketAddr};

use thiserror::Error;

/// Which side of the connection an endpoint plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Bind and accept; a dropped connection recycles the pipeline for the
    /// next accept.
    Server,
    /// Connect once; a dropped connection ends the endpoint.
    Client,
}

/// Failure starting an endpoint.
#[derive(Debug, Error)]
pub enum RunError {
    /// The listening socket could not be bound (server mode).
    #[error("Could not bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The connection could not be established (client mode).
    #[error("Could not connect to {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The pipeline did not come up within the startup timeout.
    #[error("Pipeline failed to start in time")]
    StartupTimeout,

    /// `run` was called while the endpoint was already running.
    #[error("Endpoint is already running")]
    AlreadyRunning,
}

/// Failure submitting an action.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Submissions must carry at least one payload byte.
    #[error("Empty payload")]
    EmptyPayload,

    /// The payload exceeds the message capacity.
    #[error("Payload of {0} bytes exceeds the message capacity")]
    PayloadTooLarge(usize),

    /// The endpoint has no active pipeline to submit into.
    #[error("Endpoint is not running")]
    NotRunning,

    /// The submission queue is full.
    #[error("Submission queue is full")]
    Backlogged,

    /// The pipeline shut down while the submission was being prepared.
    #[error("Pipeline is shutting down")]
    ShuttingDown,

    /// The submitted action itself failed; carries the action's error.
    #[error(transparent)]
    Action(#[from] crate::action::ActionError),
}

/// Starts building a server-mode endpoint listening on `addr`.
pub fn server(addr: SocketAddr) -> EndpointBuilder {
    EndpointBuilder::new(addr, Mode::Server)
}

/// Starts building a client-mode endpoint connecting to `addr`.
pub fn client(addr: SocketAddr) -> EndpointBuilder {
    EndpointBuilder::new(addr, Mode::Client)
}
