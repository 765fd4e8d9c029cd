//! mctp-stream: an MCTP (DSP0236) transport over a reliable byte stream.
//!
//! MCTP frames every message into 68-byte packets (a 4-byte header plus a
//! 64-byte baseline transmission unit) with start/end-of-message flags, a
//! modulo-4 packet sequence, and a 3-bit tag correlating requests with
//! responses. This crate implements the full transport as a fixed-topology
//! pipeline of cooperating tasks connected by bounded queues, with all
//! packets, messages, and in-flight actions recycled through fixed-size
//! pools rather than allocated per packet.
//!
//! # Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────┐
//!  socket ──► reader ──►│RPQ│──► reassembler ──►│RMQ│──► dispatcher ───┼──► handlers
//!                       └───┘    (per-tag)      └───┘      │           │
//!                                                          ▼           │
//!                                                      tag match ──────┼──► completion
//!                                                                      │    handles
//!  submit ──►│TAQ│──► scheduler ──►│TMQ│──► fragmenter ──►│TPQ│──► writer ──► socket
//!            └───┘    (tag table,  └───┘                  └───┘      │
//!                      retries)                                      ▼
//!                                                  completion ◄────│ACQ│
//! ```
//!
//! Inbound, the socket reader frames fixed-size records into pooled packet
//! slots; the reassembler validates sequence, SOM/EOM, and tag-owner
//! invariants while assembling per-tag messages; the dispatcher routes
//! requests to type-indexed [`Handler`]s and pairs responses with their
//! in-flight actions by tag.
//!
//! Outbound, [`Endpoint::submit`] queues an action; the scheduler assigns it
//! the lowest free tag and retransmits it on a timer until a response pairs
//! with it or its retry budget runs out; the fragmenter splits the message
//! into packets and the socket writer sends each action's packets
//! contiguously.
//!
//! # Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use mctp_stream::{Retry, Submission, ctrl, protocol::msg_type};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // A server endpoint answering MCTP Control requests
//!     let server = mctp_stream::server("0.0.0.0:2508".parse()?).build();
//!     server.run().await?;
//!
//!     // A client that assigns the server its endpoint ID
//!     let client = mctp_stream::client("127.0.0.1:2508".parse()?).build();
//!     client.run().await?;
//!
//!     let completion = client
//!         .submit_wait(
//!             Submission::new(msg_type::CONTROL, &ctrl::set_eid_request(0x02))
//!                 .dst(0x02)
//!                 .src(0x01)
//!                 .retry(Retry::Count(2)),
//!             Duration::from_secs(1),
//!         )
//!         .await?;
//!     let (_, body) = ctrl::split_payload(&completion.payload).unwrap();
//!     println!("Assigned: {:?}", ctrl::SetEidResponse::decode(body));
//!
//!     client.stop().await;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

mod action;
mod api;
pub mod ctrl;
mod handler;
mod pipeline;
pub mod protocol;
mod state;

pub use action::{ActionError, ActionHandle, Completion, DEFAULT_RETRY_MAX, Retry};
pub use api::{Endpoint, EndpointBuilder, Mode, RunError, SubmitError, Submission, client, server};
pub use handler::{Handler, HandlerCx, Reply};
pub use pipeline::{
    StatsSnapshot,
    dispatch::{DispatchCx, Dispatcher},
};
pub use protocol::MessageBuf;
pub use state::EndpointState;
