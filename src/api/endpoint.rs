use std::{net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::debug;

use super::{Mode, RunError, SubmitError, supervisor};
use crate::{
    action::{ActionHandle, Completion, Retry},
    ctrl::{CtrlHandler, Version, VersionTable},
    handler::{Handler, HandlerTable},
    pipeline::{self, Config, Shared, StatsSnapshot, dispatch::{DefaultDispatcher, Dispatcher}, signal::StopSignal},
    protocol::{MAX_PAYLOAD, TYPE_MASK, eid, msg_type},
    state::EndpointState,
};

/// Configures and constructs an [`Endpoint`].
///
/// Obtained from [`server`](super::server) or [`client`](super::client).
/// The control handler is installed for message type 0x00 unless it is
/// explicitly overridden.
pub struct EndpointBuilder {
    addr: SocketAddr,
    mode: Mode,
    handlers: HandlerTable,
    dispatcher: Arc<dyn Dispatcher>,
    versions: VersionTable,
    eid: u8,
    config: Config,
    startup_timeout: Duration,
}

impl EndpointBuilder {
    pub(super) fn new(addr: SocketAddr, mode: Mode) -> Self {
        let mut handlers = HandlerTable::new();
        handlers.set(msg_type::CONTROL, Arc::new(CtrlHandler));
        EndpointBuilder {
            addr,
            mode,
            handlers,
            dispatcher: Arc::new(DefaultDispatcher),
            versions: VersionTable::with_defaults(),
            eid: eid::NULL,
            config: Config::default(),
            startup_timeout: Duration::from_secs(1),
        }
    }

    /// Installs a handler for a message-type code.
    #[must_use]
    pub fn handler(mut self, msg_type: u8, handler: Arc<dyn Handler>) -> Self {
        self.handlers.set(msg_type & TYPE_MASK, handler);
        self
    }

    /// Replaces the dispatcher stage wholesale. Test clients use this to
    /// drive the receive-message queue by hand.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Advertises a supported version for a message type.
    #[must_use]
    pub fn version(mut self, msg_type: u8, major: u8, minor: u8, update: u8, alpha: u8) -> Self {
        self.versions.insert(msg_type, Version::new(major, minor, update, alpha));
        self
    }

    /// Presets the endpoint ID instead of waiting for a bus owner to assign
    /// one.
    #[must_use]
    pub fn eid(mut self, eid: u8) -> Self {
        self.eid = eid;
        self
    }

    /// How long an in-flight action waits for its response before it is
    /// retransmitted or retired.
    ///
    /// Default: 100 ms.
    #[must_use]
    pub fn action_timeout(mut self, delta: Duration) -> Self {
        self.config.action_delta = delta;
        self
    }

    /// The retry scheduler's sleep between sweeps.
    ///
    /// Default: 1 ms.
    #[must_use]
    pub fn scheduler_tick(mut self, tick: Duration) -> Self {
        self.config.sched_tick = tick;
        self
    }

    /// How long [`Endpoint::run`] waits for the pipeline to come up.
    ///
    /// Default: 1 second.
    #[must_use]
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn build(self) -> Endpoint {
        let mut state = EndpointState::new();
        state.eid = self.eid;
        let supported_types: Arc<[u8]> = Arc::from(self.handlers.registered_types().as_slice());

        Endpoint {
            inner: Arc::new(EndpointInner {
                addr: self.addr,
                mode: self.mode,
                config: self.config,
                startup_timeout: self.startup_timeout,
                state: Arc::new(Mutex::new(state)),
                versions: Arc::new(self.versions),
                handlers: Arc::new(self.handlers),
                supported_types,
                dispatcher: self.dispatcher,
                stop: Arc::new(StopSignal::new()),
                current: Mutex::new(None),
                running: Mutex::new(None),
            }),
        }
    }
}

pub(super) struct Running {
    pub(super) supervisor: JoinHandle<()>,
    pub(super) local_addr: SocketAddr,
}

pub(super) struct EndpointInner {
    pub(super) addr: SocketAddr,
    pub(super) mode: Mode,
    pub(super) config: Config,
    pub(super) startup_timeout: Duration,
    pub(super) state: Arc<Mutex<EndpointState>>,
    pub(super) versions: Arc<VersionTable>,
    pub(super) handlers: Arc<HandlerTable>,
    pub(super) supported_types: Arc<[u8]>,
    pub(super) dispatcher: Arc<dyn Dispatcher>,
    pub(super) stop: Arc<StopSignal>,
    /// The running connection's pipeline, if any.
    pub(super) current: Mutex<Option<Arc<Shared>>>,
    pub(super) running: Mutex<Option<Running>>,
}

/// An outbound request to submit.
#[derive(Clone, Copy, Debug)]
pub struct Submission<'a> {
    pub(crate) msg_type: u8,
    pub(crate) payload: &'a [u8],
    pub(crate) dst: u8,
    pub(crate) src: u8,
    pub(crate) retry: Retry,
}

impl<'a> Submission<'a> {
    pub fn new(msg_type: u8, payload: &'a [u8]) -> Self {
        Submission {
            msg_type: msg_type & TYPE_MASK,
            payload,
            dst: eid::NULL,
            src: eid::NULL,
            retry: Retry::Default,
        }
    }

    /// Destination EID. Defaults to NULL, which control responders treat as
    /// "whoever is listening".
    #[must_use]
    pub fn dst(mut self, dst: u8) -> Self {
        self.dst = dst;
        self
    }

    /// Source EID. Defaults to NULL.
    #[must_use]
    pub fn src(mut self, src: u8) -> Self {
        self.src = src;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }
}

/// An MCTP endpoint: one pipeline per active connection plus the supervisor
/// that recycles it.
///
/// ```no_run
/// use std::time::Duration;
/// use mctp_stream::{Submission, ctrl, protocol::msg_type};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let endpoint = mctp_stream::client("127.0.0.1:2508".parse()?).build();
/// endpoint.run().await?;
///
/// // Assign the peer's endpoint ID and wait for its answer
/// let completion = endpoint
///     .submit_wait(
///         Submission::new(msg_type::CONTROL, &ctrl::set_eid_request(0x02))
///             .dst(0x02)
///             .src(0x01),
///         Duration::from_secs(1),
///     )
///     .await?;
/// println!("Response: {:02x?}", completion.payload);
///
/// endpoint.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Starts the endpoint: binds or connects, spawns the connection
    /// supervisor, and returns once the pipeline is up.
    pub async fn run(&self) -> Result<(), RunError> {
        if self.inner.running.lock().is_some() {
            return Err(RunError::AlreadyRunning);
        }

        let (started_tx, started_rx) = oneshot::channel();
        let (handle, local_addr) = match self.inner.mode {
            Mode::Server => {
                let listener = TcpListener::bind(self.inner.addr).await.map_err(|source| RunError::Bind {
                    addr: self.inner.addr,
                    source,
                })?;
                let local_addr = listener.local_addr().unwrap_or(self.inner.addr);
                let task = tokio::spawn(supervisor::supervise(
                    self.inner.clone(),
                    Some(listener),
                    None,
                    started_tx,
                ));
                (task, local_addr)
            }
            Mode::Client => {
                let stream = TcpStream::connect(self.inner.addr)
                    .await
                    .map_err(|source| RunError::Connect {
                        addr: self.inner.addr,
                        source,
                    })?;
                let local_addr = stream.local_addr().unwrap_or(self.inner.addr);
                let task = tokio::spawn(supervisor::supervise(
                    self.inner.clone(),
                    None,
                    Some(stream),
                    started_tx,
                ));
                (task, local_addr)
            }
        };

        // The supervisor signals once queues, pools, and stages exist
        match tokio::time::timeout(self.inner.startup_timeout, started_rx).await {
            Ok(Ok(())) => {}
            _ => {
                handle.abort();
                return Err(RunError::StartupTimeout);
            }
        }

        *self.inner.running.lock() = Some(Running {
            supervisor: handle,
            local_addr,
        });
        debug!(addr = %local_addr, mode = ?self.inner.mode, "Endpoint running");
        Ok(())
    }

    /// The bound (server) or local (client) socket address, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Requests an orderly stop and waits for the supervisor to finish.
    pub async fn stop(&self) {
        let running = self.inner.running.lock().take();
        let Some(running) = running else {
            return;
        };
        self.inner.stop.request_stop();
        if let Some(shared) = self.inner.current.lock().clone() {
            shared.sched_wake.notify();
        }
        let _ = running.supervisor.await;
        debug!("Endpoint stopped");
    }

    /// Submits an outbound request and returns its completion handle.
    ///
    /// The submission is queued for the retry scheduler, which assigns it a
    /// free tag and hands it to the fragmenter; the handle resolves when a
    /// response pairs with the action or the action fails.
    pub async fn submit(&self, sub: Submission<'_>) -> Result<ActionHandle, SubmitError> {
        if sub.payload.is_empty() {
            return Err(SubmitError::EmptyPayload);
        }
        if sub.payload.len() > MAX_PAYLOAD {
            return Err(SubmitError::PayloadTooLarge(sub.payload.len()));
        }
        let shared = self.inner.current.lock().clone().ok_or(SubmitError::NotRunning)?;

        let Some(mut msg) = shared.pools.msgs.acquire().await else {
            return Err(SubmitError::ShuttingDown);
        };
        msg.dst = sub.dst;
        msg.src = sub.src;
        msg.owner = true;
        msg.msg_type = sub.msg_type;
        msg.ts = pipeline::now();
        // Length was checked above
        let _ = msg.set_payload(sub.payload);

        let Some(cell) = shared.pools.actions.acquire().await else {
            shared.pools.msgs.release(msg);
            return Err(SubmitError::ShuttingDown);
        };
        let handle = {
            let mut action = cell.lock();
            action.valid = true;
            action.request = Some(msg);
            action.created = pipeline::now();
            action.max = sub.retry.max();
            action.attach_handle()
        };

        match shared.queues.taq.try_push(cell) {
            Ok(()) => {
                shared.sched_wake.notify();
                Ok(handle)
            }
            Err(cell) => {
                crate::action::retire(&shared.pools, cell);
                Err(SubmitError::Backlogged)
            }
        }
    }

    /// Submits and waits for the completion, with a deadline.
    pub async fn submit_wait(&self, sub: Submission<'_>, deadline: Duration) -> Result<Completion, SubmitError> {
        let handle = self.submit(sub).await?;
        Ok(handle.completed_within(deadline).await?)
    }

    /// Counters of the current connection's pipeline, if one is up.
    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.inner.current.lock().as_ref().map(|shared| shared.stats.snapshot())
    }

    /// A copy of the endpoint identity state.
    pub fn state(&self) -> EndpointState {
        self.inner.state.lock().clone()
    }

    /// The endpoint UUID reported by Get Endpoint UUID.
    pub fn uuid(&self) -> uuid::Uuid {
        self.inner.state.lock().uuid
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // An endpoint dropped without `stop()` must not leave its
        // supervisor running
        if let Some(running) = self.inner.running.lock().take() {
            self.inner.stop.request_stop();
            running.supervisor.abort();
        }
    }
}
