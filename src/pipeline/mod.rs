//! The packet-and-message pipeline.
//!
//! One pipeline instance serves one connection. Seven long-lived tasks are
//! wired together by bounded queues and recycle their elements through three
//! shared pools:
//!
//! ```text
//!  inbound:   socket ──> RPQ ──> reassembler ──> RMQ ──> dispatcher
//!                                                          │      └─ handler / tag match
//!  outbound:  submit ──> TAQ ──> scheduler ──> TMQ ──> fragmenter ──> TPQ ──> socket
//!                           (tag table)                                        │
//!  completion:                                  ACQ <──────────────────────────┘
//! ```
//!
//! Every stage is a `pop; work; push` loop; a shut-down queue returns `None`
//! from its pop, which is the common exit path. The connection supervisor
//! (in `api`) owns startup, teardown, and recycling.

pub(crate) mod complete;
pub(crate) mod dispatch;
pub(crate) mod queue;
pub(crate) mod rx;
pub(crate) mod sched;
pub(crate) mod signal;
pub(crate) mod tx;

use std::{
    sync::{
        Arc, LazyLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    action::ActionCell,
    ctrl::VersionTable,
    handler::HandlerTable,
    protocol::{MessageBuf, PacketSlot},
    state::EndpointState,
};
use queue::{Pool, Queue, Recycle};
use sched::TagTable;
use signal::{StopSignal, Wake};

/// Monotonic epoch every pipeline timestamp is measured against.
static LOCAL_EPOCH: LazyLock<quanta::Instant> = LazyLock::new(quanta::Instant::now);

/// Monotonic now, relative to the pipeline epoch.
pub(crate) fn now() -> Duration {
    LOCAL_EPOCH.elapsed()
}

// Queue depths
pub(crate) const RPQ_DEPTH: usize = 1024;
pub(crate) const TPQ_DEPTH: usize = 1024;
pub(crate) const RMQ_DEPTH: usize = 128;
pub(crate) const TMQ_DEPTH: usize = 128;
pub(crate) const TAQ_DEPTH: usize = 128;
pub(crate) const ACQ_DEPTH: usize = 128;

// Pool sizes
pub(crate) const PKT_POOL_SIZE: usize = 1024;
pub(crate) const MSG_POOL_SIZE: usize = 128;
pub(crate) const ACTION_POOL_SIZE: usize = 128;

/// Tunables shared by every stage of a pipeline.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Config {
    /// How long an in-flight action waits for a response before it is
    /// retransmitted or retired.
    pub(crate) action_delta: Duration,
    /// The scheduler's sleep between sweeps.
    pub(crate) sched_tick: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            action_delta: Duration::from_millis(100),
            sched_tick: Duration::from_millis(1),
        }
    }
}

impl Recycle for Box<MessageBuf> {
    fn recycle(&mut self) {
        MessageBuf::recycle(self);
    }
}

impl Recycle for Box<PacketSlot> {
    fn recycle(&mut self) {
        PacketSlot::recycle(self);
    }
}

/// The three central free lists.
pub(crate) struct Pools {
    pub(crate) pkts: Pool<Box<PacketSlot>>,
    pub(crate) msgs: Pool<Box<MessageBuf>>,
    pub(crate) actions: Pool<ActionCell>,
}

impl Pools {
    fn new() -> Self {
        Pools {
            pkts: Pool::new(PKT_POOL_SIZE, || Box::new(PacketSlot::new())),
            msgs: Pool::new(MSG_POOL_SIZE, || Box::new(MessageBuf::new())),
            actions: Pool::new(ACTION_POOL_SIZE, || Arc::new(Mutex::new(crate::action::Action::default()))),
        }
    }

    fn shutdown(&self) {
        self.pkts.shutdown();
        self.msgs.shutdown();
        self.actions.shutdown();
    }
}

/// The six bounded queues connecting the stages.
pub(crate) struct Queues {
    /// Receive packet queue: socket reader → reassembler.
    pub(crate) rpq: Queue<Box<PacketSlot>>,
    /// Transmit packet queue: fragmenter → socket writer.
    pub(crate) tpq: Queue<ActionCell>,
    /// Receive message queue: reassembler → dispatcher.
    pub(crate) rmq: Queue<Box<MessageBuf>>,
    /// Transmit message queue: scheduler/handlers → fragmenter.
    pub(crate) tmq: Queue<ActionCell>,
    /// Transmit action queue: submit → scheduler.
    pub(crate) taq: Queue<ActionCell>,
    /// Action completion queue: socket writer → completion stage.
    pub(crate) acq: Queue<ActionCell>,
}

impl Queues {
    fn new() -> Self {
        Queues {
            rpq: Queue::new(RPQ_DEPTH),
            tpq: Queue::new(TPQ_DEPTH),
            rmq: Queue::new(RMQ_DEPTH),
            tmq: Queue::new(TMQ_DEPTH),
            taq: Queue::new(TAQ_DEPTH),
            acq: Queue::new(ACQ_DEPTH),
        }
    }

    fn shutdown(&self) {
        self.rpq.shutdown();
        self.tpq.shutdown();
        self.rmq.shutdown();
        self.tmq.shutdown();
        self.taq.shutdown();
        self.acq.shutdown();
    }
}

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Per-connection pipeline counters.
        #[derive(Default)]
        pub(crate) struct Stats {
            $($(#[$doc])* pub(crate) $name: CachePadded<AtomicU64>,)*
        }

        /// Point-in-time copy of the pipeline counters.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        #[non_exhaustive]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl Stats {
            pub(crate) fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Packets read off the socket.
    rx_packets,
    /// Packets dropped because the receive packet queue was full.
    rx_dropped,
    /// Packets dropped for an unsupported header version.
    dropped_version,
    /// Packets that broke sequence continuity.
    dropped_seqnum,
    /// Partial messages displaced by a new SOM before their EOM arrived.
    dropped_noeom,
    /// Continuation packets with no message in progress on their tag.
    dropped_nosom,
    /// Packets whose tag-owner contradicted the message in progress.
    dropped_wrongto,
    /// Partial messages dropped for exceeding the payload capacity.
    dropped_overrun,
    /// Messages fully reassembled and delivered.
    rx_messages,
    /// Packets handed to the socket writer.
    tx_packets,
    /// Messages fragmented for transmission.
    tx_messages,
    /// Actions drained from the completion queue.
    completed_actions,
    /// Actions that completed successfully.
    successful_actions,
    /// Actions that failed (transport error or retry exhaustion).
    failed_actions,
}

/// Everything one connection's stages share.
pub(crate) struct Shared {
    pub(crate) queues: Queues,
    pub(crate) pools: Pools,
    pub(crate) stats: Stats,
    pub(crate) tags: TagTable,
    pub(crate) state: Arc<Mutex<EndpointState>>,
    pub(crate) versions: Arc<VersionTable>,
    pub(crate) handlers: Arc<HandlerTable>,
    /// Non-control types with a registered handler, precomputed for the
    /// Get Message Type Support command.
    pub(crate) supported_types: Arc<[u8]>,
    pub(crate) config: Config,
    pub(crate) stop: Arc<StopSignal>,
    /// Eager wakeup for the submission scheduler.
    pub(crate) sched_wake: Wake,
}

impl Shared {
    pub(crate) fn new(
        state: Arc<Mutex<EndpointState>>,
        versions: Arc<VersionTable>,
        handlers: Arc<HandlerTable>,
        supported_types: Arc<[u8]>,
        config: Config,
        stop: Arc<StopSignal>,
    ) -> Arc<Self> {
        Arc::new(Shared {
            queues: Queues::new(),
            pools: Pools::new(),
            stats: Stats::default(),
            tags: TagTable::new(),
            state,
            versions,
            handlers,
            supported_types,
            config,
            stop,
            sched_wake: Wake::new(),
        })
    }

    /// Reports a transport failure: flags the abort for the supervisor and
    /// wakes everything that could be parked.
    pub(crate) fn abort(&self) {
        self.stop.abort();
        self.sched_wake.notify();
    }

    /// Shuts down every queue and pool, unblocking all stage pops.
    pub(crate) fn shutdown_queues(&self) {
        self.queues.shutdown();
        self.pools.shutdown();
        self.sched_wake.notify();
    }
}

/// Handles of one connection's running stages, joined in a fixed order at
/// teardown.
pub(crate) struct StageSet {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl StageSet {
    pub(crate) async fn join_all(self) {
        for (name, handle) in self.handles {
            if handle.await.is_err() {
                debug!(stage = name, "Stage task panicked");
            }
        }
    }
}

/// Spawns the seven stages for one connection.
pub(crate) fn start_stages(
    shared: &Arc<Shared>,
    rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
    token: &CancellationToken,
    dispatcher: Arc<dyn dispatch::Dispatcher>,
) -> StageSet {
    let sw = tokio::spawn(tx::socket_writer(shared.clone(), wr, token.clone()));
    let pw = tokio::spawn(tx::packet_writer(shared.clone()));
    let mh = tokio::spawn(dispatcher.run(dispatch::DispatchCx::new(shared.clone())));
    let pr = tokio::spawn(rx::packet_reader(shared.clone()));
    let sr = tokio::spawn(rx::socket_reader(shared.clone(), rd, token.clone()));
    let st = tokio::spawn(sched::submission_scheduler(shared.clone()));
    let ct = tokio::spawn(complete::completion(shared.clone()));

    StageSet {
        handles: vec![
            ("socket-reader", sr),
            ("packet-reader", pr),
            ("dispatcher", mh),
            ("packet-writer", pw),
            ("socket-writer", sw),
            ("scheduler", st),
            ("completion", ct),
        ],
    }
}
