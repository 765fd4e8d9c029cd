use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use event_listener::Event;

const RUNNING: u8 = 0;
const STOP: u8 = 1;
const ABORT: u8 = 2;

/// Why the pipeline is coming down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// An external caller requested an orderly stop. In server mode this
    /// ends the accept loop.
    Requested,
    /// A stage reported a transport failure. In server mode the supervisor
    /// recycles the pipeline for the next connection.
    Aborted,
}

/// Shared stop state for one pipeline instance.
///
/// Stages report transport failures with [`abort`](Self::abort); the external
/// stop path uses [`request_stop`](Self::request_stop), which takes
/// precedence over an abort so that a stop issued mid-failure still ends the
/// accept loop. The supervisor parks on [`wait`](Self::wait).
pub(crate) struct StopSignal {
    state: AtomicU8,
    event: Event,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        StopSignal {
            state: AtomicU8::new(RUNNING),
            event: Event::new(),
        }
    }

    /// Externally requested orderly stop.
    pub(crate) fn request_stop(&self) {
        self.state.store(STOP, Ordering::Release);
        self.event.notify(usize::MAX);
    }

    /// Stage-reported abnormal termination. Does not override an already
    /// requested stop.
    pub(crate) fn abort(&self) {
        let _ = self
            .state
            .compare_exchange(RUNNING, ABORT, Ordering::AcqRel, Ordering::Acquire);
        self.event.notify(usize::MAX);
    }

    pub(crate) fn reason(&self) -> Option<StopReason> {
        match self.state.load(Ordering::Acquire) {
            STOP => Some(StopReason::Requested),
            ABORT => Some(StopReason::Aborted),
            _ => None,
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.reason().is_some()
    }

    /// Waits until a stop is signalled and returns the reason.
    pub(crate) async fn wait(&self) -> StopReason {
        loop {
            if let Some(reason) = self.reason() {
                return reason;
            }
            let listener = self.event.listen();
            if let Some(reason) = self.reason() {
                return reason;
            }
            listener.await;
        }
    }

    /// Rearms the signal for the next connection. Only the supervisor calls
    /// this, after all stages of the previous connection have been joined.
    pub(crate) fn reset(&self) {
        self.state.store(RUNNING, Ordering::Release);
    }
}

/// Wake flag for the submission scheduler.
///
/// The scheduler sleeps between ticks; a submit wakes it immediately so a
/// free tag is assigned without waiting out the tick. The flag is sticky: a
/// wake issued while the scheduler is mid-sweep is observed by the next
/// sleep rather than lost.
pub(crate) struct Wake {
    flag: AtomicBool,
    event: Event,
}

impl Wake {
    pub(crate) fn new() -> Self {
        Wake {
            flag: AtomicBool::new(false),
            event: Event::new(),
        }
    }

    pub(crate) fn notify(&self) {
        self.flag.store(true, Ordering::Release);
        self.event.notify(usize::MAX);
    }

    /// Waits for a wake, consuming the flag.
    pub(crate) async fn wait(&self) {
        loop {
            if self.flag.swap(false, Ordering::AcqRel) {
                return;
            }
            let listener = self.event.listen();
            if self.flag.swap(false, Ordering::AcqRel) {
                return;
            }
            listener.await;
        }
    }
}
