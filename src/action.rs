//! In-flight submissions.
//!
//! An [`Action`] tracks one outbound request through its whole lifecycle:
//! waiting for a tag, fragmentation, transmission, timed retransmission, and
//! finally pairing with a response or failing. The caller observes the
//! lifecycle through an [`ActionHandle`], a one-shot completion handle
//! resolved exactly once by the pipeline.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    pipeline::Pools,
    protocol::{MessageBuf, PacketSlot},
};

/// Default total number of transmission attempts for [`Retry::Default`].
pub const DEFAULT_RETRY_MAX: u32 = 8;

/// Retransmission policy of a submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Retry {
    /// The default policy: up to [`DEFAULT_RETRY_MAX`] transmissions in
    /// total.
    #[default]
    Default,
    /// Retransmit until a response arrives or the pipeline shuts down.
    Forever,
    /// `n` retransmissions after the initial transmission (`n + 1`
    /// transmissions in total).
    Count(u32),
}

impl Retry {
    /// Total transmission cap, or `None` for forever.
    pub(crate) fn max(self) -> Option<u32> {
        match self {
            Retry::Default => Some(DEFAULT_RETRY_MAX),
            Retry::Forever => None,
            Retry::Count(n) => Some(n.saturating_add(1)),
        }
    }
}

/// Why an action did not complete.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Every transmission attempt timed out without a paired response.
    #[error("No response after {attempts} transmission attempts")]
    Exhausted {
        /// Number of transmissions performed.
        attempts: u32,
    },

    /// The connection failed while the action was being transmitted.
    #[error("Transport failure while transmitting")]
    Transport,

    /// The pipeline shut down while the action was in flight.
    #[error("Pipeline shut down while the action was in flight")]
    Shutdown,

    /// The caller-supplied wait deadline expired. The action itself may
    /// still complete or exhaust in the background.
    #[error("Deadline expired while waiting for completion")]
    Deadline,
}

/// A paired response, delivered through the action's completion handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Message-type code of the response.
    pub msg_type: u8,
    /// Source EID of the response.
    pub src: u8,
    /// Destination EID of the response.
    pub dst: u8,
    /// Response payload.
    pub payload: Vec<u8>,
    /// Number of transmissions it took.
    pub attempts: u32,
    /// Time from submission to response pairing.
    pub elapsed: Duration,
}

pub(crate) type ActionResult = Result<Completion, ActionError>;

/// Awaitable completion handle returned by `submit`.
///
/// Dropping the handle detaches it; the action still runs to completion or
/// exhaustion in the background.
#[derive(Debug)]
pub struct ActionHandle {
    rx: oneshot::Receiver<ActionResult>,
}

impl ActionHandle {
    /// Waits for the action to complete or fail.
    pub async fn completed(self) -> Result<Completion, ActionError> {
        match self.rx.await {
            Ok(result) => result,
            // Sender dropped without resolving: the pipeline went away.
            Err(_) => Err(ActionError::Shutdown),
        }
    }

    /// Waits for the action with a deadline, the await-based rendering of a
    /// submit-and-pend call.
    pub async fn completed_within(self, deadline: Duration) -> Result<Completion, ActionError> {
        match tokio::time::timeout(deadline, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ActionError::Shutdown),
            Err(_) => Err(ActionError::Deadline),
        }
    }
}

/// Shared handle to one in-flight action.
///
/// The tag table and the transmit queues reference the same action while it
/// is in flight; the mutex serializes the scheduler, fragmenter, socket
/// writer, and dispatcher. No action lock is ever held across an await, and
/// the only nested acquisition order is tag table, then action.
pub(crate) type ActionCell = Arc<Mutex<Action>>;

/// One submitted request and its lifecycle state.
#[derive(Debug, Default)]
pub(crate) struct Action {
    /// Set when the action is handed to the pipeline, cleared by retire.
    /// An action can be referenced from the tag table and a transmit queue
    /// at once, so retirement must be idempotent.
    pub(crate) valid: bool,
    /// The request message. Owned by the action from submit until retire.
    pub(crate) request: Option<Box<MessageBuf>>,
    /// The paired (or locally built) response message.
    pub(crate) response: Option<Box<MessageBuf>>,
    /// Outbound packets of the most recent transmission, in send order.
    pub(crate) chain: Option<Box<PacketSlot>>,

    /// When the action was created.
    pub(crate) created: Duration,
    /// When the action was last handed to the fragmenter.
    pub(crate) submitted: Duration,
    /// When the action completed (response paired or chain sent).
    pub(crate) completed: Duration,

    /// 0 on success; non-zero marks a transport failure.
    pub(crate) completion_code: u32,
    /// Transmissions performed so far.
    pub(crate) num: u32,
    /// Total transmission cap; `None` retries forever.
    pub(crate) max: Option<u32>,

    /// One-shot completion handle, if the submitter kept one.
    pub(crate) reply: Option<oneshot::Sender<ActionResult>>,
}

impl Action {
    /// Whether the transmission cap has been reached.
    pub(crate) fn exhausted(&self) -> bool {
        match self.max {
            Some(max) => self.num >= max,
            None => false,
        }
    }

    /// Creates the one-shot completion pair and attaches the sender.
    pub(crate) fn attach_handle(&mut self) -> ActionHandle {
        let (tx, rx) = oneshot::channel();
        self.reply = Some(tx);
        ActionHandle { rx }
    }

    /// Resolves the completion handle, if any, with `result`.
    pub(crate) fn resolve(&mut self, result: ActionResult) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(result);
        }
    }

    /// Builds the [`Completion`] for the currently attached response.
    pub(crate) fn completion(&self) -> Option<Completion> {
        let rsp = self.response.as_ref()?;
        Some(Completion {
            msg_type: rsp.msg_type,
            src: rsp.src,
            dst: rsp.dst,
            payload: rsp.payload().to_vec(),
            attempts: self.num,
            elapsed: self.completed.saturating_sub(self.created),
        })
    }

    fn reset(&mut self) {
        debug_assert!(self.request.is_none() && self.response.is_none() && self.chain.is_none());
        *self = Action::default();
    }
}

impl crate::pipeline::queue::Recycle for ActionCell {
    fn recycle(&mut self) {
        self.lock().reset();
    }
}

/// Returns an action's messages, packet chain, and the action itself to
/// their pools, leaving the action zeroed.
///
/// Idempotent: only the caller that observes `valid` set performs the
/// release, so an action referenced from both the tag table and a transmit
/// queue is retired exactly once. A pending completion handle is dropped,
/// which resolves the caller side with a shutdown error; failure paths that
/// owe the caller a more precise error resolve it before retiring.
pub(crate) fn retire(pools: &Pools, cell: ActionCell) {
    {
        let mut action = cell.lock();
        if !action.valid {
            return;
        }
        action.valid = false;
        if let Some(req) = action.request.take() {
            pools.msgs.release(req);
        }
        if let Some(rsp) = action.response.take() {
            pools.msgs.release(rsp);
        }
        let mut next = action.chain.take();
        while let Some(mut slot) = next {
            next = slot.next.take();
            pools.pkts.release(slot);
        }
    }
    pools.actions.release(cell);
}

/// Resolves the action's handle with `err`, then retires it.
pub(crate) fn fail(pools: &Pools, cell: ActionCell, err: ActionError) {
    cell.lock().resolve(Err(err));
    retire(pools, cell);
}
