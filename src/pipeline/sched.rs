//! Tag table and the submission/retry scheduler.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use super::Shared;
use crate::{
    action::{self, ActionCell, ActionError},
    protocol::NUM_TAGS,
};

/// The 8-slot table of in-flight actions, indexed by tag value.
///
/// Shared by the scheduler (assignment, sweep) and the dispatcher (response
/// pairing) under a single mutex. A slot is reassigned only when it is
/// vacant: an action leaves its slot by pairing with a response, exhausting
/// its retries, or pipeline teardown.
pub(crate) struct TagTable {
    slots: Mutex<[Option<ActionCell>; NUM_TAGS]>,
}

impl TagTable {
    pub(crate) fn new() -> Self {
        TagTable {
            slots: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    pub(crate) fn slots(&self) -> MutexGuard<'_, [Option<ActionCell>; NUM_TAGS]> {
        self.slots.lock()
    }

    /// Takes the action holding `tag`, clearing the slot.
    pub(crate) fn take(&self, tag: u8) -> Option<ActionCell> {
        self.slots.lock()[(tag as usize) % NUM_TAGS].take()
    }

    /// Stores an action at `tag`. Callers must only fill vacant slots.
    pub(crate) fn put(&self, tag: u8, cell: ActionCell) {
        let mut slots = self.slots.lock();
        let slot = &mut slots[(tag as usize) % NUM_TAGS];
        debug_assert!(slot.is_none());
        *slot = Some(cell);
    }

    /// Empties the table for teardown.
    pub(crate) fn drain(&self) -> Vec<ActionCell> {
        self.slots.lock().iter_mut().filter_map(Option::take).collect()
    }
}

enum Sweep {
    Skip,
    Resubmit,
    Fail,
}

/// One scheduler pass: sweep, then promote, both under the tag-table lock.
///
/// Holding the lock across both phases keeps the observed slot state
/// consistent: response pairing cannot vacate a slot between the sweep
/// deciding about it and the promotion filling it.
///
/// Phase A sweeps the in-flight actions: an action whose deadline
/// (`submitted + action_delta`) has passed is either retransmitted (retries
/// remain; the slot is kept) or failed and vacated (cap reached).
///
/// Phase B promotes waiting submissions: each vacant slot takes the head of
/// TAQ, lowest tag value first, stamping the tag into the request.
pub(crate) fn sweep_and_promote(shared: &Shared, now: Duration) {
    let action_delta = shared.config.action_delta;
    let mut slots = shared.tags.slots();

    // Phase A: sweep in-flight actions
    for slot in slots.iter_mut() {
        let Some(cell) = slot.as_ref() else {
            continue;
        };
        let decision = {
            let mut action = cell.lock();
            if now < action.submitted + action_delta {
                Sweep::Skip
            } else if action.exhausted() {
                Sweep::Fail
            } else {
                action.num += 1;
                action.submitted = now;
                Sweep::Resubmit
            }
        };
        match decision {
            Sweep::Skip => {}
            Sweep::Resubmit => {
                trace!("Retransmitting action");
                // A full TMQ is not fatal: the slot stays claimed and the
                // next elapsed deadline tries again.
                let _ = shared.queues.tmq.try_push(cell.clone());
            }
            Sweep::Fail => {
                if let Some(cell) = slot.take() {
                    let attempts = cell.lock().num;
                    debug!(attempts, "Action exhausted its retries");
                    shared.stats.failed_actions.fetch_add(1, Ordering::Relaxed);
                    action::fail(&shared.pools, cell, ActionError::Exhausted { attempts });
                }
            }
        }
    }

    // Phase B: promote waiting submissions into vacant slots
    for (tag, slot) in slots.iter_mut().enumerate() {
        if slot.is_some() {
            continue;
        }
        let Some(cell) = shared.queues.taq.try_pop() else {
            continue;
        };
        {
            let mut action = cell.lock();
            action.num = 1;
            action.submitted = now;
            if let Some(request) = action.request.as_mut() {
                request.tag = tag as u8;
            }
        }
        trace!(tag, "Assigned tag to submission");
        let _ = shared.queues.tmq.try_push(cell.clone());
        *slot = Some(cell);
    }
}

/// Submission scheduler stage.
///
/// Runs a sweep-and-promote pass, then sleeps for the scheduler tick or
/// until a submit wakes it, whichever comes first.
pub(crate) async fn submission_scheduler(shared: Arc<Shared>) {
    debug!("Scheduler up");
    let tick = shared.config.sched_tick;
    loop {
        if shared.stop.is_stopping() {
            break;
        }
        sweep_and_promote(&shared, super::now());
        let _ = tokio::time::timeout(tick, shared.sched_wake.wait()).await;
    }
    debug!("Scheduler exiting");
}
