//! Completion stage: drains the action-completion queue and settles each
//! action.

use std::sync::{Arc, atomic::Ordering};

use tracing::{debug, trace};

use super::Shared;
use crate::action::{self, ActionError};

/// Completion stage.
///
/// Actions arrive on ACQ from the socket writer: responses whose chain was
/// fully sent, and anything that hit a transport failure mid-send. A zero
/// completion code settles the action as successful; anything else resolves
/// its handle with a transport error. Either way the action and everything
/// it owns go back to their pools.
pub(crate) async fn completion(shared: Arc<Shared>) {
    debug!("Completion stage up");
    loop {
        let Some(cell) = shared.queues.acq.pop().await else {
            break;
        };
        shared.stats.completed_actions.fetch_add(1, Ordering::Relaxed);

        let failed = {
            let mut action = cell.lock();
            action.completed = super::now();
            action.completion_code != 0
        };

        if failed {
            shared.stats.failed_actions.fetch_add(1, Ordering::Relaxed);
            trace!("Action failed in transmission");
            action::fail(&shared.pools, cell, ActionError::Transport);
        } else {
            shared.stats.successful_actions.fetch_add(1, Ordering::Relaxed);
            // Sent-and-done actions (responses) rarely have a waiting
            // submitter, but settle the handle if one exists.
            {
                let mut action = cell.lock();
                if let Some(completion) = action.completion() {
                    action.resolve(Ok(completion));
                }
            }
            action::retire(&shared.pools, cell);
        }
    }
    debug!("Completion stage exiting");
}
