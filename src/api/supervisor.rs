use std::sync::Arc;

use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Mode, endpoint::EndpointInner};
use crate::{
    action::{self, ActionError},
    pipeline::{self, Shared, signal::StopReason},
};

/// Connection supervisor.
///
/// Per connection: construct fresh queues and pools, signal readiness (first
/// pass only), obtain a connection (accept in server mode, the
/// already-connected stream in client mode), start the seven stages, then
/// park until a stop is requested or a stage reports a transport failure.
/// Teardown unblocks the socket stages, closes every queue so the stage
/// pops drain and return, joins the stages in order, and settles whatever
/// actions were still in flight. A server recycles the pipeline and
/// re-accepts after an abnormal exit; an orderly stop ends the loop.
pub(super) async fn supervise(
    inner: Arc<EndpointInner>,
    listener: Option<TcpListener>,
    mut first_stream: Option<TcpStream>,
    started_tx: oneshot::Sender<()>,
) {
    let mut started_tx = Some(started_tx);

    loop {
        inner.stop.reset();
        let shared = Shared::new(
            inner.state.clone(),
            inner.versions.clone(),
            inner.handlers.clone(),
            inner.supported_types.clone(),
            inner.config,
            inner.stop.clone(),
        );
        *inner.current.lock() = Some(shared.clone());

        // Queues and pools exist: the endpoint is ready for submissions
        if let Some(tx) = started_tx.take() {
            let _ = tx.send(());
        }

        let stream = if let Some(listener) = &listener {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        info!(%peer, "Accepted connection");
                        stream
                    }
                    Err(err) => {
                        warn!(%err, "Accept failed");
                        break;
                    }
                },
                _ = inner.stop.wait() => break,
            }
        } else if let Some(stream) = first_stream.take() {
            stream
        } else {
            // Client mode after a lost connection: no reconnect
            break;
        };

        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();

        let token = CancellationToken::new();
        let stages = pipeline::start_stages(&shared, rd, wr, &token, inner.dispatcher.clone());
        debug!("Pipeline stages started");

        let reason = inner.stop.wait().await;
        debug!(?reason, "Tearing the pipeline down");

        // Unblock the socket stages, close the queues so every pop drains
        // and returns, then join in stage order.
        token.cancel();
        shared.shutdown_queues();
        stages.join_all().await;
        settle_in_flight(&shared);
        *inner.current.lock() = None;

        match (inner.mode, reason) {
            // A dropped connection recycles the server pipeline
            (Mode::Server, StopReason::Aborted) => continue,
            _ => break,
        }
    }

    *inner.current.lock() = None;
    debug!("Supervisor exiting");
}

/// Retires every action the stages left behind so pending completion
/// handles resolve instead of dangling until their deadlines.
fn settle_in_flight(shared: &Shared) {
    for cell in shared.tags.drain() {
        action::fail(&shared.pools, cell, ActionError::Shutdown);
    }
    for queue in [
        &shared.queues.taq,
        &shared.queues.tmq,
        &shared.queues.tpq,
        &shared.queues.acq,
    ] {
        while let Some(cell) = queue.try_pop() {
            action::fail(&shared.pools, cell, ActionError::Shutdown);
        }
    }
}
