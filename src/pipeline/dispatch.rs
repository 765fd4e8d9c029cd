//! Message dispatch: inbound requests to handlers, inbound responses to
//! their in-flight actions.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, atomic::Ordering},
};

use tracing::{debug, trace};

use super::Shared;
use crate::{
    action,
    handler::{HandlerCx, Reply},
    protocol::MessageBuf,
};

/// The dispatcher stage body.
///
/// The endpoint installs [`DefaultDispatcher`] unless the builder was given
/// a replacement. A custom dispatcher owns the receive-message queue
/// wholesale, which is how test clients drive the pipeline by hand.
pub trait Dispatcher: Send + Sync + 'static {
    fn run(self: Arc<Self>, cx: DispatchCx) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Pipeline access handed to the dispatcher stage.
pub struct DispatchCx {
    shared: Arc<Shared>,
}

impl DispatchCx {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        DispatchCx { shared }
    }

    /// Pops the next fully reassembled message.
    ///
    /// Returns `None` once the pipeline is shutting down, which is the
    /// dispatcher's signal to exit.
    pub async fn recv_message(&self) -> Option<Box<MessageBuf>> {
        self.shared.queues.rmq.pop().await
    }

    /// Returns a message buffer to the pool.
    pub fn release_message(&self, msg: Box<MessageBuf>) {
        self.shared.pools.msgs.release(msg);
    }

    /// Pairs an inbound response with the in-flight action holding its tag.
    ///
    /// Returns `true` when an action was paired and completed. A stray
    /// response (no action in the tag table slot) is silently recycled and
    /// leaves every other tag untouched.
    pub fn pair_response(&self, msg: Box<MessageBuf>) -> bool {
        let shared = &self.shared;
        let tag = msg.tag;
        let Some(cell) = shared.tags.take(tag) else {
            trace!(tag, "Stray response, no action in flight");
            shared.pools.msgs.release(msg);
            return false;
        };

        let msg_type = msg.msg_type;
        let resolved = {
            let mut action = cell.lock();
            action.response = Some(msg);
            action.completed = super::now();
            match action.completion() {
                Some(completion) if action.reply.is_some() => {
                    action.resolve(Ok(completion));
                    true
                }
                _ => false,
            }
        };

        if !resolved {
            // No caller is awaiting this action; hand the response to the
            // type's handler before retiring.
            if let Some(handler) = shared.handlers.get(msg_type) {
                let cx = HandlerCx {
                    state: shared.state.as_ref(),
                    versions: shared.versions.as_ref(),
                    supported_types: shared.supported_types.as_ref(),
                };
                let action = cell.lock();
                if let Some(rsp) = action.response.as_ref() {
                    handler.on_response(&cx, rsp);
                }
            }
        }

        shared.stats.successful_actions.fetch_add(1, Ordering::Relaxed);
        action::retire(&shared.pools, cell);
        true
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

/// The stock dispatcher: requests through the handler table, responses
/// through the tag table.
pub(crate) struct DefaultDispatcher;

impl Dispatcher for DefaultDispatcher {
    fn run(self: Arc<Self>, cx: DispatchCx) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(dispatch_loop(cx))
    }
}

async fn dispatch_loop(cx: DispatchCx) {
    debug!("Dispatcher up");
    loop {
        let Some(msg) = cx.recv_message().await else {
            break;
        };
        if msg.owner {
            if !handle_request(&cx, msg).await {
                if !cx.shared().stop.is_stopping() {
                    cx.shared().abort();
                }
                break;
            }
        } else {
            cx.pair_response(msg);
        }
    }
    debug!("Dispatcher exiting");
}

/// Routes one inbound request. Returns `false` when the pipeline is
/// shutting down mid-route.
async fn handle_request(cx: &DispatchCx, msg: Box<MessageBuf>) -> bool {
    let shared = cx.shared();

    let Some(handler) = shared.handlers.get(msg.msg_type).cloned() else {
        trace!(msg_type = msg.msg_type, "No handler for message type, dropping");
        shared.pools.msgs.release(msg);
        return true;
    };

    let Some(cell) = shared.pools.actions.acquire().await else {
        shared.pools.msgs.release(msg);
        return false;
    };
    let Some(mut reply) = shared.pools.msgs.acquire().await else {
        shared.pools.msgs.release(msg);
        shared.pools.actions.release(cell);
        return false;
    };

    // Pre-fill the reply's transport header from the request: endpoints
    // swapped, same tag, tag-owner cleared. The handler may override any of
    // it.
    reply.dst = msg.src;
    reply.src = msg.dst;
    reply.owner = false;
    reply.tag = msg.tag;
    reply.msg_type = msg.msg_type;
    reply.ts = super::now();

    let handler_cx = HandlerCx {
        state: shared.state.as_ref(),
        versions: shared.versions.as_ref(),
        supported_types: shared.supported_types.as_ref(),
    };
    let verdict = handler.handle(&handler_cx, &msg, &mut reply);

    match verdict {
        Reply::Send => {
            {
                let mut action = cell.lock();
                action.valid = true;
                action.created = msg.ts;
                action.request = Some(msg);
                action.response = Some(reply);
            }
            if let Err(cell) = shared.queues.tmq.try_push(cell) {
                debug!("Transmit message queue full, response dropped");
                action::retire(&shared.pools, cell);
            }
        }
        Reply::Drop => {
            trace!(msg_type = msg.msg_type, "Handler dropped request");
            shared.pools.msgs.release(msg);
            shared.pools.msgs.release(reply);
            shared.pools.actions.release(cell);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        handler::{Handler, HandlerTable},
        pipeline::{ACTION_POOL_SIZE, Config, MSG_POOL_SIZE, signal::StopSignal},
        protocol::msg_type,
        state::EndpointState,
    };

    struct Echo;

    impl Handler for Echo {
        fn handle(&self, _cx: &HandlerCx<'_>, request: &MessageBuf, reply: &mut MessageBuf) -> Reply {
            reply.set_payload(request.payload()).unwrap();
            Reply::Send
        }
    }

    struct Mute;

    impl Handler for Mute {
        fn handle(&self, _cx: &HandlerCx<'_>, _request: &MessageBuf, _reply: &mut MessageBuf) -> Reply {
            Reply::Drop
        }
    }

    fn test_cx(handlers: HandlerTable) -> DispatchCx {
        let handlers = Arc::new(handlers);
        let supported: Arc<[u8]> = Arc::from(handlers.registered_types().as_slice());
        DispatchCx::new(Shared::new(
            Arc::new(Mutex::new(EndpointState::new())),
            Arc::new(crate::ctrl::VersionTable::with_defaults()),
            handlers,
            supported,
            Config::default(),
            Arc::new(StopSignal::new()),
        ))
    }

    async fn inbound(cx: &DispatchCx, owner: bool, tag: u8, msg_type: u8, payload: &[u8]) -> Box<MessageBuf> {
        let mut msg = cx.shared().pools.msgs.acquire().await.unwrap();
        msg.dst = 0x02;
        msg.src = 0x01;
        msg.owner = owner;
        msg.tag = tag;
        msg.msg_type = msg_type;
        msg.set_payload(payload).unwrap();
        msg
    }

    #[tokio::test]
    async fn test_request_routed_to_handler() {
        let mut handlers = HandlerTable::new();
        handlers.set(msg_type::PLDM, Arc::new(Echo));
        let cx = test_cx(handlers);

        let msg = inbound(&cx, true, 3, msg_type::PLDM, &[1, 2, 3]).await;
        assert!(handle_request(&cx, msg).await);

        let cell = cx.shared().queues.tmq.try_pop().unwrap();
        let action = cell.lock();
        let rsp = action.response.as_ref().unwrap();
        // Reply header swapped and tagged like the request
        assert_eq!(rsp.dst, 0x01);
        assert_eq!(rsp.src, 0x02);
        assert!(!rsp.owner);
        assert_eq!(rsp.tag, 3);
        assert_eq!(rsp.payload(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unhandled_type_dropped() {
        let cx = test_cx(HandlerTable::new());
        let msg = inbound(&cx, true, 0, msg_type::SPDM, &[0xAA]).await;
        assert!(handle_request(&cx, msg).await);

        assert!(cx.shared().queues.tmq.try_pop().is_none());
        // Message and nothing else returned to the pools
        assert_eq!(cx.shared().pools.msgs.available(), MSG_POOL_SIZE);
        assert_eq!(cx.shared().pools.actions.available(), ACTION_POOL_SIZE);
    }

    #[tokio::test]
    async fn test_handler_drop_recycles_everything() {
        let mut handlers = HandlerTable::new();
        handlers.set(msg_type::PLDM, Arc::new(Mute));
        let cx = test_cx(handlers);

        let msg = inbound(&cx, true, 0, msg_type::PLDM, &[0xAA]).await;
        assert!(handle_request(&cx, msg).await);

        assert!(cx.shared().queues.tmq.try_pop().is_none());
        assert_eq!(cx.shared().pools.msgs.available(), MSG_POOL_SIZE);
        assert_eq!(cx.shared().pools.actions.available(), ACTION_POOL_SIZE);
    }

    #[tokio::test]
    async fn test_response_pairs_with_action() {
        let cx = test_cx(HandlerTable::new());
        let shared = cx.shared();

        // Plant an in-flight action on tag 2 with a completion handle
        let cell = shared.pools.actions.acquire().await.unwrap();
        let handle = {
            let mut req = shared.pools.msgs.acquire().await.unwrap();
            req.owner = true;
            req.tag = 2;
            let mut action = cell.lock();
            action.valid = true;
            action.request = Some(req);
            action.num = 1;
            action.max = Some(8);
            action.attach_handle()
        };
        shared.tags.put(2, cell);

        let rsp = inbound(&cx, false, 2, msg_type::PLDM, &[9, 9]).await;
        assert!(cx.pair_response(rsp));

        let completion = handle.completed().await.unwrap();
        assert_eq!(completion.payload, vec![9, 9]);
        assert_eq!(completion.attempts, 1);

        // Tag slot cleared, everything recycled
        assert!(shared.tags.take(2).is_none());
        assert_eq!(shared.pools.msgs.available(), MSG_POOL_SIZE);
        assert_eq!(shared.pools.actions.available(), ACTION_POOL_SIZE);
        assert_eq!(shared.stats.snapshot().successful_actions, 1);
    }

    #[tokio::test]
    async fn test_stray_response_recycled() {
        let cx = test_cx(HandlerTable::new());

        // Plant an unrelated action on tag 1; the stray targets tag 4
        let cell = cx.shared().pools.actions.acquire().await.unwrap();
        cx.shared().tags.put(1, cell);

        let stray = inbound(&cx, false, 4, msg_type::PLDM, &[1]).await;
        assert!(!cx.pair_response(stray));

        // The unrelated tag is untouched
        assert!(cx.shared().tags.take(1).is_some());
        assert_eq!(cx.shared().pools.msgs.available(), MSG_POOL_SIZE);
    }

    #[tokio::test]
    async fn test_detached_response_goes_to_handler_hook() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct Observer(Arc<AtomicU32>);

        impl Handler for Observer {
            fn handle(&self, _cx: &HandlerCx<'_>, _req: &MessageBuf, _reply: &mut MessageBuf) -> Reply {
                Reply::Drop
            }
            fn on_response(&self, _cx: &HandlerCx<'_>, response: &MessageBuf) {
                self.0.store(response.payload()[0] as u32, Ordering::Relaxed);
            }
        }

        let seen = Arc::new(AtomicU32::new(0));
        let mut handlers = HandlerTable::new();
        handlers.set(msg_type::PLDM, Arc::new(Observer(seen.clone())));
        let cx = test_cx(handlers);

        // In-flight action without a completion handle
        let cell: crate::action::ActionCell = cx.shared().pools.actions.acquire().await.unwrap();
        {
            let mut req = cx.shared().pools.msgs.acquire().await.unwrap();
            req.owner = true;
            req.tag = 0;
            let mut action = cell.lock();
            action.valid = true;
            action.request = Some(req);
            action.num = 1;
        }
        cx.shared().tags.put(0, cell);

        let rsp = inbound(&cx, false, 0, msg_type::PLDM, &[42]).await;
        assert!(cx.pair_response(rsp));
        assert_eq!(seen.load(Ordering::Relaxed), 42);
    }
}
