//! Type-indexed message handlers.
//!
//! Inbound requests are routed through a 256-slot table indexed by the 7-bit
//! MCTP message-type code (the table is sized for the full byte so vendor
//! codes index directly). Each slot holds a [`Handler`]; requests of a type
//! with no handler are dropped.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::{ctrl::VersionTable, protocol::MessageBuf, state::EndpointState};

/// Verdict of a [`Handler`] invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Transmit the reply message the handler filled in.
    Send,
    /// Drop the request without replying; the reply buffer is recycled.
    Drop,
}

/// A message-type handler for inbound requests.
///
/// The dispatcher pre-fills the reply's transport header from the request
/// (destination and source swapped, tag copied, tag-owner cleared, type
/// copied) before calling [`handle`](Handler::handle); the handler fills the
/// reply payload, may override any header field, and decides whether the
/// reply is sent.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, cx: &HandlerCx<'_>, request: &MessageBuf, reply: &mut MessageBuf) -> Reply;

    /// Called when an inbound response pairs with an in-flight action whose
    /// submitter kept no completion handle. The default does nothing; the
    /// action is retired either way.
    fn on_response(&self, cx: &HandlerCx<'_>, response: &MessageBuf) {
        let _ = (cx, response);
    }
}

/// Endpoint context available to handlers.
pub struct HandlerCx<'a> {
    pub(crate) state: &'a Mutex<EndpointState>,
    pub(crate) versions: &'a VersionTable,
    pub(crate) supported_types: &'a [u8],
}

impl HandlerCx<'_> {
    /// Locks and returns the endpoint identity state.
    pub fn state(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock()
    }

    /// The supported-versions table.
    pub fn versions(&self) -> &VersionTable {
        self.versions
    }

    /// Message-type codes with a registered handler, the control type
    /// excluded. This is what Get Message Type Support advertises.
    pub fn supported_types(&self) -> &[u8] {
        self.supported_types
    }
}

/// The 256-slot handler table.
pub(crate) struct HandlerTable {
    slots: [Option<Arc<dyn Handler>>; 256],
}

impl HandlerTable {
    pub(crate) fn new() -> Self {
        HandlerTable {
            slots: std::array::from_fn(|_| None),
        }
    }

    pub(crate) fn set(&mut self, msg_type: u8, handler: Arc<dyn Handler>) {
        self.slots[msg_type as usize] = Some(handler);
    }

    pub(crate) fn get(&self, msg_type: u8) -> Option<&Arc<dyn Handler>> {
        self.slots[msg_type as usize].as_ref()
    }

    /// Codes with a registered handler, the control type excluded.
    pub(crate) fn registered_types(&self) -> Vec<u8> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, slot)| *i != crate::protocol::msg_type::CONTROL as usize && slot.is_some())
            .map(|(i, _)| i as u8)
            .collect()
    }
}
