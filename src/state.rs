use uuid::Uuid;

use crate::protocol::eid;

/// Identity of the local MCTP endpoint.
///
/// The EID starts out unassigned (NULL) and is normally assigned by the bus
/// owner through the Set Endpoint ID control command, which also records who
/// the bus owner is. The UUID is generated once per endpoint and reported by
/// the Get Endpoint UUID control command.
#[derive(Clone, Debug)]
pub struct EndpointState {
    /// This endpoint's ID. `eid::NULL` until assigned.
    pub eid: u8,
    /// EID of the bus owner that assigned ours. `eid::NULL` until then.
    pub bus_owner_eid: u8,
    /// Endpoint UUID.
    pub uuid: Uuid,
}

impl EndpointState {
    pub(crate) fn new() -> Self {
        EndpointState {
            eid: eid::NULL,
            bus_owner_eid: eid::NULL,
            uuid: Uuid::new_v4(),
        }
    }

    /// Whether this endpoint has been assigned an EID yet.
    pub fn has_eid(&self) -> bool {
        self.eid != eid::NULL
    }
}
