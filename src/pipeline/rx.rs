//! Receive path: socket reader and packet reassembler.

use std::sync::{Arc, atomic::Ordering};

use tokio::{io::AsyncReadExt, net::tcp::OwnedReadHalf, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::Shared;
use crate::protocol::{
    BTU, MCTP_VERSION, MessageBuf, NUM_TAGS, PKT_LEN, Packet, PacketSlot, PktSeq, TYPE_MASK,
};

/// Socket reader stage.
///
/// One fixed-size record per iteration: acquire a free packet slot, read
/// exactly 68 bytes, stamp the arrival time, push to RPQ. A full RPQ drops
/// the packet back into the pool and counts it; a failed or short read is
/// connection loss and aborts the pipeline.
pub(crate) async fn socket_reader(shared: Arc<Shared>, mut rd: OwnedReadHalf, token: CancellationToken) {
    debug!("Socket reader up");
    loop {
        let Some(mut slot) = shared.pools.pkts.acquire().await else {
            // Pool shut down: orderly teardown
            debug!("Socket reader exiting on pool shutdown");
            return;
        };

        let mut wire = [0u8; PKT_LEN];
        let read = select! {
            res = rd.read_exact(&mut wire) => res,
            _ = token.cancelled() => {
                shared.pools.pkts.release(slot);
                debug!("Socket reader cancelled");
                return;
            }
        };
        if let Err(err) = read {
            shared.pools.pkts.release(slot);
            warn!(%err, "Socket read failed, aborting pipeline");
            shared.abort();
            return;
        }

        slot.pkt = Packet::from_wire(&wire);
        slot.ts = super::now();
        shared.stats.rx_packets.fetch_add(1, Ordering::Relaxed);

        if let Err(slot) = shared.queues.rpq.try_push(slot) {
            shared.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            shared.pools.pkts.release(slot);
            trace!("Receive packet queue full, packet dropped");
        }

        if shared.stop.is_stopping() {
            return;
        }
    }
}

/// What the reassembler tells its driving stage after each packet.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    /// A downstream queue or pool shut down; the stage must exit.
    Exit,
}

/// Per-tag message reassembly state.
///
/// Owned exclusively by the packet reader stage. One in-process message per
/// tag; a single expected sequence counter spans all tags because packets of
/// one connection share the sequence space.
pub(crate) struct Reassembler {
    expected_seq: PktSeq,
    slots: [Option<Box<MessageBuf>>; NUM_TAGS],
}

impl Reassembler {
    pub(crate) fn new() -> Self {
        Reassembler {
            expected_seq: PktSeq::new(0),
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Consumes one packet from RPQ.
    ///
    /// Validation order and drop accounting:
    /// 1. header version must be 1 (`dropped_version`);
    /// 2. a sequence break invalidates the tag's partial message
    ///    (`dropped_seqnum`); a non-SOM packet is dropped, a SOM packet
    ///    resynchronizes the expected sequence and is kept;
    /// 3. a SOM with a message already in progress displaces the partial
    ///    (`dropped_noeom`);
    /// 4. a continuation with no message in progress is dropped
    ///    (`dropped_nosom`);
    /// 5. a tag-owner flip invalidates the partial and drops the packet
    ///    (`dropped_wrongto`).
    ///
    /// A SOM packet starts a fresh message (type byte stripped from the
    /// payload); continuations append a full BTU. The EOM packet completes
    /// the message and pushes it to RMQ. Every consumed packet, dropped or
    /// not, advances the expected sequence and returns its slot to the
    /// pool.
    pub(crate) async fn ingest(&mut self, slot: Box<PacketSlot>, shared: &Shared) -> Step {
        let hdr = slot.pkt.hdr;
        let tag = (hdr.tag as usize) % NUM_TAGS;

        'drop_pkt: {
            if hdr.version != MCTP_VERSION {
                shared.stats.dropped_version.fetch_add(1, Ordering::Relaxed);
                trace!(version = hdr.version, "Dropping packet with unsupported header version");
                break 'drop_pkt;
            }

            // A sequence mismatch means at least one packet was lost; any
            // message in progress on this tag is invalid.
            if self.expected_seq != hdr.seq {
                if let Some(partial) = self.slots[tag].take() {
                    shared.pools.msgs.release(partial);
                }
                shared.stats.dropped_seqnum.fetch_add(1, Ordering::Relaxed);
                trace!(
                    expected = %self.expected_seq,
                    got = %hdr.seq,
                    "Sequence break"
                );
                if !hdr.som {
                    break 'drop_pkt;
                }
                // A SOM is a valid fresh start: resynchronize to it
                self.expected_seq = hdr.seq;
            }

            // A second SOM means the previous message lost its EOM
            if hdr.som && self.slots[tag].is_some() {
                if let Some(partial) = self.slots[tag].take() {
                    shared.pools.msgs.release(partial);
                }
                shared.stats.dropped_noeom.fetch_add(1, Ordering::Relaxed);
                trace!(tag, "SOM displaced an unfinished message");
            }

            // A continuation needs a message in progress
            if !hdr.som && self.slots[tag].is_none() {
                shared.stats.dropped_nosom.fetch_add(1, Ordering::Relaxed);
                trace!(tag, "Continuation without SOM");
                break 'drop_pkt;
            }

            // The tag owner must not change mid-message
            if self.slots[tag].as_ref().is_some_and(|partial| partial.owner != hdr.owner) {
                if let Some(partial) = self.slots[tag].take() {
                    shared.pools.msgs.release(partial);
                }
                shared.stats.dropped_wrongto.fetch_add(1, Ordering::Relaxed);
                trace!(tag, "Tag owner changed mid-message");
                break 'drop_pkt;
            }

            if hdr.som {
                let Some(mut msg) = shared.pools.msgs.acquire().await else {
                    shared.pools.pkts.release(slot);
                    return Step::Exit;
                };
                msg.dst = hdr.dest;
                msg.src = hdr.src;
                msg.owner = hdr.owner;
                msg.tag = hdr.tag;
                msg.msg_type = slot.pkt.payload[0] & TYPE_MASK;
                msg.ts = slot.ts;
                // The SOM payload carries the type byte first, then 63 data
                // bytes; set_payload cannot overflow an empty message.
                let _ = msg.set_payload(&slot.pkt.payload[1..]);
                self.slots[tag] = Some(msg);
            } else if let Some(partial) = self.slots[tag].as_mut() {
                if partial.append(&slot.pkt.payload[..BTU]).is_err() {
                    if let Some(partial) = self.slots[tag].take() {
                        shared.pools.msgs.release(partial);
                    }
                    shared.stats.dropped_overrun.fetch_add(1, Ordering::Relaxed);
                    debug!(tag, "Message exceeded payload capacity");
                    break 'drop_pkt;
                }
            }

            if hdr.eom {
                if let Some(msg) = self.slots[tag].take() {
                    if let Err(msg) = shared.queues.rmq.try_push(msg) {
                        // RMQ full or shut down: the inbound path is broken
                        shared.pools.msgs.release(msg);
                        shared.pools.pkts.release(slot);
                        warn!("Receive message queue rejected a completed message");
                        return Step::Exit;
                    }
                    shared.stats.rx_messages.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.expected_seq.increment();
        shared.pools.pkts.release(slot);
        Step::Continue
    }

    /// Returns any in-process messages to the pool. Called at stage exit.
    pub(crate) fn release_partials(&mut self, shared: &Shared) {
        for slot in &mut self.slots {
            if let Some(partial) = slot.take() {
                shared.pools.msgs.release(partial);
            }
        }
    }
}

/// Packet reader stage: drives the reassembler from RPQ.
pub(crate) async fn packet_reader(shared: Arc<Shared>) {
    debug!("Packet reader up");
    let mut reassembler = Reassembler::new();
    loop {
        let Some(slot) = shared.queues.rpq.pop().await else {
            break;
        };
        if reassembler.ingest(slot, &shared).await == Step::Exit {
            if !shared.stop.is_stopping() {
                shared.abort();
            }
            break;
        }
    }
    reassembler.release_partials(&shared);
    debug!("Packet reader exiting");
}
