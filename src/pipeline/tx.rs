//! Transmit path: packet fragmenter and socket writer.

use std::sync::{Arc, atomic::Ordering};

use tokio::{io::AsyncWriteExt, net::tcp::OwnedWriteHalf, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::Shared;
use crate::{
    action::ActionCell,
    protocol::{BTU, MCTP_VERSION, PacketSlot, PktSeq},
};

/// Packet writer stage: fragments one action's outbound message into
/// BTU-sized packets chained onto the action in send order.
///
/// The message to send is the response when one is attached (server side),
/// otherwise the request. The SOM packet carries the message-type byte as
/// its first payload byte followed by payload bytes `0..63`; packet `i > 0`
/// carries bytes `64i−1..64i+63`. The packet sequence advances modulo 4
/// across messages, matching what the peer's reassembler expects.
pub(crate) async fn packet_writer(shared: Arc<Shared>) {
    debug!("Packet writer up");
    let mut pkt_seq = PktSeq::new(0);

    loop {
        let Some(cell) = shared.queues.tmq.pop().await else {
            break;
        };

        // Packet count from a short peek; slots are then acquired without
        // the action lock held, since pool acquisition can wait.
        let num_pkts = {
            let action = cell.lock();
            match action.response.as_ref().or(action.request.as_ref()) {
                Some(msg) => msg.len().div_ceil(BTU).max(1),
                // Raced with retirement; nothing to send
                None => continue,
            }
        };

        let mut chain: Option<Box<PacketSlot>> = None;
        for _ in 0..num_pkts {
            let Some(mut slot) = shared.pools.pkts.acquire().await else {
                release_chain(&shared, chain);
                debug!("Packet writer exiting on pool shutdown");
                return;
            };
            slot.next = chain;
            chain = Some(slot);
        }

        {
            let mut action = cell.lock();
            // A resubmission replaces the previous transmission's chain;
            // give those slots back before attaching the new ones.
            let old = action.chain.take();
            let Some(msg) = action.response.as_ref().or(action.request.as_ref()) else {
                drop(action);
                release_chain(&shared, chain);
                release_chain(&shared, old);
                continue;
            };

            let mut i = 0;
            let mut cursor = chain.as_deref_mut();
            while let Some(slot) = cursor {
                slot.pkt.hdr.version = MCTP_VERSION;
                slot.pkt.hdr.dest = msg.dst;
                slot.pkt.hdr.src = msg.src;
                slot.pkt.hdr.owner = msg.owner;
                slot.pkt.hdr.tag = msg.tag;
                slot.pkt.hdr.som = i == 0;
                slot.pkt.hdr.eom = i == num_pkts - 1;
                slot.pkt.hdr.seq = pkt_seq;
                pkt_seq.increment();

                if i == 0 {
                    slot.pkt.payload[0] = msg.msg_type;
                    msg.copy_range(0, &mut slot.pkt.payload[1..]);
                } else {
                    msg.copy_range(i * BTU - 1, &mut slot.pkt.payload);
                }

                i += 1;
                cursor = slot.next.as_deref_mut();
            }

            action.chain = chain;
            drop(action);
            release_chain(&shared, old);
        }

        shared.stats.tx_packets.fetch_add(num_pkts as u64, Ordering::Relaxed);
        shared.stats.tx_messages.fetch_add(1, Ordering::Relaxed);

        if shared.queues.tpq.try_push(cell).is_err() {
            warn!("Transmit packet queue rejected an action");
            if !shared.stop.is_stopping() {
                shared.abort();
            }
            break;
        }
    }
    debug!("Packet writer exiting");
}

fn release_chain(shared: &Shared, mut chain: Option<Box<PacketSlot>>) {
    while let Some(mut slot) = chain {
        chain = slot.next.take();
        shared.pools.pkts.release(slot);
    }
}

/// Socket writer stage: transmits the packets of one action contiguously.
///
/// On any send failure the action is marked failed and pushed to ACQ, and
/// the stage aborts the pipeline. After a successful send, an action
/// carrying a response is complete and goes to ACQ; a request stays in the
/// tag table awaiting its response.
pub(crate) async fn socket_writer(shared: Arc<Shared>, mut wr: OwnedWriteHalf, token: CancellationToken) {
    #[derive(PartialEq)]
    enum Outcome {
        Sent,
        Failed,
        Cancelled,
    }

    debug!("Socket writer up");
    loop {
        let Some(cell) = shared.queues.tpq.pop().await else {
            break;
        };

        // Detach the chain so no lock spans the sends; it is reattached
        // afterwards so retirement returns every slot to the pool.
        let chain = cell.lock().chain.take();

        let mut outcome = Outcome::Sent;
        let mut cursor = chain.as_deref();
        while let Some(slot) = cursor {
            let wire = slot.pkt.to_wire();
            let res = select! {
                res = wr.write_all(&wire) => res,
                _ = token.cancelled() => {
                    outcome = Outcome::Cancelled;
                    break;
                }
            };
            if let Err(err) = res {
                warn!(%err, "Socket write failed");
                outcome = Outcome::Failed;
                break;
            }
            trace!(seq = %slot.pkt.hdr.seq, tag = slot.pkt.hdr.tag, "Packet sent");
            cursor = slot.next.as_deref();
        }

        if outcome == Outcome::Cancelled {
            cell.lock().chain = chain;
            debug!("Socket writer cancelled");
            return;
        }

        let failed = outcome == Outcome::Failed;
        let is_response = {
            let mut action = cell.lock();
            action.chain = chain;
            action.completed = super::now();
            if failed {
                action.completion_code = 1;
            }
            action.response.is_some()
        };

        if failed {
            if shared.queues.acq.try_push(cell).is_err() {
                debug!("Completion queue rejected a failed action");
            }
            shared.abort();
            return;
        }

        // A response is complete once sent; a request awaits pairing
        if is_response && shared.queues.acq.try_push(cell).is_err() {
            warn!("Completion queue rejected a sent response");
            if !shared.stop.is_stopping() {
                shared.abort();
            }
            return;
        }
    }
    debug!("Socket writer exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        action::Action,
        pipeline::{Config, PKT_POOL_SIZE, Shared, signal::StopSignal},
        protocol::{MAX_PAYLOAD, msg_type, packet::chain_len},
    };

    fn test_shared() -> Arc<Shared> {
        let handlers = Arc::new(crate::handler::HandlerTable::new());
        let supported: Arc<[u8]> = Arc::from(handlers.registered_types().as_slice());
        Shared::new(
            Arc::new(Mutex::new(crate::state::EndpointState::new())),
            Arc::new(crate::ctrl::VersionTable::with_defaults()),
            handlers,
            supported,
            Config::default(),
            Arc::new(StopSignal::new()),
        )
    }

    async fn request_action(shared: &Shared, len: usize) -> ActionCell {
        let mut msg = shared.pools.msgs.acquire().await.unwrap();
        msg.dst = 0x02;
        msg.src = 0x01;
        msg.owner = true;
        msg.tag = 4;
        msg.msg_type = msg_type::CXL_FMAPI;
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        msg.set_payload(&payload).unwrap();

        let cell = shared.pools.actions.acquire().await.unwrap();
        cell.lock().request = Some(msg);
        cell
    }

    /// Runs the fragmenter over a single queued action and returns it.
    async fn fragment_one(shared: &Arc<Shared>, cell: ActionCell) -> ActionCell {
        shared.queues.tmq.try_push(cell).unwrap();
        let task = tokio::spawn(packet_writer(shared.clone()));
        let cell = tokio::time::timeout(std::time::Duration::from_secs(3), shared.queues.tpq.pop())
            .await
            .unwrap()
            .unwrap();
        shared.queues.tmq.shutdown();
        task.await.unwrap();
        cell
    }

    fn collect_chain(cell: &ActionCell) -> Vec<crate::protocol::Packet> {
        let action = cell.lock();
        let mut packets = vec![];
        let mut cursor = action.chain.as_deref();
        while let Some(slot) = cursor {
            packets.push(slot.pkt);
            cursor = slot.next.as_deref();
        }
        packets
    }

    #[tokio::test]
    async fn test_single_packet_fragmentation() {
        let shared = test_shared();
        let cell = request_action(&shared, 1).await;
        let cell = fragment_one(&shared, cell).await;

        let packets = collect_chain(&cell);
        assert_eq!(packets.len(), 1);
        let pkt = packets[0];
        assert!(pkt.hdr.som);
        assert!(pkt.hdr.eom);
        assert_eq!(pkt.hdr.seq, PktSeq::new(0));
        assert_eq!(pkt.hdr.tag, 4);
        assert!(pkt.hdr.owner);
        assert_eq!(pkt.payload[0], msg_type::CXL_FMAPI);
        assert_eq!(pkt.payload[1], 0);
    }

    #[tokio::test]
    async fn test_packet_count_boundaries() {
        // One BTU still fits one packet; one byte more takes two
        for (len, expected) in [(1, 1), (BTU, 1), (BTU + 1, 2), (MAX_PAYLOAD, 128)] {
            let shared = test_shared();
            let cell = request_action(&shared, len).await;
            let cell = fragment_one(&shared, cell).await;
            let packets = collect_chain(&cell);
            assert_eq!(packets.len(), expected, "len {len}");
            assert!(packets[0].hdr.som);
            assert!(packets[expected - 1].hdr.eom);
            for (i, pkt) in packets.iter().enumerate() {
                assert_eq!(pkt.hdr.seq, PktSeq::new(i as u8), "len {len} pkt {i}");
                assert_eq!(pkt.hdr.som, i == 0);
                assert_eq!(pkt.hdr.eom, i == expected - 1);
            }
        }
    }

    #[tokio::test]
    async fn test_fragment_payload_layout() {
        let shared = test_shared();
        let cell = request_action(&shared, BTU + 10).await;
        let cell = fragment_one(&shared, cell).await;
        let packets = collect_chain(&cell);
        assert_eq!(packets.len(), 2);

        // SOM: type byte then payload 0..63
        assert_eq!(packets[0].payload[0], msg_type::CXL_FMAPI);
        for i in 0..BTU - 1 {
            assert_eq!(packets[0].payload[1 + i], i as u8);
        }
        // Continuation: payload 63..127, zero-filled past the end
        for i in 0..11 {
            assert_eq!(packets[1].payload[i], (BTU - 1 + i) as u8);
        }
        assert!(packets[1].payload[11..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_sequence_continues_across_messages() {
        let shared = test_shared();

        let first = request_action(&shared, 1).await;
        shared.queues.tmq.try_push(first).unwrap();
        let second = request_action(&shared, 1).await;
        shared.queues.tmq.try_push(second).unwrap();

        let task = tokio::spawn(packet_writer(shared.clone()));
        let a = shared.queues.tpq.pop().await.unwrap();
        let b = shared.queues.tpq.pop().await.unwrap();
        shared.queues.tmq.shutdown();
        task.await.unwrap();

        assert_eq!(collect_chain(&a)[0].hdr.seq, PktSeq::new(0));
        assert_eq!(collect_chain(&b)[0].hdr.seq, PktSeq::new(1));
    }

    #[tokio::test]
    async fn test_resubmission_returns_previous_chain() {
        let shared = test_shared();
        let cell = request_action(&shared, MAX_PAYLOAD).await;
        let cell = fragment_one(&shared, cell).await;
        assert_eq!(chain_len(&cell.lock().chain), 128);
        assert_eq!(shared.pools.pkts.available(), PKT_POOL_SIZE - 128);

        // Second pass over the same action must not leak the first chain
        shared.queues.tmq.try_push(cell).unwrap();
        let task = tokio::spawn(packet_writer(shared.clone()));
        let cell = shared.queues.tpq.pop().await.unwrap();
        shared.queues.tmq.shutdown();
        task.await.unwrap();

        assert_eq!(chain_len(&cell.lock().chain), 128);
        assert_eq!(shared.pools.pkts.available(), PKT_POOL_SIZE - 128);
    }

    #[tokio::test]
    async fn test_fragment_reassemble_round_trip() {
        use crate::pipeline::rx::{Reassembler, Step};

        // Lengths of the form 63 + 64k reassemble to the exact length;
        // everything else reassembles to the next full unit with a zero tail
        for len in [1usize, 63, 64, 65, 127, 3000, MAX_PAYLOAD] {
            let shared = test_shared();
            let cell = request_action(&shared, len).await;
            let cell = fragment_one(&shared, cell).await;

            // Walk the chain through a fresh reassembler in send order
            let mut reassembler = Reassembler::new();
            let mut chain = cell.lock().chain.take();
            while let Some(mut slot) = chain {
                chain = slot.next.take();
                assert_eq!(reassembler.ingest(slot, &shared).await, Step::Continue);
            }

            let msg = shared.queues.rmq.try_pop().unwrap();
            assert_eq!(msg.msg_type, msg_type::CXL_FMAPI, "len {len}");
            assert_eq!(msg.tag, 4);
            assert!(msg.owner);
            assert_eq!(msg.dst, 0x02);
            assert_eq!(msg.src, 0x01);

            // Payload prefix identity up to the transmitted byte count
            let sent = len.min(msg.len());
            let expected: Vec<u8> = (0..sent).map(|i| i as u8).collect();
            assert_eq!(&msg.payload()[..sent], &expected[..], "len {len}");
            // The tail past the original payload is zero fill
            assert!(msg.payload()[sent..].iter().all(|&b| b == 0), "len {len}");
        }
    }

    #[tokio::test]
    async fn test_retired_action_skipped() {
        let shared = test_shared();
        let cell: ActionCell = Arc::new(Mutex::new(Action::default()));
        shared.queues.tmq.try_push(cell).unwrap();
        shared.queues.tmq.shutdown();

        // No request or response attached: nothing reaches TPQ
        packet_writer(shared.clone()).await;
        assert!(shared.queues.tpq.try_pop().is_none());
        assert_eq!(shared.pools.pkts.available(), PKT_POOL_SIZE);
    }
}
