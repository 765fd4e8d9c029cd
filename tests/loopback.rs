//! End-to-end scenarios over real TCP loopback connections.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use mctp_stream::{
    ActionError, Endpoint, Handler, HandlerCx, MessageBuf, Reply, Retry, Submission, ctrl,
    protocol::{PKT_LEN, msg_type},
};
use tokio::{io::AsyncReadExt, net::TcpListener, time::timeout};

const TIMEOUT: Duration = Duration::from_secs(5);

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Starts a server (optionally decorated) and a client connected to it.
async fn start_pair(
    decorate: impl FnOnce(mctp_stream::EndpointBuilder) -> mctp_stream::EndpointBuilder,
) -> (Endpoint, Endpoint) {
    init_tracing();
    let server = decorate(mctp_stream::server(localhost())).build();
    server.run().await.unwrap();
    let addr = server.local_addr().unwrap();

    let client = mctp_stream::client(addr).build();
    client.run().await.unwrap();
    (server, client)
}

struct Echo;

impl Handler for Echo {
    fn handle(&self, _cx: &HandlerCx<'_>, request: &MessageBuf, reply: &mut MessageBuf) -> Reply {
        reply.set_payload(request.payload()).unwrap();
        Reply::Send
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_then_get_endpoint_id() {
    let (server, client) = start_pair(|b| b).await;

    // Assign EID 0x02; the server has none yet, so the directly addressed
    // assignment is accepted
    let completion = timeout(
        TIMEOUT,
        client.submit_wait(
            Submission::new(msg_type::CONTROL, &ctrl::set_eid_request(0x02))
                .dst(0x02)
                .src(0x01),
            TIMEOUT,
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(completion.msg_type, msg_type::CONTROL);
    assert_eq!(completion.src, 0x02);
    assert_eq!(completion.dst, 0x01);
    let (hdr, body) = ctrl::split_payload(&completion.payload).unwrap();
    assert!(!hdr.request);
    let rsp = ctrl::SetEidResponse::decode(body).unwrap();
    assert_eq!(rsp.completion_code, ctrl::cc::SUCCESS);
    assert_eq!(rsp.assignment, ctrl::assignment::ACCEPTED);
    assert_eq!(rsp.eid, 0x02);

    let state = server.state();
    assert_eq!(state.eid, 0x02);
    assert_eq!(state.bus_owner_eid, 0x01);

    // Read the assignment back
    let completion = timeout(
        TIMEOUT,
        client.submit_wait(
            Submission::new(msg_type::CONTROL, &ctrl::get_eid_request())
                .dst(0x02)
                .src(0x01),
            TIMEOUT,
        ),
    )
    .await
    .unwrap()
    .unwrap();

    let (_, body) = ctrl::split_payload(&completion.payload).unwrap();
    let rsp = ctrl::GetEidResponse::decode(body).unwrap();
    assert_eq!(rsp.completion_code, ctrl::cc::SUCCESS);
    assert_eq!(rsp.eid, 0x02);
    assert_eq!(rsp.endpoint_type, ctrl::endpoint_type::SIMPLE);
    assert_eq!(rsp.id_type, ctrl::id_type::DYNAMIC);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_endpoint_uuid() {
    let (server, client) = start_pair(|b| b).await;

    let completion = client
        .submit_wait(
            Submission::new(msg_type::CONTROL, &ctrl::get_uuid_request()).src(0x01),
            TIMEOUT,
        )
        .await
        .unwrap();

    let (_, body) = ctrl::split_payload(&completion.payload).unwrap();
    let (code, uuid) = ctrl::parse_uuid_response(body).unwrap();
    assert_eq!(code, ctrl::cc::SUCCESS);
    assert_eq!(&uuid, server.state().uuid.as_bytes());

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn version_and_type_support() {
    let (server, client) = start_pair(|b| {
        b.handler(msg_type::CXL_FMAPI, Arc::new(Echo))
            .handler(msg_type::CXL_CCI, Arc::new(Echo))
    })
    .await;

    // The DSP0236 base version is advertised by default
    let completion = client
        .submit_wait(
            Submission::new(msg_type::CONTROL, &ctrl::get_version_request(msg_type::BASE)).src(0x01),
            TIMEOUT,
        )
        .await
        .unwrap();
    let (_, body) = ctrl::split_payload(&completion.payload).unwrap();
    let (code, versions) = ctrl::parse_version_response(body).unwrap();
    assert_eq!(code, ctrl::cc::SUCCESS);
    assert_eq!(versions, vec![ctrl::Version::new(0xF1, 0xF3, 0xF1, 0x00)]);

    // An unregistered type answers with the command-specific failure code
    let completion = client
        .submit_wait(
            Submission::new(msg_type::CONTROL, &ctrl::get_version_request(msg_type::SPDM)).src(0x01),
            TIMEOUT,
        )
        .await
        .unwrap();
    let (_, body) = ctrl::split_payload(&completion.payload).unwrap();
    let (code, _) = ctrl::parse_version_response(body).unwrap();
    assert_eq!(code, ctrl::cc::UNSUPPORTED_TYPE);

    // Message-type support reflects the registered handlers
    let completion = client
        .submit_wait(
            Submission::new(msg_type::CONTROL, &ctrl::get_message_types_request()).src(0x01),
            TIMEOUT,
        )
        .await
        .unwrap();
    let (_, body) = ctrl::split_payload(&completion.payload).unwrap();
    let (code, types) = ctrl::parse_message_types_response(body).unwrap();
    assert_eq!(code, ctrl::cc::SUCCESS);
    assert_eq!(types, vec![msg_type::CXL_FMAPI, msg_type::CXL_CCI]);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fragmented_echo_round_trip() {
    let (server, client) = start_pair(|b| b.handler(msg_type::PLDM, Arc::new(Echo))).await;

    // 3000 bytes take 47 packets each way, wrapping the packet sequence
    // many times
    use rand::Rng;
    let mut rng = rand::rng();
    let payload: Vec<u8> = (0..3000).map(|_| rng.random::<u8>()).collect();
    let completion = timeout(
        TIMEOUT,
        client.submit_wait(
            Submission::new(msg_type::PLDM, &payload).dst(0x00).src(0x01),
            TIMEOUT,
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(completion.msg_type, msg_type::PLDM);
    // Reassembly restores full 64-byte units; the original bytes form the
    // prefix of the echoed payload
    assert!(completion.payload.len() >= payload.len());
    assert_eq!(&completion.payload[..payload.len()], &payload[..]);

    let stats = client.stats().unwrap();
    assert!(stats.rx_messages >= 1);
    assert!(stats.tx_packets >= 47);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_exhaustion_against_mute_peer() {
    init_tracing();

    // A peer that accepts, reads every packet, and never answers
    let listener = TcpListener::bind(localhost()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let packets_seen = Arc::new(AtomicU32::new(0));
    let counter = packets_seen.clone();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut record = [0u8; PKT_LEN];
        while stream.read_exact(&mut record).await.is_ok() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    });

    let client = mctp_stream::client(addr).build();
    client.run().await.unwrap();

    let started = Instant::now();
    let err = timeout(
        TIMEOUT,
        client.submit_wait(
            Submission::new(msg_type::CONTROL, &ctrl::get_eid_request())
                .src(0x01)
                .retry(Retry::Count(2)),
            TIMEOUT,
        ),
    )
    .await
    .unwrap()
    .unwrap_err();

    // Initial transmission plus two retries, roughly one action timeout
    // apart, then failure
    match err {
        mctp_stream::SubmitError::Action(ActionError::Exhausted { attempts }) => {
            assert_eq!(attempts, 3);
        }
        other => panic!("Unexpected error: {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(250), "failed too early: {elapsed:?}");

    // Give the mute peer a moment to drain its socket, then check that all
    // three transmissions hit the wire
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(packets_seen.load(Ordering::Relaxed), 3);

    client.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_recycles_after_disconnect() {
    let (server, first) = start_pair(|b| b).await;

    let completion = first
        .submit_wait(
            Submission::new(msg_type::CONTROL, &ctrl::set_eid_request(0x07))
                .dst(0x07)
                .src(0x01),
            TIMEOUT,
        )
        .await
        .unwrap();
    let (_, body) = ctrl::split_payload(&completion.payload).unwrap();
    assert_eq!(ctrl::SetEidResponse::decode(body).unwrap().eid, 0x07);

    // Dropping the first client aborts the server's pipeline; the
    // supervisor recycles it for the next accept
    first.stop().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = mctp_stream::client(server.local_addr().unwrap()).build();
    second.run().await.unwrap();

    // EID assignment survives the reconnect
    let completion = second
        .submit_wait(
            Submission::new(msg_type::CONTROL, &ctrl::get_eid_request())
                .dst(0x07)
                .src(0x01),
            TIMEOUT,
        )
        .await
        .unwrap();
    let (_, body) = ctrl::split_payload(&completion.payload).unwrap();
    assert_eq!(ctrl::GetEidResponse::decode(body).unwrap().eid, 0x07);

    second.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unhandled_request_exhausts() {
    let (server, client) = start_pair(|b| b).await;

    // No PLDM handler registered on the server: requests go unanswered and
    // the action runs out of retries
    let err = timeout(
        TIMEOUT,
        client.submit_wait(
            Submission::new(msg_type::PLDM, &[1, 2, 3])
                .src(0x01)
                .retry(Retry::Count(0)),
            TIMEOUT,
        ),
    )
    .await
    .unwrap()
    .unwrap_err();

    match err {
        mctp_stream::SubmitError::Action(ActionError::Exhausted { attempts }) => {
            assert_eq!(attempts, 1);
        }
        other => panic!("Unexpected error: {other:?}"),
    }

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submit_validation() {
    let (server, client) = start_pair(|b| b).await;

    assert!(matches!(
        client.submit(Submission::new(msg_type::PLDM, &[])).await,
        Err(mctp_stream::SubmitError::EmptyPayload)
    ));

    let oversized = vec![0u8; mctp_stream::protocol::MAX_PAYLOAD + 1];
    assert!(matches!(
        client.submit(Submission::new(msg_type::PLDM, &oversized)).await,
        Err(mctp_stream::SubmitError::PayloadTooLarge(_))
    ));

    // A stopped endpoint refuses submissions
    client.stop().await;
    assert!(matches!(
        client.submit(Submission::new(msg_type::PLDM, &[1])).await,
        Err(mctp_stream::SubmitError::NotRunning)
    ));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn custom_dispatcher_pairs_responses() {
    use std::{future::Future, pin::Pin};

    use mctp_stream::{DispatchCx, Dispatcher};

    /// A dispatcher that only pairs responses and counts what it sees,
    /// standing in for a hand-rolled test client loop.
    struct Counting {
        seen: Arc<AtomicU32>,
    }

    impl Dispatcher for Counting {
        fn run(self: Arc<Self>, cx: DispatchCx) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async move {
                while let Some(msg) = cx.recv_message().await {
                    self.seen.fetch_add(1, Ordering::Relaxed);
                    if msg.owner {
                        cx.release_message(msg);
                    } else {
                        cx.pair_response(msg);
                    }
                }
            })
        }
    }

    init_tracing();
    let server = mctp_stream::server(localhost()).build();
    server.run().await.unwrap();

    let seen = Arc::new(AtomicU32::new(0));
    let client = mctp_stream::client(server.local_addr().unwrap())
        .dispatcher(Arc::new(Counting { seen: seen.clone() }))
        .build();
    client.run().await.unwrap();

    let completion = client
        .submit_wait(
            Submission::new(msg_type::CONTROL, &ctrl::get_uuid_request()).src(0x01),
            TIMEOUT,
        )
        .await
        .unwrap();
    let (_, body) = ctrl::split_payload(&completion.payload).unwrap();
    assert!(ctrl::parse_uuid_response(body).is_some());
    assert_eq!(seen.load(Ordering::Relaxed), 1);

    client.stop().await;
    server.stop().await;
}
