use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use codec::{
    Packet, RfcVariant,
    message::methods::{Method, MethodType},
};
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use turn_client::{
    Services,
    requester::{RequesterDelegate, StunRequester},
    settings::Settings,
};

struct Recorder {
    started: Instant,
    sends: Mutex<Vec<(Duration, SocketAddr)>>,
    timeouts: AtomicUsize,
    accept_responses: AtomicBool,
    responses: AtomicUsize,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            sends: Mutex::new(Vec::new()),
            timeouts: AtomicUsize::new(0),
            accept_responses: AtomicBool::new(true),
            responses: AtomicUsize::new(0),
        })
    }

    fn send_offsets(&self) -> Vec<Duration> {
        self.sends.lock().iter().map(|(at, _)| *at).collect()
    }
}

impl RequesterDelegate for Recorder {
    fn on_send_packet(&self, _: &Arc<StunRequester>, destination: SocketAddr, _: Bytes) {
        self.sends
            .lock()
            .push((self.started.elapsed(), destination));
    }

    fn handle_response(&self, _: &Arc<StunRequester>, _: SocketAddr, _: &Packet) -> bool {
        self.responses.fetch_add(1, Ordering::SeqCst);
        self.accept_responses.load(Ordering::SeqCst)
    }

    fn on_timed_out(&self, _: &Arc<StunRequester>) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }
}

fn server() -> SocketAddr {
    "1.2.3.4:3478".parse().unwrap()
}

#[tokio::test(start_paused = true)]
async fn backoff_schedule_and_single_timeout() {
    let services = Services::init(Settings::default());
    let recorder = Recorder::new();

    let requester = StunRequester::create(
        services.requesters(),
        recorder.clone(),
        server(),
        Packet::request(Method::Binding(MethodType::Request)),
        RfcVariant::Rfc5389,
        None,
        None,
    );

    // no response ever arrives; the whole schedule runs out.
    tokio::time::sleep(Duration::from_secs(60)).await;

    let offsets = recorder.send_offsets();
    let expected = [0u64, 500, 1500, 3500, 7500, 15500];
    assert_eq!(offsets.len(), expected.len());
    for (offset, expected) in offsets.iter().zip(expected) {
        let expected = Duration::from_millis(expected);
        let jitter = offset.abs_diff(expected);
        assert!(jitter <= Duration::from_millis(50), "jitter {:?}", jitter);
    }

    assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 1);
    assert!(requester.is_complete());
    assert_eq!(requester.total_tries(), 6);
    assert!(services.requesters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn first_valid_response_completes_the_transaction() {
    let services = Services::init(Settings::default());
    let recorder = Recorder::new();

    let request = Packet::request(Method::Binding(MethodType::Request));
    let transaction = request.transaction();

    let requester = StunRequester::create(
        services.requesters(),
        recorder.clone(),
        server(),
        request,
        RfcVariant::Rfc5389,
        None,
        None,
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(recorder.sends.lock().len(), 1);

    let response = Packet::new(Method::Binding(MethodType::Response), transaction);
    let mut buf = BytesMut::new();
    response
        .encode(RfcVariant::Rfc5389, None, false, &mut buf)
        .unwrap();

    assert!(
        services
            .requesters()
            .handle_packet(server(), &buf, &[RfcVariant::Rfc5389])
    );
    assert!(requester.is_complete());

    // a duplicate of the response finds no owner anymore.
    assert!(
        !services
            .requesters()
            .handle_packet(server(), &buf, &[RfcVariant::Rfc5389])
    );

    // and no further retransmissions happen.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(recorder.sends.lock().len(), 1);
    assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_response_keeps_the_transaction_outstanding() {
    let services = Services::init(Settings::default());
    let recorder = Recorder::new();
    recorder.accept_responses.store(false, Ordering::SeqCst);

    let request = Packet::request(Method::Binding(MethodType::Request));
    let transaction = request.transaction();

    let requester = StunRequester::create(
        services.requesters(),
        recorder.clone(),
        server(),
        request,
        RfcVariant::Rfc5389,
        None,
        None,
    );

    tokio::time::sleep(Duration::from_millis(10)).await;

    let response = Packet::new(Method::Binding(MethodType::Error), transaction);
    let mut buf = BytesMut::new();
    response
        .encode(RfcVariant::Rfc5389, None, false, &mut buf)
        .unwrap();

    // the delegate refuses it, e.g. to retry with fresh credentials.
    assert!(
        !services
            .requesters()
            .handle_packet(server(), &buf, &[RfcVariant::Rfc5389])
    );
    assert_eq!(recorder.responses.load(Ordering::SeqCst), 1);
    assert!(!requester.is_complete());

    // retransmissions continue.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(recorder.sends.lock().len() >= 2);
}

#[tokio::test(start_paused = true)]
async fn mismatched_transactions_are_not_dispatched() {
    let services = Services::init(Settings::default());
    let recorder = Recorder::new();

    let _requester = StunRequester::create(
        services.requesters(),
        recorder.clone(),
        server(),
        Packet::request(Method::Binding(MethodType::Request)),
        RfcVariant::Rfc5389,
        None,
        None,
    );

    tokio::time::sleep(Duration::from_millis(10)).await;

    // same method, different transaction identifier.
    let stranger = Packet::request(Method::Binding(MethodType::Response));
    let mut buf = BytesMut::new();
    stranger
        .encode(RfcVariant::Rfc5389, None, false, &mut buf)
        .unwrap();

    assert!(
        !services
            .requesters()
            .handle_packet(server(), &buf, &[RfcVariant::Rfc5389])
    );
    assert_eq!(recorder.responses.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_all_callbacks() {
    let services = Services::init(Settings::default());
    let recorder = Recorder::new();

    let requester = StunRequester::create(
        services.requesters(),
        recorder.clone(),
        server(),
        Packet::request(Method::Binding(MethodType::Request)),
        RfcVariant::Rfc5389,
        None,
        None,
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    requester.cancel();

    let sends = recorder.sends.lock().len();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(recorder.sends.lock().len(), sends);
    assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 0);
    assert!(services.requesters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn retry_request_now_restarts_the_schedule() {
    let services = Services::init(Settings::default());
    let recorder = Recorder::new();

    let requester = StunRequester::create(
        services.requesters(),
        recorder.clone(),
        server(),
        Packet::request(Method::Binding(MethodType::Request)),
        RfcVariant::Rfc5389,
        None,
        None,
    );

    // two attempts have gone out by 600 ms.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(recorder.sends.lock().len(), 2);

    requester.retry_request_now();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(recorder.sends.lock().len(), 3);

    // the restarted schedule allows the full six attempts again.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(recorder.sends.lock().len(), 2 + 6);
    assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 1);
}
