use std::{
    net::SocketAddr,
    sync::{Arc, atomic::{AtomicUsize, Ordering}},
};

use bytes::{Bytes, BytesMut};
use codec::{
    Packet, RfcVariant,
    message::{
        attributes::{Attribute, ErrKind, StunError},
        methods::{Method, MethodType},
    },
};
use parking_lot::Mutex;
use tokio::time::Duration;
use turn_client::{
    Services,
    discovery::{DiscoveryDelegate, StunDiscovery},
    dns::{SrvRecord, SrvResult},
    settings::Settings,
};

struct Recorder {
    sends: Mutex<Vec<(SocketAddr, Bytes)>>,
    completions: AtomicUsize,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sends: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
        })
    }

    fn last_request(&self) -> (SocketAddr, Packet) {
        let sends = self.sends.lock();
        let (destination, bytes) = sends.last().expect("no request sent");
        (
            *destination,
            Packet::decode(bytes, RfcVariant::Rfc5389).expect("sent packet undecodable"),
        )
    }
}

impl DiscoveryDelegate for Recorder {
    fn on_send_packet(&self, _: &Arc<StunDiscovery>, destination: SocketAddr, packet: Bytes) {
        self.sends.lock().push((destination, packet));
    }

    fn on_completed(&self, _: &Arc<StunDiscovery>) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}

fn srv(entries: &[&str]) -> SrvResult {
    SrvResult::new(
        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let addr: SocketAddr = entry.parse().unwrap();
                SrvRecord {
                    priority: index as u16,
                    weight: 0,
                    port: addr.port(),
                    target: format!("server-{}.example.org", index),
                    addresses: vec![addr.ip()],
                }
            })
            .collect(),
    )
}

fn respond(services: &Arc<Services>, from: SocketAddr, response: &Packet) -> bool {
    let mut buf = BytesMut::new();
    response
        .encode(RfcVariant::Rfc5389, None, false, &mut buf)
        .unwrap();

    services
        .requesters()
        .handle_packet(from, &buf, &[RfcVariant::Rfc5389])
}

#[tokio::test(start_paused = true)]
async fn happy_path_reports_the_mapped_address() {
    let services = Services::init(Settings::default());
    let recorder = Recorder::new();

    let discovery = StunDiscovery::create(
        &services,
        recorder.clone(),
        srv(&["1.2.3.4:3478"]),
        Duration::ZERO,
    );

    tokio::time::sleep(Duration::from_millis(10)).await;

    let (destination, request) = recorder.last_request();
    assert_eq!(destination, "1.2.3.4:3478".parse().unwrap());
    assert_eq!(request.method(), Method::Binding(MethodType::Request));

    let mapped: SocketAddr = "5.6.7.8:40000".parse().unwrap();
    let response = Packet::new(Method::Binding(MethodType::Response), request.transaction())
        .with(Attribute::XorMappedAddress(mapped));
    assert!(respond(&services, destination, &response));

    assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
    assert_eq!(discovery.get_mapped_address(), Some(mapped));
    assert!(discovery.is_complete());

    // with keep-warm disabled the session is torn down; nothing more is
    // ever sent.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(recorder.sends.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn try_alternate_redirects_without_retrying_the_original() {
    let services = Services::init(Settings::default());
    let recorder = Recorder::new();

    let discovery = StunDiscovery::create(
        &services,
        recorder.clone(),
        srv(&["1.2.3.4:3478"]),
        Duration::ZERO,
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    let (original, request) = recorder.last_request();

    let alternate: SocketAddr = "9.9.9.9:3478".parse().unwrap();
    let response = Packet::new(Method::Binding(MethodType::Error), request.transaction())
        .with(Attribute::ErrorCode(StunError::from(ErrKind::TryAlternate)))
        .with(Attribute::AlternateServer(alternate));
    assert!(respond(&services, original, &response));

    tokio::time::sleep(Duration::from_millis(10)).await;

    // the next binding goes to the alternate.
    let (destination, request) = recorder.last_request();
    assert_eq!(destination, alternate);

    let mapped: SocketAddr = "5.6.7.8:40000".parse().unwrap();
    let response = Packet::new(Method::Binding(MethodType::Response), request.transaction())
        .with(Attribute::XorMappedAddress(mapped));
    assert!(respond(&services, alternate, &response));

    assert_eq!(discovery.get_mapped_address(), Some(mapped));

    // the original server was contacted exactly once.
    tokio::time::sleep(Duration::from_secs(60)).await;
    let to_original = recorder
        .sends
        .lock()
        .iter()
        .filter(|(destination, _)| *destination == original)
        .count();
    assert_eq!(to_original, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_server_list_completes_with_no_address() {
    let services = Services::init(Settings::default());
    let recorder = Recorder::new();

    let discovery = StunDiscovery::create(
        &services,
        recorder.clone(),
        srv(&["1.2.3.4:3478", "5.5.5.5:3478"]),
        Duration::ZERO,
    );

    // both servers time out their entire back-off schedule.
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
    assert_eq!(discovery.get_mapped_address(), None);
    assert!(discovery.is_complete());

    // both candidates were attempted.
    let sends = recorder.sends.lock();
    assert!(sends.iter().any(|(d, _)| *d == "1.2.3.4:3478".parse().unwrap()));
    assert!(sends.iter().any(|(d, _)| *d == "5.5.5.5:3478".parse().unwrap()));
}

#[tokio::test(start_paused = true)]
async fn keep_warm_reissues_bindings_and_reports_changes_once() {
    let services = Services::init(Settings::default());
    let recorder = Recorder::new();

    let discovery = StunDiscovery::create(
        &services,
        recorder.clone(),
        srv(&["1.2.3.4:3478"]),
        Duration::from_secs(30),
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    let (destination, request) = recorder.last_request();

    let mapped: SocketAddr = "5.6.7.8:40000".parse().unwrap();
    let response = Packet::new(Method::Binding(MethodType::Response), request.transaction())
        .with(Attribute::XorMappedAddress(mapped));
    assert!(respond(&services, destination, &response));
    assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);

    // the ping timer fires and re-binds against the same server.
    tokio::time::sleep(Duration::from_secs(31)).await;
    let (ping_destination, ping) = recorder.last_request();
    assert_eq!(ping_destination, destination);
    assert_ne!(ping.transaction(), request.transaction());

    // an unchanged mapped address does not complete again.
    let response = Packet::new(Method::Binding(MethodType::Response), ping.transaction())
        .with(Attribute::XorMappedAddress(mapped));
    assert!(respond(&services, destination, &response));
    assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);

    discovery.cancel();
    tokio::time::sleep(Duration::from_secs(120)).await;
    let sends = recorder.sends.lock().len();
    assert_eq!(sends, 2);
}
