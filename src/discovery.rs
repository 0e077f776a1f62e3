use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use codec::{
    Packet, RfcVariant,
    message::methods::{Method, MethodType},
};
use parking_lot::Mutex;
use tokio::time::Duration;

use crate::{
    Services,
    dns::{DnsResolver, SrvResult},
    requester::{RequesterDelegate, RequesterManager, StunRequester},
};

/// Callbacks of a discovery session.
pub trait DiscoveryDelegate: Send + Sync {
    /// A binding request is ready to transmit to the current server.
    fn on_send_packet(&self, discovery: &Arc<StunDiscovery>, destination: SocketAddr, packet: Bytes);

    /// Fired when the mapped address changes, and once with an empty
    /// mapped address when every server has been exhausted.
    fn on_completed(&self, discovery: &Arc<StunDiscovery>);
}

struct DiscoveryState {
    delegate: Option<Arc<dyn DiscoveryDelegate>>,
    srv: Option<SrvResult>,
    lookup_pending: bool,
    server: Option<SocketAddr>,
    requester: Option<Arc<StunRequester>>,
    contacted: Vec<SocketAddr>,
    mapped_address: Option<SocketAddr>,
    // stale keep-warm wakeups carry an old generation and are ignored.
    generation: u64,
}

/// Drives a sequence of STUN binding requests against an SRV-resolved
/// server list to obtain the reflexive transport address.
///
/// Every server is attempted at most once per session.  With a zero
/// keep-warm interval the session completes on the first success;
/// otherwise a one-shot timer re-issues a binding to the same server
/// each interval, reporting again only when the mapped address moves.
pub struct StunDiscovery {
    this: Weak<StunDiscovery>,
    manager: Arc<RequesterManager>,
    keep_warm: Duration,
    state: Mutex<DiscoveryState>,
}

// Discovery speaks modern STUN; a legacy server answers with a plain
// MappedAddress which the success path falls back to.
const DISCOVERY_RFC: RfcVariant = RfcVariant::Rfc5389;

const STUN_SRV_SERVICE: &str = "stun";
const STUN_SRV_PROTO: &str = "udp";
const STUN_DEFAULT_PORT: u16 = 3478;

impl StunDiscovery {
    /// Start from an already-resolved SRV result.
    pub fn create(
        services: &Arc<Services>,
        delegate: Arc<dyn DiscoveryDelegate>,
        srv: SrvResult,
        keep_warm: Duration,
    ) -> Arc<Self> {
        let discovery = Self::new(services, delegate, Some(srv), keep_warm);
        discovery.step();
        discovery
    }

    /// Start from a server name, resolving its SRV records first.
    pub fn create_with_name(
        services: &Arc<Services>,
        delegate: Arc<dyn DiscoveryDelegate>,
        resolver: Arc<dyn DnsResolver>,
        name: &str,
        keep_warm: Duration,
    ) -> Arc<Self> {
        let discovery = Self::new(services, delegate, None, keep_warm);
        discovery.state.lock().lookup_pending = true;

        let this = discovery.this.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let result = resolver
                .lookup_srv(&name, STUN_SRV_SERVICE, STUN_SRV_PROTO, STUN_DEFAULT_PORT)
                .await;

            let Some(discovery) = this.upgrade() else {
                return;
            };

            {
                let mut state = discovery.state.lock();
                state.lookup_pending = false;
                // a failed lookup behaves like an empty server list and
                // completes with an empty mapped address.
                state.srv = Some(result.unwrap_or_default());
            }

            discovery.step();
        });

        discovery
    }

    fn new(
        services: &Arc<Services>,
        delegate: Arc<dyn DiscoveryDelegate>,
        srv: Option<SrvResult>,
        keep_warm: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            manager: services.requesters().clone(),
            keep_warm,
            state: Mutex::new(DiscoveryState {
                delegate: Some(delegate),
                srv,
                lookup_pending: false,
                server: None,
                requester: None,
                contacted: Vec::new(),
                mapped_address: None,
                generation: 0,
            }),
        })
    }

    /// The discovered reflexive address, observable after the first
    /// successful response.
    pub fn get_mapped_address(&self) -> Option<SocketAddr> {
        self.state.lock().mapped_address
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state.delegate.is_none() || state.mapped_address.is_some()
    }

    /// Idempotent teardown; no further delegate callbacks occur.
    pub fn cancel(&self) {
        let requester = {
            let mut state = self.state.lock();
            state.delegate = None;
            state.srv = None;
            state.server = None;
            state.contacted.clear();
            state.generation += 1;
            state.requester.take()
        };

        if let Some(requester) = requester {
            requester.cancel();
        }
    }

    fn step(self: &Arc<Self>) {
        enum Outcome {
            Idle,
            Failed(Arc<dyn DiscoveryDelegate>),
        }

        let outcome = {
            let mut state = self.state.lock();
            let Some(delegate) = state.delegate.clone() else {
                return;
            };

            if state.lookup_pending {
                return;
            }

            let mut outcome = Outcome::Idle;
            while state.server.is_none() {
                let next = state.srv.as_mut().and_then(|srv| srv.extract_next_ip());
                let Some(server) = next else {
                    // no more results; report the failure below, outside
                    // the lock.
                    log::debug!("failed to contact any stun server");
                    state.mapped_address = None;
                    outcome = Outcome::Failed(delegate.clone());
                    break;
                };

                if server.ip().is_unspecified() || server.port() == 0 {
                    continue;
                }

                if state.contacted.contains(&server) {
                    continue;
                }

                state.contacted.push(server);
                state.server = Some(server);
            }

            if let (Outcome::Idle, Some(server)) = (&outcome, state.server) {
                if state.requester.is_none() {
                    let request = Packet::request(Method::Binding(MethodType::Request));
                    state.requester = Some(StunRequester::create(
                        &self.manager,
                        Arc::new(RequesterBridge(self.this.clone())),
                        server,
                        request,
                        DISCOVERY_RFC,
                        None,
                        None,
                    ));
                }
            }

            outcome
        };

        if let Outcome::Failed(delegate) = outcome {
            delegate.on_completed(self);
            self.cancel();
        }
    }

    fn on_requester_send(
        self: &Arc<Self>,
        requester: &Arc<StunRequester>,
        destination: SocketAddr,
        packet: Bytes,
    ) {
        let delegate = {
            let state = self.state.lock();
            if !state
                .requester
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, requester))
            {
                return;
            }

            state.delegate.clone()
        };

        if let Some(delegate) = delegate {
            delegate.on_send_packet(self, destination, packet);
        }
    }

    fn on_requester_response(
        self: &Arc<Self>,
        requester: &Arc<StunRequester>,
        from: SocketAddr,
        response: &Packet,
    ) -> bool {
        enum Outcome {
            Step,
            Completed {
                delegate: Option<Arc<dyn DiscoveryDelegate>>,
                terminal: bool,
            },
        }

        let outcome = {
            let mut state = self.state.lock();
            if !state
                .requester
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, requester))
            {
                // a reply for an old request; claim it so the stale
                // requester stops retrying.
                return true;
            }

            if let Some(error) = response.error() {
                // an error code on a success-class response is not a
                // proper reply; keep waiting for a valid one.
                if !response.method().is_error() {
                    log::warn!(
                        "error code on a non-error response: from={:?}, code={}",
                        from,
                        error.code
                    );

                    return false;
                }

                if error.code == 300 {
                    // redirected; chase the alternate server unless it
                    // was already contacted.
                    let alternate = response.alternate_server();
                    log::debug!("try alternate server: alternate={:?}", alternate);

                    state.server = None;
                    if let Some(alternate) = alternate {
                        if alternate.port() != 0 && !state.contacted.contains(&alternate) {
                            state.contacted.push(alternate);
                            state.server = Some(alternate);
                        }
                    }
                } else {
                    // any other error means this server is done.
                    log::debug!(
                        "stun server rejected binding: from={:?}, code={}",
                        from,
                        error.code
                    );

                    state.server = None;
                }

                state.requester = None;
                Outcome::Step
            } else {
                let mapped = response.mapped_address();
                log::info!("found mapped address: mapped={:?}", mapped);

                let changed = mapped != state.mapped_address;
                state.mapped_address = mapped;
                state.requester = None;

                let delegate = if changed { state.delegate.clone() } else { None };

                if self.keep_warm.is_zero() {
                    Outcome::Completed {
                        delegate,
                        terminal: true,
                    }
                } else {
                    // one-shot ping timer back to the same server.
                    let generation = state.generation;
                    let this = self.this.clone();
                    let keep_warm = self.keep_warm;
                    tokio::spawn(async move {
                        tokio::time::sleep(keep_warm).await;

                        let Some(discovery) = this.upgrade() else {
                            return;
                        };

                        if discovery.state.lock().generation != generation {
                            return;
                        }

                        discovery.step();
                    });

                    Outcome::Completed {
                        delegate,
                        terminal: false,
                    }
                }
            }
        };

        match outcome {
            Outcome::Step => {
                self.step();
                true
            }
            Outcome::Completed { delegate, terminal } => {
                if let Some(delegate) = delegate {
                    delegate.on_completed(self);
                }

                if terminal {
                    self.cancel();
                }

                true
            }
        }
    }

    fn on_requester_timeout(self: &Arc<Self>, requester: &Arc<StunRequester>) {
        {
            let mut state = self.state.lock();
            if !state
                .requester
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, requester))
            {
                return;
            }

            // move on to the next candidate in the list.
            state.server = None;
            state.requester = None;
        }

        self.step();
    }
}

struct RequesterBridge(Weak<StunDiscovery>);

impl RequesterDelegate for RequesterBridge {
    fn on_send_packet(&self, requester: &Arc<StunRequester>, destination: SocketAddr, packet: Bytes) {
        if let Some(discovery) = self.0.upgrade() {
            discovery.on_requester_send(requester, destination, packet);
        }
    }

    fn handle_response(
        &self,
        requester: &Arc<StunRequester>,
        from: SocketAddr,
        response: &Packet,
    ) -> bool {
        match self.0.upgrade() {
            Some(discovery) => discovery.on_requester_response(requester, from, response),
            // the session is gone; accept the response so the requester
            // cancels itself.
            None => true,
        }
    }

    fn on_timed_out(&self, requester: &Arc<StunRequester>) {
        if let Some(discovery) = self.0.upgrade() {
            discovery.on_requester_timeout(requester);
        }
    }
}
