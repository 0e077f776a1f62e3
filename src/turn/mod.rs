pub mod channel;
pub mod permission;
pub mod server;

use std::{
    net::{IpAddr, SocketAddr},
    ops::RangeInclusive,
    sync::{Arc, Weak},
};

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use codec::{
    ChannelData, FrameKind, Packet, RfcVariant,
    channel_data::CHANNEL_NUMBER_RANGE,
    crypto::{Credential, long_term_credential},
    message::{
        attributes::{Attribute, ErrKind, TRANSPORT_UDP},
        methods::{Method, MethodType},
    },
};
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use crate::{
    Services,
    backgrounding::{BackgroundingDelegate, BackgroundingNotifier, BackgroundingSubscription},
    backoff::BackoffPattern,
    dns::{DnsResolver, SrvResult},
    requester::{RequesterDelegate, StunRequester},
    turn::{
        channel::{ChannelAllocator, ChannelBinding},
        permission::{PendingDatagram, Permission},
        server::{CandidateServer, Transport, is_due, run_tcp, staggered},
    },
};

// TURN is an extension of modern STUN.
const TURN_RFC: RfcVariant = RfcVariant::Rfc5389;

const TURN_SRV_SERVICE: &str = "turn";
const TURN_DEFAULT_PORT: u16 = 3478;

/// Lifetime granted when the allocate response carries none.
const TURN_DEFAULT_LIFETIME: u32 = 600;

/// A later candidate is tried only if no earlier one has allocated by
/// this much after the previous candidate's activation.
const ACTIVATE_NEXT_SERVER_STAGGER: Duration = Duration::from_secs(4);
const ACTIVATION_TICK: Duration = Duration::from_secs(1);

/// New permissions are batched: a CreatePermission cycle runs at most
/// this often.
const PERMISSION_CYCLE: Duration = Duration::from_secs(2);

/// Installed permissions are refreshed well inside the server's five
/// minute permission lifetime.
const PERMISSION_REFRESH_INTERVAL: Duration = Duration::from_secs(240);

/// Permissions idle this long are dropped instead of refreshed.
const PERMISSION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// XorPeerAddress attributes carried per CreatePermission request.
const PERMISSION_MAX_BATCH: usize = 10;

/// Channel bindings are refreshed before the server's ten minute bind
/// timeout elapses.
const CHANNEL_REFRESH_INTERVAL: Duration = Duration::from_secs(540);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Pending,
    Ready,
    ShuttingDown,
    Shutdown,
}

/// Final cause recorded when the client reaches Shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnError {
    UserRequestedShutdown,
    UnexpectedResponse,
    NoConnectionToAnyServer,
    DnsLookupFailure,
    UnknownAuthenticationError,
}

/// Callbacks of the TURN client.
///
/// UDP traffic flows through the host socket: `on_send_packet` hands
/// outbound datagrams to the host, and the host pushes inbound ones
/// into [`TurnClient::handle_stun_packet`] /
/// [`TurnClient::handle_channel_data`].  TCP servers are internal to
/// the client.
pub trait TurnDelegate: Send + Sync {
    fn on_state_changed(&self, client: &Arc<TurnClient>, state: TurnState);

    fn on_send_packet(&self, client: &Arc<TurnClient>, destination: SocketAddr, packet: Bytes);

    /// Relayed data from a peer.
    fn on_packet(&self, client: &Arc<TurnClient>, peer: SocketAddr, packet: &[u8]);

    /// The send path toward the active server has room again.  For a
    /// TCP server this fires exactly once per drain of the client's
    /// write buffer; for a UDP server it mirrors each
    /// [`TurnClient::notify_write_ready`] call from the host.
    fn on_write_ready(&self, client: &Arc<TurnClient>);
}

/// Where the candidate servers come from.
pub enum TurnServerSource {
    /// Resolve `_turn._udp.<name>` and `_turn._tcp.<name>`, falling
    /// back to A/AAAA records on the bare name.
    Name(String),
    /// Pre-resolved SRV results per transport.
    Srv {
        udp: Option<SrvResult>,
        tcp: Option<SrvResult>,
    },
}

pub struct TurnClientOptions {
    pub server: TurnServerSource,
    pub username: String,
    pub password: String,
    pub use_channel_binding: bool,
    pub channel_range: RangeInclusive<u16>,
}

impl TurnClientOptions {
    pub fn new(server: TurnServerSource, username: &str, password: &str) -> Self {
        Self {
            server,
            username: username.to_string(),
            password: password.to_string(),
            use_channel_binding: false,
            channel_range: CHANNEL_NUMBER_RANGE,
        }
    }
}

struct TurnInner {
    delegate: Option<Arc<dyn TurnDelegate>>,
    current_state: TurnState,
    last_error: Option<TurnError>,

    realm: Option<String>,
    nonce: Option<String>,
    credential: Option<Credential>,

    started_at: Instant,
    servers: Vec<Arc<CandidateServer>>,
    active: Option<Arc<CandidateServer>>,

    relayed: Option<SocketAddr>,
    reflected: Option<SocketAddr>,
    server_response_ip: Option<SocketAddr>,
    lifetime: u32,

    refresh_requester: Option<Arc<StunRequester>>,
    deallocate_requester: Option<Arc<StunRequester>>,
    permission_requester: Option<Arc<StunRequester>>,
    channel_bind_requesters: AHashMap<u16, Arc<StunRequester>>,

    permissions: AHashMap<IpAddr, Permission>,
    permission_batch: Vec<IpAddr>,
    permission_cycle_scheduled: bool,
    last_permission_cycle: Option<Instant>,

    channels: AHashMap<u16, ChannelBinding>,
    channels_by_peer: AHashMap<SocketAddr, u16>,
    channel_allocator: ChannelAllocator,

    // timers carry the generation they were armed under; a mismatch on
    // expiry means the wakeup is stale.
    generation: u64,

    backgrounding_notifier: Option<BackgroundingNotifier>,
    backgrounding_subscription: Option<BackgroundingSubscription>,
}

/// Delegate calls gathered under the lock, executed after it drops.
#[derive(Default)]
struct Actions {
    state: Option<(Arc<dyn TurnDelegate>, TurnState)>,
    sends: Vec<(Arc<dyn TurnDelegate>, SocketAddr, Bytes)>,
    packets: Vec<(Arc<dyn TurnDelegate>, SocketAddr, Vec<u8>)>,
}

/// What to do once the lock is released.
enum After {
    Nothing,
    CheckAllFailed,
    Shutdown(TurnError),
}

/// TURN relay client.
///
/// Lifecycle: Pending (enumerating and allocating) → Ready (allocation
/// held, refreshed, permissions and channels live) → ShuttingDown
/// (best-effort deallocate) → Shutdown.  The final cause is readable
/// via [`TurnClient::get_last_error`].
pub struct TurnClient {
    this: Weak<TurnClient>,
    services: Arc<Services>,
    username: String,
    password: String,
    use_channel_binding: bool,
    force_udp: bool,
    force_tcp: bool,
    restricted_ips: Vec<IpAddr>,
    state: Mutex<TurnInner>,
}

impl TurnClient {
    pub fn create(
        services: &Arc<Services>,
        delegate: Arc<dyn TurnDelegate>,
        resolver: Arc<dyn DnsResolver>,
        options: TurnClientOptions,
    ) -> Arc<Self> {
        let settings = services.settings().turn.clone();
        let TurnClientOptions {
            server,
            username,
            password,
            use_channel_binding,
            channel_range,
        } = options;

        let client = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            services: services.clone(),
            username,
            password,
            use_channel_binding,
            force_udp: settings.force_udp,
            force_tcp: settings.force_tcp,
            restricted_ips: settings.restrict_relay_ips,
            state: Mutex::new(TurnInner {
                delegate: Some(delegate),
                current_state: TurnState::Pending,
                last_error: None,
                realm: None,
                nonce: None,
                credential: None,
                started_at: Instant::now(),
                servers: Vec::new(),
                active: None,
                relayed: None,
                reflected: None,
                server_response_ip: None,
                lifetime: TURN_DEFAULT_LIFETIME,
                refresh_requester: None,
                deallocate_requester: None,
                permission_requester: None,
                channel_bind_requesters: AHashMap::new(),
                permissions: AHashMap::new(),
                permission_batch: Vec::new(),
                permission_cycle_scheduled: false,
                last_permission_cycle: None,
                channels: AHashMap::new(),
                channels_by_peer: AHashMap::new(),
                channel_allocator: ChannelAllocator::new(channel_range),
                generation: 0,
                backgrounding_notifier: None,
                backgrounding_subscription: None,
            }),
        });

        let subscription = services.backgrounding().subscribe(
            settings.backgrounding_phase,
            Arc::downgrade(&(client.clone() as Arc<dyn BackgroundingDelegate>)),
        );
        client.state.lock().backgrounding_subscription = Some(subscription);

        tokio::spawn(enumerate_servers(
            client.this.clone(),
            resolver,
            server,
            settings.force_udp,
            settings.force_tcp,
        ));

        client
    }

    pub fn get_state(&self) -> TurnState {
        self.state.lock().current_state
    }

    pub fn get_last_error(&self) -> Option<TurnError> {
        self.state.lock().last_error
    }

    /// The relayed transport address allocated on the server; stable
    /// from Ready until shutdown.
    pub fn get_relayed_ip(&self) -> Option<SocketAddr> {
        self.state.lock().relayed
    }

    /// The reflexive address observed by the server.
    pub fn get_reflected_ip(&self) -> Option<SocketAddr> {
        self.state.lock().reflected
    }

    pub fn get_active_server_ip(&self) -> Option<SocketAddr> {
        self.state.lock().active.as_ref().map(|server| server.addr)
    }

    /// Source address of the successful allocate response, which can
    /// differ from the contacted address on multihomed servers.
    pub fn get_server_response_ip(&self) -> Option<SocketAddr> {
        self.state.lock().server_response_ip
    }

    pub fn is_relaying_udp(&self) -> bool {
        self.state
            .lock()
            .active
            .as_ref()
            .is_some_and(|server| server.transport == Transport::Udp)
    }

    /// Relay a datagram to a peer.
    ///
    /// Returns `true` when the datagram was sent, queued behind a
    /// pending permission, or filtered by the restricted-peer debug
    /// list; `false` when the client is not ready or the datagram can
    /// not be accepted.
    pub fn send_packet(
        self: &Arc<Self>,
        peer: SocketAddr,
        data: &[u8],
        bind_channel_if_possible: bool,
    ) -> bool {
        if data.len() > u16::MAX as usize {
            return false;
        }

        let mut actions = Actions::default();
        let accepted = {
            let mut inner = self.state.lock();
            if inner.current_state != TurnState::Ready || inner.active.is_none() {
                return false;
            }

            if !self.restricted_ips.is_empty() && !self.restricted_ips.contains(&peer.ip()) {
                log::debug!("peer not in restricted relay list, dropped: peer={:?}", peer);
                return true;
            }

            let now = Instant::now();
            let bound_channel = inner
                .channels_by_peer
                .get(&peer)
                .copied()
                .filter(|number| inner.channels.get(number).is_some_and(|it| it.bound));

            if let Some(number) = bound_channel {
                self.send_channel_data(&mut inner, number, peer, data, now, &mut actions);
            } else if inner
                .permissions
                .get(&peer.ip())
                .is_some_and(|it| it.installed)
            {
                self.send_indication(&mut inner, peer, data, now, &mut actions);

                if bind_channel_if_possible && self.use_channel_binding {
                    self.initiate_channel_bind(&mut inner, peer, now);
                }
            } else {
                // no permission yet: park the datagram and ask for one
                // at the next coalesced cycle.
                let permission = inner
                    .permissions
                    .entry(peer.ip())
                    .or_insert_with(|| Permission::new(peer.ip(), now));

                permission.queue(PendingDatagram {
                    peer,
                    data: Bytes::copy_from_slice(data),
                    bind_channel: bind_channel_if_possible,
                });

                if bind_channel_if_possible && self.use_channel_binding {
                    self.initiate_channel_bind(&mut inner, peer, now);
                }

                self.schedule_permission_cycle(&mut inner, now);
            }

            true
        };

        self.run_actions(actions);
        accepted
    }

    /// Accept a Data indication arriving from the active server.
    pub fn handle_stun_packet(self: &Arc<Self>, from: SocketAddr, packet: &Packet) -> bool {
        let mut actions = Actions::default();
        let handled = {
            let inner = self.state.lock();
            if inner.current_state != TurnState::Ready {
                return false;
            }

            if !inner.active.as_ref().is_some_and(|it| it.addr == from) {
                return false;
            }

            if packet.method() != Method::DataIndication {
                return false;
            }

            let (Some(peer), Some(data)) = (packet.peer_address(), packet.data()) else {
                log::warn!("data indication missing attributes: from={:?}", from);
                return false;
            };

            if let Some(delegate) = inner.delegate.clone() {
                actions.packets.push((delegate, peer, data.to_vec()));
            }

            true
        };

        self.run_actions(actions);
        handled
    }

    /// Accept a framed ChannelData message arriving from the active
    /// server and deliver its payload to the bound peer.
    pub fn handle_channel_data(self: &Arc<Self>, from: SocketAddr, bytes: &[u8]) -> bool {
        let mut actions = Actions::default();
        let handled = {
            let inner = self.state.lock();
            if inner.current_state != TurnState::Ready {
                return false;
            }

            if !inner.active.as_ref().is_some_and(|it| it.addr == from) {
                return false;
            }

            let Ok(data) = ChannelData::decode(bytes) else {
                return false;
            };

            // the server may relay on a channel as soon as the bind
            // request is in flight, before our success response.
            let Some(binding) = inner.channels.get(&data.number()) else {
                log::warn!(
                    "channel data for unknown channel: from={:?}, number={:#06x}",
                    from,
                    data.number()
                );

                return false;
            };

            if let Some(delegate) = inner.delegate.clone() {
                actions
                    .packets
                    .push((delegate, binding.peer, data.as_bytes().to_vec()));
            }

            true
        };

        self.run_actions(actions);
        handled
    }

    /// The host's send path has room again; propagate the edge.
    ///
    /// The host owns the UDP socket and alone observes its edges, so
    /// for a UDP active server every call passes through.  For a TCP
    /// server the client tracks its own buffer: the edge is re-armed
    /// when a full write buffer drops a packet and fires again once the
    /// buffer drains, so a host call is only forwarded while the edge
    /// is armed.
    pub fn notify_write_ready(self: &Arc<Self>) {
        let delegate = {
            let inner = self.state.lock();
            match (&inner.active, &inner.delegate) {
                (Some(active), Some(delegate)) => match active.transport {
                    Transport::Udp => Some(delegate.clone()),
                    Transport::Tcp => {
                        let mut state = active.state.lock();
                        if state.informed_write_ready {
                            None
                        } else {
                            state.informed_write_ready = true;
                            Some(delegate.clone())
                        }
                    }
                },
                _ => None,
            }
        };

        if let Some(delegate) = delegate {
            delegate.on_write_ready(self);
        }
    }

    /// Graceful teardown: deallocate if possible, then Shutdown.
    pub fn shutdown(self: &Arc<Self>) {
        self.shutdown_with_error(TurnError::UserRequestedShutdown);
    }

    // ------------------------------------------------------------------
    // enumeration and activation

    fn finish_enumeration(self: &Arc<Self>, udp: Option<SrvResult>, tcp: Option<SrvResult>) {
        let empty = {
            let mut inner = self.state.lock();
            if inner.current_state != TurnState::Pending {
                return;
            }

            let mut udp = udp.unwrap_or_default();
            let mut tcp = tcp.unwrap_or_default();
            let mut servers: Vec<Arc<CandidateServer>> = Vec::new();

            loop {
                let next_udp = udp.extract_next_ip().map(|addr| (Transport::Udp, addr));
                let next_tcp = tcp.extract_next_ip().map(|addr| (Transport::Tcp, addr));
                if next_udp.is_none() && next_tcp.is_none() {
                    break;
                }

                for (transport, addr) in [next_udp, next_tcp].into_iter().flatten() {
                    if addr.ip().is_unspecified() || addr.port() == 0 {
                        continue;
                    }

                    if servers
                        .iter()
                        .any(|it| it.transport == transport && it.addr == addr)
                    {
                        continue;
                    }

                    servers.push(CandidateServer::new(
                        transport,
                        addr,
                        staggered(servers.len(), ACTIVATE_NEXT_SERVER_STAGGER),
                    ));
                }
            }

            log::info!("turn server candidates: count={}", servers.len());
            inner.servers = servers;
            inner.servers.is_empty()
        };

        if empty {
            self.shutdown_with_error(TurnError::DnsLookupFailure);
            return;
        }

        self.activate_due_servers();
        tokio::spawn(run_activation(self.this.clone()));
    }

    /// Activate every candidate whose scheduled time has come.
    /// Returns `false` once activation is over (not Pending anymore).
    fn activate_due_servers(self: &Arc<Self>) -> bool {
        let now = Instant::now();
        let inner = self.state.lock();
        if inner.current_state != TurnState::Pending {
            return false;
        }

        for server in inner.servers.clone() {
            {
                let mut state = server.state.lock();
                if state.activated || state.failed || !is_due(&server, inner.started_at, now) {
                    continue;
                }

                state.activated = true;
            }

            log::info!(
                "activating turn candidate: server={:?}, transport={:?}",
                server.addr,
                server.transport
            );

            match server.transport {
                Transport::Udp => self.start_allocate(&inner, &server),
                Transport::Tcp => {
                    let task = tokio::spawn(run_tcp(self.this.clone(), server.clone()));
                    server.state.lock().tcp_task = Some(task);
                }
            }
        }

        true
    }

    fn start_allocate(self: &Arc<Self>, inner: &TurnInner, server: &Arc<CandidateServer>) {
        let mut packet = Packet::request(Method::Allocate(MethodType::Request))
            .with(Attribute::RequestedTransport(TRANSPORT_UDP));
        self.push_auth(&mut packet, inner);

        let requester = StunRequester::create(
            self.services.requesters(),
            Arc::new(RequesterBridge {
                client: self.this.clone(),
                kind: RequestKind::Allocate(Arc::downgrade(server)),
            }),
            server.addr,
            packet,
            TURN_RFC,
            inner.credential,
            None,
        );

        let mut state = server.state.lock();
        state.tried_auth = inner.credential.is_some();
        state.allocate_requester = Some(requester);
    }

    pub(crate) fn on_server_connected(self: &Arc<Self>, server: &Arc<CandidateServer>) {
        let inner = self.state.lock();
        if inner.current_state != TurnState::Pending {
            return;
        }

        {
            let state = server.state.lock();
            if !state.connected || state.allocate_requester.is_some() {
                return;
            }
        }

        self.start_allocate(&inner, server);
    }

    pub(crate) fn on_server_failed(self: &Arc<Self>, server: &Arc<CandidateServer>) {
        server.fail();

        let was_active = {
            let inner = self.state.lock();
            inner.current_state == TurnState::Ready
                && inner.active.as_ref().is_some_and(|it| Arc::ptr_eq(it, server))
        };

        if was_active {
            self.shutdown_with_error(TurnError::NoConnectionToAnyServer);
        } else {
            self.check_all_failed();
        }
    }

    pub(crate) fn on_server_drained(self: &Arc<Self>, server: &Arc<CandidateServer>) {
        let delegate = {
            let inner = self.state.lock();
            if !inner.active.as_ref().is_some_and(|it| Arc::ptr_eq(it, server)) {
                None
            } else {
                let mut state = server.state.lock();
                if !state.informed_write_ready && state.write_buffer.is_empty() {
                    state.informed_write_ready = true;
                    inner.delegate.clone()
                } else {
                    None
                }
            }
        };

        if let Some(delegate) = delegate {
            delegate.on_write_ready(self);
        }
    }

    /// Route one complete frame read off a TCP server connection.
    pub(crate) fn route_server_frame(self: &Arc<Self>, server: &Arc<CandidateServer>, frame: &[u8]) {
        match FrameKind::detect(frame) {
            Some(FrameKind::Message) => match Packet::decode(frame, TURN_RFC) {
                Ok(packet) => {
                    // transaction responses first; what is left over can
                    // only be an indication.
                    if !self
                        .services
                        .requesters()
                        .handle_stun_packet(server.addr, &packet)
                    {
                        self.handle_stun_packet(server.addr, &packet);
                    }
                }
                Err(err) => {
                    log::warn!(
                        "undecodable stun frame: server={:?}, err={:?}",
                        server.addr,
                        err
                    );
                }
            },
            Some(FrameKind::ChannelData) => {
                self.handle_channel_data(server.addr, frame);
            }
            None => {
                log::warn!("unrecognized frame: server={:?}", server.addr);
            }
        }
    }

    fn check_all_failed(self: &Arc<Self>) {
        let all_failed = {
            let inner = self.state.lock();
            inner.current_state == TurnState::Pending
                && !inner.servers.is_empty()
                && inner.servers.iter().all(|it| it.is_failed())
        };

        if all_failed {
            self.shutdown_with_error(TurnError::NoConnectionToAnyServer);
        }
    }

    // ------------------------------------------------------------------
    // allocate

    fn on_allocate_response(
        self: &Arc<Self>,
        server: &Arc<CandidateServer>,
        requester: &Arc<StunRequester>,
        from: SocketAddr,
        response: &Packet,
    ) -> bool {
        let mut actions = Actions::default();
        let mut torn_down: Vec<Arc<CandidateServer>> = Vec::new();
        let after = {
            let mut inner = self.state.lock();
            if inner.current_state != TurnState::Pending {
                return true;
            }

            {
                let state = server.state.lock();
                if !state
                    .allocate_requester
                    .as_ref()
                    .is_some_and(|it| Arc::ptr_eq(it, requester))
                {
                    return true;
                }
            }

            if let Some(error) = response.error() {
                if !response.method().is_error() {
                    return false;
                }

                match error.kind() {
                    Some(ErrKind::Unauthorized) => {
                        if server.state.lock().tried_auth {
                            log::warn!(
                                "credentials rejected by turn server: server={:?}",
                                server.addr
                            );

                            After::Shutdown(TurnError::UnknownAuthenticationError)
                        } else {
                            match (response.realm(), response.nonce()) {
                                (Some(realm), Some(nonce)) => {
                                    inner.realm = Some(realm.to_string());
                                    inner.nonce = Some(nonce.to_string());
                                    inner.credential = Some(long_term_credential(
                                        &self.username,
                                        realm,
                                        &self.password,
                                    ));

                                    // retry with the long-term credential;
                                    // the accepted response cancels this
                                    // requester.
                                    self.start_allocate(&inner, server);
                                    After::Nothing
                                }
                                _ => {
                                    log::warn!(
                                        "401 without realm/nonce: server={:?}",
                                        server.addr
                                    );

                                    server.fail();
                                    After::CheckAllFailed
                                }
                            }
                        }
                    }
                    Some(ErrKind::StaleNonce) => {
                        if let Some(nonce) = response.nonce() {
                            inner.nonce = Some(nonce.to_string());
                        }

                        self.start_allocate(&inner, server);
                        After::Nothing
                    }
                    Some(ErrKind::TryAlternate) => {
                        server.fail();

                        match response.alternate_server() {
                            Some(alternate)
                                if alternate.port() != 0
                                    && !inner.servers.iter().any(|it| {
                                        it.transport == server.transport && it.addr == alternate
                                    }) =>
                            {
                                log::debug!(
                                    "redirected to alternate server: alternate={:?}",
                                    alternate
                                );

                                let replacement = CandidateServer::new(
                                    server.transport,
                                    alternate,
                                    Instant::now() - inner.started_at,
                                );
                                inner.servers.push(replacement.clone());

                                replacement.state.lock().activated = true;
                                match replacement.transport {
                                    Transport::Udp => self.start_allocate(&inner, &replacement),
                                    Transport::Tcp => {
                                        let task = tokio::spawn(run_tcp(
                                            self.this.clone(),
                                            replacement.clone(),
                                        ));
                                        replacement.state.lock().tcp_task = Some(task);
                                    }
                                }

                                After::Nothing
                            }
                            _ => After::CheckAllFailed,
                        }
                    }
                    _ => {
                        log::debug!(
                            "allocate rejected: server={:?}, code={}",
                            server.addr,
                            error.code
                        );

                        server.fail();
                        After::CheckAllFailed
                    }
                }
            } else {
                match response.relayed_address() {
                    None => {
                        log::warn!(
                            "allocate response without relayed address: server={:?}",
                            server.addr
                        );

                        server.fail();
                        After::CheckAllFailed
                    }
                    Some(relayed) => {
                        inner.relayed = Some(relayed);
                        inner.reflected = response.mapped_address();
                        inner.server_response_ip = Some(from);
                        inner.lifetime = response.lifetime().unwrap_or(TURN_DEFAULT_LIFETIME);
                        inner.active = Some(server.clone());
                        server.state.lock().allocate_requester = None;

                        log::info!(
                            "allocation ready: server={:?}, relayed={:?}, reflected={:?}, lifetime={}",
                            server.addr,
                            inner.relayed,
                            inner.reflected,
                            inner.lifetime
                        );

                        // losers are torn down outside the lock.
                        torn_down = inner
                            .servers
                            .iter()
                            .filter(|it| !Arc::ptr_eq(it, server))
                            .cloned()
                            .collect();

                        inner.current_state = TurnState::Ready;
                        if let Some(delegate) = inner.delegate.clone() {
                            actions.state = Some((delegate, TurnState::Ready));
                        }

                        self.schedule_refresh(&inner);
                        spawn_permission_maintenance(self.this.clone(), inner.generation);
                        After::Nothing
                    }
                }
            }
        };

        for server in torn_down {
            server.fail();
        }

        self.run_actions(actions);
        self.run_after(after);
        true
    }

    fn on_allocate_timeout(self: &Arc<Self>, server: &Arc<CandidateServer>) {
        log::debug!("allocate timed out: server={:?}", server.addr);
        self.on_server_failed(server);
    }

    // ------------------------------------------------------------------
    // refresh and deallocate

    fn refresh_now(self: &Arc<Self>) {
        let mut inner = self.state.lock();
        if inner.current_state != TurnState::Ready || inner.refresh_requester.is_some() {
            return;
        }

        let Some(active) = inner.active.clone() else {
            return;
        };

        let mut packet = Packet::request(Method::Refresh(MethodType::Request));
        self.push_auth(&mut packet, &inner);

        inner.refresh_requester = Some(StunRequester::create(
            self.services.requesters(),
            Arc::new(RequesterBridge {
                client: self.this.clone(),
                kind: RequestKind::Refresh,
            }),
            active.addr,
            packet,
            TURN_RFC,
            inner.credential,
            None,
        ));
    }

    fn schedule_refresh(&self, inner: &TurnInner) {
        // leave at least a quarter of the granted lifetime for the
        // refresh round-trips.
        let delay = Duration::from_secs(u64::from(inner.lifetime)) * 3 / 4;
        let generation = inner.generation;
        let this = self.this.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(client) = this.upgrade() else {
                return;
            };

            if client.state.lock().generation != generation {
                return;
            }

            client.refresh_now();
        });
    }

    fn on_refresh_response(
        self: &Arc<Self>,
        requester: &Arc<StunRequester>,
        response: &Packet,
    ) -> bool {
        let after = {
            let mut inner = self.state.lock();
            if !inner
                .refresh_requester
                .as_ref()
                .is_some_and(|it| Arc::ptr_eq(it, requester))
            {
                return true;
            }

            if let Some(error) = response.error() {
                if !response.method().is_error() {
                    return false;
                }

                match error.kind() {
                    Some(ErrKind::StaleNonce) => {
                        if let Some(nonce) = response.nonce() {
                            inner.nonce = Some(nonce.to_string());
                        }

                        inner.refresh_requester = None;
                        drop(inner);
                        self.refresh_now();
                        After::Nothing
                    }
                    Some(ErrKind::Unauthorized) => {
                        After::Shutdown(TurnError::UnknownAuthenticationError)
                    }
                    _ => {
                        log::warn!("refresh rejected: code={}", error.code);
                        After::Shutdown(TurnError::UnexpectedResponse)
                    }
                }
            } else {
                inner.lifetime = response.lifetime().unwrap_or(inner.lifetime);
                inner.refresh_requester = None;

                log::debug!("allocation refreshed: lifetime={}", inner.lifetime);

                self.schedule_refresh(&inner);
                After::Nothing
            }
        };

        self.run_after(after);
        self.clear_backgrounding_notifier_if_possible();
        true
    }

    fn on_refresh_timeout(self: &Arc<Self>) {
        log::warn!("refresh timed out, server lost");
        self.shutdown_with_error(TurnError::NoConnectionToAnyServer);
        self.clear_backgrounding_notifier_if_possible();
    }

    fn start_deallocate(self: &Arc<Self>, inner: &mut TurnInner) {
        let Some(active) = inner.active.clone() else {
            return;
        };

        let mut packet = Packet::request(Method::Refresh(MethodType::Request))
            .with(Attribute::Lifetime(0));
        self.push_auth(&mut packet, inner);

        // best effort: a handful of quick attempts, then give up.
        let pattern = BackoffPattern::new(
            3,
            vec![Duration::from_millis(500)],
            2.0,
            vec![Duration::from_millis(1)],
        );

        inner.deallocate_requester = Some(StunRequester::create(
            self.services.requesters(),
            Arc::new(RequesterBridge {
                client: self.this.clone(),
                kind: RequestKind::Deallocate,
            }),
            active.addr,
            packet,
            TURN_RFC,
            inner.credential,
            Some(pattern),
        ));
    }

    fn on_deallocate_response(
        self: &Arc<Self>,
        requester: &Arc<StunRequester>,
        response: &Packet,
    ) -> bool {
        let stale_nonce = {
            let mut inner = self.state.lock();
            if !inner
                .deallocate_requester
                .as_ref()
                .is_some_and(|it| Arc::ptr_eq(it, requester))
            {
                return true;
            }

            inner.deallocate_requester = None;
            if response.error().is_some_and(|it| it.kind() == Some(ErrKind::StaleNonce)) {
                if let Some(nonce) = response.nonce() {
                    inner.nonce = Some(nonce.to_string());
                }

                self.start_deallocate(&mut inner);
                true
            } else {
                // success, or any error: the allocation either died or
                // will expire on its own.
                false
            }
        };

        if !stale_nonce {
            self.finish_shutdown();
        }

        true
    }

    fn on_deallocate_timeout(self: &Arc<Self>) {
        self.finish_shutdown();
    }

    // ------------------------------------------------------------------
    // permissions

    fn schedule_permission_cycle(self: &Arc<Self>, inner: &mut TurnInner, now: Instant) {
        if inner.permission_requester.is_some() {
            // another cycle right after the outstanding one completes.
            inner.permission_cycle_scheduled = true;
            return;
        }

        let due = inner
            .last_permission_cycle
            .map(|last| last + PERMISSION_CYCLE)
            .filter(|at| *at > now);

        match due {
            None => self.request_permissions_now(inner, now),
            Some(at) => {
                if inner.permission_cycle_scheduled {
                    return;
                }

                inner.permission_cycle_scheduled = true;

                let generation = inner.generation;
                let this = self.this.clone();
                tokio::spawn(async move {
                    tokio::time::sleep_until(at).await;

                    let Some(client) = this.upgrade() else {
                        return;
                    };

                    let mut inner = client.state.lock();
                    if inner.generation != generation
                        || inner.current_state != TurnState::Ready
                    {
                        return;
                    }

                    inner.permission_cycle_scheduled = false;
                    if inner.permission_requester.is_none() {
                        client.request_permissions_now(&mut inner, Instant::now());
                    }
                });
            }
        }
    }

    fn request_permissions_now(self: &Arc<Self>, inner: &mut TurnInner, now: Instant) {
        let Some(active) = inner.active.clone() else {
            return;
        };

        // uninstalled peers first, then refreshes of installed ones.
        let mut batch: Vec<IpAddr> = inner
            .permissions
            .iter()
            .filter(|(_, it)| !it.installed && !it.installing)
            .map(|(ip, _)| *ip)
            .take(PERMISSION_MAX_BATCH)
            .collect();

        for ip in inner
            .permissions
            .iter()
            .filter(|(_, it)| it.installed)
            .map(|(ip, _)| *ip)
        {
            if batch.len() >= PERMISSION_MAX_BATCH {
                break;
            }

            batch.push(ip);
        }

        if batch.is_empty() {
            return;
        }

        let mut packet = Packet::request(Method::CreatePermission(MethodType::Request));
        for ip in &batch {
            packet.push(Attribute::XorPeerAddress(SocketAddr::new(*ip, 0)));
        }
        self.push_auth(&mut packet, inner);

        for ip in &batch {
            if let Some(permission) = inner.permissions.get_mut(ip) {
                permission.installing = true;
            }
        }

        log::debug!("create permission cycle: peers={}", batch.len());

        inner.permission_batch = batch;
        inner.last_permission_cycle = Some(now);
        inner.permission_requester = Some(StunRequester::create(
            self.services.requesters(),
            Arc::new(RequesterBridge {
                client: self.this.clone(),
                kind: RequestKind::Permission,
            }),
            active.addr,
            packet,
            TURN_RFC,
            inner.credential,
            None,
        ));
    }

    fn on_permission_response(
        self: &Arc<Self>,
        requester: &Arc<StunRequester>,
        response: &Packet,
    ) -> bool {
        let mut actions = Actions::default();
        {
            let mut inner = self.state.lock();
            if !inner
                .permission_requester
                .as_ref()
                .is_some_and(|it| Arc::ptr_eq(it, requester))
            {
                return true;
            }

            if let Some(error) = response.error() {
                if !response.method().is_error() {
                    return false;
                }

                if error.kind() == Some(ErrKind::StaleNonce) {
                    if let Some(nonce) = response.nonce() {
                        inner.nonce = Some(nonce.to_string());
                    }

                    inner.permission_requester = None;
                    let batch = std::mem::take(&mut inner.permission_batch);
                    for ip in &batch {
                        if let Some(permission) = inner.permissions.get_mut(ip) {
                            permission.installing = false;
                        }
                    }

                    self.request_permissions_now(&mut inner, Instant::now());
                } else {
                    // the peers in this batch can not be authorized;
                    // their parked datagrams go with them.
                    log::warn!("create permission rejected: code={}", error.code);

                    inner.permission_requester = None;
                    let batch = std::mem::take(&mut inner.permission_batch);
                    for ip in batch {
                        inner.permissions.remove(&ip);
                    }
                }
            } else {
                inner.permission_requester = None;

                let now = Instant::now();
                let batch = std::mem::take(&mut inner.permission_batch);
                for ip in batch {
                    if let Some(permission) = inner.permissions.get_mut(&ip) {
                        permission.installed = true;
                        permission.installing = false;
                    }

                    self.flush_pending(&mut inner, ip, now, &mut actions);
                }

                if inner.permission_cycle_scheduled
                    || inner.permissions.values().any(|it| !it.installed)
                {
                    inner.permission_cycle_scheduled = false;
                    self.schedule_permission_cycle(&mut inner, now);
                }
            }
        }

        self.run_actions(actions);
        self.clear_backgrounding_notifier_if_possible();
        true
    }

    fn on_permission_timeout(self: &Arc<Self>) {
        {
            let mut inner = self.state.lock();
            inner.permission_requester = None;

            let batch = std::mem::take(&mut inner.permission_batch);
            log::warn!("create permission timed out: peers={}", batch.len());
            for ip in batch {
                inner.permissions.remove(&ip);
            }
        }

        self.clear_backgrounding_notifier_if_possible();
    }

    /// Drop idle permissions and refresh the rest.  Runs on the
    /// maintenance timer while Ready.
    fn permission_maintenance_tick(self: &Arc<Self>, generation: u64) -> bool {
        let mut inner = self.state.lock();
        if inner.generation != generation || inner.current_state != TurnState::Ready {
            return false;
        }

        let now = Instant::now();
        inner.permissions.retain(|_, permission| {
            let keep = now.duration_since(permission.last_send) < PERMISSION_IDLE_TIMEOUT
                || !permission.pending.is_empty();
            if !keep {
                log::debug!("permission expired idle: peer={:?}", permission.peer);
            }

            keep
        });

        if !inner.permissions.is_empty() && inner.permission_requester.is_none() {
            self.request_permissions_now(&mut inner, now);
        }

        true
    }

    // ------------------------------------------------------------------
    // channels

    fn initiate_channel_bind(self: &Arc<Self>, inner: &mut TurnInner, peer: SocketAddr, now: Instant) {
        if inner.channels_by_peer.contains_key(&peer) {
            return;
        }

        let Some(active) = inner.active.clone() else {
            return;
        };

        let TurnInner {
            channel_allocator,
            channels,
            ..
        } = &mut *inner;

        let Some(number) = channel_allocator.next(|number| channels.contains_key(&number)) else {
            log::warn!("channel range exhausted: peer={:?}", peer);
            return;
        };

        inner.channels.insert(number, ChannelBinding::new(number, peer, now));
        inner.channels_by_peer.insert(peer, number);

        log::debug!("binding channel: number={:#06x}, peer={:?}", number, peer);
        self.start_channel_bind(inner, &active, number, peer);
    }

    fn start_channel_bind(
        self: &Arc<Self>,
        inner: &mut TurnInner,
        active: &Arc<CandidateServer>,
        number: u16,
        peer: SocketAddr,
    ) {
        let mut packet = Packet::request(Method::ChannelBind(MethodType::Request))
            .with(Attribute::ChannelNumber(number))
            .with(Attribute::XorPeerAddress(peer));
        self.push_auth(&mut packet, inner);

        let requester = StunRequester::create(
            self.services.requesters(),
            Arc::new(RequesterBridge {
                client: self.this.clone(),
                kind: RequestKind::ChannelBind(number),
            }),
            active.addr,
            packet,
            TURN_RFC,
            inner.credential,
            None,
        );

        inner.channel_bind_requesters.insert(number, requester);
    }

    fn on_channel_bind_response(
        self: &Arc<Self>,
        number: u16,
        requester: &Arc<StunRequester>,
        response: &Packet,
    ) -> bool {
        let mut actions = Actions::default();
        {
            let mut inner = self.state.lock();
            if !inner
                .channel_bind_requesters
                .get(&number)
                .is_some_and(|it| Arc::ptr_eq(it, requester))
            {
                return true;
            }

            if let Some(error) = response.error() {
                if !response.method().is_error() {
                    return false;
                }

                inner.channel_bind_requesters.remove(&number);

                if error.kind() == Some(ErrKind::StaleNonce) {
                    if let Some(nonce) = response.nonce() {
                        inner.nonce = Some(nonce.to_string());
                    }

                    if let (Some(peer), Some(active)) = (
                        inner.channels.get(&number).map(|it| it.peer),
                        inner.active.clone(),
                    ) {
                        self.start_channel_bind(&mut inner, &active, number, peer);
                    }
                } else {
                    // fall back to send indications for this peer.
                    log::warn!(
                        "channel bind rejected: number={:#06x}, code={}",
                        number,
                        error.code
                    );

                    if let Some(binding) = inner.channels.remove(&number) {
                        inner.channels_by_peer.remove(&binding.peer);
                    }
                }
            } else {
                inner.channel_bind_requesters.remove(&number);

                let peer = match inner.channels.get_mut(&number) {
                    Some(binding) => {
                        binding.bound = true;
                        Some(binding.peer)
                    }
                    None => None,
                };

                log::debug!("channel bound: number={:#06x}, peer={:?}", number, peer);

                if let Some(peer) = peer {
                    let now = Instant::now();
                    self.flush_pending(&mut inner, peer.ip(), now, &mut actions);
                    self.schedule_channel_refresh(&inner, number);
                }
            }
        }

        self.run_actions(actions);
        true
    }

    fn on_channel_bind_timeout(self: &Arc<Self>, number: u16) {
        let mut inner = self.state.lock();
        inner.channel_bind_requesters.remove(&number);

        log::warn!("channel bind timed out: number={:#06x}", number);
        if let Some(binding) = inner.channels.remove(&number) {
            inner.channels_by_peer.remove(&binding.peer);
        }
    }

    fn schedule_channel_refresh(&self, inner: &TurnInner, number: u16) {
        let generation = inner.generation;
        let this = self.this.clone();

        tokio::spawn(async move {
            tokio::time::sleep(CHANNEL_REFRESH_INTERVAL).await;

            let Some(client) = this.upgrade() else {
                return;
            };

            let mut inner = client.state.lock();
            if inner.generation != generation || inner.current_state != TurnState::Ready {
                return;
            }

            if inner.channel_bind_requesters.contains_key(&number) {
                return;
            }

            let (Some(binding), Some(active)) = (
                inner.channels.get(&number).filter(|it| it.bound),
                inner.active.clone(),
            ) else {
                return;
            };

            let peer = binding.peer;
            log::trace!(
                "refreshing channel binding: number={:#06x}, idle={:?}",
                binding.number,
                Instant::now() - binding.last_send
            );

            client.start_channel_bind(&mut inner, &active, number, peer);
        });
    }

    // ------------------------------------------------------------------
    // data paths

    fn send_channel_data(
        &self,
        inner: &mut TurnInner,
        number: u16,
        peer: SocketAddr,
        data: &[u8],
        now: Instant,
        actions: &mut Actions,
    ) {
        let Some(active) = inner.active.clone() else {
            return;
        };

        let mut buf = BytesMut::with_capacity(data.len() + 8);
        let frame = ChannelData {
            number,
            bytes: data,
        };

        match active.transport {
            Transport::Udp => frame.encode(&mut buf),
            Transport::Tcp => frame.encode_tcp(&mut buf),
        }

        if let Some(binding) = inner.channels.get_mut(&number) {
            binding.last_send = now;
        }

        if let Some(permission) = inner.permissions.get_mut(&peer.ip()) {
            permission.last_send = now;
        }

        self.transmit(inner, &active, buf.freeze(), actions);
    }

    fn send_indication(
        &self,
        inner: &mut TurnInner,
        peer: SocketAddr,
        data: &[u8],
        now: Instant,
        actions: &mut Actions,
    ) {
        let Some(active) = inner.active.clone() else {
            return;
        };

        let packet = Packet::request(Method::SendIndication)
            .with(Attribute::XorPeerAddress(peer))
            .with(Attribute::Data(data.to_vec()));

        let mut buf = BytesMut::with_capacity(data.len() + 64);
        if packet.encode(TURN_RFC, None, false, &mut buf).is_err() {
            return;
        }

        if let Some(permission) = inner.permissions.get_mut(&peer.ip()) {
            permission.last_send = now;
        }

        self.transmit(inner, &active, buf.freeze(), actions);
    }

    /// Release every datagram parked behind the peer's permission,
    /// through the channel when one is bound.
    fn flush_pending(
        self: &Arc<Self>,
        inner: &mut TurnInner,
        peer_ip: IpAddr,
        now: Instant,
        actions: &mut Actions,
    ) {
        let pending: Vec<PendingDatagram> = match inner.permissions.get_mut(&peer_ip) {
            Some(permission) => permission.pending.drain(..).collect(),
            None => return,
        };

        for datagram in pending {
            let bound_channel = inner
                .channels_by_peer
                .get(&datagram.peer)
                .copied()
                .filter(|number| inner.channels.get(number).is_some_and(|it| it.bound));

            match bound_channel {
                Some(number) => self.send_channel_data(
                    inner,
                    number,
                    datagram.peer,
                    &datagram.data,
                    now,
                    actions,
                ),
                None => {
                    self.send_indication(inner, datagram.peer, &datagram.data, now, actions);

                    // the datagram asked for a channel that is still not
                    // bound, e.g. after a failed bind attempt.
                    if datagram.bind_channel && self.use_channel_binding {
                        self.initiate_channel_bind(inner, datagram.peer, now);
                    }
                }
            }
        }
    }

    fn transmit(
        &self,
        inner: &TurnInner,
        server: &Arc<CandidateServer>,
        bytes: Bytes,
        actions: &mut Actions,
    ) {
        match server.transport {
            Transport::Udp => {
                if let Some(delegate) = inner.delegate.clone() {
                    actions.sends.push((delegate, server.addr, bytes));
                }
            }
            Transport::Tcp => {
                server.queue_write(&bytes);
            }
        }
    }

    // ------------------------------------------------------------------
    // shutdown

    fn shutdown_with_error(self: &Arc<Self>, error: TurnError) {
        enum Mode {
            Ignore,
            Graceful,
            Immediate,
        }

        let mut actions = Actions::default();
        let mode = {
            let mut inner = self.state.lock();
            match inner.current_state {
                TurnState::Shutdown | TurnState::ShuttingDown => Mode::Ignore,
                state => {
                    if inner.last_error.is_none() {
                        inner.last_error = Some(error);
                    }

                    // a graceful deallocate only makes sense while the
                    // server is still answering us.
                    if state == TurnState::Ready
                        && error == TurnError::UserRequestedShutdown
                        && inner.credential.is_some()
                        && inner.active.is_some()
                    {
                        inner.current_state = TurnState::ShuttingDown;
                        if let Some(delegate) = inner.delegate.clone() {
                            actions.state = Some((delegate, TurnState::ShuttingDown));
                        }

                        self.cancel_maintenance(&mut inner);
                        self.start_deallocate(&mut inner);
                        Mode::Graceful
                    } else {
                        Mode::Immediate
                    }
                }
            }
        };

        self.run_actions(actions);
        if let Mode::Immediate = mode {
            self.finish_shutdown();
        }
    }

    /// Stop timers and cancel every ancillary requester.  Called under
    /// the lock.
    fn cancel_maintenance(&self, inner: &mut TurnInner) {
        inner.generation += 1;

        let mut cancelled: Vec<Arc<StunRequester>> = Vec::new();
        cancelled.extend(inner.refresh_requester.take());
        cancelled.extend(inner.permission_requester.take());
        cancelled.extend(inner.channel_bind_requesters.drain().map(|(_, it)| it));

        inner.permission_batch.clear();
        inner.permission_cycle_scheduled = false;

        for requester in cancelled {
            requester.cancel();
        }
    }

    fn finish_shutdown(self: &Arc<Self>) {
        let mut actions = Actions::default();
        let servers = {
            let mut inner = self.state.lock();
            if inner.current_state == TurnState::Shutdown {
                return;
            }

            self.cancel_maintenance(&mut inner);

            if let Some(requester) = inner.deallocate_requester.take() {
                requester.cancel();
            }

            inner.permissions.clear();
            inner.channels.clear();
            inner.channels_by_peer.clear();
            inner.backgrounding_notifier = None;
            inner.backgrounding_subscription = None;

            inner.current_state = TurnState::Shutdown;

            log::info!("turn client shutdown: error={:?}", inner.last_error);

            // the state change is the last callback the delegate sees.
            if let Some(delegate) = inner.delegate.take() {
                actions.state = Some((delegate, TurnState::Shutdown));
            }

            std::mem::take(&mut inner.servers)
        };

        for server in servers {
            server.fail();
        }

        self.run_actions(actions);
    }

    // ------------------------------------------------------------------
    // plumbing

    fn push_auth(&self, packet: &mut Packet, inner: &TurnInner) {
        if let (Some(realm), Some(nonce)) = (inner.realm.clone(), inner.nonce.clone()) {
            packet.push(Attribute::UserName(self.username.clone()));
            packet.push(Attribute::Realm(realm));
            packet.push(Attribute::Nonce(nonce));
        }
    }

    fn clear_backgrounding_notifier_if_possible(&self) {
        let mut inner = self.state.lock();
        if inner.refresh_requester.is_none()
            && inner.permission_requester.is_none()
            && inner.deallocate_requester.is_none()
        {
            inner.backgrounding_notifier = None;
        }
    }

    fn on_requester_send(self: &Arc<Self>, kind: &RequestKind, packet: Bytes) {
        let mut actions = Actions::default();
        {
            let inner = self.state.lock();
            let server = match kind {
                RequestKind::Allocate(server) => server.upgrade(),
                _ => inner.active.clone(),
            };

            if let Some(server) = server {
                self.transmit(&inner, &server, packet, &mut actions);
            }
        }

        self.run_actions(actions);
    }

    fn run_actions(self: &Arc<Self>, actions: Actions) {
        if let Some((delegate, state)) = actions.state {
            delegate.on_state_changed(self, state);
        }

        for (delegate, destination, bytes) in actions.sends {
            delegate.on_send_packet(self, destination, bytes);
        }

        for (delegate, peer, bytes) in actions.packets {
            delegate.on_packet(self, peer, &bytes);
        }
    }

    fn run_after(self: &Arc<Self>, after: After) {
        match after {
            After::Nothing => {}
            After::CheckAllFailed => self.check_all_failed(),
            After::Shutdown(error) => self.shutdown_with_error(error),
        }
    }
}

impl BackgroundingDelegate for TurnClient {
    fn going_to_background(&self, notifier: BackgroundingNotifier) {
        let Some(this) = self.this.upgrade() else {
            return;
        };

        {
            let mut inner = this.state.lock();
            if inner.current_state != TurnState::Ready {
                return;
            }

            inner.backgrounding_notifier = Some(notifier);
        }

        // push the lifetime out before we freeze.
        this.refresh_now();
        this.clear_backgrounding_notifier_if_possible();
    }

    fn going_to_background_now(&self) {
        self.state.lock().backgrounding_notifier = None;
    }

    fn returning_from_background(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };

        // the network may have changed while frozen; a refresh verifies
        // the allocation and exercises the TCP connection.
        this.refresh_now();
    }

    fn application_will_quit(&self) {
        if let Some(this) = self.this.upgrade() {
            this.shutdown();
        }
    }
}

enum RequestKind {
    Allocate(Weak<CandidateServer>),
    Refresh,
    Deallocate,
    Permission,
    ChannelBind(u16),
}

struct RequesterBridge {
    client: Weak<TurnClient>,
    kind: RequestKind,
}

impl RequesterDelegate for RequesterBridge {
    fn on_send_packet(&self, _: &Arc<StunRequester>, _: SocketAddr, packet: Bytes) {
        if let Some(client) = self.client.upgrade() {
            client.on_requester_send(&self.kind, packet);
        }
    }

    fn handle_response(
        &self,
        requester: &Arc<StunRequester>,
        from: SocketAddr,
        response: &Packet,
    ) -> bool {
        let Some(client) = self.client.upgrade() else {
            return true;
        };

        match &self.kind {
            RequestKind::Allocate(server) => match server.upgrade() {
                Some(server) => client.on_allocate_response(&server, requester, from, response),
                None => true,
            },
            RequestKind::Refresh => client.on_refresh_response(requester, response),
            RequestKind::Deallocate => client.on_deallocate_response(requester, response),
            RequestKind::Permission => client.on_permission_response(requester, response),
            RequestKind::ChannelBind(number) => {
                client.on_channel_bind_response(*number, requester, response)
            }
        }
    }

    fn on_timed_out(&self, _: &Arc<StunRequester>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };

        match &self.kind {
            RequestKind::Allocate(server) => {
                if let Some(server) = server.upgrade() {
                    client.on_allocate_timeout(&server);
                }
            }
            RequestKind::Refresh => client.on_refresh_timeout(),
            RequestKind::Deallocate => client.on_deallocate_timeout(),
            RequestKind::Permission => client.on_permission_timeout(),
            RequestKind::ChannelBind(number) => client.on_channel_bind_timeout(*number),
        }
    }
}

async fn enumerate_servers(
    this: Weak<TurnClient>,
    resolver: Arc<dyn DnsResolver>,
    source: TurnServerSource,
    force_udp: bool,
    force_tcp: bool,
) {
    let (mut udp, mut tcp) = match source {
        TurnServerSource::Srv { udp, tcp } => (udp, tcp),
        TurnServerSource::Name(name) => {
            let udp = if force_tcp {
                None
            } else {
                resolver
                    .lookup_srv(&name, TURN_SRV_SERVICE, "udp", TURN_DEFAULT_PORT)
                    .await
                    .ok()
                    .filter(|it| !it.is_empty())
            };

            let tcp = if force_udp {
                None
            } else {
                resolver
                    .lookup_srv(&name, TURN_SRV_SERVICE, "tcp", TURN_DEFAULT_PORT)
                    .await
                    .ok()
                    .filter(|it| !it.is_empty())
            };

            if udp.is_none() && tcp.is_none() {
                // no SRV records at all: fall back to the bare name.
                match resolver.lookup_a_or_aaaa(&name).await {
                    Ok(addresses) if !addresses.is_empty() => {
                        let result =
                            SrvResult::from_addresses(&name, addresses, TURN_DEFAULT_PORT);
                        (Some(result.clone()), Some(result))
                    }
                    _ => (None, None),
                }
            } else {
                (udp, tcp)
            }
        }
    };

    if force_udp {
        tcp = None;
    }
    if force_tcp {
        udp = None;
    }

    let Some(client) = this.upgrade() else {
        return;
    };

    client.finish_enumeration(udp, tcp);
}

async fn run_activation(this: Weak<TurnClient>) {
    loop {
        tokio::time::sleep(ACTIVATION_TICK).await;

        let Some(client) = this.upgrade() else {
            return;
        };

        if !client.activate_due_servers() {
            return;
        }
    }
}

fn spawn_permission_maintenance(this: Weak<TurnClient>, generation: u64) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(PERMISSION_REFRESH_INTERVAL).await;

            let Some(client) = this.upgrade() else {
                return;
            };

            if !client.permission_maintenance_tick(generation) {
                return;
            }
        }
    });
}

