//! ## STUN/TURN client core
//!
//! [RFC5389]: https://tools.ietf.org/html/rfc5389
//! [RFC5766]: https://tools.ietf.org/html/rfc5766
//!
//! The NAT-traversal networking core of an interactive-communications
//! stack: a STUN request/response engine with retransmission and
//! back-off, a STUN binding discovery loop that walks an SRV-resolved
//! server list to learn the reflexive transport address, and a TURN
//! [RFC5766] relay client covering the full allocation lifecycle with
//! permissions, channel bindings and both UDP and TCP transports.
//!
//! The host application owns the sockets for UDP traffic: outbound
//! packets are handed to delegates and inbound packets are pushed into
//! [`requester::RequesterManager::handle_packet`] and the TURN client's
//! receive operations.  TCP connections to TURN servers are owned by
//! the client itself.
//!
//! Entities are driven by tokio tasks and never invoke a delegate while
//! holding their own lock; late timer wakeups and responses after
//! `cancel()` are discarded.

pub mod backgrounding;
pub mod backoff;
pub mod discovery;
pub mod dns;
pub mod requester;
pub mod settings;
pub mod turn;

use std::sync::Arc;

use crate::{backgrounding::Backgrounding, requester::RequesterManager, settings::Settings};

pub use codec::{Packet, RfcVariant, TransactionId};

/// Errors surfaced by the client core.
///
/// Transient conditions (a 300 redirect, a 401 challenge, a stale
/// nonce) are recovered internally and never reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// STUN decode failure or integrity mismatch; the packet is
    /// dropped.
    InvalidPacket,
    /// No requester is monitoring the transaction identifier; not an
    /// error for the peer, returned as "not handled".
    TransactionUnknown,
    /// The back-off schedule is exhausted for a requester.
    Timeout,
    /// An allocate or refresh received an error that is not recoverable
    /// via a realm/nonce refresh.
    AuthenticationFailed,
    /// A redirect to an alternate server; handled internally.
    TryAlternate,
    /// All SRV candidates are exhausted.
    NoServerReachable,
    /// No A/AAAA/SRV results.
    DnsFailure,
    /// Explicit teardown.
    ShutdownRequested,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(_: codec::Error) -> Self {
        Self::InvalidPacket
    }
}

/// Process-wide services root.
///
/// The requester registry, the backgrounding service and the settings
/// are plain state owned here; the host constructs the root explicitly
/// and tears it down with [`Services::shutdown`], so there is no hidden
/// global construction order.
pub struct Services {
    requesters: Arc<RequesterManager>,
    backgrounding: Arc<Backgrounding>,
    settings: Arc<Settings>,
}

impl Services {
    pub fn init(settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            requesters: RequesterManager::new(),
            backgrounding: Backgrounding::new(),
            settings: Arc::new(settings),
        })
    }

    pub fn requesters(&self) -> &Arc<RequesterManager> {
        &self.requesters
    }

    pub fn backgrounding(&self) -> &Arc<Backgrounding> {
        &self.backgrounding
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Cancel every outstanding transaction and notify long-lived
    /// entities that the application is quitting.  Idempotent.
    pub fn shutdown(&self) {
        self.backgrounding.notify_application_will_quit();
        self.requesters.cancel_all();
    }
}
