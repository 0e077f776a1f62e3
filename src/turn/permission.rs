use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
};

use bytes::Bytes;
use tokio::time::Instant;

/// Datagrams queued per peer while its permission installs.
pub(crate) const PENDING_DATA_LIMIT: usize = 10;

/// A datagram parked until the server authorizes its peer.
pub(crate) struct PendingDatagram {
    pub peer: SocketAddr,
    pub data: Bytes,
    pub bind_channel: bool,
}

/// Client-side view of a TURN permission.
///
/// A permission authorizes relayed traffic to one peer IP.  Datagrams
/// sent before the CreatePermission round-trip completes are queued
/// here, bounded; overflow drops the newest datagram.
pub(crate) struct Permission {
    pub peer: IpAddr,
    pub installed: bool,
    /// part of the CreatePermission request currently in flight.
    pub installing: bool,
    pub last_send: Instant,
    pub pending: VecDeque<PendingDatagram>,
}

impl Permission {
    pub fn new(peer: IpAddr, now: Instant) -> Self {
        Self {
            peer,
            installed: false,
            installing: false,
            last_send: now,
            pending: VecDeque::new(),
        }
    }

    /// Queue a datagram, dropping it when the bound is reached.
    pub fn queue(&mut self, datagram: PendingDatagram) -> bool {
        if self.pending.len() >= PENDING_DATA_LIMIT {
            log::warn!(
                "pending queue full, dropping datagram: peer={:?}, size={}",
                datagram.peer,
                datagram.data.len()
            );

            return false;
        }

        self.pending.push_back(datagram);
        true
    }
}
