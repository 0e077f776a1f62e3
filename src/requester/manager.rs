use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use ahash::AHashMap;
use codec::{Packet, RfcVariant, TransactionId};
use parking_lot::Mutex;

use super::StunRequester;

/// Registry routing incoming STUN responses to the requester that owns
/// their transaction identifier.
///
/// Entries hold weak references: a requester that completes or is
/// dropped leaves at most a stale entry behind, purged on the next
/// lookup.  The lock guards only the map; dispatch into a requester
/// happens outside it.
pub struct RequesterManager {
    requesters: Mutex<AHashMap<TransactionId, Weak<StunRequester>>>,
}

impl RequesterManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requesters: Mutex::new(AHashMap::with_capacity(16)),
        })
    }

    pub(crate) fn monitor_start(&self, requester: &Arc<StunRequester>) {
        self.requesters
            .lock()
            .insert(requester.transaction(), Arc::downgrade(requester));
    }

    pub(crate) fn monitor_stop(&self, transaction: TransactionId) {
        self.requesters.lock().remove(&transaction);
    }

    /// Number of transactions currently monitored.
    pub fn len(&self) -> usize {
        self.requesters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requesters.lock().is_empty()
    }

    /// Dispatch an already-decoded packet.  Returns whether a requester
    /// claimed it.
    pub fn handle_stun_packet(&self, from: SocketAddr, packet: &Packet) -> bool {
        let requester = {
            let mut requesters = self.requesters.lock();
            match requesters.get(&packet.transaction()) {
                None => None,
                Some(weak) => match weak.upgrade() {
                    Some(requester) => Some(requester),
                    None => {
                        // the owner is gone; drop the stale entry.
                        requesters.remove(&packet.transaction());
                        None
                    }
                },
            }
        };

        match requester {
            Some(requester) => requester.handle_stun_packet(from, packet),
            None => {
                log::trace!(
                    "no requester for transaction: transaction={}, from={:?}",
                    packet.transaction(),
                    from
                );

                false
            }
        }
    }

    /// Decode raw bytes against the allowed RFC variants and dispatch.
    pub fn handle_packet(&self, from: SocketAddr, bytes: &[u8], allowed_rfcs: &[RfcVariant]) -> bool {
        for rfc in allowed_rfcs {
            if let Ok(packet) = Packet::decode(bytes, *rfc) {
                return self.handle_stun_packet(from, &packet);
            }
        }

        false
    }

    /// Cancel every monitored requester.  Used at services teardown.
    pub(crate) fn cancel_all(&self) {
        let requesters: Vec<_> = {
            self.requesters
                .lock()
                .values()
                .filter_map(|weak| weak.upgrade())
                .collect()
        };

        for requester in requesters {
            requester.cancel();
        }
    }
}
