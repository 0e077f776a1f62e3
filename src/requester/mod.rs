pub mod manager;

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use bytes::{Bytes, BytesMut};
use codec::{Packet, RfcVariant, TransactionId, crypto::Credential};
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

use crate::backoff::{BackoffPattern, BackoffTimer};

pub use manager::RequesterManager;

/// Callbacks for one outstanding STUN transaction.
///
/// All three are invoked synchronously from the requester's task or the
/// manager's dispatch path, but never while the requester holds its own
/// lock, so a delegate may call straight back into the requester.
pub trait RequesterDelegate: Send + Sync {
    /// A serialized attempt is ready; the delegate transmits it.
    fn on_send_packet(&self, requester: &Arc<StunRequester>, destination: SocketAddr, packet: Bytes);

    /// A validated response arrived.  Returning `false` leaves the
    /// transaction outstanding, which lets a delegate reject an error
    /// response it intends to retry with updated credentials.
    fn handle_response(&self, requester: &Arc<StunRequester>, from: SocketAddr, response: &Packet)
    -> bool;

    /// The back-off schedule is exhausted.
    fn on_timed_out(&self, requester: &Arc<StunRequester>);
}

struct RequesterState {
    delegate: Option<Arc<dyn RequesterDelegate>>,
    request: Packet,
    timer: BackoffTimer,
    total_tries: u64,
}

/// One outstanding STUN request.
///
/// The requester serializes its request, drives retransmission through
/// a back-off timer and surfaces the first valid response to its
/// delegate.  It registers itself with the [`RequesterManager`] under
/// the request's transaction identifier and unregisters on completion
/// or [`StunRequester::cancel`]; a completed requester ignores late
/// responses.
pub struct StunRequester {
    transaction: TransactionId,
    server: SocketAddr,
    rfc: RfcVariant,
    credential: Option<Credential>,
    manager: Arc<RequesterManager>,
    state: Mutex<RequesterState>,
    wake: Notify,
}

impl StunRequester {
    /// Create the requester and send the first attempt as soon as the
    /// runtime schedules its task.
    ///
    /// The server endpoint must carry a routable address and port.
    pub fn create(
        manager: &Arc<RequesterManager>,
        delegate: Arc<dyn RequesterDelegate>,
        server: SocketAddr,
        request: Packet,
        rfc: RfcVariant,
        credential: Option<Credential>,
        pattern: Option<BackoffPattern>,
    ) -> Arc<Self> {
        assert!(!server.ip().is_unspecified());
        assert!(server.port() != 0);

        let requester = Arc::new(Self {
            transaction: request.transaction(),
            server,
            rfc,
            credential,
            manager: manager.clone(),
            state: Mutex::new(RequesterState {
                delegate: Some(delegate),
                request,
                timer: BackoffTimer::new(pattern.unwrap_or_default()),
                total_tries: 0,
            }),
            wake: Notify::new(),
        });

        manager.monitor_start(&requester);
        tokio::spawn(run(Arc::downgrade(&requester)));
        requester
    }

    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn server_ip(&self) -> SocketAddr {
        self.server
    }

    pub fn request(&self) -> Packet {
        self.state.lock().request.clone()
    }

    /// Number of attempts sent so far.
    pub fn total_tries(&self) -> u64 {
        self.state.lock().total_tries
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().delegate.is_none()
    }

    /// Restart the back-off schedule and retransmit immediately.
    pub fn retry_request_now(&self) {
        {
            let mut state = self.state.lock();
            if state.delegate.is_none() {
                return;
            }

            state.timer.reset();
        }

        self.wake.notify_one();
    }

    /// Idempotent: releases the delegate so late responses and timer
    /// wakeups become no-ops, and unregisters from the manager.
    pub fn cancel(&self) {
        let cancelled = self.state.lock().delegate.take().is_some();
        if cancelled {
            log::trace!(
                "requester cancelled: transaction={}, server={:?}",
                self.transaction,
                self.server
            );

            self.manager.monitor_stop(self.transaction);
        }

        self.wake.notify_one();
    }

    /// Route a decoded packet into this transaction.
    ///
    /// Returns `false` when no request is outstanding or the packet is
    /// not a valid response to it.
    pub fn handle_stun_packet(self: &Arc<Self>, from: SocketAddr, packet: &Packet) -> bool {
        let delegate = {
            let state = self.state.lock();
            let Some(delegate) = state.delegate.clone() else {
                return false;
            };

            if !packet.is_valid_response_to(&state.request, self.rfc) {
                log::trace!(
                    "response failed validation: transaction={}, from={:?}",
                    self.transaction,
                    from
                );

                return false;
            }

            delegate
        };

        // The delegate is informed outside the lock: it may be calling
        // into this requester at the same time.
        if !delegate.handle_response(self, from, packet) {
            return false;
        }

        self.cancel();
        true
    }
}

impl Drop for StunRequester {
    fn drop(&mut self) {
        if self.state.get_mut().delegate.take().is_some() {
            self.manager.monitor_stop(self.transaction);
        }
    }
}

enum Step {
    Send(Arc<dyn RequesterDelegate>, Bytes),
    Fail(Arc<dyn RequesterDelegate>),
    Wait(Option<Instant>),
    Done,
}

async fn run(this: Weak<StunRequester>) {
    loop {
        let Some(requester) = this.upgrade() else {
            return;
        };

        let now = Instant::now();
        let step = {
            let mut state = requester.state.lock();
            let Some(delegate) = state.delegate.clone() else {
                return;
            };

            state.timer.poll(now);
            if state.timer.should_attempt_now() {
                state.timer.notify_attempting(now);
                state.total_tries += 1;

                let mut buf = BytesMut::with_capacity(1280);
                match state
                    .request
                    .encode(requester.rfc, requester.credential.as_ref(), false, &mut buf)
                {
                    Ok(()) => Step::Send(delegate, buf.freeze()),
                    Err(_) => Step::Done,
                }
            } else if state.timer.have_all_attempts_failed() {
                Step::Fail(delegate)
            } else {
                Step::Wait(state.timer.next_deadline())
            }
        };

        match step {
            Step::Send(delegate, packet) => {
                log::trace!(
                    "sending request: transaction={}, server={:?}, try={}",
                    requester.transaction,
                    requester.server,
                    requester.total_tries()
                );

                delegate.on_send_packet(&requester, requester.server, packet);
            }
            Step::Fail(delegate) => {
                log::debug!(
                    "request timed out: transaction={}, server={:?}",
                    requester.transaction,
                    requester.server
                );

                delegate.on_timed_out(&requester);
                requester.cancel();
                return;
            }
            Step::Wait(deadline) => match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = requester.wake.notified() => {}
                    }
                }
                None => requester.wake.notified().await,
            },
            Step::Done => {
                requester.cancel();
                return;
            }
        }
    }
}
