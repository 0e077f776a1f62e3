use std::{
    collections::BTreeMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

/// Callbacks delivered to a long-lived entity around application
/// background transitions.
pub trait BackgroundingDelegate: Send + Sync {
    /// The application is about to background.  The entity flushes
    /// whatever it needs to and holds the notifier until it is safe to
    /// be frozen; the transition for this phase completes when every
    /// notifier clone is dropped.
    fn going_to_background(&self, notifier: BackgroundingNotifier);

    /// Hard cutoff; the process may be frozen at any moment.
    fn going_to_background_now(&self);

    /// Resume.  TCP sockets should be probed since the network may have
    /// changed underneath them while frozen.
    fn returning_from_background(&self);

    /// The application is terminating.
    fn application_will_quit(&self);
}

/// Held by a subscriber while it finishes its pre-background work.
///
/// The token is cheap to clone; the phase completes once every clone
/// is gone.
#[derive(Clone)]
pub struct BackgroundingNotifier {
    _permit: mpsc::Sender<()>,
}

impl BackgroundingNotifier {
    /// Explicitly signal readiness.  Equivalent to dropping the token.
    pub fn ready(self) {}
}

/// Resolves once every subscriber has released its notifier.
pub struct GoingToBackgroundQuery {
    done: oneshot::Receiver<()>,
}

impl GoingToBackgroundQuery {
    pub async fn wait(self) {
        let _ = self.done.await;
    }
}

/// Keeps the subscription alive; dropping it unsubscribes.
pub struct BackgroundingSubscription {
    service: Weak<Backgrounding>,
    phase: u32,
    id: u64,
}

impl Drop for BackgroundingSubscription {
    fn drop(&mut self) {
        if let Some(service) = self.service.upgrade() {
            service.unsubscribe(self.phase, self.id);
        }
    }
}

type Subscribers = BTreeMap<u32, Vec<(u64, Weak<dyn BackgroundingDelegate>)>>;

/// Fan-out service for application background transitions.
///
/// Subscribers declare an integer phase.  Going to background walks the
/// phases in ascending order and waits for each phase's notifiers
/// before moving on; returning from background walks them in reverse.
pub struct Backgrounding {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
}

impl Backgrounding {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn subscribe(
        self: &Arc<Self>,
        phase: u32,
        delegate: Weak<dyn BackgroundingDelegate>,
    ) -> BackgroundingSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .entry(phase)
            .or_default()
            .push((id, delegate));

        BackgroundingSubscription {
            service: Arc::downgrade(self),
            phase,
            id,
        }
    }

    fn unsubscribe(&self, phase: u32, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(entries) = subscribers.get_mut(&phase) {
            entries.retain(|(entry, _)| *entry != id);
            if entries.is_empty() {
                subscribers.remove(&phase);
            }
        }
    }

    // Snapshot the live delegates so no callback runs under the lock,
    // purging the dead entries on the way.
    fn snapshot(&self) -> Vec<(u32, Vec<Arc<dyn BackgroundingDelegate>>)> {
        let mut subscribers = self.subscribers.lock();

        let mut phases = Vec::with_capacity(subscribers.len());
        for (phase, entries) in subscribers.iter_mut() {
            entries.retain(|(_, delegate)| delegate.strong_count() > 0);

            let live: Vec<_> = entries
                .iter()
                .filter_map(|(_, delegate)| delegate.upgrade())
                .collect();

            if !live.is_empty() {
                phases.push((*phase, live));
            }
        }

        phases
    }

    /// Notify every subscriber, phase by phase, that the application is
    /// going to background.  The returned query resolves once all
    /// phases have released their notifiers.
    pub fn notify_going_to_background(self: &Arc<Self>) -> GoingToBackgroundQuery {
        let phases = self.snapshot();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            for (phase, delegates) in phases {
                let (permit, mut released) = mpsc::channel::<()>(1);

                log::debug!(
                    "backgrounding phase starting: phase={}, subscribers={}",
                    phase,
                    delegates.len()
                );

                for delegate in delegates {
                    delegate.going_to_background(BackgroundingNotifier {
                        _permit: permit.clone(),
                    });
                }

                // recv yields None once every notifier clone is gone.
                drop(permit);
                let _ = released.recv().await;
            }

            let _ = done_tx.send(());
        });

        GoingToBackgroundQuery { done: done_rx }
    }

    pub fn notify_going_to_background_now(&self) {
        for (_, delegates) in self.snapshot() {
            for delegate in delegates {
                delegate.going_to_background_now();
            }
        }
    }

    pub fn notify_returning_from_background(&self) {
        for (_, delegates) in self.snapshot().into_iter().rev() {
            for delegate in delegates {
                delegate.returning_from_background();
            }
        }
    }

    pub fn notify_application_will_quit(&self) {
        for (_, delegates) in self.snapshot() {
            for delegate in delegates {
                delegate.application_will_quit();
            }
        }
    }
}
