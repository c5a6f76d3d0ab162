//! Subscription multiplexer.
//!
//! Any number of caller subscriptions share at most one stack-level watch per
//! target. A [`Watch`] is reference counted through [`Arc`]: every subscription
//! record holds one strong reference per target it observes, and the live set
//! only holds [`Weak`] references. Dropping the last strong reference of a
//! registered remote watch queues its key for retirement, and
//! [`Watches::reap`] hands those keys back to the caller so that exactly one
//! disable request is issued per watch.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::stack::{Peer, ValueChanged};
use crate::table::Handle;
use crate::{Addr, Result, Uuid};

/// Characteristic identity within a watched service.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CharId {
    Uuid(Uuid),
    Handle(Handle),
}

/// De-duplication key of a stack-level watch. `addr` is `None` for local
/// characteristics.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct WatchKey {
    pub addr: Option<Addr>,
    pub service: Uuid,
    pub id: CharId,
}

impl Display for WatchKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.addr {
            Some(a) => write!(f, "{a}/")?,
            None => f.write_str("local/")?,
        }
        match self.id {
            CharId::Uuid(u) => write!(f, "{:?}/{u:?}", self.service),
            CharId::Handle(h) => write!(f, "{:?}/{h}", self.service),
        }
    }
}

/// Caller subscription identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct SubscriptionId(u64);

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WatchState {
    /// Enable request is in flight.
    Pending,
    /// Stack confirmed that notifications are enabled.
    Registered,
}

/// Stack-level watch shared by all subscriptions to the same target.
#[derive(Debug)]
pub struct Watch {
    key: WatchKey,
    chr: Uuid,
    peer: Option<Peer>,
    state: Mutex<WatchState>,
    retired: mpsc::UnboundedSender<(WatchKey, Peer)>,
}

impl Watch {
    /// Returns the de-duplication key.
    #[inline(always)]
    #[must_use]
    pub const fn key(&self) -> WatchKey {
        self.key
    }

    /// Returns the addressing mode used to enable the watch, or `None` for a
    /// local watch.
    #[inline(always)]
    #[must_use]
    pub const fn peer(&self) -> Option<Peer> {
        self.peer
    }

    /// Returns whether the stack confirmed the watch.
    #[inline]
    #[must_use]
    pub fn is_registered(&self) -> bool {
        *self.state.lock() == WatchState::Registered
    }

    /// Returns whether a value change event belongs to this watch.
    #[must_use]
    pub fn matches(&self, v: &ValueChanged) -> bool {
        self.key.addr == v.addr
            && self.key.service == v.service
            && (self.chr == v.characteristic
                || matches!(self.key.id, CharId::Handle(h) if v.handle == Some(h)))
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        let Some(peer) = self.peer else { return };
        if *self.state.get_mut() == WatchState::Registered {
            debug!("Retiring watch {}", self.key);
            let _ = self.retired.send((self.key, peer));
        }
    }
}

/// Caller-level subscription.
#[derive(Debug)]
struct Record {
    watches: SmallVec<[Arc<Watch>; 4]>,
    sink: mpsc::UnboundedSender<ValueChanged>,
    reply: Option<oneshot::Sender<Result<()>>>,
}

impl Record {
    /// Confirms the subscription once all of its watches are registered.
    fn try_confirm(&mut self, id: SubscriptionId) {
        if self.reply.is_some() && self.watches.iter().all(|w| w.is_registered()) {
            debug!("Confirmed {id}");
            if let Some(tx) = self.reply.take() {
                let _ = tx.send(Ok(()));
            }
        }
    }

    #[inline]
    fn holds(&self, w: &Arc<Watch>) -> bool {
        self.watches.iter().any(|x| Arc::ptr_eq(x, w))
    }
}

/// Live watch set and subscription records.
#[derive(Debug)]
pub struct Watches {
    live: HashMap<WatchKey, Weak<Watch>>,
    subs: HashMap<SubscriptionId, Record>,
    retired_tx: mpsc::UnboundedSender<(WatchKey, Peer)>,
    retired_rx: mpsc::UnboundedReceiver<(WatchKey, Peer)>,
    next_id: u64,
}

impl Default for Watches {
    fn default() -> Self {
        let (retired_tx, retired_rx) = mpsc::unbounded_channel();
        Self {
            live: HashMap::new(),
            subs: HashMap::new(),
            retired_tx,
            retired_rx,
            next_id: 0,
        }
    }
}

impl Watches {
    /// Creates an empty watch set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live watch for the specified key.
    #[must_use]
    pub fn get(&self, key: &WatchKey) -> Option<Arc<Watch>> {
        self.live.get(key).and_then(Weak::upgrade)
    }

    /// Returns the number of subscription records holding the watch for the
    /// specified key.
    #[must_use]
    pub fn ref_count(&self, key: &WatchKey) -> usize {
        (self.subs.values())
            .filter(|r| r.watches.iter().any(|w| w.key == *key))
            .count()
    }

    /// Returns the number of live watches.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.values().filter(|w| w.strong_count() > 0).count()
    }

    /// Returns the number of live watches on a remote device.
    #[must_use]
    pub fn live_for(&self, addr: Addr) -> usize {
        (self.live.iter())
            .filter(|(k, w)| k.addr == Some(addr) && w.strong_count() > 0)
            .count()
    }

    /// Returns the number of subscription records.
    #[inline]
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.subs.len()
    }

    /// Returns the existing watch for `key` or creates a new one. The returned
    /// flag is `true` if the watch was created and needs to be enabled. Local
    /// watches (`peer` is `None`) are registered immediately.
    pub fn acquire(
        &mut self,
        key: WatchKey,
        chr: Uuid,
        peer: Option<Peer>,
    ) -> (Arc<Watch>, bool) {
        if let Some(w) = self.get(&key) {
            trace!("Joining watch {key}");
            return (w, false);
        }
        let state = if peer.is_some() {
            WatchState::Pending
        } else {
            WatchState::Registered
        };
        let w = Arc::new(Watch {
            key,
            chr,
            peer,
            state: Mutex::new(state),
            retired: self.retired_tx.clone(),
        });
        debug!("Created watch {key}");
        self.live.insert(key, Arc::downgrade(&w));
        (w, peer.is_some())
    }

    /// Adds a subscription record. The reply is sent once every watch is
    /// registered, which may be immediately.
    pub fn subscribe(
        &mut self,
        watches: SmallVec<[Arc<Watch>; 4]>,
        sink: mpsc::UnboundedSender<ValueChanged>,
        reply: oneshot::Sender<Result<()>>,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let mut r = Record {
            watches,
            sink,
            reply: Some(reply),
        };
        debug!("Added {id} with {} watch(es)", r.watches.len());
        r.try_confirm(id);
        self.subs.insert(id, r);
        id
    }

    /// Records the completion of an enable request. On success, subscriptions
    /// waiting for the watch are confirmed. On failure, every subscription
    /// holding the watch is removed and receives the error.
    pub fn enabled(&mut self, w: &Arc<Watch>, r: Result<()>) {
        match r {
            Ok(()) => {
                *w.state.lock() = WatchState::Registered;
                debug!("Enabled watch {}", w.key);
                for (&id, rec) in &mut self.subs {
                    if rec.holds(w) {
                        rec.try_confirm(id);
                    }
                }
            }
            Err(e) => {
                warn!("Failed to enable watch {}: {e}", w.key);
                let ids: Vec<_> = (self.subs.iter())
                    .filter_map(|(&id, rec)| rec.holds(w).then_some(id))
                    .collect();
                for id in ids {
                    if let Some(rec) = self.subs.remove(&id) {
                        debug!("Removed {id}");
                        if let Some(tx) = rec.reply {
                            let _ = tx.send(Err(e.clone()));
                        }
                    }
                }
            }
        }
    }

    /// Removes a subscription record. Returns `false` if the record does not
    /// exist, which makes repeated releases harmless.
    pub fn release(&mut self, id: SubscriptionId) -> bool {
        let Some(rec) = self.subs.remove(&id) else {
            return false;
        };
        debug!("Released {id}");
        drop(rec);
        true
    }

    /// Delivers a value change to every matching subscription and returns the
    /// number of deliveries. Subscriptions with a closed sink are released.
    pub fn fan_out(&mut self, v: &ValueChanged) -> usize {
        let (mut n, mut closed) = (0, SmallVec::<[SubscriptionId; 4]>::new());
        for (&id, rec) in &self.subs {
            if !rec.watches.iter().any(|w| w.is_registered() && w.matches(v)) {
                continue;
            }
            if rec.sink.send(v.clone()).is_ok() {
                n += 1;
            } else {
                closed.push(id);
            }
        }
        for id in closed {
            debug!("Subscriber of {id} went away");
            self.release(id);
        }
        n
    }

    /// Prunes dead watches and returns the keys of registered remote watches
    /// that must be disabled. Each key is returned once per retired watch.
    pub fn reap(&mut self) -> Vec<(WatchKey, Peer)> {
        self.live.retain(|_, w| w.strong_count() > 0);
        let mut v = Vec::new();
        while let Ok(k) = self.retired_rx.try_recv() {
            v.push(k);
        }
        v
    }
}
