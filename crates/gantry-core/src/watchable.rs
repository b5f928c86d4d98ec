//! A concurrent key-value store with subscriptions.
//!
//! A [WatchableStore] is the only way pipeline stages talk to each other. One
//! stage writes keys, and any number of downstream stages subscribe to changes.
//!
//! Every [Subscription] starts with a [Snapshot] of the full state of the
//! store at the moment it subscribed, expressed as a batch of store updates,
//! and every snapshot after that contains only what changed since the last
//! one was received. A subscriber that falls behind never blocks a writer or
//! another subscriber: pending updates are coalesced per key, so a slow
//! subscriber only ever sees the latest value for a key (or its deletion).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use futures::Stream;
use tokio::sync::Notify;

macro_rules! no_poison {
    ($guard:expr) => {
        $guard.expect("WatchableStore was poisoned: this is a bug in Gantry")
    };
}

/// A single change to a store.
///
/// Deletes carry the last value stored at the key so subscribers can clean up
/// any state they derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Update<K, V> {
    pub key: K,
    pub value: V,
    pub delete: bool,
}

impl<K, V> Update<K, V> {
    fn store(key: K, value: V) -> Self {
        Self {
            key,
            value,
            delete: false,
        }
    }

    fn delete(key: K, value: V) -> Self {
        Self {
            key,
            value,
            delete: true,
        }
    }
}

/// A batch of updates delivered to a subscriber.
///
/// The first snapshot a subscriber receives has `initial` set and contains
/// the entire contents of the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<K, V> {
    pub initial: bool,
    pub updates: Vec<Update<K, V>>,
}

/// A thread-safe map that supports subscribing to changes.
///
/// Cloning a store is cheap and every clone refers to the same data.
pub struct WatchableStore<K, V> {
    inner: Arc<Mutex<StoreInner<K, V>>>,
}

impl<K, V> Clone for WatchableStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Default for WatchableStore<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                values: BTreeMap::new(),
                subscribers: Vec::new(),
                closed: false,
            })),
        }
    }
}

struct StoreInner<K, V> {
    values: BTreeMap<K, V>,
    subscribers: Vec<Weak<Subscriber<K, V>>>,
    closed: bool,
}

struct Subscriber<K, V> {
    state: Mutex<SubscriberState<K, V>>,
    notify: Notify,
}

struct SubscriberState<K, V> {
    initial: bool,
    pending: Vec<Update<K, V>>,
    closed: bool,
}

impl<K, V> Subscriber<K, V>
where
    K: PartialEq,
{
    fn push(&self, update: Update<K, V>) {
        let mut state = no_poison!(self.state.lock());
        let existing = state.pending.iter().position(|u| u.key == update.key);
        match existing {
            // the initial snapshot only ever holds current state, so a delete
            // before it's delivered just takes the key back out.
            Some(idx) if state.initial && update.delete => {
                state.pending.remove(idx);
            }
            None if state.initial && update.delete => (),
            Some(idx) => state.pending[idx] = update,
            None => state.pending.push(update),
        }
        drop(state);
        self.notify.notify_one();
    }

    fn close(&self) {
        no_poison!(self.state.lock()).closed = true;
        self.notify.notify_one();
    }
}

impl<K, V> WatchableStore<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value at a key.
    ///
    /// Storing a value equal to the current value is a no-op, and subscribers
    /// are not notified. Stores after the store has been closed are ignored.
    pub fn store(&self, key: K, value: V) {
        let mut inner = no_poison!(self.inner.lock());
        if inner.closed {
            tracing::debug!("ignoring store to a closed WatchableStore");
            return;
        }

        if inner.values.get(&key) == Some(&value) {
            return;
        }

        inner.values.insert(key.clone(), value.clone());
        inner.publish(Update::store(key, value));
    }

    /// Delete a key. Deleting a key that doesn't exist is a no-op.
    pub fn delete(&self, key: &K) {
        let mut inner = no_poison!(self.inner.lock());
        if inner.closed {
            tracing::debug!("ignoring delete from a closed WatchableStore");
            return;
        }

        if let Some(value) = inner.values.remove(key) {
            inner.publish(Update::delete(key.clone(), value));
        }
    }

    /// Get the current value of a key.
    pub fn load(&self, key: &K) -> Option<V> {
        no_poison!(self.inner.lock()).values.get(key).cloned()
    }

    /// Get a point-in-time copy of the entire store.
    pub fn load_all(&self) -> BTreeMap<K, V> {
        no_poison!(self.inner.lock()).values.clone()
    }

    pub fn len(&self) -> usize {
        no_poison!(self.inner.lock()).values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to changes.
    ///
    /// The first snapshot received on the subscription contains the full
    /// state of the store. Subscribing to a closed store returns a
    /// subscription that ends immediately after that first snapshot.
    pub fn subscribe(&self) -> Subscription<K, V> {
        let mut inner = no_poison!(self.inner.lock());

        let pending = inner
            .values
            .iter()
            .map(|(k, v)| Update::store(k.clone(), v.clone()))
            .collect();

        let subscriber = Arc::new(Subscriber {
            state: Mutex::new(SubscriberState {
                initial: true,
                pending,
                closed: inner.closed,
            }),
            notify: Notify::new(),
        });

        if !inner.closed {
            inner.subscribers.push(Arc::downgrade(&subscriber));
        }

        Subscription {
            subscriber,
            delivered_initial: false,
        }
    }

    /// Close the store, ending every subscription. Writes to a closed store
    /// are ignored.
    pub fn close(&self) {
        let mut inner = no_poison!(self.inner.lock());
        inner.closed = true;
        for subscriber in inner.subscribers.drain(..) {
            if let Some(subscriber) = subscriber.upgrade() {
                subscriber.close();
            }
        }
    }
}

impl<K, V> StoreInner<K, V>
where
    K: PartialEq + Clone,
    V: Clone,
{
    fn publish(&mut self, update: Update<K, V>) {
        // drop subscribers that have gone away while we're here
        self.subscribers.retain(|s| s.strong_count() > 0);

        for subscriber in &self.subscribers {
            if let Some(subscriber) = subscriber.upgrade() {
                subscriber.push(update.clone());
            }
        }
    }
}

/// A stream of [Snapshot]s from a [WatchableStore].
///
/// Dropping a subscription unsubscribes it.
pub struct Subscription<K, V> {
    subscriber: Arc<Subscriber<K, V>>,
    delivered_initial: bool,
}

impl<K, V> Subscription<K, V> {
    /// Wait for the next snapshot. Returns `None` once the store has been
    /// closed and every pending update has been delivered.
    ///
    /// The initial snapshot is always delivered, even if the store is empty.
    pub async fn recv(&mut self) -> Option<Snapshot<K, V>> {
        loop {
            {
                let mut state = no_poison!(self.subscriber.state.lock());
                if !self.delivered_initial || !state.pending.is_empty() {
                    self.delivered_initial = true;
                    let initial = std::mem::replace(&mut state.initial, false);
                    let updates = std::mem::take(&mut state.pending);
                    return Some(Snapshot { initial, updates });
                }

                if state.closed {
                    return None;
                }
            }

            // notify_one stores a permit when nobody is waiting, so an update
            // pushed between dropping the lock and awaiting isn't lost.
            self.subscriber.notify.notified().await;
        }
    }

    /// Convert this subscription into a [Stream] of snapshots.
    pub fn into_stream(self) -> impl Stream<Item = Snapshot<K, V>> {
        futures::stream::unfold(self, |mut sub| async move {
            let snapshot = sub.recv().await?;
            Some((snapshot, sub))
        })
    }
}
