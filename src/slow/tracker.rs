//! Group-level slowness derived from the query cache's lifecycle events.
//!
//! Every query tagged with a [`PeerGroup`] contributes to its group. The
//! first fetch to start in a group arms a single timer; when it fires while
//! some member is still fetching, the group is marked slow. As soon as no
//! member of the group is fetching, the timer is cancelled and the flag
//! cleared. Listeners are told about every transition of the flag.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::query::{
  lock, CacheEvent, KeyHash, PeerGroup, QueryCache, QueryFilter, QueryKey, Subscription,
  UpdateAction,
};

/// Callback told about `is_slow` transitions of one peer group.
type SlowListener = Arc<dyn Fn(bool) + Send + Sync>;

struct SlowTimer {
  generation: u64,
  handle: JoinHandle<()>,
}

/// Exists only while the group has at least one observer.
struct GroupState {
  key: QueryKey,
  timeout: Duration,
  is_slow: bool,
  observer_count: usize,
  timer: Option<SlowTimer>,
}

impl GroupState {
  fn new(peer: &PeerGroup) -> Self {
    Self {
      key: peer.key.clone(),
      timeout: peer.timeout,
      is_slow: false,
      observer_count: 0,
      timer: None,
    }
  }

  fn cancel_timer(&mut self) {
    if let Some(timer) = self.timer.take() {
      timer.handle.abort();
      trace!(group = %self.key, generation = timer.generation, "Slow timer cancelled");
    }
  }
}

struct TrackerInner {
  groups: Mutex<HashMap<KeyHash, GroupState>>,
  listeners: Mutex<HashMap<KeyHash, Vec<(u64, SlowListener)>>>,
  /// Source of listener ids and timer generations
  next_id: AtomicU64,
  cache_subscription: Mutex<Option<Subscription>>,
}

impl TrackerInner {
  fn next_id(&self) -> u64 {
    self.next_id.fetch_add(1, Ordering::Relaxed)
  }

  fn on_cache_event(self: &Arc<Self>, cache: &QueryCache, event: &CacheEvent) {
    match event {
      CacheEvent::ObserverAdded {
        peer: Some(peer), ..
      } => self.register(peer),
      CacheEvent::ObserverRemoved {
        peer: Some(peer), ..
      } => self.unregister(&peer.key),
      // Membership is by prefix, so tagged or not, an update touches every
      // tracked group whose key leads the query's key.
      CacheEvent::Updated { query, action } => {
        for group in self.groups_containing(&query.key) {
          if *action == UpdateAction::Fetch {
            self.arm_timer(&group);
          }
          self.reconcile(cache, &group);
        }
      }
      _ => {}
    }
  }

  fn groups_containing(&self, key: &QueryKey) -> Vec<QueryKey> {
    lock(&self.groups)
      .values()
      .filter(|state| key.starts_with(&state.key))
      .map(|state| state.key.clone())
      .collect()
  }

  fn register(&self, peer: &PeerGroup) {
    let mut groups = lock(&self.groups);
    let state = groups.entry(peer.key.hash()).or_insert_with(|| {
      debug!(group = %peer.key, timeout_ms = peer.timeout.as_millis() as u64, "Tracking peer group");
      GroupState::new(peer)
    });
    state.observer_count += 1;
    if state.timeout != peer.timeout {
      debug!(
        group = %peer.key,
        kept_ms = state.timeout.as_millis() as u64,
        ignored_ms = peer.timeout.as_millis() as u64,
        "Peer group already tracked with another timeout"
      );
    }
  }

  fn unregister(&self, key: &QueryKey) {
    let hash = key.hash();
    let released = {
      let mut groups = lock(&self.groups);
      let Some(state) = groups.get_mut(&hash) else {
        warn!(group = %key, "Unregistering observer of an untracked peer group");
        return;
      };
      state.observer_count = state.observer_count.saturating_sub(1);
      if state.observer_count > 0 {
        return;
      }
      groups.remove(&hash)
    };

    if let Some(mut state) = released {
      state.cancel_timer();
      debug!(group = %key, "Peer group released");
      if state.is_slow {
        self.notify(&hash, false);
      }
    }
  }

  /// Arm the group's timer unless one is already running.
  fn arm_timer(self: &Arc<Self>, key: &QueryKey) {
    let hash = key.hash();
    let mut groups = lock(&self.groups);
    let Some(state) = groups.get_mut(&hash) else {
      return;
    };
    if state.timer.is_some() {
      return;
    }

    let generation = self.next_id();
    let timeout = state.timeout;
    let tracker = Arc::downgrade(self);
    let timer_hash = hash.clone();
    let handle = tokio::spawn(async move {
      tokio::time::sleep(timeout).await;
      if let Some(tracker) = tracker.upgrade() {
        tracker.mark_slow(&timer_hash, generation);
      }
    });

    trace!(group = %key, generation, "Slow timer armed");
    state.timer = Some(SlowTimer { generation, handle });
  }

  fn mark_slow(&self, hash: &KeyHash, generation: u64) {
    let became_slow = {
      let mut groups = lock(&self.groups);
      let Some(state) = groups.get_mut(hash) else {
        trace!(hash = hash.short(), "Slow timer fired for a released peer group");
        return;
      };
      match &state.timer {
        Some(timer) if timer.generation == generation => {}
        _ => {
          trace!(group = %state.key, generation, "Ignoring stale slow timer");
          return;
        }
      }
      state.timer = None;
      if state.is_slow {
        false
      } else {
        state.is_slow = true;
        debug!(group = %state.key, "Peer group is slow");
        true
      }
    };

    if became_slow {
      self.notify(hash, true);
    }
  }

  /// Clear slowness once no member of the group is fetching.
  fn reconcile(&self, cache: &QueryCache, key: &QueryKey) {
    let fetching = cache.find_all(&QueryFilter::prefix(key.clone()).fetching());
    if !fetching.is_empty() {
      return;
    }

    let hash = key.hash();
    let was_slow = {
      let mut groups = lock(&self.groups);
      let Some(state) = groups.get_mut(&hash) else {
        return;
      };
      state.cancel_timer();
      std::mem::replace(&mut state.is_slow, false)
    };

    if was_slow {
      debug!(group = %key, "Peer group is no longer slow");
      self.notify(&hash, false);
    }
  }

  fn notify(&self, hash: &KeyHash, is_slow: bool) {
    let listeners: Vec<SlowListener> = lock(&self.listeners)
      .get(hash)
      .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
      .unwrap_or_default();

    for listener in listeners {
      listener(is_slow);
    }
  }
}

impl Drop for TrackerInner {
  fn drop(&mut self) {
    let groups = self.groups.get_mut().unwrap_or_else(PoisonError::into_inner);
    for state in groups.values_mut() {
      state.cancel_timer();
    }
  }
}

/// Slow-tracking layer over a [`QueryCache`].
///
/// Cheap to clone; clones share state. The layer stops listening to the
/// cache once the last clone is dropped.
#[derive(Clone)]
pub struct SlowQueryCache {
  cache: QueryCache,
  inner: Arc<TrackerInner>,
}

impl SlowQueryCache {
  /// Attach slow tracking to `cache`.
  pub fn new(cache: &QueryCache) -> Self {
    let inner = Arc::new(TrackerInner {
      groups: Mutex::new(HashMap::new()),
      listeners: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(0),
      cache_subscription: Mutex::new(None),
    });

    let tracker: Weak<TrackerInner> = Arc::downgrade(&inner);
    let subscription = cache.subscribe(move |cache, event| {
      if let Some(tracker) = tracker.upgrade() {
        tracker.on_cache_event(cache, event);
      }
    });
    *lock(&inner.cache_subscription) = Some(subscription);

    Self {
      cache: cache.clone(),
      inner,
    }
  }

  /// The wrapped cache.
  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  /// Count one more observer for the peer group, creating its state.
  ///
  /// Driven by the cache's `ObserverAdded` events that carry a peer group.
  pub fn register_observer(&self, peer: &PeerGroup) {
    self.inner.register(peer);
  }

  /// Count one observer less. At zero the group's state and timer go away.
  ///
  /// Driven by the cache's `ObserverRemoved` events that carry a peer group.
  pub fn unregister_observer(&self, peer_key: &QueryKey) {
    self.inner.unregister(peer_key);
  }

  /// Whether the group has been fetching longer than its timeout.
  /// False for groups without observers.
  pub fn is_slow(&self, peer_key: &QueryKey) -> bool {
    lock(&self.inner.groups)
      .get(&peer_key.hash())
      .map(|state| state.is_slow)
      .unwrap_or(false)
  }

  /// Number of observers currently registered for the group.
  pub fn observer_count(&self, peer_key: &QueryKey) -> usize {
    lock(&self.inner.groups)
      .get(&peer_key.hash())
      .map(|state| state.observer_count)
      .unwrap_or(0)
  }

  /// Number of peer groups with live state.
  pub fn tracked_groups(&self) -> usize {
    lock(&self.inner.groups).len()
  }

  /// Listen for `is_slow` transitions of one group.
  pub fn subscribe_slow<F>(&self, peer_key: &QueryKey, listener: F) -> SlowSubscription
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    let hash = peer_key.hash();
    let id = self.inner.next_id();
    lock(&self.inner.listeners)
      .entry(hash.clone())
      .or_default()
      .push((id, Arc::new(listener)));

    SlowSubscription {
      tracker: Arc::downgrade(&self.inner),
      hash,
      id,
    }
  }
}

impl fmt::Debug for SlowQueryCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SlowQueryCache")
      .field("groups", &self.tracked_groups())
      .field("listener_groups", &lock(&self.inner.listeners).len())
      .finish()
  }
}

/// Handle for a slow listener. Dropping it unsubscribes.
#[must_use = "dropping a SlowSubscription unsubscribes the listener"]
pub struct SlowSubscription {
  tracker: Weak<TrackerInner>,
  hash: KeyHash,
  id: u64,
}

impl SlowSubscription {
  /// Unsubscribe explicitly. Equivalent to dropping the handle.
  pub fn unsubscribe(self) {}
}

impl Drop for SlowSubscription {
  fn drop(&mut self) {
    let Some(tracker) = self.tracker.upgrade() else {
      return;
    };
    let mut listeners = lock(&tracker.listeners);
    if let Some(entries) = listeners.get_mut(&self.hash) {
      entries.retain(|(id, _)| *id != self.id);
      if entries.is_empty() {
        listeners.remove(&self.hash);
      }
    }
  }
}

impl fmt::Debug for SlowSubscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SlowSubscription")
      .field("group", &self.hash.short())
      .field("id", &self.id)
      .finish()
  }
}
