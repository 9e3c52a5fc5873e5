//! Shared query cache with a lifecycle event stream.

use std::any::{type_name, Any};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::key::{KeyHash, QueryKey};
use super::lock;

/// Type-erased query data. Each record stores whatever its fetcher produced.
type QueryData = Arc<dyn Any + Send + Sync>;

/// How long an unobserved, idle record stays cached by default.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

/// Callback invoked for every cache event, in emission order.
type CacheListener = Arc<dyn Fn(&QueryCache, &CacheEvent) + Send + Sync>;

/// Whether a fetch is in flight for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
  Idle,
  Fetching,
}

/// What the query holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// No data and no error yet
  Pending,
  /// Data from the last successful fetch
  Success,
  /// The last fetch failed
  Error,
}

/// Association of a query with a peer group for slowness tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerGroup {
  /// Prefix shared by every query in the group
  pub key: QueryKey,
  /// How long a member may fetch before the group counts as slow
  pub timeout: Duration,
}

/// Point-in-time view of a query record.
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
  pub key: QueryKey,
  pub hash: KeyHash,
  pub status: QueryStatus,
  pub fetch_status: FetchStatus,
  pub observers: usize,
  pub error: Option<String>,
  /// Bumped on every update to the record
  pub revision: u64,
}

/// Kind of change reported by [`CacheEvent::Updated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
  /// A fetch started
  Fetch,
  /// A fetch resolved with data
  Success,
  /// A fetch failed
  Error,
  /// An in-flight fetch was cancelled
  Cancel,
}

/// Lifecycle notification published by the cache.
#[derive(Debug, Clone)]
pub enum CacheEvent {
  /// `peer` is the group the new observer declared, not a property of the
  /// record: observers of one key may belong to different groups.
  ObserverAdded {
    query: QuerySnapshot,
    peer: Option<PeerGroup>,
  },
  ObserverRemoved {
    query: QuerySnapshot,
    peer: Option<PeerGroup>,
  },
  Updated {
    query: QuerySnapshot,
    action: UpdateAction,
  },
  /// An unobserved record was garbage collected.
  Removed(QuerySnapshot),
}

impl CacheEvent {
  /// The query the event is about, as it was when the event was emitted.
  pub fn query(&self) -> &QuerySnapshot {
    match self {
      CacheEvent::ObserverAdded { query, .. }
      | CacheEvent::ObserverRemoved { query, .. }
      | CacheEvent::Updated { query, .. }
      | CacheEvent::Removed(query) => query,
    }
  }

  fn name(&self) -> &'static str {
    match self {
      CacheEvent::ObserverAdded { .. } => "observer_added",
      CacheEvent::ObserverRemoved { .. } => "observer_removed",
      CacheEvent::Updated { .. } => "updated",
      CacheEvent::Removed(_) => "removed",
    }
  }
}

/// Selects queries by key prefix and fetch status.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
  pub prefix: Option<QueryKey>,
  pub fetch_status: Option<FetchStatus>,
}

impl QueryFilter {
  /// Match every query whose key starts with `prefix`.
  pub fn prefix(prefix: QueryKey) -> Self {
    Self {
      prefix: Some(prefix),
      fetch_status: None,
    }
  }

  /// Restrict the filter to queries with a fetch in flight.
  pub fn fetching(mut self) -> Self {
    self.fetch_status = Some(FetchStatus::Fetching);
    self
  }

  fn matches(&self, entry: &QueryEntry) -> bool {
    let prefix_ok = self
      .prefix
      .as_ref()
      .map(|p| entry.key.starts_with(p))
      .unwrap_or(true);
    let status_ok = self
      .fetch_status
      .map(|s| entry.fetch_status == s)
      .unwrap_or(true);
    prefix_ok && status_ok
  }
}

struct QueryEntry {
  key: QueryKey,
  data: Option<QueryData>,
  error: Option<String>,
  fetch_status: FetchStatus,
  observers: usize,
  revision: u64,
  /// Identifies the current fetch; results from older fetches are dropped
  fetch_id: u64,
  task: Option<JoinHandle<()>>,
  /// Identifies the scheduled collection; bumped whenever it is rescheduled
  gc_id: u64,
  gc: Option<JoinHandle<()>>,
}

impl QueryEntry {
  fn new(key: QueryKey) -> Self {
    Self {
      key,
      data: None,
      error: None,
      fetch_status: FetchStatus::Idle,
      observers: 0,
      revision: 0,
      fetch_id: 0,
      task: None,
      gc_id: 0,
      gc: None,
    }
  }

  fn status(&self) -> QueryStatus {
    if self.error.is_some() {
      QueryStatus::Error
    } else if self.data.is_some() {
      QueryStatus::Success
    } else {
      QueryStatus::Pending
    }
  }

  fn snapshot(&self, hash: &KeyHash) -> QuerySnapshot {
    QuerySnapshot {
      key: self.key.clone(),
      hash: hash.clone(),
      status: self.status(),
      fetch_status: self.fetch_status,
      observers: self.observers,
      error: self.error.clone(),
      revision: self.revision,
    }
  }
}

impl Drop for QueryEntry {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
    if let Some(gc) = self.gc.take() {
      gc.abort();
    }
  }
}

#[derive(Default)]
struct CacheState {
  queries: HashMap<KeyHash, QueryEntry>,
  /// Events waiting for delivery, in emission order
  pending: VecDeque<CacheEvent>,
}

impl CacheState {
  fn entry(&mut self, key: &QueryKey, hash: &KeyHash) -> &mut QueryEntry {
    self
      .queries
      .entry(hash.clone())
      .or_insert_with(|| QueryEntry::new(key.clone()))
  }

  fn evict(&mut self, hash: &KeyHash) {
    if let Some(mut entry) = self.queries.remove(hash) {
      // Detach rather than abort: eviction may run on the gc task itself
      entry.gc = None;
      debug!(key = %entry.key, "Query removed from cache");
      let snapshot = entry.snapshot(hash);
      self.pending.push_back(CacheEvent::Removed(snapshot));
    }
  }
}

#[derive(Default)]
struct Listeners {
  next_id: u64,
  entries: Vec<(u64, CacheListener)>,
}

struct CacheInner {
  state: Mutex<CacheState>,
  listeners: Mutex<Listeners>,
  /// Set while some caller is draining `pending`
  dispatching: AtomicBool,
  /// Delay before an unobserved, idle record is dropped
  gc_time: Duration,
}

/// Resets the dispatching flag even if a listener panics.
struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Shared cache of query records.
///
/// Cloning is cheap and yields a handle to the same cache. Every mutation
/// queues a [`CacheEvent`]; events are delivered to listeners strictly in
/// the order they were emitted. A listener may call back into the cache:
/// events emitted from inside a listener are queued and delivered after the
/// current one.
///
/// A record without observers and without a fetch in flight is dropped
/// after the cache's gc time unless it is observed again in between.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<CacheInner>,
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::with_gc_time(DEFAULT_GC_TIME)
  }
}

impl QueryCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Cache that drops unobserved, idle records after `gc_time`.
  /// A zero duration drops them as soon as they become collectable.
  pub fn with_gc_time(gc_time: Duration) -> Self {
    Self {
      inner: Arc::new(CacheInner {
        state: Mutex::new(CacheState::default()),
        listeners: Mutex::new(Listeners::default()),
        dispatching: AtomicBool::new(false),
        gc_time,
      }),
    }
  }

  /// Whether both handles point at the same cache.
  pub fn same_cache(&self, other: &QueryCache) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  /// Subscribe to the lifecycle event stream.
  ///
  /// The listener stays registered until the returned [`Subscription`] is
  /// dropped.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&QueryCache, &CacheEvent) + Send + Sync + 'static,
  {
    let mut listeners = lock(&self.inner.listeners);
    let id = listeners.next_id;
    listeners.next_id += 1;
    listeners.entries.push((id, Arc::new(listener)));

    Subscription {
      cache: Arc::downgrade(&self.inner),
      id,
    }
  }

  /// Current state of a query, if the cache knows it.
  pub fn snapshot(&self, key: &QueryKey) -> Option<QuerySnapshot> {
    let hash = key.hash();
    lock(&self.inner.state)
      .queries
      .get(&hash)
      .map(|entry| entry.snapshot(&hash))
  }

  /// All queries matching the filter, read from the live state.
  pub fn find_all(&self, filter: &QueryFilter) -> Vec<QuerySnapshot> {
    lock(&self.inner.state)
      .queries
      .iter()
      .filter(|(_, entry)| filter.matches(entry))
      .map(|(hash, entry)| entry.snapshot(hash))
      .collect()
  }

  /// Data stored for a query, if any and if it has type `T`.
  pub fn data<T: Any + Send + Sync>(&self, key: &QueryKey) -> Option<Arc<T>> {
    self.read::<T>(key).and_then(|(_, data)| data)
  }

  /// Snapshot and typed data read under one lock.
  pub(crate) fn read<T: Any + Send + Sync>(
    &self,
    key: &QueryKey,
  ) -> Option<(QuerySnapshot, Option<Arc<T>>)> {
    let hash = key.hash();
    let state = lock(&self.inner.state);
    let entry = state.queries.get(&hash)?;
    let data = entry.data.clone().and_then(|data| match data.downcast::<T>() {
      Ok(data) => Some(data),
      Err(_) => {
        warn!(key = %key, expected = type_name::<T>(), "Cached data has a different type");
        None
      }
    });
    Some((entry.snapshot(&hash), data))
  }

  /// Register an observer on a query, creating the record if needed.
  ///
  /// `peer` is the group the observer declares for slowness tracking. It is
  /// reported on the event and must be passed again on removal.
  pub fn add_observer(&self, key: &QueryKey, peer: Option<PeerGroup>) {
    {
      let hash = key.hash();
      let mut guard = lock(&self.inner.state);
      let state = &mut *guard;
      let entry = state.entry(key, &hash);
      entry.observers += 1;
      if let Some(gc) = entry.gc.take() {
        gc.abort();
        entry.gc_id += 1;
      }
      let snapshot = entry.snapshot(&hash);
      state
        .pending
        .push_back(CacheEvent::ObserverAdded { query: snapshot, peer });
    }
    self.flush();
  }

  /// Unregister an observer that was added with `peer`. The record and its
  /// data stay cached until collected.
  pub fn remove_observer(&self, key: &QueryKey, peer: Option<&PeerGroup>) {
    {
      let hash = key.hash();
      let mut guard = lock(&self.inner.state);
      let state = &mut *guard;
      let Some(entry) = state.queries.get_mut(&hash) else {
        warn!(key = %key, "Removing observer from unknown query");
        return;
      };
      entry.observers = entry.observers.saturating_sub(1);
      let snapshot = entry.snapshot(&hash);
      state.pending.push_back(CacheEvent::ObserverRemoved {
        query: snapshot,
        peer: peer.cloned(),
      });
      self.schedule_gc(state, &hash);
    }
    self.flush();
  }

  /// Number of records currently held.
  pub fn len(&self) -> usize {
    lock(&self.inner.state).queries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Start fetching a query unless a fetch is already in flight for it.
  ///
  /// Returns `true` if a new fetch was started. The fetcher is only invoked
  /// in that case. Must be called from within a tokio runtime.
  pub fn fetch<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> bool
  where
    T: Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    let hash = key.hash();
    let fetch_id = {
      let mut guard = lock(&self.inner.state);
      let state = &mut *guard;
      let entry = state.entry(key, &hash);
      if entry.fetch_status == FetchStatus::Fetching {
        trace!(key = %key, "Fetch already in flight");
        return false;
      }
      entry.fetch_status = FetchStatus::Fetching;
      entry.fetch_id += 1;
      entry.revision += 1;
      let fetch_id = entry.fetch_id;
      let snapshot = entry.snapshot(&hash);
      state.pending.push_back(CacheEvent::Updated {
        query: snapshot,
        action: UpdateAction::Fetch,
      });
      fetch_id
    };

    debug!(key = %key, fetch_id, "Fetch started");

    let future = fetcher();
    let cache = Arc::downgrade(&self.inner);
    let task_hash = hash.clone();
    let handle = tokio::spawn(async move {
      let result = future.await.map(|data| Arc::new(data) as QueryData);
      if let Some(inner) = cache.upgrade() {
        QueryCache { inner }.settle(&task_hash, fetch_id, result);
      }
    });

    {
      let mut state = lock(&self.inner.state);
      match state.queries.get_mut(&hash) {
        Some(entry) if entry.fetch_id == fetch_id && entry.fetch_status == FetchStatus::Fetching => {
          entry.task = Some(handle);
        }
        // Cancelled or already settled before the handle could be stored
        _ => handle.abort(),
      }
    }

    self.flush();
    true
  }

  /// Abort an in-flight fetch. Returns `false` if nothing was fetching.
  pub fn cancel(&self, key: &QueryKey) -> bool {
    {
      let hash = key.hash();
      let mut guard = lock(&self.inner.state);
      let state = &mut *guard;
      let Some(entry) = state.queries.get_mut(&hash) else {
        return false;
      };
      if entry.fetch_status != FetchStatus::Fetching {
        return false;
      }
      if let Some(task) = entry.task.take() {
        task.abort();
      }
      entry.fetch_status = FetchStatus::Idle;
      entry.fetch_id += 1;
      entry.revision += 1;
      let snapshot = entry.snapshot(&hash);
      state.pending.push_back(CacheEvent::Updated {
        query: snapshot,
        action: UpdateAction::Cancel,
      });
      self.schedule_gc(state, &hash);
    }
    debug!(key = %key, "Fetch cancelled");
    self.flush();
    true
  }

  /// Store the outcome of a fetch, unless the fetch was superseded.
  fn settle(&self, hash: &KeyHash, fetch_id: u64, result: Result<QueryData, String>) {
    {
      let mut guard = lock(&self.inner.state);
      let state = &mut *guard;
      let entry = match state.queries.get_mut(hash) {
        Some(entry) if entry.fetch_id == fetch_id && entry.fetch_status == FetchStatus::Fetching => {
          entry
        }
        _ => {
          trace!(hash = hash.short(), fetch_id, "Discarding superseded fetch result");
          return;
        }
      };

      entry.fetch_status = FetchStatus::Idle;
      entry.task = None;
      entry.revision += 1;
      let action = match result {
        Ok(data) => {
          entry.data = Some(data);
          entry.error = None;
          UpdateAction::Success
        }
        Err(error) => {
          debug!(key = %entry.key, error = %error, "Fetch failed");
          entry.error = Some(error);
          UpdateAction::Error
        }
      };
      let snapshot = entry.snapshot(hash);
      state.pending.push_back(CacheEvent::Updated {
        query: snapshot,
        action,
      });
      self.schedule_gc(state, hash);
    }
    self.flush();
  }

  /// Start the collection timer of a record that has no observers and no
  /// fetch in flight. Without a runtime or with a zero gc time the record is
  /// dropped right away.
  fn schedule_gc(&self, state: &mut CacheState, hash: &KeyHash) {
    let Some(entry) = state.queries.get_mut(hash) else {
      return;
    };
    if entry.observers > 0 || entry.fetch_status == FetchStatus::Fetching {
      return;
    }
    if let Some(gc) = entry.gc.take() {
      gc.abort();
    }
    entry.gc_id += 1;

    let gc_time = self.inner.gc_time;
    match Handle::try_current() {
      Ok(runtime) if !gc_time.is_zero() => {
        let gc_id = entry.gc_id;
        let cache = Arc::downgrade(&self.inner);
        let task_hash = hash.clone();
        entry.gc = Some(runtime.spawn(async move {
          tokio::time::sleep(gc_time).await;
          if let Some(inner) = cache.upgrade() {
            QueryCache { inner }.collect(&task_hash, gc_id);
          }
        }));
        trace!(key = %entry.key, gc_ms = gc_time.as_millis() as u64, "Query scheduled for collection");
      }
      _ => state.evict(hash),
    }
  }

  /// Drop a record whose collection timer fired, unless it was observed or
  /// refetched in the meantime.
  fn collect(&self, hash: &KeyHash, gc_id: u64) {
    {
      let mut state = lock(&self.inner.state);
      match state.queries.get(hash) {
        Some(entry)
          if entry.gc_id == gc_id
            && entry.observers == 0
            && entry.fetch_status == FetchStatus::Idle => {}
        _ => return,
      }
      state.evict(hash);
    }
    self.flush();
  }

  /// Deliver queued events. Whoever wins the dispatching flag drains the
  /// queue; everyone else leaves their events for it.
  fn flush(&self) {
    loop {
      if self.inner.dispatching.swap(true, Ordering::AcqRel) {
        return;
      }
      {
        let _guard = DispatchGuard(&self.inner.dispatching);
        while let Some(event) = self.next_pending() {
          self.deliver(&event);
        }
      }
      // An event may have been queued after the last pop but before the
      // flag was released.
      if lock(&self.inner.state).pending.is_empty() {
        return;
      }
    }
  }

  fn next_pending(&self) -> Option<CacheEvent> {
    lock(&self.inner.state).pending.pop_front()
  }

  fn deliver(&self, event: &CacheEvent) {
    let listeners: Vec<CacheListener> = lock(&self.inner.listeners)
      .entries
      .iter()
      .map(|(_, listener)| Arc::clone(listener))
      .collect();

    trace!(
      event = event.name(),
      key = %event.query().key,
      listeners = listeners.len(),
      "Delivering cache event"
    );

    for listener in listeners {
      listener(self, event);
    }
  }
}

impl fmt::Debug for QueryCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryCache")
      .field("queries", &lock(&self.inner.state).queries.len())
      .field("listeners", &lock(&self.inner.listeners).entries.len())
      .field("gc_time", &self.inner.gc_time)
      .finish()
  }
}

/// Handle for a cache listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
  cache: Weak<CacheInner>,
  id: u64,
}

impl Subscription {
  /// Unsubscribe explicitly. Equivalent to dropping the handle.
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.cache.upgrade() {
      lock(&inner.listeners)
        .entries
        .retain(|(id, _)| *id != self.id);
    }
  }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription").field("id", &self.id).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;
  use std::sync::atomic::AtomicU32;

  fn record_events(cache: &QueryCache) -> (Arc<Mutex<Vec<String>>>, Subscription) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let subscription = cache.subscribe(move |_, event| {
      let line = match event {
        CacheEvent::ObserverAdded { query, .. } => format!("added {}", query.key),
        CacheEvent::ObserverRemoved { query, .. } => format!("removed {}", query.key),
        CacheEvent::Updated { query, action } => format!("{:?} {}", action, query.key),
        CacheEvent::Removed(query) => format!("removed-record {}", query.key),
      };
      lock(&sink).push(line);
    });
    (log, subscription)
  }

  fn sleeper(ms: u64, value: u32) -> impl Future<Output = Result<u32, String>> + Send {
    async move {
      tokio::time::sleep(Duration::from_millis(ms)).await;
      Ok(value)
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_success_emits_in_order() {
    let cache = QueryCache::new();
    let (log, _sub) = record_events(&cache);
    let key = query_key!["count", "pcc2"];

    assert!(cache.fetch(&key, || sleeper(100, 7)));
    assert_eq!(
      cache.snapshot(&key).map(|s| s.fetch_status),
      Some(FetchStatus::Fetching)
    );

    tokio::time::sleep(Duration::from_millis(101)).await;

    let snapshot = cache.snapshot(&key).expect("query exists");
    assert_eq!(snapshot.fetch_status, FetchStatus::Idle);
    assert_eq!(snapshot.status, QueryStatus::Success);
    assert_eq!(cache.data::<u32>(&key).as_deref(), Some(&7));
    assert_eq!(
      *lock(&log),
      vec![
        r#"Fetch ["count","pcc2"]"#.to_string(),
        r#"Success ["count","pcc2"]"#.to_string()
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_in_flight_fetch_is_deduplicated() {
    let cache = QueryCache::new();
    let key = query_key!["count"];
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
      let calls = Arc::clone(&calls);
      cache.fetch(&key, move || {
        calls.fetch_add(1, Ordering::SeqCst);
        sleeper(50, 1)
      });
    }

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.data::<u32>(&key).as_deref(), Some(&1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_error_is_recorded() {
    let cache = QueryCache::new();
    let key = query_key!["nodes", ""];

    cache.fetch(&key, || async { Err::<u32, _>("empty query".to_string()) });
    tokio::time::sleep(Duration::from_millis(1)).await;

    let snapshot = cache.snapshot(&key).expect("query exists");
    assert_eq!(snapshot.status, QueryStatus::Error);
    assert_eq!(snapshot.error.as_deref(), Some("empty query"));
    assert!(cache.data::<u32>(&key).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_discards_late_result() {
    let cache = QueryCache::new();
    let (log, _sub) = record_events(&cache);
    let key = query_key!["count"];

    cache.fetch(&key, || sleeper(100, 1));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(cache.cancel(&key));
    assert!(!cache.cancel(&key));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cache.data::<u32>(&key).is_none());
    assert_eq!(
      cache.snapshot(&key).map(|s| s.fetch_status),
      Some(FetchStatus::Idle)
    );
    assert_eq!(lock(&log).last().map(String::as_str), Some(r#"Cancel ["count"]"#));
  }

  #[tokio::test(start_paused = true)]
  async fn test_find_all_by_prefix_and_status() {
    let cache = QueryCache::new();
    cache.add_observer(&query_key!["nodes", "a"], None);
    cache.fetch(&query_key!["nodes", "b"], || sleeper(100, 1));
    cache.fetch(&query_key!["count", "b"], || sleeper(100, 1));

    let nodes = cache.find_all(&QueryFilter::prefix(query_key!["nodes"]));
    assert_eq!(nodes.len(), 2);

    let fetching = cache.find_all(&QueryFilter::prefix(query_key!["nodes"]).fetching());
    assert_eq!(fetching.len(), 1);
    assert_eq!(fetching[0].key, query_key!["nodes", "b"]);

    assert_eq!(cache.find_all(&QueryFilter::default().fetching()).len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reentrant_listener_keeps_order() {
    let cache = QueryCache::new();
    let (log, _sub) = record_events(&cache);
    let _chain = cache.subscribe(|cache, event| {
      if let CacheEvent::ObserverAdded { query, .. } = event {
        if query.key == query_key!["a"] {
          cache.fetch(&query_key!["b"], || sleeper(10, 1));
        }
      }
    });

    cache.add_observer(&query_key!["a"], None);

    assert_eq!(
      *lock(&log),
      vec![r#"added ["a"]"#.to_string(), r#"Fetch ["b"]"#.to_string()]
    );
  }

  #[tokio::test]
  async fn test_observer_counts_and_unsubscribe() {
    let cache = QueryCache::new();
    let (log, sub) = record_events(&cache);
    let key = query_key!["a"];

    cache.add_observer(&key, None);
    cache.add_observer(&key, None);
    assert_eq!(cache.snapshot(&key).map(|s| s.observers), Some(2));

    drop(sub);
    cache.remove_observer(&key, None);
    assert_eq!(cache.snapshot(&key).map(|s| s.observers), Some(1));
    assert_eq!(lock(&log).len(), 2);
  }

  #[tokio::test]
  async fn test_mismatched_type_reads_as_none() {
    let cache = QueryCache::new();
    let key = query_key!["a"];
    cache.fetch(&key, || async { Ok::<_, String>(String::from("text")) });
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert!(cache.data::<u32>(&key).is_none());
    assert_eq!(cache.data::<String>(&key).as_deref().map(String::as_str), Some("text"));
  }

  #[tokio::test]
  async fn test_observer_events_carry_declared_peer() {
    let cache = QueryCache::new();
    let peers = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&peers);
    let _sub = cache.subscribe(move |_, event| match event {
      CacheEvent::ObserverAdded { peer, .. } | CacheEvent::ObserverRemoved { peer, .. } => {
        lock(&sink).push(peer.as_ref().map(|p| p.key.to_string()));
      }
      _ => {}
    });

    let key = query_key!["a", "b", "c"];
    let outer = PeerGroup {
      key: query_key!["a"],
      timeout: Duration::from_millis(500),
    };
    let inner = PeerGroup {
      key: query_key!["a", "b"],
      timeout: Duration::from_millis(500),
    };
    cache.add_observer(&key, Some(outer.clone()));
    cache.add_observer(&key, Some(inner.clone()));
    cache.remove_observer(&key, Some(&outer));
    cache.remove_observer(&key, Some(&inner));

    assert_eq!(
      *lock(&peers),
      vec![
        Some(r#"["a"]"#.to_string()),
        Some(r#"["a","b"]"#.to_string()),
        Some(r#"["a"]"#.to_string()),
        Some(r#"["a","b"]"#.to_string()),
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_unobserved_records_are_collected() {
    let cache = QueryCache::with_gc_time(Duration::from_millis(10));
    for i in 0..1000 {
      let key = query_key!["nodes", i];
      cache.add_observer(&key, None);
      cache.remove_observer(&key, None);
    }
    assert_eq!(cache.len(), 1000);

    tokio::time::sleep(Duration::from_millis(11)).await;
    assert!(cache.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_reobserving_cancels_collection() {
    let cache = QueryCache::with_gc_time(Duration::from_millis(10));
    let key = query_key!["count"];
    cache.add_observer(&key, None);
    cache.fetch(&key, || sleeper(1, 3));
    tokio::time::sleep(Duration::from_millis(2)).await;

    cache.remove_observer(&key, None);
    tokio::time::sleep(Duration::from_millis(5)).await;
    cache.add_observer(&key, None);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.data::<u32>(&key).as_deref(), Some(&3));
  }

  #[tokio::test(start_paused = true)]
  async fn test_collection_waits_for_fetch_to_settle() {
    let cache = QueryCache::with_gc_time(Duration::from_millis(10));
    let (log, _sub) = record_events(&cache);
    let key = query_key!["count"];
    let start = tokio::time::Instant::now();

    cache.fetch(&key, || sleeper(50, 1));
    tokio::time::sleep_until(start + Duration::from_millis(30)).await;
    assert_eq!(cache.len(), 1);

    tokio::time::sleep_until(start + Duration::from_millis(55)).await;
    assert_eq!(cache.data::<u32>(&key).as_deref(), Some(&1));

    tokio::time::sleep_until(start + Duration::from_millis(61)).await;
    assert!(cache.is_empty());
    assert_eq!(
      lock(&log).last().map(String::as_str),
      Some(r#"removed-record ["count"]"#)
    );
  }

  #[tokio::test]
  async fn test_zero_gc_time_drops_at_once() {
    let cache = QueryCache::with_gc_time(Duration::ZERO);
    let key = query_key!["a"];
    cache.add_observer(&key, None);
    cache.add_observer(&key, None);
    cache.remove_observer(&key, None);
    assert_eq!(cache.len(), 1);
    cache.remove_observer(&key, None);
    assert!(cache.is_empty());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_dispatch_is_serial_and_ordered_across_threads() {
    const QUERIES: u32 = 64;
    let cache = QueryCache::new();
    let (log, _sub) = record_events(&cache);
    let in_listener = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));

    let busy = Arc::clone(&in_listener);
    let overlap = Arc::clone(&overlapped);
    let _guard = cache.subscribe(move |_, _| {
      if busy.swap(true, Ordering::AcqRel) {
        overlap.store(true, Ordering::Release);
      }
      std::thread::yield_now();
      busy.store(false, Ordering::Release);
    });

    let tasks: Vec<_> = (0..QUERIES)
      .map(|i| {
        let cache = cache.clone();
        tokio::spawn(async move {
          cache.fetch(&query_key!["count", i], move || async move {
            tokio::task::yield_now().await;
            Ok::<_, String>(i)
          });
        })
      })
      .collect();
    for task in futures::future::join_all(tasks).await {
      task.unwrap();
    }

    for _ in 0..200 {
      if lock(&log).len() == 2 * QUERIES as usize {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let log = lock(&log).clone();
    assert_eq!(log.len(), 2 * QUERIES as usize);
    assert!(!overlapped.load(Ordering::Acquire));
    for i in 0..QUERIES {
      let key = query_key!["count", i];
      let started = log.iter().position(|l| *l == format!("Fetch {}", key));
      let finished = log.iter().position(|l| *l == format!("Success {}", key));
      assert!(started.is_some() && finished.is_some());
      assert!(started < finished);
    }
  }
}
