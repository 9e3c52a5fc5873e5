//! Query observer that opts into group-level slow tracking.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::tracker::{SlowQueryCache, SlowSubscription};
use crate::client::QueryClient;
use crate::error::SlowQueryError;
use crate::query::{ObserverOptions, PeerGroup, QueryKey, QueryObserver, QueryResult};

/// Peer group declaration for a slow-tracking query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowQueryOptions {
  /// Prefix shared by every query of the group
  pub peer_key: QueryKey,
  pub timeout: Duration,
}

impl SlowQueryOptions {
  pub fn new(peer_key: QueryKey, timeout: Duration) -> Self {
    Self { peer_key, timeout }
  }

  fn peer_group(&self) -> PeerGroup {
    PeerGroup {
      key: self.peer_key.clone(),
      timeout: self.timeout,
    }
  }
}

/// A [`QueryResult`] plus the peer group's slowness.
#[derive(Debug)]
pub struct SlowQueryResult<T> {
  pub data: Option<Arc<T>>,
  pub error: Option<String>,
  pub is_pending: bool,
  pub is_fetching: bool,
  pub is_placeholder_data: bool,
  /// Some member of the peer group has been fetching longer than the timeout
  pub is_slow: bool,
}

impl<T> SlowQueryResult<T> {
  fn from_result(result: QueryResult<T>, is_slow: bool) -> Self {
    // Once the group is known to be slow, stale data is not shown in place
    // of the pending request.
    if is_slow && result.is_placeholder_data {
      return Self {
        data: None,
        error: result.error,
        is_pending: true,
        is_fetching: result.is_fetching,
        is_placeholder_data: false,
        is_slow,
      };
    }

    Self {
      data: result.data,
      error: result.error,
      is_pending: result.is_pending,
      is_fetching: result.is_fetching,
      is_placeholder_data: result.is_placeholder_data,
      is_slow,
    }
  }
}

/// One query with slow tracking, owned by a UI consumer.
///
/// Registers as an observer of its peer group on creation and unregisters
/// on drop. The peer group (key and timeout) and the client are fixed for
/// the lifetime of the value; [`SlowQuery::update`] rejects attempts to
/// change them.
pub struct SlowQuery<T> {
  observer: QueryObserver<T>,
  _slow_subscription: SlowSubscription,
  slow_signal: Arc<AtomicBool>,
  slow: SlowQueryCache,
  client: QueryClient,
  options: SlowQueryOptions,
}

impl<T: Send + Sync + 'static> SlowQuery<T> {
  pub fn new<F, Fut>(
    client: &QueryClient,
    key: QueryKey,
    fetcher: F,
    options: SlowQueryOptions,
  ) -> Result<Self, SlowQueryError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    let slow = client
      .slow_cache()
      .cloned()
      .ok_or(SlowQueryError::MissingSlowTracker)?;

    let slow_signal = Arc::new(AtomicBool::new(false));
    let signal = Arc::clone(&slow_signal);
    let slow_subscription = slow.subscribe_slow(&options.peer_key, move |_| {
      signal.store(true, Ordering::Release);
    });

    let observer = QueryObserver::new(
      client.cache(),
      key,
      fetcher,
      ObserverOptions {
        peer: Some(options.peer_group()),
        keep_previous_data: true,
      },
    );

    Ok(Self {
      observer,
      _slow_subscription: slow_subscription,
      slow_signal,
      slow,
      client: client.clone(),
      options,
    })
  }

  /// Re-declare the query, as a consumer does on every render.
  ///
  /// The key and fetcher may change freely. A different peer key, timeout
  /// or client is a programming error and fails without touching any state.
  pub fn update<F, Fut>(
    &mut self,
    client: &QueryClient,
    key: QueryKey,
    fetcher: F,
    options: SlowQueryOptions,
  ) -> Result<(), SlowQueryError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    if !self.client.same_client(client) {
      return Err(SlowQueryError::ClientChanged);
    }
    if options.peer_key != self.options.peer_key {
      return Err(SlowQueryError::PeerKeyChanged {
        from: self.options.peer_key.clone(),
        to: options.peer_key,
      });
    }
    if options.timeout != self.options.timeout {
      return Err(SlowQueryError::TimeoutChanged {
        group: options.peer_key,
        from: self.options.timeout,
        to: options.timeout,
      });
    }

    self.observer.set_query(key, fetcher);
    Ok(())
  }

  pub fn key(&self) -> &QueryKey {
    self.observer.key()
  }

  pub fn options(&self) -> &SlowQueryOptions {
    &self.options
  }

  /// Start fetching the current key unless a fetch is already in flight.
  pub fn fetch(&self) -> bool {
    self.observer.fetch()
  }

  /// Cancel an in-flight fetch for the current key and start over.
  pub fn refetch(&self) -> bool {
    self.observer.refetch()
  }

  /// Fetch only if the current key has no data and nothing in flight.
  pub fn ensure_data(&self) -> bool {
    self.observer.ensure_data()
  }

  pub fn is_slow(&self) -> bool {
    self.slow.is_slow(&self.options.peer_key)
  }

  pub fn result(&mut self) -> SlowQueryResult<T> {
    let result = self.observer.result();
    SlowQueryResult::from_result(result, self.is_slow())
  }

  /// Check whether anything the result depends on changed since the last
  /// poll: the query record or the group's slowness.
  pub fn poll(&mut self) -> bool {
    let query_changed = self.observer.poll();
    let slow_changed = self.slow_signal.swap(false, Ordering::AcqRel);
    query_changed || slow_changed
  }
}

impl<T> std::fmt::Debug for SlowQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SlowQuery")
      .field("observer", &self.observer)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}
