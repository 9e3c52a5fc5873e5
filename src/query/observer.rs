//! Per-consumer view of one query in the cache.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

use super::cache::{FetchStatus, PeerGroup, QueryCache};
use super::key::QueryKey;

/// A factory for the futures that fetch a query's data
type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, String>> + Send + Sync>;

/// How an observer attaches to its query.
#[derive(Debug, Clone, Default)]
pub struct ObserverOptions {
  /// Peer group the observed queries belong to
  pub peer: Option<PeerGroup>,
  /// Show the previous key's data while a new key has none yet
  pub keep_previous_data: bool,
}

/// What a consumer renders for its query.
#[derive(Debug)]
pub struct QueryResult<T> {
  pub data: Option<Arc<T>>,
  pub error: Option<String>,
  /// No data and no error yet
  pub is_pending: bool,
  /// A fetch is in flight for the current key
  pub is_fetching: bool,
  /// `data` belongs to a previous key
  pub is_placeholder_data: bool,
}

impl<T> QueryResult<T> {
  fn empty() -> Self {
    Self {
      data: None,
      error: None,
      is_pending: true,
      is_fetching: false,
      is_placeholder_data: false,
    }
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }
}

impl<T> Clone for QueryResult<T> {
  fn clone(&self) -> Self {
    Self {
      data: self.data.clone(),
      error: self.error.clone(),
      is_pending: self.is_pending,
      is_fetching: self.is_fetching,
      is_placeholder_data: self.is_placeholder_data,
    }
  }
}

/// Observer of one query at a time.
///
/// Registers itself with the cache on creation and when switching keys, and
/// unregisters on drop. Call [`QueryObserver::poll`] from the event loop
/// tick to learn whether the observed record changed.
pub struct QueryObserver<T> {
  cache: QueryCache,
  key: QueryKey,
  fetcher: FetcherFn<T>,
  options: ObserverOptions,
  /// Last data seen, kept for the placeholder policy
  previous: Option<Arc<T>>,
  seen_revision: Option<u64>,
}

fn boxed<T, F, Fut>(fetcher: F) -> FetcherFn<T>
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, String>> + Send + 'static,
{
  Arc::new(move || fetcher().boxed())
}

impl<T: Send + Sync + 'static> QueryObserver<T> {
  pub fn new<F, Fut>(cache: &QueryCache, key: QueryKey, fetcher: F, options: ObserverOptions) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    cache.add_observer(&key, options.peer.clone());
    Self {
      cache: cache.clone(),
      key,
      fetcher: boxed(fetcher),
      options,
      previous: None,
      seen_revision: None,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  /// Point the observer at a (possibly) different key and fetcher.
  ///
  /// The new query is registered before the old one is released, so a peer
  /// group shared by both never drops to zero observers in between.
  pub fn set_query<F, Fut>(&mut self, key: QueryKey, fetcher: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    self.fetcher = boxed(fetcher);
    if key == self.key {
      return;
    }

    if let Some(data) = self.cache.data::<T>(&self.key) {
      self.previous = Some(data);
    }
    self.cache.add_observer(&key, self.options.peer.clone());
    self.cache.remove_observer(&self.key, self.options.peer.as_ref());
    self.key = key;
    self.seen_revision = None;
  }

  /// Start fetching the current key unless a fetch is already in flight.
  pub fn fetch(&self) -> bool {
    let fetcher = Arc::clone(&self.fetcher);
    self.cache.fetch(&self.key, move || fetcher())
  }

  /// Cancel any in-flight fetch for the current key and start a new one.
  pub fn refetch(&self) -> bool {
    self.cache.cancel(&self.key);
    self.fetch()
  }

  /// Fetch only if the current key has neither data nor a fetch in flight.
  pub fn ensure_data(&self) -> bool {
    match self.cache.read::<T>(&self.key) {
      Some((snapshot, data)) => {
        if data.is_some() || snapshot.fetch_status == FetchStatus::Fetching {
          false
        } else {
          self.fetch()
        }
      }
      None => self.fetch(),
    }
  }

  /// Current result for the observed key.
  pub fn result(&mut self) -> QueryResult<T> {
    let Some((snapshot, data)) = self.cache.read::<T>(&self.key) else {
      return QueryResult::empty();
    };
    let is_fetching = snapshot.fetch_status == FetchStatus::Fetching;

    if let Some(data) = data {
      self.previous = Some(Arc::clone(&data));
      return QueryResult {
        data: Some(data),
        error: snapshot.error,
        is_pending: false,
        is_fetching,
        is_placeholder_data: false,
      };
    }

    if snapshot.error.is_none() && self.options.keep_previous_data {
      if let Some(previous) = &self.previous {
        return QueryResult {
          data: Some(Arc::clone(previous)),
          error: None,
          is_pending: false,
          is_fetching,
          is_placeholder_data: true,
        };
      }
    }

    QueryResult {
      data: None,
      is_pending: snapshot.error.is_none(),
      error: snapshot.error,
      is_fetching,
      is_placeholder_data: false,
    }
  }

  /// Check whether the observed record changed since the last poll.
  pub fn poll(&mut self) -> bool {
    let revision = self.cache.snapshot(&self.key).map(|s| s.revision);
    if revision != self.seen_revision {
      self.seen_revision = revision;
      true
    } else {
      false
    }
  }
}

impl<T> Drop for QueryObserver<T> {
  fn drop(&mut self) {
    self.cache.remove_observer(&self.key, self.options.peer.as_ref());
  }
}

impl<T> std::fmt::Debug for QueryObserver<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", &self.key)
      .field("options", &self.options)
      .field("seen_revision", &self.seen_revision)
      .finish_non_exhaustive()
  }
}
