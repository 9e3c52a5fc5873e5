//! Application-wide handle bundling the query cache and its slow tracking.

use crate::query::QueryCache;
use crate::slow::SlowQueryCache;

/// Shared query client.
///
/// Cloning yields a handle to the same cache. A client built with
/// [`QueryClient::with_slow_tracking`] also carries a [`SlowQueryCache`],
/// which slow-tracking queries require.
#[derive(Debug, Clone, Default)]
pub struct QueryClient {
  cache: QueryCache,
  slow: Option<SlowQueryCache>,
}

impl QueryClient {
  /// Client without slow tracking.
  pub fn new() -> Self {
    Self::default()
  }

  /// Client whose cache reports slow peer groups.
  pub fn with_slow_tracking() -> Self {
    let cache = QueryCache::new();
    let slow = SlowQueryCache::new(&cache);
    Self {
      cache,
      slow: Some(slow),
    }
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  pub fn slow_cache(&self) -> Option<&SlowQueryCache> {
    self.slow.as_ref()
  }

  /// Whether both handles refer to the same underlying cache.
  pub fn same_client(&self, other: &QueryClient) -> bool {
    self.cache.same_cache(&other.cache)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_clone_is_same_client() {
    let client = QueryClient::with_slow_tracking();
    let clone = client.clone();
    assert!(client.same_client(&clone));
    assert!(!client.same_client(&QueryClient::with_slow_tracking()));
  }

  #[test]
  fn test_slow_tracking_is_optional() {
    assert!(QueryClient::new().slow_cache().is_none());
    assert!(QueryClient::with_slow_tracking().slow_cache().is_some());
  }
}
