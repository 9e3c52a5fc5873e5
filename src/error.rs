use std::time::Duration;
use thiserror::Error;

use crate::query::QueryKey;

/// Misuse of a slow-tracking query. These indicate bugs in the calling code.
#[derive(Debug, Error)]
pub enum SlowQueryError {
  #[error("Query client has no slow-query tracking; build it with QueryClient::with_slow_tracking")]
  MissingSlowTracker,

  #[error("Peer key changed from {from} to {to}; a slow query keeps its peer group for its lifetime")]
  PeerKeyChanged { from: QueryKey, to: QueryKey },

  #[error("Timeout of peer group {group} changed from {from:?} to {to:?}")]
  TimeoutChanged {
    group: QueryKey,
    from: Duration,
    to: Duration,
  },

  #[error("Query client changed during the lifetime of a slow query")]
  ClientChanged,
}
