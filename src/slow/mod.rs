//! Slow-query tracking on top of the query cache.
//!
//! Fast responses should not flicker a loading indicator; slow ones should
//! show a distinct state. Queries declare a peer group (a key prefix plus a
//! timeout) and the [`SlowQueryCache`] derives one `is_slow` flag per group
//! from the cache's fetch events. [`SlowQuery`] is the consumer-facing side.

mod hook;
mod tracker;

pub use hook::{SlowQuery, SlowQueryOptions, SlowQueryResult};
pub use tracker::{SlowQueryCache, SlowSubscription};
