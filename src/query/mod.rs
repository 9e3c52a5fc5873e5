//! Async query cache for data fetching with observers.
//!
//! Inspired by TanStack Query: a shared [`QueryCache`] owns one record per
//! [`QueryKey`], de-duplicates in-flight fetches and publishes a lifecycle
//! event stream. UI code attaches to a record through a [`QueryObserver`],
//! which exposes a [`QueryResult`] and can be polled on each tick.

mod cache;
mod key;
mod observer;

pub use cache::{
  CacheEvent, FetchStatus, PeerGroup, QueryCache, QueryFilter, QuerySnapshot, QueryStatus,
  Subscription, UpdateAction, DEFAULT_GC_TIME,
};
pub use key::{KeyHash, KeyPart, QueryKey};
pub use observer::{ObserverOptions, QueryObserver, QueryResult};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// All state behind these mutexes is updated in single steps, so a poisoned
/// lock never exposes a half-applied change.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
