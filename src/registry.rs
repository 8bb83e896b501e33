use core::fmt;
use core::future::Future;
use core::hash::Hash;
use std::collections::hash_map::{Entry, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::call::{Call, Outcome, Shared, WaitError};

/// Deduplicates concurrent computations by key.
///
/// At most one computation is in flight for each key. The first caller to [`acquire`] a key
/// becomes its [`Leader`] and is responsible for publishing the outcome, every caller arriving
/// while the computation runs becomes a follower and receives a [`Call`] to wait on instead.
///
/// A key is only held while its computation is in flight. Completed outcomes are not
/// remembered, the next `acquire` after publication elects a new leader.
///
/// [`acquire`]: Self::acquire
pub struct Registry<K, V, E> {
    table: Arc<Table<K, V, E>>,
    options: Options,
}

/// Configures a [`Registry`].
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Number of keys the table has room for without reallocating.
    pub capacity: usize,
    /// The longest time [`Call::wait`] blocks for. Waits forever if `None`.
    pub default_timeout: Option<Duration>,
}

/// The result of [`Registry::acquire`].
pub enum Acquired<K: Eq + Hash, V, E> {
    /// No computation was in flight. Run it and publish the outcome.
    Leader(Leader<K, V, E>),
    /// A computation was already in flight. Wait for its outcome.
    Follower(Call<K, V, E>),
}

/// The role a caller was assigned for a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Leader,
    Follower,
}

/// The exclusive right, and duty, to publish the outcome of one computation.
///
/// Publishing consumes the leader, so an outcome is published at most once. If the leader is
/// dropped without publishing, be it by an early return or while unwinding from a panic, the
/// computation is published as abandoned instead. Followers are never left waiting on a leader
/// that is gone.
pub struct Leader<K: Eq + Hash, V, E> {
    call: Call<K, V, E>,
    /// The table to deregister from. The registry may be torn down before we publish.
    table: Weak<Table<K, V, E>>,
}

/// A key was released that was not registered to the releasing call.
///
/// This means the same computation was completed twice, a contract violation of the leader.
#[derive(Debug)]
pub struct ReleaseError {
    /// Whether the key was held by another, newer call.
    key_present: bool,
}

pub(crate) struct Table<K, V, E> {
    calls: Mutex<HashMap<K, Arc<Shared<K, V, E>>>>,
}

impl<K, V, E> Registry<K, V, E> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Registry::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        Registry {
            table: Arc::new(Table {
                calls: Mutex::new(HashMap::with_capacity(options.capacity)),
            }),
            options,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The number of computations currently in flight.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, V, E> Registry<K, V, E> {
    /// Join the computation for `key`, or start it.
    ///
    /// Of all concurrent callers with equal keys exactly one receives [`Acquired::Leader`]. The
    /// lock of the table is held only for the lookup, never while computing or waiting.
    pub fn acquire(&self, key: K) -> Acquired<K, V, E> {
        let mut calls = self.table.lock();

        let acquired = match calls.entry(key) {
            Entry::Occupied(entry) => {
                Acquired::Follower(Call::from_shared(Arc::clone(entry.get())))
            }
            Entry::Vacant(entry) => {
                let shared = Arc::new(Shared::new(
                    entry.key().clone(),
                    self.options.default_timeout,
                ));
                entry.insert(Arc::clone(&shared));
                Acquired::Leader(Leader {
                    call: Call::from_shared(shared),
                    table: Arc::downgrade(&self.table),
                })
            }
        };

        let in_flight = calls.len();
        drop(calls);

        log::trace!(
            "call {:p}: acquired as {:?}, {} in flight",
            Arc::as_ptr(acquired.shared()),
            acquired.role(),
            in_flight,
        );

        acquired
    }

    /// Check if a computation for `key` is in flight.
    pub fn contains(&self, key: &K) -> bool {
        self.table.lock().contains_key(key)
    }

    /// A snapshot of all keys with a computation in flight.
    pub fn keys(&self) -> Vec<K> {
        self.table.lock().keys().cloned().collect()
    }

    /// The number of handles on the computation in flight for `key`, the leader included.
    ///
    /// Every caller that acquired the key and still holds its handle is counted. `None` if no
    /// computation for `key` is in flight.
    pub fn waiters(&self, key: &K) -> Option<usize> {
        let calls = self.table.lock();
        // The table's own reference is not a waiter.
        calls.get(key).map(|shared| Arc::strong_count(shared) - 1)
    }

    /// Run `compute` for `key` unless it is already running, and return the shared result.
    ///
    /// The leader's own error is reported as [`WaitErrorKind::Failed`], just as it is reported
    /// to the followers.
    ///
    /// [`WaitErrorKind::Failed`]: crate::call::WaitErrorKind::Failed
    pub fn run<F>(&self, key: K, compute: F) -> Result<V, WaitError<E>>
    where
        F: FnOnce() -> Result<V, E>,
        V: Clone,
        E: Clone,
    {
        match self.acquire(key) {
            Acquired::Leader(leader) => leader.run(compute).map_err(WaitError::failed),
            Acquired::Follower(call) => call.wait(),
        }
    }

    /// Await `compute` for `key` unless it is already running, and return the shared result.
    ///
    /// Followers never poll `compute`, it is dropped unused.
    pub async fn run_async<F>(&self, key: K, compute: F) -> Result<V, WaitError<E>>
    where
        F: Future<Output = Result<V, E>>,
        V: Clone,
        E: Clone,
    {
        match self.acquire(key) {
            Acquired::Leader(leader) => {
                leader.run_async(compute).await.map_err(WaitError::failed)
            }
            Acquired::Follower(call) => call.wait_async().await,
        }
    }
}

impl<K, V, E> Default for Registry<K, V, E> {
    fn default() -> Self {
        Registry::new()
    }
}

impl<K, V, E> fmt::Debug for Registry<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("in_flight", &self.len())
            .field("options", &self.options)
            .finish()
    }
}

impl Options {
    pub fn with_capacity(self, capacity: usize) -> Self {
        Options { capacity, ..self }
    }

    pub fn with_default_timeout(self, timeout: Duration) -> Self {
        Options {
            default_timeout: Some(timeout),
            ..self
        }
    }
}

impl<K: Eq + Hash, V, E> Acquired<K, V, E> {
    pub fn role(&self) -> Role {
        match self {
            Acquired::Leader(_) => Role::Leader,
            Acquired::Follower(_) => Role::Follower,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// A new waiter on the computation, whatever the role.
    pub fn call(&self) -> Call<K, V, E> {
        match self {
            Acquired::Leader(leader) => leader.call(),
            Acquired::Follower(call) => call.clone(),
        }
    }

    /// Take the leader, if we were elected.
    pub fn into_leader(self) -> Option<Leader<K, V, E>> {
        match self {
            Acquired::Leader(leader) => Some(leader),
            Acquired::Follower(_) => None,
        }
    }

    fn shared(&self) -> &Arc<Shared<K, V, E>> {
        match self {
            Acquired::Leader(leader) => &leader.call.shared,
            Acquired::Follower(call) => &call.shared,
        }
    }
}

impl<K: Eq + Hash + fmt::Debug, V, E> fmt::Debug for Acquired<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acquired::Leader(leader) => f.debug_tuple("Leader").field(&leader.call).finish(),
            Acquired::Follower(call) => f.debug_tuple("Follower").field(call).finish(),
        }
    }
}

impl<K: Eq + Hash, V, E> Leader<K, V, E> {
    pub fn key(&self) -> &K {
        self.call.key()
    }

    /// A waiter on our own computation, for example to hand to another thread.
    pub fn call(&self) -> Call<K, V, E> {
        self.call.clone()
    }

    fn complete(&self, outcome: Outcome<V, E>) {
        let shared = &self.call.shared;
        if !shared.store(outcome) {
            return;
        }

        // Deregister before waking, so a woken follower asking again will lead a fresh attempt.
        if let Some(table) = self.table.upgrade() {
            if let Err(err) = table.release(shared) {
                log::error!("call {:p}: {}", Arc::as_ptr(shared), err);
            }
        }

        shared.fire();
    }

    /// Publish a successful outcome and wake all followers.
    pub fn publish_value(self, value: V) {
        log::trace!("call {:p}: publishing value", Arc::as_ptr(&self.call.shared));
        self.complete(Outcome::Value(value));
    }

    /// Publish a failure and wake all followers.
    pub fn publish_error(self, err: E) {
        log::trace!("call {:p}: publishing error", Arc::as_ptr(&self.call.shared));
        self.complete(Outcome::Error(err));
    }

    pub fn publish(self, result: Result<V, E>) {
        match result {
            Ok(value) => self.publish_value(value),
            Err(err) => self.publish_error(err),
        }
    }

    /// Run the computation and publish its result.
    ///
    /// The result is also returned to the caller. Should `compute` panic, the followers observe
    /// [`WaitErrorKind::Abandoned`] while the panic continues to unwind through our caller.
    ///
    /// [`WaitErrorKind::Abandoned`]: crate::call::WaitErrorKind::Abandoned
    pub fn run<F>(self, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        V: Clone,
        E: Clone,
    {
        let result = compute();
        self.publish(result.clone());
        result
    }

    /// Await the computation and publish its result.
    ///
    /// If the returned future is dropped before completion, the computation is abandoned.
    pub async fn run_async<F>(self, compute: F) -> Result<V, E>
    where
        F: Future<Output = Result<V, E>>,
        V: Clone,
        E: Clone,
    {
        let result = compute.await;
        self.publish(result.clone());
        result
    }
}

impl<K: Eq + Hash, V, E> Drop for Leader<K, V, E> {
    fn drop(&mut self) {
        if !self.call.is_complete() {
            log::debug!(
                "call {:p}: leader dropped without publishing",
                Arc::as_ptr(&self.call.shared)
            );
            self.complete(Outcome::Abandoned);
        }
    }
}

impl<K, V, E> Table<K, V, E> {
    fn lock(&self) -> MutexGuard<'_, HashMap<K, Arc<Shared<K, V, E>>>> {
        // A panicking hasher can not leave a half-inserted entry behind.
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Eq + Hash, V, E> Table<K, V, E> {
    /// Remove the key of `shared`, but only if it is still registered to `shared` itself.
    pub(crate) fn release(&self, shared: &Arc<Shared<K, V, E>>) -> Result<(), ReleaseError> {
        let mut calls = self.lock();
        match calls.get(shared.key()) {
            Some(current) if Arc::ptr_eq(current, shared) => {
                calls.remove(shared.key());
                Ok(())
            }
            Some(_) => Err(ReleaseError { key_present: true }),
            None => Err(ReleaseError { key_present: false }),
        }
    }
}

impl ReleaseError {
    /// Whether the key was held by another call at the time of release.
    pub fn key_present(&self) -> bool {
        self.key_present
    }
}

impl fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key_present {
            f.write_str("released a key that belongs to a newer computation")
        } else {
            f.write_str("released a key that is not in flight, was the outcome published twice?")
        }
    }
}

impl std::error::Error for ReleaseError {}
