use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::task::Waker;
use std::time::{Duration, Instant};

use slotmap::{DefaultKey, SlotMap};

mod wait;

pub use self::wait::Wait;

/// A handle on one in-flight computation.
///
/// Every handle is an independent waiter. Followers receive one from
/// [`Registry::acquire`](crate::registry::Registry::acquire), the leader can create one with
/// [`Leader::call`](crate::registry::Leader::call). Cloning a handle creates another waiter on the
/// same computation, with its own cancellation state.
///
/// A handle never grants the capability to publish. That is reserved to the single `Leader`.
pub struct Call<K, V, E> {
    pub(crate) shared: Arc<Shared<K, V, E>>,
    cancelled: Arc<AtomicBool>,
}

/// Detaches one waiter from its computation.
///
/// Obtained from [`Call::canceller`]. Cancelling does not affect the leader or any other waiter
/// of the same computation, it only makes the waits of the originating handle return early.
#[derive(Clone)]
pub struct Canceller {
    cancelled: Arc<AtomicBool>,
    signal: Arc<Signal>,
}

/// The reason a wait did not produce a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitError<E> {
    kind: WaitErrorKind<E>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitErrorKind<E> {
    /// The leader published this error.
    Failed(E),
    /// The leader went away without publishing anything, for example by panicking.
    Abandoned,
    /// The deadline of the wait passed before the outcome was published.
    TimedOut,
    /// This waiter was cancelled through its [`Canceller`].
    Cancelled,
}

/// State shared between the registry table, the leader and all waiters of one key.
pub(crate) struct Shared<K, V, E> {
    /// The key under which the call is registered, used only to deregister it.
    key: K,
    /// Written once by the leader, read-only afterwards.
    outcome: OnceLock<Outcome<V, E>>,
    signal: Arc<Signal>,
    default_timeout: Option<Duration>,
}

pub(crate) enum Outcome<V, E> {
    Value(V),
    Error(E),
    Abandoned,
}

/// The one-shot completion signal.
///
/// Blocking waiters sleep on the condition variable, asynchronous waiters park their waker in
/// the slot map. The outcome itself lives outside the lock, every waiter re-checks it while
/// holding the lock so that a publication can not slip between check and sleep.
#[derive(Default)]
pub(crate) struct Signal {
    waiter: Condvar,
    wake: Mutex<Wakers>,
}

#[derive(Default)]
struct Wakers {
    wakers: SlotMap<DefaultKey, Waker>,
}

impl<K, V, E> Shared<K, V, E> {
    pub(crate) fn new(key: K, default_timeout: Option<Duration>) -> Self {
        Shared {
            key,
            outcome: OnceLock::new(),
            signal: Arc::default(),
            default_timeout,
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    /// Store the outcome, without waking anyone yet.
    ///
    /// Returns `false` if an outcome had already been stored, leaving the first one in place.
    pub(crate) fn store(&self, outcome: Outcome<V, E>) -> bool {
        self.outcome.set(outcome).is_ok()
    }

    pub(crate) fn fire(&self) {
        self.signal.fire();
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.outcome.get().is_some()
    }
}

impl<K, V, E> Call<K, V, E> {
    pub(crate) fn from_shared(shared: Arc<Shared<K, V, E>>) -> Self {
        Call {
            shared,
            cancelled: Arc::default(),
        }
    }

    /// The key this computation was registered under.
    pub fn key(&self) -> &K {
        self.shared.key()
    }

    /// Check if the leader has published an outcome.
    pub fn is_complete(&self) -> bool {
        self.shared.is_complete()
    }

    /// Check if this waiter was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Check if two handles wait on the very same computation.
    pub fn same_call(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Get a handle that cancels the waits of this handle, from any thread.
    pub fn canceller(&self) -> Canceller {
        Canceller {
            cancelled: Arc::clone(&self.cancelled),
            signal: Arc::clone(&self.shared.signal),
        }
    }

    /// Asynchronously wait for the outcome.
    ///
    /// The default timeout of the registry is not applied here. Drop the future, or race it
    /// against a timer, to stop waiting.
    pub fn wait_async(&self) -> Wait<'_, K, V, E> {
        Wait::new(self)
    }

    /// The outcome is published or this waiter no longer cares.
    fn is_settled(&self) -> bool {
        self.is_complete() || self.is_cancelled()
    }

    fn id(&self) -> *const Shared<K, V, E> {
        Arc::as_ptr(&self.shared)
    }
}

impl<K, V: Clone, E: Clone> Call<K, V, E> {
    /// Read the outcome if it has been published, without blocking.
    pub fn try_get(&self) -> Option<Result<V, WaitError<E>>> {
        self.shared.outcome.get().map(Outcome::to_result)
    }

    /// Block the current thread until the outcome is published.
    ///
    /// If the registry was configured with a default timeout, this waits at most that long.
    /// Calling this on the leader's own thread before the leader published will block until the
    /// timeout, or forever.
    pub fn wait(&self) -> Result<V, WaitError<E>> {
        match self.shared.default_timeout {
            Some(timeout) => self.wait_timeout(timeout),
            None => self.wait_inner(None),
        }
    }

    /// Block the current thread until the outcome is published or `timeout` passed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<V, WaitError<E>> {
        // A deadline too far in the future to represent is as good as none.
        let deadline = Instant::now().checked_add(timeout);
        self.wait_inner(deadline)
    }

    /// Block the current thread until the outcome is published or `deadline` is reached.
    pub fn wait_deadline(&self, deadline: Instant) -> Result<V, WaitError<E>> {
        self.wait_inner(Some(deadline))
    }

    fn wait_inner(&self, deadline: Option<Instant>) -> Result<V, WaitError<E>> {
        self.shared
            .signal
            .wait_until(&mut || self.is_settled(), deadline);
        self.settled_result().unwrap_or_else(|| {
            log::debug!("call {:p}: wait timed out", self.id());
            Err(WaitError::TimedOut)
        })
    }

    /// The result once settled, preferring a published outcome over cancellation.
    pub(crate) fn settled_result(&self) -> Option<Result<V, WaitError<E>>> {
        if let Some(result) = self.try_get() {
            return Some(result);
        }

        if self.is_cancelled() {
            log::debug!("call {:p}: waiter cancelled", self.id());
            return Some(Err(WaitError::Cancelled));
        }

        None
    }
}

impl<K, V, E> Clone for Call<K, V, E> {
    /// Create another waiter on the same computation.
    ///
    /// The new waiter is not cancelled, even if `self` was.
    fn clone(&self) -> Self {
        Call::from_shared(Arc::clone(&self.shared))
    }
}

impl<'call, K, V: Clone, E: Clone> core::future::IntoFuture for &'call Call<K, V, E> {
    type Output = Result<V, WaitError<E>>;
    type IntoFuture = Wait<'call, K, V, E>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait_async()
    }
}

impl<K: fmt::Debug, V, E> fmt::Debug for Call<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("key", self.key())
            .field("complete", &self.is_complete())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Canceller {
    /// Stop the originating handle from waiting.
    ///
    /// Waits that are blocked return immediately, later waits return at once. An outcome that
    /// was already published is still returned instead.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.signal.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<V: Clone, E: Clone> Outcome<V, E> {
    fn to_result(&self) -> Result<V, WaitError<E>> {
        match self {
            Outcome::Value(value) => Ok(value.clone()),
            Outcome::Error(err) => Err(WaitError::failed(err.clone())),
            Outcome::Abandoned => Err(WaitError::Abandoned),
        }
    }
}

impl Signal {
    fn lock(&self) -> MutexGuard<'_, Wakers> {
        // Nothing inside the critical sections can leave the wakers inconsistent.
        self.wake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake all current waiters, for good.
    ///
    /// The outcome must be stored before this is called.
    pub(crate) fn fire(&self) {
        let wakers: Vec<Waker> = {
            let mut lock = self.lock();
            self.waiter.notify_all();
            lock.wakers.drain().map(|(_, waker)| waker).collect()
        };

        for waker in wakers {
            waker.wake();
        }
    }

    /// Wake all current waiters so they re-check their own cancellation.
    fn interrupt(&self) {
        let lock = self.lock();
        self.waiter.notify_all();
        for waker in lock.wakers.values() {
            waker.wake_by_ref();
        }
    }

    /// Block until `settled` returns true or the deadline passes.
    ///
    /// Returns whether `settled` held at the end.
    pub(crate) fn wait_until(
        &self,
        settled: &mut dyn FnMut() -> bool,
        deadline: Option<Instant>,
    ) -> bool {
        let mut lock = self.lock();

        loop {
            if settled() {
                return true;
            }

            lock = match deadline {
                None => self
                    .waiter
                    .wait(lock)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    if timeout.is_zero() {
                        return false;
                    }

                    let (lock, _) = self
                        .waiter
                        .wait_timeout(lock, timeout)
                        .unwrap_or_else(PoisonError::into_inner);
                    lock
                }
            };
        }
    }

    /// Park `waker` in `slot` unless `settled` already holds.
    ///
    /// Returns `true` if the waker was parked and the caller should return pending.
    pub(crate) fn register(
        &self,
        slot: &mut Option<DefaultKey>,
        waker: &Waker,
        settled: &mut dyn FnMut() -> bool,
    ) -> bool {
        let mut lock = self.lock();

        if settled() {
            if let Some(key) = slot.take() {
                lock.wakers.remove(key);
            }
            return false;
        }

        let wakers = &mut lock.wakers;
        match *slot {
            Some(key) if wakers.contains_key(key) => {
                let parked = &mut wakers[key];
                if !parked.will_wake(waker) {
                    *parked = waker.clone();
                }
            }
            _ => *slot = Some(wakers.insert(waker.clone())),
        }

        true
    }

    pub(crate) fn deregister(&self, key: DefaultKey) {
        self.lock().wakers.remove(key);
    }
}

#[allow(non_upper_case_globals)]
impl<E> WaitError<E> {
    pub(crate) fn failed(err: E) -> Self {
        WaitError {
            kind: WaitErrorKind::Failed(err),
        }
    }

    pub(crate) const Abandoned: Self = WaitError {
        kind: WaitErrorKind::Abandoned,
    };

    pub(crate) const TimedOut: Self = WaitError {
        kind: WaitErrorKind::TimedOut,
    };

    pub(crate) const Cancelled: Self = WaitError {
        kind: WaitErrorKind::Cancelled,
    };
}

impl<E> WaitError<E> {
    pub fn kind(&self) -> &WaitErrorKind<E> {
        &self.kind
    }

    pub fn into_kind(self) -> WaitErrorKind<E> {
        self.kind
    }

    /// The error published by the leader, if that is why the wait failed.
    pub fn into_failure(self) -> Option<E> {
        match self.kind {
            WaitErrorKind::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.kind, WaitErrorKind::Failed(_))
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self.kind, WaitErrorKind::Abandoned)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self.kind, WaitErrorKind::TimedOut)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, WaitErrorKind::Cancelled)
    }
}

impl<E: fmt::Display> fmt::Display for WaitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            WaitErrorKind::Failed(err) => write!(f, "the computation failed: {}", err),
            WaitErrorKind::Abandoned => f.write_str("the computation was abandoned by its leader"),
            WaitErrorKind::TimedOut => f.write_str("timed out waiting for the computation"),
            WaitErrorKind::Cancelled => f.write_str("waiting for the computation was cancelled"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for WaitError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            WaitErrorKind::Failed(err) => Some(err),
            _ => None,
        }
    }
}
