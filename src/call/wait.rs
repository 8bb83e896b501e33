use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use slotmap::DefaultKey;

use super::{Call, WaitError};

/// A future waiting for the outcome of a [`Call`].
///
/// Created by [`Call::wait_async`]. Dropping it detaches only this waiter.
pub struct Wait<'call, K, V, E> {
    call: &'call Call<K, V, E>,
    /// Our parked waker, if any.
    slot: Option<DefaultKey>,
}

impl<'call, K, V, E> Wait<'call, K, V, E> {
    pub(crate) fn new(call: &'call Call<K, V, E>) -> Self {
        Wait { call, slot: None }
    }
}

impl<K, V: Clone, E: Clone> Future for Wait<'_, K, V, E> {
    type Output = Result<V, WaitError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let call = this.call;
        let signal = &call.shared.signal;

        loop {
            if let Some(result) = call.settled_result() {
                if let Some(key) = this.slot.take() {
                    signal.deregister(key);
                }

                return Poll::Ready(result);
            }

            // Not parked if it settled in between, then look at the result again.
            if signal.register(&mut this.slot, cx.waker(), &mut || call.is_settled()) {
                return Poll::Pending;
            }
        }
    }
}

impl<K, V, E> Drop for Wait<'_, K, V, E> {
    fn drop(&mut self) {
        if let Some(key) = self.slot.take() {
            self.call.shared.signal.deregister(key);
        }
    }
}
