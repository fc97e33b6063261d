//! A send-once channel used to tear the connector down.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Broadcasts a single shutdown signal to every clone of the channel.
///
/// - Multi-producer and multi-consumer; clone to get another handle.
/// - Each clone observes the signal at most once, but handles cloned *after*
///   the signal was sent still observe it (unlike [`tokio::sync::broadcast`]).
/// - Sending more than once is harmless.
///
/// The implementation rides on a [`Semaphore`] with zero permits: [`acquire`]
/// only ever returns once the semaphore has been closed, so closing it is the
/// signal and the resulting [`AcquireError`] is the receipt.
///
/// [`acquire`]: Semaphore::acquire
/// [`AcquireError`]: tokio::sync::AcquireError
#[derive(Debug)]
pub(crate) struct Shutdown {
    inner: Arc<Semaphore>,
    seen: bool,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
            seen: false,
        }
    }

    /// Fire the signal, waking every pending and future [`recv`](Self::recv).
    pub(crate) fn send(&self) {
        self.inner.close();
    }

    /// Wait for the signal.
    ///
    /// NOTE: if this handle has already observed the signal, this future
    /// never resolves; subscribe with a fresh clone instead.
    pub(crate) async fn recv(&mut self) {
        if self.seen {
            std::future::pending().await
        } else {
            let result = self.inner.acquire().await;
            debug_assert!(result.is_err(), "zero-permit semaphore acquired?");
            self.seen = true;
        }
    }

    /// Whether the signal has been sent. Does not consume the handle's
    /// at-most-once receipt.
    #[must_use]
    pub(crate) fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            // Every clone gets its own chance to observe the signal.
            seen: false,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time;
    use tokio_test::{assert_pending, assert_ready};

    use super::*;

    #[test]
    fn repeated_sends_are_harmless() {
        let shutdown = Shutdown::new();
        shutdown.send();
        shutdown.send();
        shutdown.send();
    }

    #[test]
    fn each_handle_observes_once() {
        let shutdown1 = Shutdown::new();
        let mut shutdown2 = shutdown1.clone();

        let mut recv = tokio_test::task::spawn(shutdown2.recv());
        assert_pending!(recv.poll());

        shutdown1.send();
        assert!(recv.is_woken());
        assert_ready!(recv.poll());
        drop(recv);

        // The same handle never observes the signal twice.
        let mut recv_again = tokio_test::task::spawn(shutdown2.recv());
        assert_pending!(recv_again.poll());
        assert_pending!(recv_again.poll());
        drop(recv_again);

        // But a fresh clone does.
        let mut shutdown3 = shutdown2.clone();
        let mut recv3 = tokio_test::task::spawn(shutdown3.recv());
        assert_ready!(recv3.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_after_send() {
        let shutdown1 = Shutdown::new();
        let mut shutdown2 = shutdown1.clone();
        time::sleep(Duration::from_secs(1)).await;
        shutdown1.send();

        assert!(shutdown2.try_recv());
        time::timeout(Duration::from_nanos(1), shutdown2.recv())
            .await
            .expect("should have resolved immediately");
    }
}
