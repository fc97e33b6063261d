//! Named task handles that propagate panics.

use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error};

/// A thin wrapper around [`tokio::task::JoinHandle`] that:
///
/// (1) names the task for debuggability,
/// (2) inherits the current tracing span across the spawn boundary,
/// (3) propagates panics to the poller instead of swallowing them, and
/// (4) is `#[must_use]` so that fire-and-forget spawns are an explicit
///     [`Task::detach`] rather than an accident.
#[must_use]
pub(crate) struct Task<T> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T: Send + 'static> Task<T> {
    /// Spawns a named task which inherits the current span.
    pub(crate) fn spawn<F>(
        name: impl Into<Cow<'static, str>>,
        future: F,
    ) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        Self {
            handle: tokio::spawn(future.in_current_span()),
            name,
        }
    }
}

impl<T> Task<T> {
    #[allow(dead_code)] // used in tests and kept for parity with `detach`
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Drop the handle, letting the task run to completion in the background.
    /// The task's output (and any panic) can no longer be observed.
    pub(crate) fn detach(self) {
        std::mem::drop(self)
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = match result {
            Ok(value) => Ok(value),
            Err(join_err) => match join_err.try_into_panic() {
                Ok(panic_reason) => {
                    error!("Task '{name}' panicked!", name = self.name());
                    std::panic::resume_unwind(panic_reason)
                }
                Err(join_err) => Err(join_err),
            },
        };

        Poll::Ready(result)
    }
}
