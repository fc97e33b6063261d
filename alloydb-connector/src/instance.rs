//! Per-instance refresh state machine.
//!
//! Each [`Instance`] owns the credential lifecycle for one AlloyDB instance:
//! it holds the latest successful [`RefreshResult`], coalesces concurrent
//! refreshes into a single in-flight attempt, and (under the background
//! strategy) keeps a loop running that renews credentials ahead of expiry.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use time::OffsetDateTime;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

use crate::{
    api::AdminApi,
    backoff,
    config::RefreshStrategy,
    error::Error,
    keys::SharedKeyPair,
    refresh::{self, REFRESH_BUFFER, RefreshResult},
    shutdown::Shutdown,
    task::Task,
    token::TokenProvider,
    uri::InstanceUri,
};

/// Failed background refreshes retry on this schedule until one succeeds or
/// the connector closes.
const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(200);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// The singleflight handle: every concurrent waiter clones this future and
/// observes the same outcome. Dropping a clone abandons only that waiter's
/// wait; the underlying refresh task keeps running.
type RefreshFuture =
    Shared<BoxFuture<'static, Result<Arc<RefreshResult>, Error>>>;

/// Cheap-to-clone handle to one instance's refresh state.
#[derive(Clone)]
pub(crate) struct Instance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    uri: InstanceUri,
    api: Arc<dyn AdminApi>,
    token_provider: Arc<dyn TokenProvider>,
    keys: SharedKeyPair,
    strategy: RefreshStrategy,
    state: Mutex<State>,
    /// Wakes the background loop to abandon its scheduled sleep.
    wake: Notify,
    shutdown: Shutdown,
}

#[derive(Default)]
struct State {
    /// The latest successful refresh, if any. Only replaced by a *newer*
    /// success or dropped on close, so callers keep connecting with
    /// last-known-good credentials while a replacement is in flight.
    current: Option<Arc<RefreshResult>>,
    /// The in-flight refresh, if any. At most one exists at a time.
    next: Option<RefreshFuture>,
    closed: bool,
}

impl Instance {
    /// Creates the instance and, under the background strategy, spawns its
    /// refresh loop (returned so the connector can join it on close).
    pub(crate) fn spawn(
        uri: InstanceUri,
        api: Arc<dyn AdminApi>,
        token_provider: Arc<dyn TokenProvider>,
        keys: SharedKeyPair,
        strategy: RefreshStrategy,
        shutdown: Shutdown,
    ) -> (Instance, Option<Task<()>>) {
        let inner = Arc::new(InstanceInner {
            uri,
            api,
            token_provider,
            keys,
            strategy,
            state: Mutex::new(State::default()),
            wake: Notify::new(),
            shutdown,
        });

        let refresh_loop = match strategy {
            RefreshStrategy::Background => {
                let name = format!("refresh-loop({})", inner.uri);
                Some(Task::spawn(name, run_refresh_loop(Arc::clone(&inner))))
            }
            RefreshStrategy::Lazy => None,
        };

        (Instance { inner }, refresh_loop)
    }

    /// Returns connection metadata, awaiting the in-flight refresh when
    /// nothing usable is cached. Never starts a second concurrent refresh,
    /// and never returns a result whose expiry has passed.
    pub(crate) async fn connection_info(
        &self,
    ) -> Result<Arc<RefreshResult>, Error> {
        let next = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Err(Error::Closed);
            }

            if let Some(current) = &state.current {
                let now = OffsetDateTime::now_utc();
                let usable = match self.inner.strategy {
                    // The loop renews proactively; serve the cached result
                    // for as long as it is valid.
                    RefreshStrategy::Background => !current.expired(now),
                    RefreshStrategy::Lazy =>
                        !current.expires_within(REFRESH_BUFFER, now),
                };
                if usable {
                    return Ok(Arc::clone(current));
                }
            }

            start_refresh_locked(&self.inner, &mut state)
        };

        next.await
    }

    /// Triggers an immediate renewal, e.g. after a failed handshake hinting
    /// that the server rotated its identity.
    ///
    /// Coalesces with any refresh already in flight, and keeps serving the
    /// last-known-good result until the replacement lands. Under the
    /// background strategy the loop's scheduled refresh is abandoned in favor
    /// of this one.
    pub(crate) fn force_refresh(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed || state.next.is_some() {
            return;
        }

        debug!(uri = %self.inner.uri, "Forcing refresh");
        let _next = start_refresh_locked(&self.inner, &mut state);
        drop(state);

        // Re-anchor the background loop's schedule to the new refresh.
        self.inner.wake.notify_one();
    }

    /// Drops the cached and in-flight results. Subsequent calls observe
    /// [`Error::Closed`]; pending waiters are failed by the refresh task's
    /// shutdown arm.
    pub(crate) fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        state.current = None;
        state.next = None;
    }

    #[cfg(test)]
    fn current(&self) -> Option<Arc<RefreshResult>> {
        self.inner.state.lock().unwrap().current.clone()
    }
}

/// Starts a refresh task unless one is already in flight. Callers await the
/// returned future *outside* the state lock.
fn start_refresh_locked(
    inner: &Arc<InstanceInner>,
    state: &mut State,
) -> RefreshFuture {
    if let Some(next) = &state.next {
        return next.clone();
    }

    let (result_tx, result_rx) = oneshot::channel();
    let task_inner = Arc::clone(inner);
    let mut shutdown = inner.shutdown.clone();
    Task::spawn(format!("refresh({})", inner.uri), async move {
        let result = tokio::select! {
            biased;
            () = shutdown.recv() => Err(Error::Closed),
            result = task_inner.refresh_once() => result,
        };
        task_inner.finish_refresh(&result);
        // All waiters may have gone away; that's fine.
        let _ = result_tx.send(result);
    })
    // The task is bounded by the shutdown channel, not this handle.
    .detach();

    let next = result_rx
        .map(|received| match received {
            Ok(result) => result,
            // The refresh task was torn down before completing.
            Err(_recv_error) => Err(Error::Closed),
        })
        .boxed()
        .shared();
    state.next = Some(next.clone());
    next
}

/// Background strategy driver: refresh, sleep until the next scheduled
/// renewal (or a failure retry, or a force-refresh wake), repeat.
async fn run_refresh_loop(inner: Arc<InstanceInner>) {
    let mut shutdown = inner.shutdown.clone();
    let mut retries = backoff::iter_with(RETRY_INITIAL_DELAY, RETRY_MAX_DELAY);

    loop {
        let next = {
            let mut state = inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            start_refresh_locked(&inner, &mut state)
        };

        let delay = match next.await {
            Ok(result) => {
                // Reset the failure schedule after any success.
                retries =
                    backoff::iter_with(RETRY_INITIAL_DELAY, RETRY_MAX_DELAY);
                let ttl = result.ttl(OffsetDateTime::now_utc());
                refresh::refresh_delay(ttl)
            }
            Err(Error::Closed) => return,
            Err(_) => retries.next().expect("backoff iter is infinite"),
        };

        debug!(uri = %inner.uri, ?delay, "Next refresh scheduled");
        tokio::select! {
            biased;
            () = shutdown.recv() => return,
            // A force-refresh started; loop around and subscribe to it.
            () = inner.wake.notified() => (),
            () = tokio::time::sleep(delay) => (),
        }
    }
}

impl InstanceInner {
    /// The suspendable part of a refresh; runs without holding the lock.
    async fn refresh_once(&self) -> Result<Arc<RefreshResult>, Error> {
        let keys = self.keys.clone().await?;
        refresh::perform_refresh(
            self.api.as_ref(),
            self.token_provider.as_ref(),
            &keys,
            &self.uri,
        )
        .await
        .map(Arc::new)
    }

    /// Publishes the refresh outcome. The swap of `current` is atomic with
    /// respect to readers, and failures leave the previous result in place.
    fn finish_refresh(&self, result: &Result<Arc<RefreshResult>, Error>) {
        let mut state = self.state.lock().unwrap();
        state.next = None;
        match result {
            // Discard results that raced with close.
            Ok(_) if state.closed => (),
            Ok(result) => state.current = Some(Arc::clone(result)),
            // Shutdown during a refresh is not a failure worth logging.
            Err(Error::Closed) => (),
            Err(e) => warn!(
                uri = %self.uri,
                kind = ?e.kind(),
                "Instance refresh failed: {e:#}",
            ),
        }
    }
}
