//! Per-call state shared by the read path, the write path and the caller.
//!
//! A call terminates exactly once. The first terminal assignment wins,
//! later ones observe the winning status. Every suspended operation of the
//! call watches the same cancellation token, which fires on termination.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, trace};

use crate::metrics::{CallMetric, MetricsSink};
use crate::{Code, Status};

/// Lifecycle of a call.
///
/// `Completed`, `Cancelled` and `DeadlineExceeded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallState {
    /// Created, nothing sent yet.
    Created,
    /// Initial headers were sent.
    HeadersSent,
    /// At least one message was exchanged.
    Streaming,
    /// Terminated with a status from the peer or from local processing.
    Completed,
    /// Terminated by cancellation.
    Cancelled,
    /// Terminated because the deadline expired.
    DeadlineExceeded,
}

impl CallState {
    /// Whether no further transition can happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::DeadlineExceeded
        )
    }
}

/// Handle to the shared state of one call.
#[derive(Clone)]
pub struct Call {
    shared: Arc<CallShared>,
}

struct CallShared {
    path: Arc<str>,
    deadline: Option<Instant>,
    token: CancellationToken,
    inner: Mutex<CallInner>,
    peer_accept_encoding: OnceLock<Vec<String>>,
    metrics: Arc<dyn MetricsSink>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

struct CallInner {
    state: CallState,
    status: Option<Status>,
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Call")
            .field("path", &self.shared.path)
            .field("deadline", &self.shared.deadline)
            .field("state", &inner.state)
            .field("status", &inner.status)
            .finish()
    }
}

impl Call {
    /// Create a call for `path`.
    ///
    /// A deadline or an external cancellation token is watched by a
    /// background task on the current tokio runtime.
    pub fn new(
        path: impl Into<Arc<str>>,
        deadline: Option<Instant>,
        cancellation: Option<CancellationToken>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        metrics.increment(CallMetric::TotalCalls);
        metrics.increment(CallMetric::CurrentCalls);

        let shared = Arc::new(CallShared {
            path: path.into(),
            deadline,
            token: CancellationToken::new(),
            inner: Mutex::new(CallInner {
                state: CallState::Created,
                status: None,
            }),
            peer_accept_encoding: OnceLock::new(),
            metrics,
            watchdog: Mutex::new(None),
        });

        if deadline.is_some() || cancellation.is_some() {
            let watchdog = spawn_watchdog(&shared, cancellation);
            *shared.watchdog.lock() = watchdog;
        }

        trace!(path = %shared.path, ?deadline, "call created");
        Self { shared }
    }

    /// The request path of the call.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Absolute deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CallState {
        self.shared.inner.lock().state
    }

    /// Terminal status, once terminated.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        self.shared.inner.lock().status.clone()
    }

    /// Whether the call terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// A token cancelled once the call terminates.
    ///
    /// Cancelling the returned token does not affect the call.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.token.child_token()
    }

    /// Resolves once the call terminates.
    pub fn terminated(&self) -> WaitForCancellationFutureOwned {
        self.shared.token.clone().cancelled_owned()
    }

    /// Cancel the call. No effect once terminated.
    pub fn cancel(&self) {
        self.terminate(
            CallState::Cancelled,
            Status::cancelled("Call canceled by the client."),
        );
    }

    pub(crate) fn expire(&self) {
        self.terminate(
            CallState::DeadlineExceeded,
            Status::deadline_exceeded("Deadline Exceeded"),
        );
    }

    /// Complete the call with `status`, returning the status that won.
    pub(crate) fn finish(&self, status: Status) -> Status {
        self.terminate(CallState::Completed, status)
    }

    /// The status an interrupted operation resolves with.
    pub(crate) fn interrupted(&self) -> Status {
        self.status()
            .unwrap_or_else(|| Status::cancelled("Call was cancelled."))
    }

    /// The status an operation on a terminated call resolves with.
    pub(crate) fn closed(&self) -> Status {
        let status = self.interrupted();
        if status.code() == Code::Ok {
            Status::internal("Call is already complete.")
        } else {
            status
        }
    }

    /// The terminal status if it is an error.
    pub(crate) fn failure(&self) -> Option<Status> {
        self.status().filter(|status| status.code() != Code::Ok)
    }

    /// Move forward to a non-terminal state, never backwards.
    pub(crate) fn advance(&self, to: CallState) {
        let mut inner = self.shared.inner.lock();
        if !inner.state.is_terminal() && !to.is_terminal() && to > inner.state {
            trace!(path = %self.shared.path, from = ?inner.state, ?to, "call state");
            inner.state = to;
        }
    }

    pub(crate) fn set_peer_accept_encoding(&self, names: Vec<String>) {
        let _already_set = self.shared.peer_accept_encoding.set(names);
    }

    /// Whether the peer accepts `name`, assumed until it advertised a set.
    pub(crate) fn peer_accepts(&self, name: &str) -> bool {
        self.shared
            .peer_accept_encoding
            .get()
            .is_none_or(|names| names.iter().any(|n| n == name))
    }

    pub(crate) fn metrics(&self) -> &dyn MetricsSink {
        &*self.shared.metrics
    }

    fn terminate(&self, state: CallState, status: Status) -> Status {
        let mut inner = self.shared.inner.lock();
        if let Some(existing) = &inner.status {
            trace!(
                path = %self.shared.path,
                winner = ?existing.code(),
                loser = ?status.code(),
                "call already terminated"
            );
            return existing.clone();
        }
        inner.state = state;
        inner.status = Some(status.clone());
        drop(inner);

        self.shared.token.cancel();
        if let Some(watchdog) = self.shared.watchdog.lock().take() {
            watchdog.abort();
        }

        let metrics = &self.shared.metrics;
        metrics.decrement(CallMetric::CurrentCalls);
        if status.code() != Code::Ok {
            metrics.increment(CallMetric::CallsFailed);
        }
        if state == CallState::DeadlineExceeded {
            metrics.increment(CallMetric::CallsDeadlineExceeded);
        }

        debug!(
            path = %self.shared.path,
            ?state,
            code = ?status.code(),
            message = status.message(),
            "call terminated"
        );
        status
    }
}

fn spawn_watchdog(
    shared: &Arc<CallShared>,
    external: Option<CancellationToken>,
) -> Option<JoinHandle<()>> {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!(path = %shared.path, "no tokio runtime, deadline and cancellation are not watched");
        return None;
    };

    let weak: Weak<CallShared> = Arc::downgrade(shared);
    let token = shared.token.clone();
    let deadline = shared.deadline;

    Some(handle.spawn(async move {
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async move {
            match external {
                Some(external) => external.cancelled_owned().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = token.cancelled() => {}
            () = expired => {
                if let Some(shared) = weak.upgrade() {
                    Call { shared }.expire();
                }
            }
            () = cancelled => {
                if let Some(shared) = weak.upgrade() {
                    Call { shared }.cancel();
                }
            }
        }
    }))
}

impl Drop for CallShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = CallState::Cancelled;
        self.token.cancel();
        if let Some(watchdog) = self.watchdog.get_mut().take() {
            watchdog.abort();
        }
        self.metrics.decrement(CallMetric::CurrentCalls);
        self.metrics.increment(CallMetric::CallsFailed);
        debug!(path = %self.path, "call dropped before termination");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{AtomicMetrics, NoopMetrics};
    use std::time::Duration;

    fn call(deadline: Option<Duration>) -> Call {
        Call::new(
            "/test.Service/Call",
            deadline.map(|d| Instant::now() + d),
            None,
            Arc::new(NoopMetrics),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_strictly_first_wins() {
        let call = call(Some(Duration::from_millis(100)));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(call.state(), CallState::DeadlineExceeded);

        let status = call.finish(Status::ok(""));
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert_eq!(call.status().unwrap().code(), Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_status_strictly_first_wins() {
        let call = call(Some(Duration::from_millis(100)));
        tokio::time::sleep(Duration::from_millis(99)).await;
        let status = call.finish(Status::not_found("gone"));
        assert_eq!(status.code(), Code::NotFound);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(call.state(), CallState::Completed);
        assert_eq!(call.status().unwrap().code(), Code::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn termination_wakes_waiters() {
        let call = call(Some(Duration::from_secs(1)));
        let waiter = tokio::spawn(call.terminated());
        call.cancel();
        waiter.await.unwrap();
        assert_eq!(call.status().unwrap().code(), Code::Cancelled);
        assert!(call.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn external_cancellation() {
        let external = CancellationToken::new();
        let call = Call::new(
            "/test.Service/Call",
            None,
            Some(external.clone()),
            Arc::new(NoopMetrics),
        );
        external.cancel();
        call.terminated().await;
        assert_eq!(call.state(), CallState::Cancelled);
    }

    #[test]
    fn states_only_move_forward() {
        let call = call(None);
        call.advance(CallState::Streaming);
        call.advance(CallState::HeadersSent);
        assert_eq!(call.state(), CallState::Streaming);
        call.finish(Status::ok(""));
        call.advance(CallState::Streaming);
        assert_eq!(call.state(), CallState::Completed);
    }

    #[test]
    fn metrics_follow_lifecycle() {
        let metrics = Arc::new(AtomicMetrics::new());
        let a = Call::new("/svc/a", None, None, metrics.clone());
        let b = Call::new("/svc/b", None, None, metrics.clone());
        assert_eq!(metrics.get(CallMetric::CurrentCalls), 2);

        a.finish(Status::internal("boom"));
        drop(b);
        assert_eq!(metrics.get(CallMetric::TotalCalls), 2);
        assert_eq!(metrics.get(CallMetric::CurrentCalls), 0);
        assert_eq!(metrics.get(CallMetric::CallsFailed), 2);
    }

    #[test]
    fn peer_accept_encoding() {
        let call = call(None);
        assert!(call.peer_accepts("gzip"));
        call.set_peer_accept_encoding(vec!["zstd".to_owned()]);
        assert!(!call.peer_accepts("gzip"));
        assert!(call.peer_accepts("zstd"));
    }
}
