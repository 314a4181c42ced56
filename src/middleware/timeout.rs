//! Request timeout guard.
//!
//! Bounds how long a request may hold its connection. Three paths are active
//! at the same time:
//!
//! 1. **Transport bounds**: the router reads request bodies through
//!    `tower_http::timeout::RequestBodyTimeoutLayer`, so a client that stops
//!    sending cannot pin a handler past the threshold.
//! 2. **Deadline propagation**: the threshold is published to downstream code
//!    as a [`RequestDeadline`] extension so handlers can bound their own I/O
//!    (see [`RequestDeadlineExt::effective_timeout`]).
//! 3. **Fallback timer**: a [`TimeoutTimer`] armed for `threshold + grace`.
//!    If it expires before the handler produced a response, the client gets
//!    `503 {"erro": "Request timeout", "requestId": ...}`. If the head was
//!    already sent, the timer moves into the response body and the stream is
//!    aborted when it expires.
//!
//! The handler runs in its own task. A timeout answers the client but does
//! not abort that task; it can check [`RequestContext::is_timed_out`].
//!
//! # Timer Outcomes
//!
//! Every timer ends in exactly one [`TimerOutcome`]:
//!
//! ```text
//! armed ──┬── response fully sent first ──► Finished
//!         ├── timer expired first ────────► Fired   (503 sent or body aborted)
//!         └── connection dropped ─────────► Closed  (future or body dropped)
//! ```

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Json;
use axum::body::{Body, HttpBody};
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use futures_util::stream;
use tokio::time::{Instant, Sleep};
use tower::{Layer, Service};
use tracing::{Instrument, Span, debug, error, warn};

use super::request_id::RequestContext;
use crate::error::{ErrorBody, GENERIC_ERROR_MESSAGE};
use crate::metrics;

/// Body text of the fallback response.
pub const TIMEOUT_MESSAGE: &str = "Request timeout";

/// Deadline published to downstream handlers through request extensions.
#[derive(Debug, Clone, Copy)]
pub struct RequestDeadline {
    /// Configured processing threshold.
    pub threshold: Duration,
    /// Instant at which the threshold elapses.
    pub expires_at: Instant,
}

impl RequestDeadline {
    pub fn starting_now(threshold: Duration) -> Self {
        Self {
            threshold,
            expires_at: Instant::now() + threshold,
        }
    }

    /// Time left before the threshold, zero once it passed.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Extension trait for reading the request deadline.
pub trait RequestDeadlineExt {
    /// The smaller of `default` and the time left before the deadline.
    fn effective_timeout(&self, default: Duration) -> Duration;
}

impl<B> RequestDeadlineExt for Request<B> {
    fn effective_timeout(&self, default: Duration) -> Duration {
        self.extensions()
            .get::<RequestDeadline>()
            .map(|d| d.remaining().min(default))
            .unwrap_or(default)
    }
}

/// How a [`TimeoutTimer`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    Fired,
    Finished,
    Closed,
}

impl TimerOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TimerOutcome::Fired => "fired",
            TimerOutcome::Finished => "finished",
            TimerOutcome::Closed => "closed",
        }
    }
}

impl fmt::Display for TimerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type OutcomeObserver = Box<dyn FnOnce(TimerOutcome) + Send>;

/// Fallback timer scoped to one request.
///
/// Settles exactly once. Dropping an unsettled timer (the response future was
/// dropped because the client went away) settles it as [`TimerOutcome::Closed`].
pub struct TimeoutTimer {
    sleep: Pin<Box<Sleep>>,
    observer: Option<OutcomeObserver>,
}

impl TimeoutTimer {
    /// Arm a timer that expires after `after`.
    pub fn arm(after: Duration) -> Self {
        Self::arm_with_observer(after, |outcome| {
            metrics::record_timeout_timer_outcome(outcome.as_str());
        })
    }

    /// Arm a timer and report its outcome to `observer`.
    pub fn arm_with_observer<F>(after: Duration, observer: F) -> Self
    where
        F: FnOnce(TimerOutcome) + Send + 'static,
    {
        Self {
            sleep: Box::pin(tokio::time::sleep(after)),
            observer: Some(Box::new(observer)),
        }
    }

    /// Wait for the timer to expire.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await;
    }

    pub fn is_settled(&self) -> bool {
        self.observer.is_none()
    }

    /// Record the outcome. Later calls are ignored.
    pub fn settle(&mut self, outcome: TimerOutcome) {
        if let Some(observer) = self.observer.take() {
            observer(outcome);
        }
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        if !self.is_settled() {
            debug!("Connection closed before the request completed");
            self.settle(TimerOutcome::Closed);
        }
    }
}

/// Timeout guard layer for Tower middleware stack.
///
/// Must run inside [`super::RequestIdLayer`] so the 503 body carries the
/// correlation id.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuardLayer {
    threshold: Duration,
    grace: Duration,
}

impl TimeoutGuardLayer {
    pub fn new(threshold: Duration, grace: Duration) -> Self {
        Self { threshold, grace }
    }

    /// Time after which the fallback response is sent.
    pub fn deadline(&self) -> Duration {
        self.threshold + self.grace
    }
}

impl<S> Layer<S> for TimeoutGuardLayer {
    type Service = TimeoutGuardService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutGuardService {
            inner,
            threshold: self.threshold,
            grace: self.grace,
        }
    }
}

/// Timeout guard service wrapper.
#[derive(Clone)]
pub struct TimeoutGuardService<S> {
    inner: S,
    threshold: Duration,
    grace: Duration,
}

impl<S> Service<Request<Body>> for TimeoutGuardService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let threshold = self.threshold;
        let deadline = self.threshold + self.grace;

        req.extensions_mut()
            .insert(RequestDeadline::starting_now(threshold));
        let context = req.extensions().get::<RequestContext>().cloned();
        let path = req.uri().path().to_owned();

        let mut inner = self.inner.clone();
        let downstream = inner.call(req);

        Box::pin(async move {
            let mut timer = TimeoutTimer::arm(deadline);
            let mut handler = tokio::spawn(downstream.instrument(Span::current()));

            tokio::select! {
                joined = &mut handler => {
                    match joined {
                        Ok(Ok(response)) => Ok(guard_response(response, timer, context, path)),
                        Ok(Err(e)) => {
                            timer.settle(TimerOutcome::Finished);
                            Err(e)
                        }
                        Err(join_error) => {
                            timer.settle(TimerOutcome::Finished);
                            error!(error = %join_error, path = %path, "Request handler task failed");
                            let body = ErrorBody::new(
                                GENERIC_ERROR_MESSAGE,
                                context.as_ref().map(|c| c.correlation_id().to_owned()),
                            );
                            Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response())
                        }
                    }
                }
                () = timer.expired() => {
                    timer.settle(TimerOutcome::Fired);
                    if let Some(ctx) = &context {
                        ctx.mark_timed_out();
                    }
                    warn!(
                        path = %path,
                        timeout_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                        "Request exceeded processing time, answering with 503"
                    );
                    Ok(timeout_response(context.as_ref()))
                }
            }
        })
    }
}

/// Keep the deadline running while the response body is sent.
///
/// Bodies whose length is already known are complete in memory and settle
/// the timer at once. Anything else is streamed under the remaining deadline.
fn guard_response(
    response: Response<Body>,
    mut timer: TimeoutTimer,
    context: Option<RequestContext>,
    path: String,
) -> Response<Body> {
    if response.body().size_hint().exact().is_some() {
        timer.settle(TimerOutcome::Finished);
        return response;
    }

    response.map(|body| guard_body(body, timer, context, path))
}

/// Wrap `body` so it ends with an error once `timer` expires.
///
/// The timer settles as [`TimerOutcome::Finished`] when the body reaches its
/// end, [`TimerOutcome::Fired`] when the deadline cuts it off, and
/// [`TimerOutcome::Closed`] when the body is dropped unfinished.
fn guard_body(
    body: Body,
    timer: TimeoutTimer,
    context: Option<RequestContext>,
    path: String,
) -> Body {
    let state = Some((body.into_data_stream(), timer));

    let guarded = stream::unfold(state, move |state| {
        let context = context.clone();
        let path = path.clone();

        async move {
            let Some((mut data, mut timer)) = state else {
                return None;
            };

            tokio::select! {
                chunk = data.next() => match chunk {
                    Some(chunk) => Some((chunk, Some((data, timer)))),
                    None => {
                        timer.settle(TimerOutcome::Finished);
                        None
                    }
                },
                () = timer.expired() => {
                    timer.settle(TimerOutcome::Fired);
                    if let Some(ctx) = &context {
                        ctx.mark_timed_out();
                    }
                    warn!(path = %path, "Response body exceeded processing time, aborting");
                    let cut = io::Error::new(io::ErrorKind::TimedOut, TIMEOUT_MESSAGE);
                    Some((Err(axum::Error::new(cut)), None))
                }
            }
        }
    });

    Body::from_stream(guarded)
}

/// Build the fallback 503 response.
fn timeout_response(context: Option<&RequestContext>) -> Response<Body> {
    let body = ErrorBody::new(
        TIMEOUT_MESSAGE,
        context.map(|c| c.correlation_id().to_owned()),
    );
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}
