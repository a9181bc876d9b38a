use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::FlowError;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Terminal or intermediate result of a request.
pub type Outcome<T> = Result<T, FlowError>;

type Producer<T> = Box<dyn FnOnce(RequestContext) -> BoxFuture<'static, Outcome<T>> + Send>;

type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle of a [`Request`].
///
/// `Pending -> Running -> Finished | Failed | Cancelled`. A request cancelled
/// before it starts goes straight from `Pending` to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pending,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Finished | Phase::Failed | Phase::Cancelled)
    }

    fn of<T>(outcome: &Outcome<T>) -> Phase {
        match outcome {
            Ok(_) => Phase::Finished,
            Err(FlowError::Cancelled) => Phase::Cancelled,
            Err(_) => Phase::Failed,
        }
    }
}

// =============================================================================
// RequestContext
// =============================================================================

/// Handed to every producer while it runs.
///
/// Producers use it to observe cancellation and to spawn child requests that
/// belong to the same request tree.
#[derive(Clone, Debug)]
pub struct RequestContext {
    token: CancellationToken,
    handle: Option<Handle>,
}

impl RequestContext {
    /// A root context for callers that are not themselves inside a request.
    pub fn detached() -> Self {
        Self {
            token: CancellationToken::new(),
            handle: Handle::try_current().ok(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(FlowError::Cancelled)` once the surrounding request is cancelled.
    ///
    /// Long-running producers call this at coarse granularity (once per
    /// block or row batch) and return early with `?`.
    pub fn check_cancelled(&self) -> Result<(), FlowError> {
        if self.is_cancelled() {
            Err(FlowError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Create a child request whose token is cancelled with this context's.
    pub fn child<T, F, Fut>(&self, producer: F) -> Request<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        Request::build(self.token.child_token(), self.handle.clone(), producer)
    }
}

// =============================================================================
// Request
// =============================================================================

/// A cancellable, observable unit of asynchronous work.
///
/// A request wraps a producer closure and runs it at most once on a tokio
/// worker. Cloning a request yields another handle to the same computation,
/// so several waiters can share one result.
///
/// Waiting is asynchronous: a producer that awaits a child request yields its
/// worker thread instead of blocking it, so arbitrarily deep request trees
/// cannot exhaust the pool.
///
/// # Example
///
/// ```
/// use blockflow::request::Request;
///
/// # #[tokio::main]
/// # async fn main() {
/// let request = Request::new(|ctx| async move {
///     let child = ctx.child(|_| async { Ok(20) });
///     Ok(child.wait().await? + 1)
/// });
/// assert_eq!(request.wait().await.unwrap(), 21);
/// # }
/// ```
pub struct Request<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    id: u64,
    token: CancellationToken,
    handle: Option<Handle>,
    inner: Mutex<Inner<T>>,
    phase: watch::Sender<Phase>,
}

struct Inner<T> {
    producer: Option<Producer<T>>,
    submitted: bool,
    outcome: Option<Outcome<T>>,
    callbacks: Vec<Callback<T>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.shared.id)
            .field("phase", &*self.shared.phase.borrow())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Request<T> {
    /// Create a root request with its own cancellation token.
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        Self::build(CancellationToken::new(), None, producer)
    }

    /// Create a request governed by an existing token.
    ///
    /// A failure inside the producer cancels `token`, which also cancels
    /// every request created under it.
    pub fn with_token<F, Fut>(token: CancellationToken, producer: F) -> Self
    where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        Self::build(token, None, producer)
    }

    /// Create a request that runs on `handle`, so it can be submitted from
    /// threads outside of any runtime.
    pub fn on_runtime<F, Fut>(handle: Handle, producer: F) -> Self
    where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        Self::build(CancellationToken::new(), Some(handle), producer)
    }

    /// A request that is already finished with `value`.
    pub fn ready(value: T) -> Self {
        Self::terminal(Ok(value))
    }

    /// A request that has already failed with `err`.
    pub fn failed(err: FlowError) -> Self {
        Self::terminal(Err(err))
    }

    fn terminal(outcome: Outcome<T>) -> Self {
        let phase = Phase::of(&outcome);
        Self {
            shared: Arc::new(Shared {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                token: CancellationToken::new(),
                handle: None,
                inner: Mutex::new(Inner {
                    producer: None,
                    submitted: true,
                    outcome: Some(outcome),
                    callbacks: Vec::new(),
                }),
                phase: watch::channel(phase).0,
            }),
        }
    }

    pub(crate) fn build<F, Fut>(token: CancellationToken, handle: Option<Handle>, producer: F) -> Self
    where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let producer: Producer<T> = Box::new(move |ctx| producer(ctx).boxed());
        Self {
            shared: Arc::new(Shared {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                token,
                handle,
                inner: Mutex::new(Inner {
                    producer: Some(producer),
                    submitted: false,
                    outcome: None,
                    callbacks: Vec::new(),
                }),
                phase: watch::channel(Phase::Pending).0,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.borrow()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// The outcome, if the request has reached a terminal state.
    pub fn try_result(&self) -> Option<Outcome<T>> {
        self.shared.inner.lock().outcome.clone()
    }

    /// True if both handles refer to the same computation.
    pub fn ptr_eq(&self, other: &Request<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Schedule the producer on a worker and return immediately.
    ///
    /// Runs on the handle given at construction, else on the ambient tokio
    /// runtime. Submitting an already submitted or finished request is a
    /// no-op. A request whose token is already cancelled is finalized as
    /// cancelled without ever running its producer.
    pub fn submit(&self) -> Result<(), FlowError> {
        let handle = match self.shared.handle.clone() {
            Some(handle) => Some(handle),
            None => Handle::try_current().ok(),
        };

        let producer = {
            let mut inner = self.shared.inner.lock();
            if inner.submitted || inner.outcome.is_some() {
                return Ok(());
            }
            if self.shared.token.is_cancelled() {
                None
            } else {
                if handle.is_none() {
                    return Err(FlowError::NoRuntime);
                }
                inner.submitted = true;
                inner.producer.take()
            }
        };

        let (Some(producer), Some(handle)) = (producer, handle) else {
            self.shared.finalize(Err(FlowError::Cancelled));
            return Ok(());
        };

        let shared = Arc::clone(&self.shared);
        handle.spawn(shared.run(producer));
        Ok(())
    }

    /// Wait for the result, submitting the request first if necessary.
    ///
    /// Every waiter receives a clone of the same outcome. A cancelled request
    /// yields `Err(FlowError::Cancelled)`.
    pub async fn wait(&self) -> Outcome<T> {
        self.submit()?;
        let mut phase = self.shared.phase.subscribe();
        phase
            .wait_for(|p| p.is_terminal())
            .await
            .map(|_| ())
            .map_err(|_| FlowError::Internal("request state channel closed".into()))?;
        self.try_result()
            .unwrap_or_else(|| Err(FlowError::Internal("terminal request without outcome".into())))
    }

    /// Block the current thread until the result is available.
    ///
    /// Intended for synchronous callers outside of the runtime. Calling this
    /// from inside a tokio worker blocks that worker; use [`wait`](Self::wait)
    /// there instead.
    pub fn wait_blocking(&self) -> Outcome<T> {
        futures::executor::block_on(self.wait())
    }

    /// Request cooperative cancellation.
    ///
    /// An unsubmitted request is finalized as cancelled right away and will
    /// never run. A running producer observes the flag through its context;
    /// the request itself resolves as cancelled as soon as the flag is set.
    pub fn cancel(&self) {
        self.shared.token.cancel();
        let unstarted = {
            let inner = self.shared.inner.lock();
            !inner.submitted && inner.outcome.is_none()
        };
        if unstarted {
            self.shared.finalize(Err(FlowError::Cancelled));
        }
    }

    /// Run `callback` on successful completion.
    pub fn notify_finished(&self, callback: impl FnOnce(&T) + Send + 'static) {
        self.notify_done(move |outcome| {
            if let Ok(value) = outcome {
                callback(value);
            }
        });
    }

    /// Run `callback` if the request fails (cancellation is not a failure).
    pub fn notify_failed(&self, callback: impl FnOnce(&FlowError) + Send + 'static) {
        self.notify_done(move |outcome| match outcome {
            Err(FlowError::Cancelled) | Ok(_) => {}
            Err(err) => callback(err),
        });
    }

    /// Run `callback` if the request is cancelled.
    pub fn notify_cancelled(&self, callback: impl FnOnce() + Send + 'static) {
        self.notify_done(move |outcome| {
            if matches!(outcome, Err(FlowError::Cancelled)) {
                callback();
            }
        });
    }

    /// Run `callback` on whichever terminal event happens.
    ///
    /// Callbacks fire exactly once, on the thread that finalizes the request,
    /// before any waiter is woken. If the request is already terminal the
    /// callback runs immediately on the caller's thread.
    pub fn notify_done(&self, callback: impl FnOnce(&Outcome<T>) + Send + 'static) {
        let outcome = {
            let mut inner = self.shared.inner.lock();
            match &inner.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }
}

impl<T: Clone + Send + Sync + 'static> Shared<T> {
    async fn run(self: Arc<Self>, producer: Producer<T>) {
        if self.token.is_cancelled() {
            self.finalize(Err(FlowError::Cancelled));
            return;
        }
        self.phase.send_replace(Phase::Running);

        let ctx = RequestContext {
            token: self.token.clone(),
            handle: self.handle.clone().or_else(|| Handle::try_current().ok()),
        };
        let work = AssertUnwindSafe(async move { producer(ctx).await }).catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(FlowError::Cancelled),
            result = work => match result {
                Ok(outcome) => outcome,
                Err(panic) => Err(FlowError::compute(
                    "request",
                    format!("producer panicked: {}", panic_message(&panic)),
                )),
            },
        };

        if let Err(err) = &outcome {
            if !err.is_cancelled() {
                debug!(request = self.id, error = %err, "Request failed, cancelling descendants");
                self.token.cancel();
            }
        }
        self.finalize(outcome);
    }

    /// Store the outcome, fire callbacks, then wake waiters. Only the first
    /// call has any effect.
    fn finalize(&self, outcome: Outcome<T>) {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return;
            }
            inner.producer = None;
            inner.outcome = Some(outcome.clone());
            std::mem::take(&mut inner.callbacks)
        };

        for callback in callbacks {
            let fired = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome)));
            if let Err(panic) = fired {
                error!(
                    request = self.id,
                    "Request callback panicked: {}",
                    panic_message(&panic)
                );
            }
        }

        self.phase.send_replace(Phase::of(&outcome));
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
