//! Completion tokens: single-assignment results of asynchronous operations.
//!
//! A token is created together with its [`Completer`]. The completer is
//! consumed by `complete`/`fail`, so a result can be assigned at most once.
//! Dropping a completer without settling resolves the token as cancelled.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::sync::oneshot;

use super::SessionDispatcher;
use crate::error::DebugError;
use crate::shutdown::ShutdownState;

type Outcome<T> = Result<T, DebugError>;

/// Create an unbound completer/token pair.
///
/// Continuations registered on an unbound token run on the ambient tokio
/// runtime instead of a session dispatcher.
pub fn pair<T>() -> (Completer<T>, CompletionToken<T>) {
    bound(0, None)
}

pub(crate) fn bound<T>(
    scheduled_at: u64,
    dispatcher: Option<SessionDispatcher>,
) -> (Completer<T>, CompletionToken<T>) {
    let (tx, rx) = oneshot::channel();
    let cancelled = Arc::new(AtomicBool::new(false));
    let completer = Completer { tx, cancelled: Arc::clone(&cancelled) };
    let token = CompletionToken {
        state: TokenState::Waiting(rx),
        cancelled,
        scheduled_at,
        dispatcher,
    };
    (completer, token)
}

/// Producer half of a completion token.
pub struct Completer<T> {
    tx: oneshot::Sender<Outcome<T>>,
    cancelled: Arc<AtomicBool>,
}

impl<T> Completer<T> {
    /// Assign a success value.
    pub fn complete(self, value: T) {
        self.settle(Ok(value));
    }

    /// Assign a failure.
    pub fn fail(self, error: DebugError) {
        self.settle(Err(error));
    }

    /// Assign either outcome. A result for a token that was cancelled or
    /// dropped is discarded.
    pub fn settle(self, result: Outcome<T>) {
        let _ = self.tx.send(result);
    }

    /// True once the consumer has cancelled the token.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

enum TokenState<T> {
    Waiting(oneshot::Receiver<Outcome<T>>),
    Ready(Option<Outcome<T>>),
}

/// Consumer half: awaitable result of one asynchronous operation.
pub struct CompletionToken<T> {
    state: TokenState<T>,
    cancelled: Arc<AtomicBool>,
    scheduled_at: u64,
    dispatcher: Option<SessionDispatcher>,
}

// No field is structurally pinned.
impl<T> Unpin for CompletionToken<T> {}

impl<T> fmt::Debug for CompletionToken<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionToken")
            .field("scheduled_at", &self.scheduled_at)
            .field("cancelled", &self.is_cancelled())
            .field("ready", &matches!(self.state, TokenState::Ready(_)))
            .finish()
    }
}

impl<T> CompletionToken<T> {
    /// A token that is already settled.
    pub fn ready(result: Outcome<T>) -> Self {
        Self {
            state: TokenState::Ready(Some(result)),
            cancelled: Arc::new(AtomicBool::new(false)),
            scheduled_at: 0,
            dispatcher: None,
        }
    }

    pub(crate) fn ready_on(dispatcher: &SessionDispatcher, result: Outcome<T>) -> Self {
        let mut token = Self::ready(result);
        token.dispatcher = Some(dispatcher.clone());
        token
    }

    /// Mark the token failed with `Cancelled`.
    ///
    /// An operation that has not started yet is skipped by its dispatcher.
    /// One that is already running completes normally; its result is dropped.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Logical clock tick at which the operation was scheduled (0 if unbound).
    pub fn scheduled_at(&self) -> u64 {
        self.scheduled_at
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

impl<T: Send + 'static> CompletionToken<T> {
    /// Register a continuation, invoked exactly once with this token's result.
    ///
    /// The continuation runs as a task on the owning dispatcher, either when
    /// the result arrives or right away if it already has. Its own return
    /// value settles the returned token, so chains stay typed end to end.
    ///
    /// If the dispatcher refuses or abandons the task, the continuation
    /// still runs, inline, with this token's result when it is already
    /// settled and with `SessionClosed` or `Cancelled` otherwise.
    pub fn then<U, F>(self, continuation: F) -> CompletionToken<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
    {
        if let Some(dispatcher) = self.dispatcher.clone() {
            if dispatcher.state() != ShutdownState::Running {
                tracing::warn!(dispatcher = dispatcher.id(), "token: session closed, continuation runs inline");
            }
            let pending = Continuation::new(self, dispatcher.clone(), continuation);
            return dispatcher.schedule(move || async move {
                let mut pending = pending;
                let result = match pending.source.take() {
                    Some(source) => source.await,
                    None => Err(DebugError::Cancelled),
                };
                pending.invoke(result)
            });
        }
        if let TokenState::Ready(_) = self.state {
            let result = futures::executor::block_on(self);
            return CompletionToken::ready(continuation(result));
        }
        let (completer, token) = pair();
        tokio::spawn(async move {
            completer.settle(continuation(self.await));
        });
        token
    }
}

/// A continuation that runs exactly once: when invoked, or else on drop.
struct Continuation<T, U, F>
where
    F: FnOnce(Outcome<T>) -> Outcome<U>,
{
    source: Option<CompletionToken<T>>,
    dispatcher: SessionDispatcher,
    continuation: Option<F>,
    _output: PhantomData<fn() -> U>,
}

impl<T, U, F> Continuation<T, U, F>
where
    F: FnOnce(Outcome<T>) -> Outcome<U>,
{
    fn new(source: CompletionToken<T>, dispatcher: SessionDispatcher, continuation: F) -> Self {
        Self { source: Some(source), dispatcher, continuation: Some(continuation), _output: PhantomData }
    }

    fn invoke(&mut self, result: Outcome<T>) -> Outcome<U> {
        match self.continuation.take() {
            Some(continuation) => continuation(result),
            None => Err(DebugError::Cancelled),
        }
    }
}

impl<T, U, F> Drop for Continuation<T, U, F>
where
    F: FnOnce(Outcome<T>) -> Outcome<U>,
{
    fn drop(&mut self) {
        let Some(continuation) = self.continuation.take() else { return };
        let settled = self.source.take().and_then(FutureExt::now_or_never);
        let result = match settled {
            Some(result) => result,
            None if self.dispatcher.state() != ShutdownState::Running => Err(DebugError::SessionClosed),
            None => Err(DebugError::Cancelled),
        };
        let _ = continuation(result);
    }
}

impl<T> Future for CompletionToken<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.is_cancelled() {
            this.state = TokenState::Ready(None);
            return Poll::Ready(Err(DebugError::Cancelled));
        }
        match &mut this.state {
            TokenState::Ready(slot) => Poll::Ready(slot.take().unwrap_or(Err(DebugError::Cancelled))),
            TokenState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => {
                    this.state = TokenState::Ready(None);
                    Poll::Ready(result)
                }
                // Completer dropped without a result: the task never ran to
                // completion (skipped or abandoned at shutdown).
                Poll::Ready(Err(_)) => {
                    this.state = TokenState::Ready(None);
                    Poll::Ready(Err(DebugError::Cancelled))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
