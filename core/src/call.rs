//! The single execution primitive behind every delivery style.
//!
//! # Design
//! A `Call` is one transport task plus a one-shot completion slot. Natural
//! completion (from the transport's callback thread) and `cancel()` (from
//! any caller) race to take the slot, so exactly one of them delivers a
//! result and the other becomes a no-op. The awaitable, callback, publisher
//! and event-stream styles are thin adapters that differ only in what the
//! slot's sink does with the result.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::oneshot;

use crate::error::{InternalError, NetworkingError, Result};
use crate::transport::{TaskId, Transport};

pub(crate) type Sink<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

pub(crate) struct Call<T> {
    id: TaskId,
    transport: Arc<dyn Transport>,
    sink: Mutex<Option<Sink<T>>>,
}

impl<T: Send + 'static> Call<T> {
    pub(crate) fn new(id: TaskId, transport: Arc<dyn Transport>, sink: Sink<T>) -> Arc<Self> {
        Arc::new(Self {
            id,
            transport,
            sink: Mutex::new(Some(sink)),
        })
    }

    fn take_sink(&self) -> Option<Sink<T>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Deliver the natural result. Ignored if the call was already cancelled.
    pub(crate) fn complete(&self, result: Result<T>) {
        match self.take_sink() {
            Some(sink) => sink(result),
            None => tracing::trace!(task = %self.id, "result arrived after cancellation"),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    pub(crate) fn handle(self: &Arc<Self>) -> TaskHandle {
        TaskHandle {
            id: self.id,
            call: self.clone(),
        }
    }
}

trait Cancellable: Send + Sync {
    fn cancel(&self) -> bool;
    fn is_finished(&self) -> bool;
}

impl<T: Send + 'static> Cancellable for Call<T> {
    fn cancel(&self) -> bool {
        match self.take_sink() {
            Some(sink) => {
                tracing::debug!(task = %self.id, "cancelling call");
                self.transport.cancel(self.id);
                sink(Err(NetworkingError::Cancelled));
                true
            }
            None => false,
        }
    }

    fn is_finished(&self) -> bool {
        Call::is_finished(self)
    }
}

/// Cancellable handle to an in-flight operation.
///
/// Cancelling is idempotent and safe to race with natural completion: the
/// completion fires exactly once, either with the real result or with
/// `NetworkingError::Cancelled`.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    call: Arc<dyn Cancellable>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns true if this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        self.call.cancel()
    }

    pub fn is_finished(&self) -> bool {
        self.call.is_finished()
    }

    pub(crate) fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            handle: Some(self.clone()),
        }
    }

    /// Handle for an operation that failed before reaching the transport.
    pub(crate) fn finished(id: TaskId) -> Self {
        struct Finished;

        impl Cancellable for Finished {
            fn cancel(&self) -> bool {
                false
            }

            fn is_finished(&self) -> bool {
                true
            }
        }

        TaskHandle {
            id,
            call: Arc::new(Finished),
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Cancels the wrapped call when dropped, unless disarmed.
pub(crate) struct CancelOnDrop {
    handle: Option<TaskHandle>,
}

impl CancelOnDrop {
    pub(crate) fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}

/// Await the result of a call whose sink feeds `rx`.
///
/// Dropping the returned future before it resolves cancels the call.
pub(crate) async fn await_call<T>(handle: TaskHandle, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    let guard = handle.cancel_on_drop();
    let result = rx
        .await
        .unwrap_or(Err(NetworkingError::Internal(InternalError::LostReferenceOfSelf)));
    guard.disarm();
    result
}

/// Push-style delivery of a single result.
///
/// Yields at most one item, either the decoded value or the error, then
/// ends. Dropping the publisher before it yields cancels the transport task.
pub struct Publisher<T> {
    rx: Option<oneshot::Receiver<Result<T>>>,
    guard: Option<CancelOnDrop>,
}

impl<T> Publisher<T> {
    pub(crate) fn new(handle: &TaskHandle, rx: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            rx: Some(rx),
            guard: Some(handle.cancel_on_drop()),
        }
    }

    pub(crate) fn ready(result: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self {
            rx: Some(rx),
            guard: None,
        }
    }

    fn finish(&mut self) {
        self.rx = None;
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
    }
}

impl<T> Stream for Publisher<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<T>>> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => {
                this.finish();
                Poll::Ready(Some(result))
            }
            Poll::Ready(Err(_)) => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }
}
