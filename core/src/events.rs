//! Ordered event streams fed from transport callback threads.
//!
//! # Design
//! Producers are transport callbacks, which must never block. Every stream
//! is therefore backed by an unbounded channel, with one bound: events sent
//! through `send_lossy` (progress) are dropped once `capacity` events are
//! waiting undelivered. Events sent through `send` (lifecycle, messages,
//! terminal results) are always delivered, in order.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::call::CancelOnDrop;

/// Producer half of an `EventStream`.
pub(crate) struct EventSender<E> {
    tx: mpsc::UnboundedSender<E>,
    pending: Arc<AtomicUsize>,
    capacity: usize,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            pending: self.pending.clone(),
            capacity: self.capacity,
        }
    }
}

impl<E> EventSender<E> {
    /// Deliver `event`. Returns false once the consumer is gone.
    pub(crate) fn send(&self, event: E) -> bool {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(event).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Deliver `event` unless the consumer is already `capacity` events behind.
    pub(crate) fn send_lossy(&self, event: E) -> bool {
        if self.pending.load(Ordering::Acquire) >= self.capacity {
            tracing::trace!(capacity = self.capacity, "dropping progress event for slow consumer");
            return !self.tx.is_closed();
        }
        self.send(event)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An ordered sequence of events delivered from the transport.
///
/// Ends when the producer finishes or is shut down. Streams tied to a
/// transport task cancel that task when dropped early.
pub struct EventStream<E> {
    rx: mpsc::UnboundedReceiver<E>,
    pending: Arc<AtomicUsize>,
    _guard: Option<CancelOnDrop>,
}

impl<E> EventStream<E> {
    pub(crate) fn channel(capacity: usize) -> (EventSender<E>, EventStream<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let sender = EventSender {
            tx,
            pending: pending.clone(),
            capacity: capacity.max(1),
        };
        let stream = EventStream {
            rx,
            pending,
            _guard: None,
        };
        (sender, stream)
    }

    pub(crate) fn with_guard(mut self, guard: CancelOnDrop) -> Self {
        self._guard = Some(guard);
        self
    }

    /// Receive the next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<E> {
        let event = self.rx.recv().await;
        if event.is_some() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        event
    }
}

impl<E> Stream for EventStream<E> {
    type Item = E;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                this.pending.fetch_sub(1, Ordering::AcqRel);
                Poll::Ready(Some(event))
            }
            other => other,
        }
    }
}

/// Fan-out of one event source to any number of `EventStream`s.
///
/// Each subscriber sees every event published after it subscribed, in
/// publish order. Closed subscribers are pruned on the next publish. Once
/// closed, new subscribers get a stream that has already ended.
pub(crate) struct Subscribers<E> {
    senders: Mutex<Option<Vec<EventSender<E>>>>,
    capacity: usize,
}

impl<E: Clone> Subscribers<E> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            senders: Mutex::new(Some(Vec::new())),
            capacity,
        }
    }

    pub(crate) fn subscribe(&self) -> EventStream<E> {
        let (sender, stream) = EventStream::channel(self.capacity);
        if let Some(senders) = self.senders.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            senders.push(sender);
        }
        stream
    }

    pub(crate) fn publish(&self, event: E) {
        if let Some(senders) = self.senders.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            senders.retain(|sender| sender.send(event.clone()));
        }
    }

    /// Like `publish`, but subscribers that are too far behind miss the event.
    pub(crate) fn publish_lossy(&self, event: E) {
        if let Some(senders) = self.senders.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            senders.retain(|sender| sender.send_lossy(event.clone()));
        }
    }

    /// End every subscriber's stream, now and for later subscribers.
    pub(crate) fn close(&self) {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Fraction of `expected` completed, clamped to `[0, 1]`.
///
/// `None` when the total is unknown or zero.
pub fn progress_fraction(done: u64, expected: Option<u64>) -> Option<f64> {
    let expected = expected.filter(|&total| total > 0)?;
    Some((done as f64 / expected as f64).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn lossy_events_are_bounded_but_lifecycle_events_are_not() {
        let (tx, mut rx) = EventStream::channel(2);
        assert!(tx.send_lossy(1));
        assert!(tx.send_lossy(2));
        assert!(tx.send_lossy(3));
        assert!(tx.send(4));
        drop(tx);

        let received: Vec<i32> = (&mut rx).collect().await;
        assert_eq!(received, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn draining_frees_capacity() {
        let (tx, mut rx) = EventStream::channel(1);
        assert!(tx.send_lossy("a"));
        assert_eq!(rx.recv().await, Some("a"));
        assert!(tx.send_lossy("b"));
        assert_eq!(rx.recv().await, Some("b"));
    }

    #[test]
    fn send_reports_closed_consumer() {
        let (tx, rx) = EventStream::<u8>::channel(4);
        drop(rx);
        assert!(!tx.send(1));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn subscribers_each_see_every_event_in_order() {
        let subscribers = Subscribers::new(8);
        let mut first = subscribers.subscribe();
        subscribers.publish(1);
        let mut second = subscribers.subscribe();
        subscribers.publish(2);
        subscribers.publish(3);
        subscribers.close();

        assert_eq!(first.by_ref().collect::<Vec<_>>().await, vec![1, 2, 3]);
        assert_eq!(second.by_ref().collect::<Vec<_>>().await, vec![2, 3]);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let subscribers = Subscribers::new(8);
        let dropped = subscribers.subscribe();
        let mut kept = subscribers.subscribe();
        drop(dropped);
        subscribers.publish("x");
        assert_eq!(subscribers.senders.lock().unwrap().as_ref().map(Vec::len), Some(1));
        assert_eq!(kept.recv().await, Some("x"));
    }

    #[tokio::test]
    async fn subscribing_after_close_yields_an_ended_stream() {
        let subscribers = Subscribers::<u8>::new(8);
        subscribers.close();
        subscribers.publish(1);
        assert_eq!(subscribers.subscribe().recv().await, None);
    }

    #[tokio::test]
    async fn lossy_publish_skips_slow_subscribers_only() {
        let subscribers = Subscribers::new(1);
        let mut slow = subscribers.subscribe();
        let mut fast = subscribers.subscribe();
        subscribers.publish_lossy(1);
        assert_eq!(fast.recv().await, Some(1));
        subscribers.publish_lossy(2);
        subscribers.close();
        assert_eq!(slow.by_ref().collect::<Vec<_>>().await, vec![1]);
        assert_eq!(fast.by_ref().collect::<Vec<_>>().await, vec![2]);
    }

    #[test]
    fn fraction_guards_unknown_and_zero_totals() {
        assert_eq!(progress_fraction(10, None), None);
        assert_eq!(progress_fraction(10, Some(0)), None);
        assert_eq!(progress_fraction(25, Some(100)), Some(0.25));
        assert_eq!(progress_fraction(150, Some(100)), Some(1.0));
    }
}
