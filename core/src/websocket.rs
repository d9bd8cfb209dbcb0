//! WebSocket client.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::connection::{ConnectionCore, ConnectionState};
use crate::delegate::{Capability, LifecycleInterceptor, WebSocketInterceptor};
use crate::error::{InternalError, Result, StateError, TransportError};
use crate::events::{EventStream, Subscribers};
use crate::http::HttpRequest;
use crate::request::RequestDescriptor;
use crate::session::Session;
use crate::transport::{TaskId, WebSocketMessage};

/// Close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;
const GOING_AWAY: u16 = 1001;

/// Error domain for connections the peer closed abnormally.
pub const WEBSOCKET_DOMAIN: &str = "WebSocket";

struct Inner {
    session: Session,
    request: HttpRequest,
    core: ConnectionCore<()>,
    messages: Subscribers<WebSocketMessage>,
}

impl Inner {
    /// The transport reported the end of `task`, with the failure if any.
    fn closed(&self, task: TaskId, failure: Option<TransportError>) {
        let mut current = self.core.lock();
        if !current.is_current(task) {
            tracing::trace!(task = %task, "ignoring close of a superseded websocket");
            return;
        }
        current.task = None;
        let next = match failure {
            _ if current.state == ConnectionState::Disconnecting => ConnectionState::Disconnected,
            Some(err) => ConnectionState::Failed(err.into()),
            None => ConnectionState::Disconnected,
        };
        self.core.transition(&mut current, next);
    }
}

impl WebSocketInterceptor for Inner {
    fn did_open(&self, task: TaskId, protocol: Option<&str>) {
        let mut current = self.core.lock();
        if current.is_current(task) && current.state == ConnectionState::Connecting {
            tracing::debug!(task = %task, protocol, "websocket open");
            self.core.transition(&mut current, ConnectionState::Connected);
        }
    }

    fn did_receive_message(&self, task: TaskId, message: &WebSocketMessage) {
        let current = self.core.lock();
        if current.is_current(task) {
            self.messages.publish(message.clone());
        } else {
            tracing::trace!(task = %task, "ignoring message of a superseded websocket");
        }
    }

    fn did_close(&self, task: TaskId, code: u16, reason: Option<&Bytes>) {
        let failure = match code {
            NORMAL_CLOSURE | GOING_AWAY => None,
            code => {
                let reason = reason.map(|r| String::from_utf8_lossy(r).into_owned());
                Some(TransportError::new(
                    WEBSOCKET_DOMAIN,
                    i64::from(code),
                    reason.unwrap_or_else(|| "closed by peer".to_string()),
                ))
            }
        };
        self.closed(task, failure);
    }
}

impl LifecycleInterceptor for Inner {
    fn did_complete(&self, task: TaskId, error: Option<&TransportError>) {
        self.closed(task, error.cloned());
    }
}

/// Client for one WebSocket endpoint.
///
/// Owns a forked session and occupies its websocket and lifecycle
/// capabilities. Inbound messages are published to every `messages()`
/// stream in arrival order.
pub struct WebSocketClient {
    inner: Arc<Inner>,
}

impl WebSocketClient {
    pub fn new(session: &Session, descriptor: &RequestDescriptor) -> Result<Self> {
        let request = descriptor.build(session.configuration())?;
        let session = session.fork();
        let capacity = session.configuration().max_buffered_progress_events;
        let inner = Arc::new(Inner {
            session,
            request,
            core: ConnectionCore::new("websocket", ()),
            messages: Subscribers::new(capacity),
        });
        inner.session.delegate().set_websocket_interceptor(&inner);
        inner.session.delegate().set_lifecycle_interceptor(&inner);
        Ok(Self { inner })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.state()
    }

    pub fn state_changes(&self) -> EventStream<ConnectionState> {
        self.inner.core.changes()
    }

    /// Messages received from now on. Ends when the client shuts down.
    pub fn messages(&self) -> EventStream<WebSocketMessage> {
        self.inner.messages.subscribe()
    }

    /// Open the socket. The state becomes `Connected` when the transport
    /// reports the handshake.
    pub fn connect(&self) -> Result<()> {
        let task = TaskId::next();
        {
            let mut current = self.inner.core.lock();
            self.inner.core.begin_connect(&mut current)?;
            current.task = Some(task);
        }

        let delegate = self.inner.session.delegate();
        delegate.did_create_task(task);
        tracing::debug!(task = %task, url = %self.inner.request.url, "opening websocket");
        self.inner
            .session
            .transport()
            .start_websocket_task(self.inner.session.context(task), self.inner.request.clone());

        // A disconnect or shutdown may have raced the start.
        let superseded = !self.inner.core.lock().is_current(task);
        if superseded {
            self.inner.session.transport().cancel(task);
        }
        Ok(())
    }

    /// Send one message. Fails with a state error, without touching the
    /// transport, unless connected.
    pub async fn send(&self, message: WebSocketMessage) -> Result<()> {
        let task = {
            let current = self.inner.core.lock();
            match current.task {
                Some(task) if current.state.is_connected() => task,
                _ => return Err(StateError::new("send", &current.state).into()),
            }
        };
        let (tx, rx) = oneshot::channel();
        self.inner.session.transport().send_websocket_message(
            task,
            message,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        match rx.await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(InternalError::LostReferenceOfSelf.into()),
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(WebSocketMessage::Text(text.into())).await
    }

    /// Close the connection.
    ///
    /// An open socket goes through `Disconnecting` and reaches `Disconnected`
    /// once the transport confirms the close. A handshake still in progress
    /// is cancelled outright. From `Failed` this only resets the state.
    pub fn disconnect(&self) -> Result<()> {
        let mut current = self.inner.core.lock();
        if matches!(current.state, ConnectionState::Failed(_)) {
            self.inner.core.transition(&mut current, ConnectionState::Disconnected);
            return Ok(());
        }
        if !matches!(current.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Err(StateError::new("disconnect", &current.state).into());
        }
        let handshaking = current.state == ConnectionState::Connecting;
        let task = current.task;
        self.inner.core.transition(&mut current, ConnectionState::Disconnecting);
        if handshaking {
            current.task = None;
            self.inner.core.transition(&mut current, ConnectionState::Disconnected);
        }
        drop(current);

        let transport = self.inner.session.transport();
        match task {
            Some(task) if handshaking => transport.cancel(task),
            Some(task) => transport.close_websocket(task, NORMAL_CLOSURE, None),
            None => {}
        }
        Ok(())
    }

    /// Stop for good: cancel the socket, end every stream and release the
    /// session capabilities.
    pub fn shutdown(&self) {
        let task = {
            let mut current = self.inner.core.lock();
            self.inner.core.terminate(&mut current)
        };
        self.inner.messages.close();
        let delegate = self.inner.session.delegate();
        delegate.clear(Capability::WebSocket);
        delegate.clear(Capability::Lifecycle);
        if let Some(task) = task {
            self.inner.session.transport().cancel(task);
        }
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        let task = self.inner.core.lock().task.take();
        if let Some(task) = task {
            self.inner.session.transport().cancel(task);
        }
    }
}

impl fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("url", &self.inner.request.url)
            .field("state", &self.state())
            .finish()
    }
}
