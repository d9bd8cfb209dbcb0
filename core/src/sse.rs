//! Server-Sent Events client.
//!
//! The event stream is a long-lived data task. Body chunks arrive through
//! the session's data capability and are fed to an incremental parser, so
//! events are published as soon as their terminating blank line is seen.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;

use crate::call::TaskHandle;
use crate::connection::{ConnectionCore, ConnectionState, Current};
use crate::decode::validate;
use crate::delegate::{Capability, DataInterceptor, ResponseDisposition};
use crate::error::{HttpError, NetworkingError, Result, StateError};
use crate::events::{EventStream, Subscribers};
use crate::http::{HttpRequest, HttpResponseInfo};
use crate::request::{encode_headers, RequestDescriptor};
use crate::session::Session;
use crate::transport::{DataResponse, TaskId};

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerSentEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    /// Data lines joined with `\n`.
    pub data: String,
    pub retry: Option<Duration>,
}

/// Incremental `text/event-stream` parser.
///
/// Accepts arbitrary chunk boundaries, including ones that split a UTF-8
/// sequence or a CRLF pair.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    data: Vec<String>,
    event: Option<String>,
    id: Option<String>,
    retry: Option<Duration>,
    last_event_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent `id` seen, carried across events.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Feed one chunk and return every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ServerSentEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < self.buffer.len() {
            match self.buffer[i] {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.buffer[start..i]).into_owned();
                    self.line(&line, &mut events);
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    // Wait for the next chunk to tell CR from CRLF.
                    if i + 1 == self.buffer.len() {
                        break;
                    }
                    let line = String::from_utf8_lossy(&self.buffer[start..i]).into_owned();
                    self.line(&line, &mut events);
                    i += if self.buffer[i + 1] == b'\n' { 2 } else { 1 };
                    start = i;
                }
                _ => i += 1,
            }
        }
        self.buffer.drain(..start);
        events
    }

    /// Flush a trailing line and any event not terminated by a blank line.
    pub fn finish(&mut self) -> Option<ServerSentEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let text = String::from_utf8_lossy(&rest).into_owned();
            let line = text.strip_suffix('\r').unwrap_or(text.as_str()).to_string();
            self.line(&line, &mut events);
        }
        self.line("", &mut events);
        events.pop()
    }

    fn line(&mut self, line: &str, events: &mut Vec<ServerSentEvent>) {
        if line.is_empty() {
            if let Some(event) = self.dispatch() {
                events.push(event);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.id = Some(value.to_string());
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<ServerSentEvent> {
        if self.data.is_empty() && self.event.is_none() && self.id.is_none() && self.retry.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(ServerSentEvent {
            id: self.id.take(),
            event: self.event.take(),
            data,
            retry: self.retry.take(),
        })
    }
}

struct SseLink {
    handle: Option<TaskHandle>,
    parser: SseParser,
    /// Set once body bytes arrive through the data interceptor.
    streamed: bool,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

/// End of one stream task, tagged with its id.
struct Ended {
    task: TaskId,
    result: Result<Bytes>,
}

struct Inner {
    session: Session,
    request: HttpRequest,
    core: ConnectionCore<SseLink>,
    events: Subscribers<ServerSentEvent>,
}

impl Inner {
    fn publish(&self, link: &mut SseLink, parsed: Vec<ServerSentEvent>) {
        for event in parsed {
            if let Some(retry) = event.retry {
                link.retry = Some(retry);
            }
            self.events.publish(event);
        }
        if let Some(id) = link.parser.last_event_id() {
            link.last_event_id = Some(id.to_string());
        }
    }

    fn end(&self, ended: Ended) {
        let mut current = self.core.lock();
        if !current.is_current(ended.task) {
            tracing::trace!(task = %ended.task, "ignoring end of a superseded event stream");
            return;
        }
        current.task = None;
        current.extra.handle = None;
        let Current { state, extra, .. } = &mut *current;
        let next = match ended.result {
            _ if *state == ConnectionState::Disconnecting => ConnectionState::Disconnected,
            Ok(body) => {
                // A streamed body was already parsed chunk by chunk.
                let mut parsed = if extra.streamed { Vec::new() } else { extra.parser.feed(&body) };
                parsed.extend(extra.parser.finish());
                self.publish(extra, parsed);
                ConnectionState::Disconnected
            }
            Err(err) => ConnectionState::Failed(err),
        };
        self.core.transition(&mut current, next);
    }
}

impl DataInterceptor for Inner {
    fn did_receive_response(&self, task: TaskId, response: &HttpResponseInfo) -> ResponseDisposition {
        let mut current = self.core.lock();
        if !current.is_current(task) {
            return ResponseDisposition::Cancel;
        }
        if response.category().is_success() {
            if current.state == ConnectionState::Connecting {
                self.core.transition(&mut current, ConnectionState::Connected);
            }
            return ResponseDisposition::Allow;
        }
        tracing::debug!(task = %task, status = response.status, "event stream rejected");
        current.task = None;
        current.extra.handle = None;
        let err = HttpError::new(response.status, response.headers.clone());
        self.core.transition(&mut current, ConnectionState::Failed(err.into()));
        ResponseDisposition::Cancel
    }

    fn did_receive_data(&self, task: TaskId, data: &Bytes) {
        let mut current = self.core.lock();
        if !current.is_current(task) {
            tracing::trace!(task = %task, "ignoring data of a superseded event stream");
            return;
        }
        if current.state == ConnectionState::Connecting {
            self.core.transition(&mut current, ConnectionState::Connected);
        }
        current.extra.streamed = true;
        let parsed = current.extra.parser.feed(data);
        self.publish(&mut current.extra, parsed);
    }
}

/// Client for a `text/event-stream` endpoint.
///
/// Owns a forked session whose data capability it occupies. There is no
/// automatic reconnection: after a failure or a normal end of stream the
/// caller decides whether to `connect()` again, and the next request carries
/// `Last-Event-ID` when an id has been seen.
pub struct SseClient {
    inner: Arc<Inner>,
}

impl SseClient {
    pub fn new(session: &Session, descriptor: &RequestDescriptor) -> Result<Self> {
        let request = descriptor.build(session.configuration())?;
        let session = session.fork();
        let capacity = session.configuration().max_buffered_progress_events;
        let inner = Arc::new(Inner {
            session,
            request,
            core: ConnectionCore::new(
                "sse",
                SseLink {
                    handle: None,
                    parser: SseParser::new(),
                    streamed: false,
                    last_event_id: None,
                    retry: None,
                },
            ),
            events: Subscribers::new(capacity),
        });
        inner.session.delegate().set_data_interceptor(&inner);
        Ok(Self { inner })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.state()
    }

    pub fn state_changes(&self) -> EventStream<ConnectionState> {
        self.inner.core.changes()
    }

    /// Events received from now on. Ends when the client shuts down.
    pub fn events(&self) -> EventStream<ServerSentEvent> {
        self.inner.events.subscribe()
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.inner.core.lock().extra.last_event_id.clone()
    }

    /// Reconnection delay requested by the server, if any.
    pub fn retry_interval(&self) -> Option<Duration> {
        self.inner.core.lock().extra.retry
    }

    /// Open the stream. Fails unless disconnected or failed.
    pub fn connect(&self) -> Result<()> {
        let request = {
            let mut current = self.inner.core.lock();
            self.inner.core.begin_connect(&mut current)?;
            current.extra.parser = SseParser::new();
            current.extra.streamed = false;
            let mut request = self.inner.request.clone();
            let mut headers = vec![
                ("Accept".to_string(), "text/event-stream".to_string()),
                ("Cache-Control".to_string(), "no-cache".to_string()),
            ];
            if let Some(id) = &current.extra.last_event_id {
                headers.push(("Last-Event-ID".to_string(), id.clone()));
            }
            encode_headers(&mut request, &headers);
            request
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = self.inner.session.spawn(
            Box::new(move |ended: Result<Ended>| match (ended, weak.upgrade()) {
                (Ok(ended), Some(inner)) => inner.end(ended),
                (Ok(ended), None) => tracing::trace!(task = %ended.task, "client released before stream end"),
                (Err(err), _) => tracing::trace!(error = %err, "event stream stopped by its handle"),
            }),
            |id| {
                let mut current = self.inner.core.lock();
                if current.state == ConnectionState::Connecting {
                    current.task = Some(id);
                }
            },
            |task, result| {
                let result = result
                    .map_err(NetworkingError::from)
                    .and_then(|data: DataResponse| validate(data.response).map(|_| data.body));
                Ok(Ended { task, result })
            },
            move |transport, task, completion| transport.start_data_task(task, request, completion),
        );

        // A disconnect or shutdown may have raced the start.
        let stale = {
            let mut current = self.inner.core.lock();
            if current.is_current(handle.id()) {
                current.extra.handle = Some(handle);
                None
            } else {
                Some(handle)
            }
        };
        if let Some(handle) = stale {
            handle.cancel();
        }
        Ok(())
    }

    /// Close the stream and return to `Disconnected`.
    ///
    /// From `Failed` this only resets the state.
    pub fn disconnect(&self) -> Result<()> {
        let handle = {
            let mut current = self.inner.core.lock();
            if matches!(current.state, ConnectionState::Failed(_)) {
                self.inner.core.transition(&mut current, ConnectionState::Disconnected);
                return Ok(());
            }
            if !matches!(current.state, ConnectionState::Connecting | ConnectionState::Connected) {
                return Err(StateError::new("disconnect", &current.state).into());
            }
            self.inner.core.transition(&mut current, ConnectionState::Disconnecting);
            current.task = None;
            current.extra.handle.take()
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
        let mut current = self.inner.core.lock();
        if current.state == ConnectionState::Disconnecting {
            self.inner.core.transition(&mut current, ConnectionState::Disconnected);
        }
        Ok(())
    }

    /// Stop for good: cancel the stream, end every event stream and release
    /// the data capability.
    pub fn shutdown(&self) {
        let handle = {
            let mut current = self.inner.core.lock();
            self.inner.core.terminate(&mut current);
            current.extra.handle.take()
        };
        self.inner.events.close();
        self.inner.session.delegate().clear(Capability::Data);
        if let Some(handle) = handle {
            handle.cancel();
        }
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        let handle = self.inner.core.lock().extra.handle.take();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }
}

impl fmt::Debug for SseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseClient")
            .field("url", &self.inner.request.url)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ok_response, MockTransport};
    use futures_util::StreamExt;

    fn event(data: &str) -> ServerSentEvent {
        ServerSentEvent {
            data: data.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_fields_comments_and_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keep-alive\nevent: update\nid: 7\ndata: first\ndata: second\nretry: 1500\n\n");
        assert_eq!(
            events,
            vec![ServerSentEvent {
                id: Some("7".to_string()),
                event: Some("update".to_string()),
                data: "first\nsecond".to_string(),
                retry: Some(Duration::from_millis(1500)),
            }]
        );
        assert_eq!(parser.last_event_id(), Some("7"));
    }

    #[test]
    fn handles_chunk_boundaries_and_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: he").is_empty());
        assert!(parser.feed(b"llo\r").is_empty());
        assert!(parser.feed(b"\n").is_empty());
        assert_eq!(parser.feed(b"\r\ndata: x\r\rdata"), vec![event("hello"), event("x")]);
        assert_eq!(parser.feed(b": y\n\n"), vec![event("y")]);
    }

    #[test]
    fn keeps_utf8_split_across_chunks() {
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        let split = bytes.len() - 3;
        let mut parser = SseParser::new();
        assert!(parser.feed(&bytes[..split]).is_empty());
        assert_eq!(parser.feed(&bytes[split..]), vec![event("caf\u{e9}")]);
    }

    #[test]
    fn ignores_ids_with_nul_and_bad_retry() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"id: a\0b\nretry: soon\ndata: d\n\n");
        assert_eq!(events, vec![event("d")]);
        assert_eq!(parser.last_event_id(), None);
    }

    #[test]
    fn field_without_colon_has_empty_value() {
        let mut parser = SseParser::new();
        assert_eq!(parser.feed(b"data\ndata\n\n"), vec![event("\n")]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: tail").is_empty());
        assert_eq!(parser.finish(), Some(event("tail")));
        assert_eq!(parser.finish(), None);
    }

    fn client() -> (Arc<MockTransport>, SseClient) {
        let transport = MockTransport::new();
        let client = SseClient::new(
            &Session::new(transport.clone()),
            &RequestDescriptor::get("https://stream.test/events"),
        )
        .unwrap();
        (transport, client)
    }

    #[tokio::test]
    async fn streams_events_and_returns_to_disconnected() {
        let (transport, client) = client();
        let mut states = client.state_changes();
        let mut events = client.events();
        client.connect().unwrap();

        let task = transport.last_task();
        let request = transport.request(task).unwrap();
        assert_eq!(request.header("accept"), Some("text/event-stream"));
        assert_eq!(request.header("cache-control"), Some("no-cache"));
        assert_eq!(request.header("last-event-id"), None);

        let ctx = transport.context(task);
        assert_eq!(
            ctx.delegate().did_receive_response(task, &HttpResponseInfo::new(200)),
            ResponseDisposition::Allow
        );
        ctx.delegate().did_receive_data(task, &Bytes::from_static(b"id: 1\ndata: a\n\nda"));
        ctx.delegate().did_receive_data(task, &Bytes::from_static(b"ta: b\n\n"));
        transport.finish_data(task, ok_response(200, ""));

        assert_eq!(events.recv().await.unwrap().data, "a");
        assert_eq!(events.recv().await.unwrap().data, "b");
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.last_event_id().as_deref(), Some("1"));

        client.connect().unwrap();
        let again = transport.request(transport.last_task()).unwrap();
        assert_eq!(again.header("last-event-id"), Some("1"));

        client.shutdown();
        let seen: Vec<_> = states.by_ref().collect().await;
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Terminated,
            ]
        );
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn rejected_status_fails_the_connection() {
        let (transport, client) = client();
        client.connect().unwrap();
        let task = transport.last_task();
        let disposition = transport
            .context(task)
            .delegate()
            .did_receive_response(task, &HttpResponseInfo::new(503));
        assert_eq!(disposition, ResponseDisposition::Cancel);
        assert!(matches!(client.state(), ConnectionState::Failed(err) if err.status_code() == Some(503)));

        client.disconnect().unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn body_in_completion_is_parsed_too() {
        let (transport, client) = client();
        let mut events = client.events();
        client.connect().unwrap();
        transport.finish_data(
            transport.last_task(),
            Ok(DataResponse {
                response: Some(HttpResponseInfo::new(200)),
                body: Bytes::from_static(b"data: whole\n\ndata: tail"),
            }),
        );
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert_eq!(runtime.block_on(events.recv()).unwrap().data, "whole");
        assert_eq!(runtime.block_on(events.recv()).unwrap().data, "tail");
    }

    #[tokio::test]
    async fn streamed_body_repeated_in_completion_is_not_replayed() {
        let (transport, client) = client();
        let mut events = client.events();
        client.connect().unwrap();
        let task = transport.last_task();
        let ctx = transport.context(task);
        ctx.delegate().did_receive_response(task, &HttpResponseInfo::new(200));
        ctx.delegate().did_receive_data(task, &Bytes::from_static(b"data: a\n\ndata: b"));
        transport.finish_data(
            task,
            Ok(DataResponse {
                response: Some(HttpResponseInfo::new(200)),
                body: Bytes::from_static(b"data: a\n\ndata: b"),
            }),
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.shutdown();
        let seen: Vec<String> = events.by_ref().map(|event| event.data).collect().await;
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn connect_twice_fails() {
        let (transport, client) = client();
        client.connect().unwrap();
        assert!(matches!(client.connect(), Err(NetworkingError::State(_))));
        assert_eq!(transport.started(), 1);
    }

    #[test]
    fn disconnect_cancels_the_stream_and_ignores_late_data() {
        let (transport, client) = client();
        client.connect().unwrap();
        let task = transport.last_task();
        client.disconnect().unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(transport.cancelled(), vec![task]);

        transport
            .context(task)
            .delegate()
            .did_receive_data(task, &Bytes::from_static(b"data: late\n\n"));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.disconnect().is_err());
    }

    #[test]
    fn terminated_client_cannot_reconnect() {
        let (transport, client) = client();
        client.shutdown();
        assert!(matches!(client.connect(), Err(NetworkingError::State(_))));
        assert_eq!(client.state(), ConnectionState::Terminated);
        assert_eq!(transport.started(), 0);
        assert!(!client.inner.session.delegate().is_registered(Capability::Data));
    }
}
