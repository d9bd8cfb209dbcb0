//! Data, file and multipart uploads with progress.
//!
//! Every entry point issues exactly one transport upload task per call.
//! `UploadStream::events` is the restartable style: each call starts a new
//! task and returns its own event stream.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::call::{await_call, Publisher, Sink, TaskHandle};
use crate::decode::finish_data;
use crate::delegate::UploadInterceptor;
use crate::error::{InternalError, NetworkingError, Result};
use crate::events::{progress_fraction, EventStream};
use crate::http::HttpRequest;
use crate::multipart::MultipartForm;
use crate::request::{encode_headers, RequestDescriptor};
use crate::session::Session;
use crate::transport::{TaskId, UploadSource};

/// What to send as the request body.
#[derive(Debug, Clone)]
pub enum UploadPayload {
    Data(Bytes),
    /// Streamed from disk by the transport.
    File(PathBuf),
    Multipart(MultipartForm),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadStreamEvent<T> {
    Started,
    /// Fraction of the body sent, in `[0, 1]`, never decreasing.
    Progress(f64),
    Completed(T),
    Failed(NetworkingError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Sending,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadState::Idle => "idle",
            UploadState::Sending => "sending",
            UploadState::Completed => "completed",
            UploadState::Failed => "failed",
            UploadState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Receives the monotonic sent fraction of one upload.
pub type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

struct TrackerState {
    state: UploadState,
    last_fraction: Option<f64>,
}

/// State of one in-flight upload.
struct UploadTracker {
    inner: Mutex<TrackerState>,
    on_progress: Option<ProgressFn>,
}

impl UploadTracker {
    fn new(on_progress: Option<ProgressFn>) -> Self {
        Self {
            inner: Mutex::new(TrackerState {
                state: UploadState::Idle,
                last_fraction: None,
            }),
            on_progress,
        }
    }

    fn transition(&self, next: UploadState) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(from = %inner.state, to = %next, "upload state");
        inner.state = next;
    }

    fn progress(&self, total_sent: u64, total_expected: Option<u64>) {
        let Some(fraction) = progress_fraction(total_sent, total_expected) else {
            return;
        };
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.state != UploadState::Sending {
            return;
        }
        if inner.last_fraction.is_some_and(|last| fraction < last) {
            return;
        }
        inner.last_fraction = Some(fraction);
        if let Some(on_progress) = &self.on_progress {
            on_progress(fraction);
        }
    }
}

/// Routes upload callbacks to the tracker of the task they belong to.
#[derive(Default)]
struct UploadRouter {
    uploads: Mutex<HashMap<TaskId, Arc<UploadTracker>>>,
}

impl UploadRouter {
    fn insert(&self, task: TaskId, tracker: Arc<UploadTracker>) {
        tracker.transition(UploadState::Sending);
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task, tracker);
    }

    fn release(&self, tracker: &Arc<UploadTracker>) {
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, t| !Arc::ptr_eq(t, tracker));
    }

    fn get(&self, task: TaskId) -> Option<Arc<UploadTracker>> {
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task)
            .cloned()
    }
}

impl UploadInterceptor for UploadRouter {
    fn did_send_body_data(&self, task: TaskId, _bytes_sent: u64, total_sent: u64, total_expected: Option<u64>) {
        match self.get(task) {
            Some(tracker) => tracker.progress(total_sent, total_expected),
            None => tracing::trace!(task = %task, "progress for unknown upload"),
        }
    }
}

/// Uploads bodies and decodes the server's JSON reply.
#[derive(Clone)]
pub struct Uploader {
    session: Session,
    router: Arc<UploadRouter>,
}

impl Uploader {
    /// Create an uploader with its own delegate over `session`'s transport.
    pub fn new(session: &Session) -> Self {
        let session = session.fork();
        let router = Arc::new(UploadRouter::default());
        session.delegate().set_upload_interceptor(&router);
        Self { session, router }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Send `payload` and decode the reply. `progress` sees every sent fraction.
    pub async fn upload<T>(
        &self,
        descriptor: &RequestDescriptor,
        payload: UploadPayload,
        progress: Option<ProgressFn>,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (request, source) = self.prepare(descriptor, payload)?;
        let (tx, rx) = oneshot::channel();
        let handle = self.start(
            request,
            source,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            progress,
        );
        await_call(handle, rx).await
    }

    pub fn upload_task<T, F>(
        &self,
        descriptor: &RequestDescriptor,
        payload: UploadPayload,
        progress: Option<ProgressFn>,
        completion: F,
    ) -> TaskHandle
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        match self.prepare(descriptor, payload) {
            Ok((request, source)) => self.start(request, source, Box::new(completion), progress),
            Err(err) => {
                completion(Err(err));
                TaskHandle::finished(TaskId::next())
            }
        }
    }

    pub fn upload_publisher<T>(
        &self,
        descriptor: &RequestDescriptor,
        payload: UploadPayload,
        progress: Option<ProgressFn>,
    ) -> Publisher<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        match self.prepare(descriptor, payload) {
            Ok((request, source)) => {
                let (tx, rx) = oneshot::channel();
                let handle = self.start(
                    request,
                    source,
                    Box::new(move |result| {
                        let _ = tx.send(result);
                    }),
                    progress,
                );
                Publisher::new(&handle, rx)
            }
            Err(err) => Publisher::ready(Err(err)),
        }
    }

    /// A restartable upload. Nothing is sent until `events()` is called.
    pub fn upload_stream<T>(&self, descriptor: &RequestDescriptor, payload: UploadPayload) -> UploadStream<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        UploadStream {
            uploader: self.clone(),
            prepared: self.prepare(descriptor, payload),
            _marker: PhantomData,
        }
    }

    fn prepare(&self, descriptor: &RequestDescriptor, payload: UploadPayload) -> Result<(HttpRequest, UploadSource)> {
        let mut request = descriptor.build(self.session.configuration())?;
        request.body = None;
        let source = match payload {
            UploadPayload::Data(data) => UploadSource::Data(data),
            UploadPayload::File(path) => {
                std::fs::metadata(&path)
                    .map_err(|e| InternalError::Io(format!("{}: {e}", path.display())))?;
                UploadSource::File(path)
            }
            UploadPayload::Multipart(form) => {
                encode_headers(&mut request, &[("Content-Type".to_string(), form.content_type())]);
                UploadSource::Data(form.encode())
            }
        };
        Ok((request, source))
    }

    fn start<T>(
        &self,
        request: HttpRequest,
        source: UploadSource,
        sink: Sink<T>,
        on_progress: Option<ProgressFn>,
    ) -> TaskHandle
    where
        T: DeserializeOwned + Send + 'static,
    {
        let tracker = Arc::new(UploadTracker::new(on_progress));
        let router = self.router.clone();
        let registered = tracker.clone();

        let sink: Sink<T> = Box::new(move |result: Result<T>| {
            router.release(&tracker);
            tracker.transition(match &result {
                Ok(_) => UploadState::Completed,
                Err(err) if err.is_cancellation() => UploadState::Cancelled,
                Err(_) => UploadState::Failed,
            });
            sink(result)
        });

        let router = self.router.clone();
        self.session.spawn(
            sink,
            move |id| router.insert(id, registered),
            |_, result| finish_data(result),
            move |transport, task, completion| transport.start_upload_task(task, request, source, completion),
        )
    }
}

impl fmt::Debug for Uploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uploader").field("session", &self.session).finish()
    }
}

/// Restartable event-stream style upload.
pub struct UploadStream<T> {
    uploader: Uploader,
    prepared: Result<(HttpRequest, UploadSource)>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> UploadStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Start a fresh upload and return its events.
    ///
    /// The stream yields `Started`, any number of `Progress` events, then
    /// exactly one of `Completed` or `Failed`. Dropping it early cancels the
    /// upload.
    pub fn events(&self) -> EventStream<UploadStreamEvent<T>> {
        let capacity = self.uploader.session.configuration().max_buffered_progress_events;
        let (tx, stream) = EventStream::channel(capacity);

        let (request, source) = match &self.prepared {
            Ok(prepared) => prepared.clone(),
            Err(err) => {
                tx.send(UploadStreamEvent::Failed(err.clone()));
                return stream;
            }
        };

        tx.send(UploadStreamEvent::Started);
        let progress = tx.clone();
        let on_progress: ProgressFn = Box::new(move |fraction| {
            progress.send_lossy(UploadStreamEvent::Progress(fraction));
        });
        let sink: Sink<T> = Box::new(move |result| {
            tx.send(match result {
                Ok(value) => UploadStreamEvent::Completed(value),
                Err(err) => UploadStreamEvent::Failed(err),
            });
        });
        let handle = self.uploader.start(request, source, sink, Some(on_progress));
        stream.with_guard(handle.cancel_on_drop())
    }
}
