//! The seam between netkit and the host-provided transport.
//!
//! # Design
//! netkit never opens a socket. The host (an OS HTTP stack, a test double,
//! or an adapter over another client library) implements `Transport`. Each
//! task is started with a `TaskContext` that names the task and carries the
//! session's delegate multiplexer: the host reports every intermediate event
//! (progress, data, redirects, challenges, websocket frames) through it, and
//! the terminal result through the task's completion, exactly once.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::delegate::SessionDelegate;
use crate::error::TransportError;
use crate::http::{HttpRequest, HttpResponseInfo};

/// Terminal callback of a transport task.
pub type Completion<T> = Box<dyn FnOnce(Result<T, TransportError>) + Send + 'static>;

/// Process-unique identifier of a transport task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Identity of a task plus the delegate its callbacks go to.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    delegate: Arc<SessionDelegate>,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, delegate: Arc<SessionDelegate>) -> Self {
        Self { id, delegate }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn delegate(&self) -> &SessionDelegate {
        &self.delegate
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext").field("id", &self.id).finish()
    }
}

/// Result of a data or upload task.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataResponse {
    /// `None` when the transport produced no HTTP response wrapper.
    pub response: Option<HttpResponseInfo>,
    pub body: Bytes,
}

/// Result of a download task.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadResponse {
    pub response: Option<HttpResponseInfo>,
    /// Where the transport left the downloaded file.
    pub location: PathBuf,
}

/// Body of an upload task.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadSource {
    Data(Bytes),
    File(PathBuf),
}

/// Where a download task starts from.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadSource {
    Request(HttpRequest),
    ResumeData(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketMessage {
    Text(String),
    Binary(Bytes),
}

/// Host-provided HTTP/WebSocket transport.
///
/// Implementations must invoke each completion at most once and may do so
/// from any thread, including synchronously inside the `start_*` call.
pub trait Transport: Send + Sync + 'static {
    fn start_data_task(&self, task: TaskContext, request: HttpRequest, completion: Completion<DataResponse>);

    fn start_upload_task(
        &self,
        task: TaskContext,
        request: HttpRequest,
        source: UploadSource,
        completion: Completion<DataResponse>,
    );

    fn start_download_task(
        &self,
        task: TaskContext,
        source: DownloadSource,
        completion: Completion<DownloadResponse>,
    );

    /// Open a websocket. Opening, inbound messages and closing are reported
    /// through the delegate's websocket capability; task failure through the
    /// lifecycle capability.
    fn start_websocket_task(&self, task: TaskContext, request: HttpRequest);

    fn send_websocket_message(&self, task: TaskId, message: WebSocketMessage, completion: Completion<()>);

    fn close_websocket(&self, task: TaskId, code: u16, reason: Option<Bytes>);

    /// Cancel a task. The task's completion, if still pending, reports a
    /// cancellation error.
    fn cancel(&self, task: TaskId);

    /// Cancel a download, handing back resume data when the transport can
    /// produce it.
    fn cancel_producing_resume_data(&self, task: TaskId, completion: Box<dyn FnOnce(Option<Bytes>) + Send + 'static>);
}
