//! Scripted transport for unit tests.
//!
//! Records every task it is asked to start and lets the test deliver
//! delegate callbacks and completions by hand. Cancelling a task completes it
//! with a cancellation error, as platform transports do.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::TransportError;
use crate::http::{HttpRequest, HttpResponseInfo};
use crate::transport::{
    Completion, DataResponse, DownloadResponse, DownloadSource, TaskContext, TaskId, Transport, UploadSource,
    WebSocketMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Data,
    Upload,
    Download,
    WebSocket,
}

enum Pending {
    Data(Completion<DataResponse>),
    Download(Completion<DownloadResponse>),
    None,
}

struct StartedTask {
    kind: TaskKind,
    context: TaskContext,
    request: Option<HttpRequest>,
    upload: Option<UploadSource>,
    download: Option<DownloadSource>,
    pending: Pending,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    tasks: Mutex<Vec<StartedTask>>,
    cancelled: Mutex<Vec<TaskId>>,
    resume_data: Mutex<Option<Bytes>>,
    sent: Mutex<Vec<(TaskId, WebSocketMessage)>>,
    closed: Mutex<Vec<(TaskId, u16)>>,
}

pub(crate) fn ok_response(status: u16, body: &'static str) -> Result<DataResponse, TransportError> {
    Ok(DataResponse {
        response: Some(HttpResponseInfo::new(status)),
        body: Bytes::from_static(body.as_bytes()),
    })
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, task: StartedTask) {
        self.tasks.lock().unwrap().push(task);
    }

    fn with_task<R>(&self, id: TaskId, f: impl FnOnce(&mut StartedTask) -> R) -> R {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .iter_mut()
            .find(|t| t.context.id() == id)
            .unwrap_or_else(|| panic!("no task {id}"));
        f(task)
    }

    pub(crate) fn started(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub(crate) fn started_of(&self, kind: TaskKind) -> usize {
        self.tasks.lock().unwrap().iter().filter(|t| t.kind == kind).count()
    }

    pub(crate) fn last_task(&self) -> TaskId {
        self.tasks
            .lock()
            .unwrap()
            .last()
            .map(|t| t.context.id())
            .expect("no task started")
    }

    pub(crate) fn context(&self, id: TaskId) -> TaskContext {
        self.with_task(id, |t| t.context.clone())
    }

    pub(crate) fn request(&self, id: TaskId) -> Option<HttpRequest> {
        self.with_task(id, |t| t.request.clone())
    }

    pub(crate) fn upload_source(&self, id: TaskId) -> Option<UploadSource> {
        self.with_task(id, |t| t.upload.clone())
    }

    pub(crate) fn download_source(&self, id: TaskId) -> Option<DownloadSource> {
        self.with_task(id, |t| t.download.clone())
    }

    pub(crate) fn finish_data(&self, id: TaskId, result: Result<DataResponse, TransportError>) {
        let pending = self.with_task(id, |t| std::mem::replace(&mut t.pending, Pending::None));
        match pending {
            Pending::Data(completion) => completion(result),
            _ => panic!("task {id} has no pending data completion"),
        }
    }

    pub(crate) fn finish_download(&self, id: TaskId, result: Result<DownloadResponse, TransportError>) {
        let pending = self.with_task(id, |t| std::mem::replace(&mut t.pending, Pending::None));
        match pending {
            Pending::Download(completion) => completion(result),
            _ => panic!("task {id} has no pending download completion"),
        }
    }

    pub(crate) fn cancelled(&self) -> Vec<TaskId> {
        self.cancelled.lock().unwrap().clone()
    }

    pub(crate) fn set_resume_data(&self, data: Option<Bytes>) {
        *self.resume_data.lock().unwrap() = data;
    }

    pub(crate) fn sent_messages(&self) -> Vec<(TaskId, WebSocketMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn closed(&self) -> Vec<(TaskId, u16)> {
        self.closed.lock().unwrap().clone()
    }

    fn fail_pending(&self, id: TaskId) {
        let pending = {
            let mut tasks = self.tasks.lock().unwrap();
            match tasks.iter_mut().find(|t| t.context.id() == id) {
                Some(task) => std::mem::replace(&mut task.pending, Pending::None),
                None => Pending::None,
            }
        };
        match pending {
            Pending::Data(completion) => completion(Err(TransportError::cancelled())),
            Pending::Download(completion) => completion(Err(TransportError::cancelled())),
            Pending::None => {}
        }
    }
}

impl Transport for MockTransport {
    fn start_data_task(&self, task: TaskContext, request: HttpRequest, completion: Completion<DataResponse>) {
        self.push(StartedTask {
            kind: TaskKind::Data,
            context: task,
            request: Some(request),
            upload: None,
            download: None,
            pending: Pending::Data(completion),
        });
    }

    fn start_upload_task(
        &self,
        task: TaskContext,
        request: HttpRequest,
        source: UploadSource,
        completion: Completion<DataResponse>,
    ) {
        self.push(StartedTask {
            kind: TaskKind::Upload,
            context: task,
            request: Some(request),
            upload: Some(source),
            download: None,
            pending: Pending::Data(completion),
        });
    }

    fn start_download_task(&self, task: TaskContext, source: DownloadSource, completion: Completion<DownloadResponse>) {
        let request = match &source {
            DownloadSource::Request(request) => Some(request.clone()),
            DownloadSource::ResumeData(_) => None,
        };
        self.push(StartedTask {
            kind: TaskKind::Download,
            context: task,
            request,
            upload: None,
            download: Some(source),
            pending: Pending::Download(completion),
        });
    }

    fn start_websocket_task(&self, task: TaskContext, request: HttpRequest) {
        self.push(StartedTask {
            kind: TaskKind::WebSocket,
            context: task,
            request: Some(request),
            upload: None,
            download: None,
            pending: Pending::None,
        });
    }

    fn send_websocket_message(&self, task: TaskId, message: WebSocketMessage, completion: Completion<()>) {
        self.sent.lock().unwrap().push((task, message));
        completion(Ok(()));
    }

    fn close_websocket(&self, task: TaskId, code: u16, _reason: Option<Bytes>) {
        self.closed.lock().unwrap().push((task, code));
    }

    fn cancel(&self, task: TaskId) {
        self.cancelled.lock().unwrap().push(task);
        self.fail_pending(task);
    }

    fn cancel_producing_resume_data(&self, task: TaskId, completion: Box<dyn FnOnce(Option<Bytes>) + Send + 'static>) {
        self.cancelled.lock().unwrap().push(task);
        let data = self.resume_data.lock().unwrap().clone();
        completion(data);
        self.fail_pending(task);
    }
}
