//! Resumable single-file downloads.
//!
//! # Design
//! A `Downloader` is a single-writer state machine:
//!
//! ```text
//! idle -> downloading -> paused -> downloading
//!                     -> failed_resumable -> downloading
//!                     -> completed | failed | cancelled
//! ```
//!
//! Operations are serialized by an async mutex so a `pause()` that is still
//! waiting for resume data cannot interleave with `resume()` or `cancel()`.
//! Transport callbacks only take the short state lock, and they carry the id
//! of the task they belong to: a callback for a task that is no longer the
//! current one (paused, cancelled, superseded) is dropped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::call::TaskHandle;
use crate::decode::validate;
use crate::delegate::DownloadInterceptor;
use crate::error::{InternalError, NetworkingError, Result, StateError, TransportError};
use crate::events::{progress_fraction, EventStream, Subscribers};
use crate::http::HttpRequest;
use crate::request::RequestDescriptor;
use crate::session::Session;
use crate::transport::{DownloadResponse, DownloadSource, TaskId};

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Started,
    Progress {
        bytes_written: u64,
        total_bytes: Option<u64>,
        /// `None` while the total size is unknown.
        fraction: Option<f64>,
    },
    Paused,
    Resumed,
    /// Final location of the file.
    Completed(PathBuf),
    Failed(NetworkingError),
    /// The transport left resume data behind; `resume()` can continue.
    FailedButCanResume(NetworkingError),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    Downloading,
    Paused,
    FailedResumable,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownloadState::Idle => "idle",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::FailedResumable => "failed (resumable)",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

struct Machine {
    state: DownloadState,
    task: Option<TaskId>,
    handle: Option<TaskHandle>,
    resume_data: Option<Bytes>,
}

/// Outcome of one transport download task, tagged with its id.
struct Settled {
    task: TaskId,
    result: Result<PathBuf>,
}

struct Inner {
    session: Session,
    request: HttpRequest,
    destination: Option<PathBuf>,
    machine: Mutex<Machine>,
    events: Subscribers<DownloadEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, machine: &mut Machine, next: DownloadState, event: DownloadEvent) {
        tracing::debug!(from = %machine.state, to = %next, "download state");
        machine.state = next;
        self.events.publish(event);
        if next.is_terminal() {
            self.events.close();
        }
    }

    /// Start a transport task and make it the current one.
    fn launch(self: &Arc<Self>, source: DownloadSource) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let destination = self.destination.clone();

        let handle = self.session.spawn(
            Box::new(move |settled: Result<Settled>| match (settled, weak.upgrade()) {
                (Ok(settled), Some(inner)) => inner.complete(settled),
                (Ok(settled), None) => tracing::trace!(task = %settled.task, "downloader released before completion"),
                (Err(err), _) => tracing::trace!(error = %err, "download task stopped by its handle"),
            }),
            |id| self.lock().task = Some(id),
            move |task, result| {
                Ok(Settled {
                    task,
                    result: settle(result, destination.as_deref()),
                })
            },
            move |transport, task, completion| transport.start_download_task(task, source, completion),
        );

        let mut machine = self.lock();
        if machine.task == Some(handle.id()) {
            machine.handle = Some(handle);
        }
    }

    fn complete(&self, settled: Settled) {
        let mut machine = self.lock();
        if machine.task != Some(settled.task) {
            tracing::trace!(task = %settled.task, "ignoring completion of a superseded download task");
            return;
        }
        machine.task = None;
        machine.handle = None;
        match settled.result {
            Ok(location) => self.transition(&mut machine, DownloadState::Completed, DownloadEvent::Completed(location)),
            Err(err) => match err.resume_data().cloned() {
                Some(data) => {
                    machine.resume_data = Some(data);
                    self.transition(
                        &mut machine,
                        DownloadState::FailedResumable,
                        DownloadEvent::FailedButCanResume(err),
                    );
                }
                None => self.transition(&mut machine, DownloadState::Failed, DownloadEvent::Failed(err)),
            },
        }
    }

    fn progress(&self, task: TaskId, written: u64, expected: Option<u64>) {
        let machine = self.lock();
        if machine.task != Some(task) || machine.state != DownloadState::Downloading {
            tracing::trace!(task = %task, "ignoring progress of a superseded download task");
            return;
        }
        self.events.publish_lossy(DownloadEvent::Progress {
            bytes_written: written,
            total_bytes: expected,
            fraction: progress_fraction(written, expected),
        });
    }
}

impl DownloadInterceptor for Inner {
    fn did_write_data(&self, task: TaskId, _bytes_written: u64, total_written: u64, total_expected: Option<u64>) {
        self.progress(task, total_written, total_expected);
    }

    fn did_resume_at_offset(&self, task: TaskId, offset: u64, total_expected: Option<u64>) {
        self.progress(task, offset, total_expected);
    }
}

/// Validate a finished download and move it to its destination.
fn settle(result: std::result::Result<DownloadResponse, TransportError>, destination: Option<&Path>) -> Result<PathBuf> {
    let download = result?;
    validate(download.response)?;
    match destination {
        Some(destination) => {
            move_file(&download.location, destination)?;
            Ok(destination.to_path_buf())
        }
        None => Ok(download.location),
    }
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    let io = |e: std::io::Error| NetworkingError::from(InternalError::Io(format!("{}: {e}", to.display())));
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io)?;
    }
    if to.exists() {
        std::fs::remove_file(to).map_err(io)?;
    }
    // rename fails across filesystems; fall back to copy.
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to).map_err(io)?;
        std::fs::remove_file(from).map_err(io)?;
    }
    Ok(())
}

/// A single resumable download.
///
/// Each downloader owns a forked session so its download interceptor does
/// not compete with other components. Dropping it cancels the transport
/// task in flight.
pub struct Downloader {
    inner: Arc<Inner>,
    ops: tokio::sync::Mutex<()>,
}

impl Downloader {
    /// Prepare a download of `descriptor`. Fails if the request cannot be built.
    pub fn new(session: &Session, descriptor: &RequestDescriptor) -> Result<Self> {
        Self::build(session, descriptor, None, None)
    }

    /// Like `new`, but the finished file is moved to `destination`.
    pub fn with_destination(
        session: &Session,
        descriptor: &RequestDescriptor,
        destination: impl Into<PathBuf>,
    ) -> Result<Self> {
        Self::build(session, descriptor, Some(destination.into()), None)
    }

    /// Rebuild a paused download from resume data persisted by the caller.
    ///
    /// The downloader starts in `Paused`, so `resume()` continues it.
    pub fn restore(
        session: &Session,
        descriptor: &RequestDescriptor,
        destination: Option<PathBuf>,
        resume_data: Bytes,
    ) -> Result<Self> {
        Self::build(session, descriptor, destination, Some(resume_data))
    }

    fn build(
        session: &Session,
        descriptor: &RequestDescriptor,
        destination: Option<PathBuf>,
        resume_data: Option<Bytes>,
    ) -> Result<Self> {
        let request = descriptor.build(session.configuration())?;
        let session = session.fork();
        let capacity = session.configuration().max_buffered_progress_events;
        let state = match resume_data {
            Some(_) => DownloadState::Paused,
            None => DownloadState::Idle,
        };
        let inner = Arc::new(Inner {
            session,
            request,
            destination,
            machine: Mutex::new(Machine {
                state,
                task: None,
                handle: None,
                resume_data,
            }),
            events: Subscribers::new(capacity),
        });
        inner.session.delegate().set_download_interceptor(&inner);
        Ok(Self {
            inner,
            ops: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state(&self) -> DownloadState {
        self.inner.lock().state
    }

    /// Resume data captured by the last pause or resumable failure.
    pub fn resume_data(&self) -> Option<Bytes> {
        self.inner.lock().resume_data.clone()
    }

    /// Subscribe to events published from now on.
    ///
    /// The stream ends after the terminal event (`Completed`, `Failed` or
    /// `Cancelled`).
    pub fn events(&self) -> EventStream<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Start the download. Only valid from `Idle`.
    pub async fn start(&self) -> Result<()> {
        let _op = self.ops.lock().await;
        {
            let mut machine = self.inner.lock();
            if machine.state != DownloadState::Idle {
                return Err(StateError::new("start", machine.state).into());
            }
            self.inner
                .transition(&mut machine, DownloadState::Downloading, DownloadEvent::Started);
        }
        self.inner.launch(DownloadSource::Request(self.inner.request.clone()));
        Ok(())
    }

    /// Stop the transfer and keep whatever resume data the transport hands back.
    ///
    /// Only valid while `Downloading`.
    pub async fn pause(&self) -> Result<()> {
        let _op = self.ops.lock().await;
        let task = {
            let mut machine = self.inner.lock();
            if machine.state != DownloadState::Downloading {
                return Err(StateError::new("pause", machine.state).into());
            }
            let task = machine.task.take();
            machine.handle = None;
            self.inner
                .transition(&mut machine, DownloadState::Paused, DownloadEvent::Paused);
            task
        };

        let Some(task) = task else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        self.inner.session.transport().cancel_producing_resume_data(
            task,
            Box::new(move |data| {
                let _ = tx.send(data);
            }),
        );
        let data = rx.await.unwrap_or(None);
        tracing::debug!(task = %task, resumable = data.is_some(), "download paused");

        let mut machine = self.inner.lock();
        if machine.state == DownloadState::Paused {
            machine.resume_data = data;
        }
        Ok(())
    }

    /// Continue from `Paused` or `FailedResumable`.
    ///
    /// Uses the captured resume data, or restarts from the original request
    /// when the transport produced none.
    pub async fn resume(&self) -> Result<()> {
        let _op = self.ops.lock().await;
        let source = {
            let mut machine = self.inner.lock();
            if !matches!(machine.state, DownloadState::Paused | DownloadState::FailedResumable) {
                return Err(StateError::new("resume", machine.state).into());
            }
            let source = match machine.resume_data.take() {
                Some(data) => DownloadSource::ResumeData(data),
                None => DownloadSource::Request(self.inner.request.clone()),
            };
            self.inner
                .transition(&mut machine, DownloadState::Downloading, DownloadEvent::Resumed);
            source
        };
        self.inner.launch(source);
        Ok(())
    }

    /// Abandon the download. Fails if it already reached a terminal state.
    pub async fn cancel(&self) -> Result<()> {
        let _op = self.ops.lock().await;
        let handle = {
            let mut machine = self.inner.lock();
            if machine.state.is_terminal() {
                return Err(StateError::new("cancel", machine.state).into());
            }
            machine.task = None;
            machine.resume_data = None;
            let handle = machine.handle.take();
            self.inner
                .transition(&mut machine, DownloadState::Cancelled, DownloadEvent::Cancelled);
            handle
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
        Ok(())
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        let handle = {
            let mut machine = self.inner.lock();
            machine.task = None;
            machine.handle.take()
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
    }
}

impl fmt::Debug for Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downloader")
            .field("url", &self.inner.request.url)
            .field("state", &self.state())
            .finish()
    }
}
