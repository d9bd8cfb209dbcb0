//! Session delegate multiplexer.
//!
//! # Design
//! A transport session has exactly one delegate. `SessionDelegate` is that
//! delegate: it holds at most one interceptor per capability and forwards
//! each callback to whichever interceptor is currently registered for it.
//!
//! - Interceptors are held as `Weak` references. An owner that goes away
//!   (an upload finishing, a client being dropped) silently stops receiving
//!   callbacks; it is never kept alive by the session.
//! - Every capability has its own lock, taken only long enough to upgrade
//!   the reference, so callbacks for different capabilities never wait on
//!   each other.
//! - Callbacks that expect a decision fall back to the platform default when
//!   nothing is registered: cache the proposed response, follow the redirect,
//!   perform default challenge handling, allow the response.
//!
//! The multiplexer carries no business state; it only routes.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;

use crate::error::TransportError;
use crate::http::{HttpRequest, HttpResponseInfo};
use crate::transport::{TaskId, WebSocketMessage};

/// The callback families a session can route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Cache,
    Auth,
    Redirect,
    Metrics,
    Lifecycle,
    Data,
    Download,
    Upload,
    Stream,
    WebSocket,
}

/// A response the transport proposes to store in its cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub response: HttpResponseInfo,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub host: String,
    pub port: u16,
    pub authentication_method: String,
    pub realm: Option<String>,
    pub previous_failure_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeDisposition {
    UseCredential { user: String, password: String },
    PerformDefaultHandling,
    CancelAuthenticationChallenge,
    RejectProtectionSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    Allow,
    Cancel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMetrics {
    pub redirect_count: u32,
    pub duration: Duration,
    pub request_body_bytes: u64,
    pub response_body_bytes: u64,
}

pub trait CacheInterceptor: Send + Sync {
    /// Return the response to store, or `None` to skip caching.
    fn will_cache_response(&self, _task: TaskId, proposed: CachedResponse) -> Option<CachedResponse> {
        Some(proposed)
    }
}

pub trait AuthInterceptor: Send + Sync {
    fn did_receive_challenge(&self, _task: Option<TaskId>, _challenge: &AuthChallenge) -> ChallengeDisposition {
        ChallengeDisposition::PerformDefaultHandling
    }
}

pub trait RedirectInterceptor: Send + Sync {
    /// Return the request to follow, or `None` to stop at the redirect response.
    fn will_perform_redirection(
        &self,
        _task: TaskId,
        _response: &HttpResponseInfo,
        new_request: HttpRequest,
    ) -> Option<HttpRequest> {
        Some(new_request)
    }
}

pub trait MetricsInterceptor: Send + Sync {
    fn did_finish_collecting_metrics(&self, task: TaskId, metrics: &TaskMetrics);
}

pub trait LifecycleInterceptor: Send + Sync {
    fn did_create_task(&self, _task: TaskId) {}
    fn task_is_waiting_for_connectivity(&self, _task: TaskId) {}
    fn did_complete(&self, _task: TaskId, _error: Option<&TransportError>) {}
    fn did_become_invalid(&self, _error: Option<&TransportError>) {}
}

pub trait DataInterceptor: Send + Sync {
    fn did_receive_response(&self, _task: TaskId, _response: &HttpResponseInfo) -> ResponseDisposition {
        ResponseDisposition::Allow
    }
    fn did_receive_data(&self, _task: TaskId, _data: &Bytes) {}
}

pub trait DownloadInterceptor: Send + Sync {
    fn did_write_data(&self, _task: TaskId, _bytes_written: u64, _total_written: u64, _total_expected: Option<u64>) {}
    fn did_resume_at_offset(&self, _task: TaskId, _offset: u64, _total_expected: Option<u64>) {}
    fn did_finish_downloading(&self, _task: TaskId, _location: &Path) {}
}

pub trait UploadInterceptor: Send + Sync {
    fn did_send_body_data(&self, task: TaskId, bytes_sent: u64, total_sent: u64, total_expected: Option<u64>);
}

pub trait StreamInterceptor: Send + Sync {
    fn read_closed(&self, _task: TaskId) {}
    fn write_closed(&self, _task: TaskId) {}
    fn better_route_discovered(&self, _task: TaskId) {}
}

pub trait WebSocketInterceptor: Send + Sync {
    fn did_open(&self, _task: TaskId, _protocol: Option<&str>) {}
    fn did_receive_message(&self, _task: TaskId, _message: &WebSocketMessage) {}
    fn did_close(&self, _task: TaskId, _code: u16, _reason: Option<&Bytes>) {}
}

/// One capability's registration: a non-owning reference behind its own lock.
struct Slot<T: ?Sized> {
    inner: RwLock<Option<Weak<T>>>,
}

impl<T: ?Sized> Slot<T> {
    fn empty() -> Self {
        Self { inner: RwLock::new(None) }
    }

    fn set(&self, interceptor: Weak<T>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(interceptor);
    }

    fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The live interceptor, if any. The read lock is released before the
    /// caller forwards the callback.
    fn get(&self) -> Option<Arc<T>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

pub struct SessionDelegate {
    cache: Slot<dyn CacheInterceptor>,
    auth: Slot<dyn AuthInterceptor>,
    redirect: Slot<dyn RedirectInterceptor>,
    metrics: Slot<dyn MetricsInterceptor>,
    lifecycle: Slot<dyn LifecycleInterceptor>,
    data: Slot<dyn DataInterceptor>,
    download: Slot<dyn DownloadInterceptor>,
    upload: Slot<dyn UploadInterceptor>,
    stream: Slot<dyn StreamInterceptor>,
    websocket: Slot<dyn WebSocketInterceptor>,
}

impl Default for SessionDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDelegate {
    pub fn new() -> Self {
        Self {
            cache: Slot::empty(),
            auth: Slot::empty(),
            redirect: Slot::empty(),
            metrics: Slot::empty(),
            lifecycle: Slot::empty(),
            data: Slot::empty(),
            download: Slot::empty(),
            upload: Slot::empty(),
            stream: Slot::empty(),
            websocket: Slot::empty(),
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn set_cache_interceptor<I: CacheInterceptor + 'static>(&self, interceptor: &Arc<I>) {
        self.cache.set(Arc::downgrade(interceptor) as Weak<dyn CacheInterceptor>);
    }

    pub fn set_auth_interceptor<I: AuthInterceptor + 'static>(&self, interceptor: &Arc<I>) {
        self.auth.set(Arc::downgrade(interceptor) as Weak<dyn AuthInterceptor>);
    }

    pub fn set_redirect_interceptor<I: RedirectInterceptor + 'static>(&self, interceptor: &Arc<I>) {
        self.redirect.set(Arc::downgrade(interceptor) as Weak<dyn RedirectInterceptor>);
    }

    pub fn set_metrics_interceptor<I: MetricsInterceptor + 'static>(&self, interceptor: &Arc<I>) {
        self.metrics.set(Arc::downgrade(interceptor) as Weak<dyn MetricsInterceptor>);
    }

    pub fn set_lifecycle_interceptor<I: LifecycleInterceptor + 'static>(&self, interceptor: &Arc<I>) {
        self.lifecycle.set(Arc::downgrade(interceptor) as Weak<dyn LifecycleInterceptor>);
    }

    pub fn set_data_interceptor<I: DataInterceptor + 'static>(&self, interceptor: &Arc<I>) {
        self.data.set(Arc::downgrade(interceptor) as Weak<dyn DataInterceptor>);
    }

    pub fn set_download_interceptor<I: DownloadInterceptor + 'static>(&self, interceptor: &Arc<I>) {
        self.download.set(Arc::downgrade(interceptor) as Weak<dyn DownloadInterceptor>);
    }

    pub fn set_upload_interceptor<I: UploadInterceptor + 'static>(&self, interceptor: &Arc<I>) {
        self.upload.set(Arc::downgrade(interceptor) as Weak<dyn UploadInterceptor>);
    }

    pub fn set_stream_interceptor<I: StreamInterceptor + 'static>(&self, interceptor: &Arc<I>) {
        self.stream.set(Arc::downgrade(interceptor) as Weak<dyn StreamInterceptor>);
    }

    pub fn set_websocket_interceptor<I: WebSocketInterceptor + 'static>(&self, interceptor: &Arc<I>) {
        self.websocket.set(Arc::downgrade(interceptor) as Weak<dyn WebSocketInterceptor>);
    }

    pub fn clear(&self, capability: Capability) {
        match capability {
            Capability::Cache => self.cache.clear(),
            Capability::Auth => self.auth.clear(),
            Capability::Redirect => self.redirect.clear(),
            Capability::Metrics => self.metrics.clear(),
            Capability::Lifecycle => self.lifecycle.clear(),
            Capability::Data => self.data.clear(),
            Capability::Download => self.download.clear(),
            Capability::Upload => self.upload.clear(),
            Capability::Stream => self.stream.clear(),
            Capability::WebSocket => self.websocket.clear(),
        }
    }

    /// Whether a live interceptor is registered for `capability`.
    pub fn is_registered(&self, capability: Capability) -> bool {
        match capability {
            Capability::Cache => self.cache.get().is_some(),
            Capability::Auth => self.auth.get().is_some(),
            Capability::Redirect => self.redirect.get().is_some(),
            Capability::Metrics => self.metrics.get().is_some(),
            Capability::Lifecycle => self.lifecycle.get().is_some(),
            Capability::Data => self.data.get().is_some(),
            Capability::Download => self.download.get().is_some(),
            Capability::Upload => self.upload.get().is_some(),
            Capability::Stream => self.stream.get().is_some(),
            Capability::WebSocket => self.websocket.get().is_some(),
        }
    }

    // -----------------------------------------------------------------------
    // Forwarding
    // -----------------------------------------------------------------------

    pub fn will_cache_response(&self, task: TaskId, proposed: CachedResponse) -> Option<CachedResponse> {
        match self.cache.get() {
            Some(interceptor) => interceptor.will_cache_response(task, proposed),
            None => Some(proposed),
        }
    }

    pub fn did_receive_challenge(&self, task: Option<TaskId>, challenge: &AuthChallenge) -> ChallengeDisposition {
        match self.auth.get() {
            Some(interceptor) => interceptor.did_receive_challenge(task, challenge),
            None => ChallengeDisposition::PerformDefaultHandling,
        }
    }

    pub fn will_perform_redirection(
        &self,
        task: TaskId,
        response: &HttpResponseInfo,
        new_request: HttpRequest,
    ) -> Option<HttpRequest> {
        match self.redirect.get() {
            Some(interceptor) => interceptor.will_perform_redirection(task, response, new_request),
            None => Some(new_request),
        }
    }

    pub fn did_finish_collecting_metrics(&self, task: TaskId, metrics: &TaskMetrics) {
        if let Some(interceptor) = self.metrics.get() {
            interceptor.did_finish_collecting_metrics(task, metrics);
        }
    }

    pub fn did_create_task(&self, task: TaskId) {
        if let Some(interceptor) = self.lifecycle.get() {
            interceptor.did_create_task(task);
        }
    }

    pub fn task_is_waiting_for_connectivity(&self, task: TaskId) {
        if let Some(interceptor) = self.lifecycle.get() {
            interceptor.task_is_waiting_for_connectivity(task);
        }
    }

    pub fn did_complete(&self, task: TaskId, error: Option<&TransportError>) {
        if let Some(interceptor) = self.lifecycle.get() {
            interceptor.did_complete(task, error);
        }
    }

    pub fn did_become_invalid(&self, error: Option<&TransportError>) {
        if let Some(interceptor) = self.lifecycle.get() {
            interceptor.did_become_invalid(error);
        }
    }

    pub fn did_receive_response(&self, task: TaskId, response: &HttpResponseInfo) -> ResponseDisposition {
        match self.data.get() {
            Some(interceptor) => interceptor.did_receive_response(task, response),
            None => ResponseDisposition::Allow,
        }
    }

    pub fn did_receive_data(&self, task: TaskId, data: &Bytes) {
        if let Some(interceptor) = self.data.get() {
            interceptor.did_receive_data(task, data);
        }
    }

    pub fn did_write_data(&self, task: TaskId, bytes_written: u64, total_written: u64, total_expected: Option<u64>) {
        if let Some(interceptor) = self.download.get() {
            interceptor.did_write_data(task, bytes_written, total_written, total_expected);
        }
    }

    pub fn did_resume_at_offset(&self, task: TaskId, offset: u64, total_expected: Option<u64>) {
        if let Some(interceptor) = self.download.get() {
            interceptor.did_resume_at_offset(task, offset, total_expected);
        }
    }

    pub fn did_finish_downloading(&self, task: TaskId, location: &Path) {
        if let Some(interceptor) = self.download.get() {
            interceptor.did_finish_downloading(task, location);
        }
    }

    pub fn did_send_body_data(&self, task: TaskId, bytes_sent: u64, total_sent: u64, total_expected: Option<u64>) {
        if let Some(interceptor) = self.upload.get() {
            interceptor.did_send_body_data(task, bytes_sent, total_sent, total_expected);
        }
    }

    pub fn read_closed(&self, task: TaskId) {
        if let Some(interceptor) = self.stream.get() {
            interceptor.read_closed(task);
        }
    }

    pub fn write_closed(&self, task: TaskId) {
        if let Some(interceptor) = self.stream.get() {
            interceptor.write_closed(task);
        }
    }

    pub fn better_route_discovered(&self, task: TaskId) {
        if let Some(interceptor) = self.stream.get() {
            interceptor.better_route_discovered(task);
        }
    }

    pub fn websocket_did_open(&self, task: TaskId, protocol: Option<&str>) {
        if let Some(interceptor) = self.websocket.get() {
            interceptor.did_open(task, protocol);
        }
    }

    pub fn websocket_did_receive_message(&self, task: TaskId, message: &WebSocketMessage) {
        if let Some(interceptor) = self.websocket.get() {
            interceptor.did_receive_message(task, message);
        }
    }

    pub fn websocket_did_close(&self, task: TaskId, code: u16, reason: Option<&Bytes>) {
        if let Some(interceptor) = self.websocket.get() {
            interceptor.did_close(task, code, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;
    use std::thread;

    #[derive(Default)]
    struct CountingDownloads {
        written: AtomicU64,
    }

    impl DownloadInterceptor for CountingDownloads {
        fn did_write_data(&self, _task: TaskId, bytes_written: u64, _total: u64, _expected: Option<u64>) {
            self.written.fetch_add(bytes_written, Ordering::SeqCst);
        }
    }

    struct NoRedirects;

    impl RedirectInterceptor for NoRedirects {
        fn will_perform_redirection(&self, _task: TaskId, _r: &HttpResponseInfo, _n: HttpRequest) -> Option<HttpRequest> {
            None
        }
    }

    fn request() -> HttpRequest {
        crate::request::RequestDescriptor::get("https://example.com/next")
            .build(&crate::config::SessionConfiguration::default())
            .unwrap()
    }

    #[test]
    fn unregistered_capability_is_a_silent_noop() {
        let delegate = SessionDelegate::new();
        delegate.did_write_data(TaskId::next(), 10, 10, Some(100));
        delegate.did_send_body_data(TaskId::next(), 10, 10, None);
        delegate.websocket_did_close(TaskId::next(), 1000, None);
        assert!(!delegate.is_registered(Capability::Download));
    }

    #[test]
    fn forwards_to_registered_interceptor() {
        let delegate = SessionDelegate::new();
        let downloads = Arc::new(CountingDownloads::default());
        delegate.set_download_interceptor(&downloads);

        delegate.did_write_data(TaskId::next(), 10, 10, Some(100));
        delegate.did_write_data(TaskId::next(), 5, 15, Some(100));
        assert_eq!(downloads.written.load(Ordering::SeqCst), 15);
        assert!(delegate.is_registered(Capability::Download));
    }

    #[test]
    fn released_owner_stops_receiving_callbacks() {
        let delegate = SessionDelegate::new();
        let downloads = Arc::new(CountingDownloads::default());
        delegate.set_download_interceptor(&downloads);
        drop(downloads);

        delegate.did_write_data(TaskId::next(), 10, 10, Some(100));
        assert!(!delegate.is_registered(Capability::Download));
    }

    #[test]
    fn cleared_capability_stops_forwarding() {
        let delegate = SessionDelegate::new();
        let downloads = Arc::new(CountingDownloads::default());
        delegate.set_download_interceptor(&downloads);
        delegate.clear(Capability::Download);

        delegate.did_write_data(TaskId::next(), 10, 10, Some(100));
        assert_eq!(downloads.written.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn decisions_fall_back_to_platform_defaults() {
        let delegate = SessionDelegate::new();
        let task = TaskId::next();
        let redirect = request();
        assert_eq!(
            delegate.will_perform_redirection(task, &HttpResponseInfo::new(302), redirect.clone()),
            Some(redirect)
        );
        let challenge = AuthChallenge {
            host: "example.com".to_string(),
            port: 443,
            authentication_method: "basic".to_string(),
            realm: None,
            previous_failure_count: 0,
        };
        assert_eq!(
            delegate.did_receive_challenge(Some(task), &challenge),
            ChallengeDisposition::PerformDefaultHandling
        );
        assert_eq!(
            delegate.did_receive_response(task, &HttpResponseInfo::new(200)),
            ResponseDisposition::Allow
        );
        let proposed = CachedResponse {
            response: HttpResponseInfo::new(200),
            body: Bytes::from_static(b"cached"),
        };
        assert_eq!(delegate.will_cache_response(task, proposed.clone()), Some(proposed));
    }

    #[test]
    fn registered_redirect_interceptor_decides() {
        let delegate = SessionDelegate::new();
        let policy = Arc::new(NoRedirects);
        delegate.set_redirect_interceptor(&policy);
        assert_eq!(
            delegate.will_perform_redirection(TaskId::next(), &HttpResponseInfo::new(301), request()),
            None
        );
    }

    #[test]
    fn concurrent_callbacks_across_capabilities_are_independent() {
        struct SlowUploads {
            barrier: Arc<Barrier>,
        }

        impl UploadInterceptor for SlowUploads {
            fn did_send_body_data(&self, _task: TaskId, _sent: u64, _total: u64, _expected: Option<u64>) {
                // Blocks until the download callback on the other thread has run.
                self.barrier.wait();
            }
        }

        struct SignallingDownloads {
            barrier: Arc<Barrier>,
        }

        impl DownloadInterceptor for SignallingDownloads {
            fn did_write_data(&self, _task: TaskId, _w: u64, _t: u64, _e: Option<u64>) {
                self.barrier.wait();
            }
        }

        let barrier = Arc::new(Barrier::new(2));
        let delegate = Arc::new(SessionDelegate::new());
        let uploads = Arc::new(SlowUploads { barrier: barrier.clone() });
        let downloads = Arc::new(SignallingDownloads { barrier });
        delegate.set_upload_interceptor(&uploads);
        delegate.set_download_interceptor(&downloads);

        let upload_side = {
            let delegate = delegate.clone();
            thread::spawn(move || delegate.did_send_body_data(TaskId::next(), 1, 1, Some(2)))
        };
        delegate.did_write_data(TaskId::next(), 1, 1, Some(2));
        upload_side.join().unwrap();
    }
}
