//! Single request/response execution with typed decoding.

use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::call::{await_call, Publisher, Sink, TaskHandle};
use crate::decode::finish_data;
use crate::error::Result;
use crate::http::HttpRequest;
use crate::request::RequestDescriptor;
use crate::session::Session;
use crate::transport::TaskId;

/// Executes requests and decodes their JSON bodies.
///
/// Each call creates exactly one transport data task. The three entry
/// points differ only in how the result is delivered.
#[derive(Debug, Clone)]
pub struct RequestPerformer {
    session: Session,
}

impl RequestPerformer {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Perform `descriptor` and decode the body as `T`.
    ///
    /// Fails with `InvalidUrl` before any network activity if the request
    /// cannot be built. Dropping the future cancels the transport task.
    pub async fn perform<T>(&self, descriptor: &RequestDescriptor) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let request = descriptor.build(self.session.configuration())?;
        let (tx, rx) = oneshot::channel();
        let handle = self.start(
            request,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        await_call(handle, rx).await
    }

    /// Perform `descriptor` and hand the result to `completion`.
    ///
    /// `completion` runs exactly once, on the transport's callback thread or
    /// on the caller's thread for build errors and cancellation.
    pub fn perform_task<T, F>(&self, descriptor: &RequestDescriptor, completion: F) -> TaskHandle
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        match descriptor.build(self.session.configuration()) {
            Ok(request) => self.start(request, Box::new(completion)),
            Err(err) => {
                tracing::debug!(url = descriptor.base_url(), error = %err, "request could not be built");
                completion(Err(err));
                TaskHandle::finished(TaskId::next())
            }
        }
    }

    /// Perform `descriptor` and publish the single result.
    pub fn perform_publisher<T>(&self, descriptor: &RequestDescriptor) -> Publisher<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        match descriptor.build(self.session.configuration()) {
            Ok(request) => {
                let (tx, rx) = oneshot::channel();
                let handle = self.start(
                    request,
                    Box::new(move |result| {
                        let _ = tx.send(result);
                    }),
                );
                Publisher::new(&handle, rx)
            }
            Err(err) => Publisher::ready(Err(err)),
        }
    }

    fn start<T>(&self, request: HttpRequest, sink: Sink<T>) -> TaskHandle
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.session.spawn(
            sink,
            |_| {},
            |_, result| finish_data(result),
            move |transport, task, completion| transport.start_data_task(task, request, completion),
        )
    }
}
