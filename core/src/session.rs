//! A logical transport session: one transport, one delegate multiplexer.

use std::fmt;
use std::sync::Arc;

use crate::call::{Call, Sink, TaskHandle};
use crate::config::SessionConfiguration;
use crate::delegate::SessionDelegate;
use crate::error::{Result, TransportError};
use crate::transport::{Completion, TaskContext, TaskId, Transport};

/// Handle to a transport plus the delegate that receives its callbacks.
///
/// Cloning shares the delegate. Components that register interceptors
/// (downloader, uploader, SSE and WebSocket clients) hold one capability slot
/// each, so two components of the same kind need two sessions.
#[derive(Clone)]
pub struct Session {
    transport: Arc<dyn Transport>,
    delegate: Arc<SessionDelegate>,
    config: Arc<SessionConfiguration>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_configuration(transport, SessionConfiguration::default())
    }

    pub fn with_configuration(transport: Arc<dyn Transport>, config: SessionConfiguration) -> Self {
        Self {
            transport,
            delegate: Arc::new(SessionDelegate::new()),
            config: Arc::new(config),
        }
    }

    /// A new session over the same transport and configuration, with its own delegate.
    pub fn fork(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            delegate: Arc::new(SessionDelegate::new()),
            config: self.config.clone(),
        }
    }

    pub fn delegate(&self) -> &Arc<SessionDelegate> {
        &self.delegate
    }

    pub fn configuration(&self) -> &SessionConfiguration {
        &self.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn context(&self, id: TaskId) -> TaskContext {
        TaskContext::new(id, self.delegate.clone())
    }

    /// Start one transport task whose outcome goes to `sink`.
    ///
    /// `prepare` runs with the task id before the transport sees the task, so
    /// callers can register per-task state that early callbacks will need.
    /// `finish` converts the transport result on the callback thread; it is
    /// skipped if the call was cancelled first.
    pub(crate) fn spawn<R, T>(
        &self,
        sink: Sink<T>,
        prepare: impl FnOnce(TaskId),
        finish: impl FnOnce(TaskId, std::result::Result<R, TransportError>) -> Result<T> + Send + 'static,
        start: impl FnOnce(&dyn Transport, TaskContext, Completion<R>),
    ) -> TaskHandle
    where
        R: Send + 'static,
        T: Send + 'static,
    {
        let id = TaskId::next();
        let call = Call::new(id, self.transport.clone(), sink);
        let pending = call.clone();
        let completion: Completion<R> = Box::new(move |result| {
            if pending.is_finished() {
                tracing::trace!(task = %id, "ignoring completion of a cancelled task");
                return;
            }
            let outcome = finish(id, result);
            if let Err(err) = &outcome {
                tracing::debug!(task = %id, error = %err, "task failed");
            }
            pending.complete(outcome);
        });

        prepare(id);
        self.delegate.did_create_task(id);
        tracing::debug!(task = %id, "starting task");
        start(self.transport.as_ref(), self.context(id), completion);
        call.handle()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{Capability, LifecycleInterceptor};
    use crate::error::NetworkingError;
    use crate::mock::{ok_response, MockTransport};
    use crate::request::RequestDescriptor;
    use crate::transport::DataResponse;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Created(Mutex<Vec<TaskId>>);

    impl LifecycleInterceptor for Created {
        fn did_create_task(&self, task: TaskId) {
            self.0.lock().unwrap().push(task);
        }
    }

    fn spawn_data(session: &Session, seen: Arc<Mutex<Vec<String>>>) -> TaskHandle {
        let order = seen.clone();
        let request = RequestDescriptor::get("https://example.com/items")
            .build(session.configuration())
            .unwrap();
        let sink: Sink<usize> = Box::new(move |result| seen.lock().unwrap().push(format!("sink {result:?}")));
        session.spawn(
            sink,
            move |id| order.lock().unwrap().push(format!("prepare {}", id.get())),
            |_, result: std::result::Result<DataResponse, TransportError>| Ok(result?.body.len()),
            move |transport, task, completion| transport.start_data_task(task, request, completion),
        )
    }

    #[test]
    fn fork_shares_configuration_but_not_the_delegate() {
        let config = SessionConfiguration {
            user_agent: Some("netkit-test".to_string()),
            ..SessionConfiguration::default()
        };
        let session = Session::with_configuration(MockTransport::new(), config);
        let forked = session.fork();
        let created = Arc::new(Created::default());
        session.delegate().set_lifecycle_interceptor(&created);

        assert!(session.delegate().is_registered(Capability::Lifecycle));
        assert!(!forked.delegate().is_registered(Capability::Lifecycle));
        assert_eq!(forked.configuration().user_agent.as_deref(), Some("netkit-test"));
    }

    #[test]
    fn spawn_prepares_then_starts_then_finishes_once() {
        let transport = MockTransport::new();
        let session = Session::new(transport.clone());
        let created = Arc::new(Created::default());
        session.delegate().set_lifecycle_interceptor(&created);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = spawn_data(&session, seen.clone());
        assert_eq!(transport.started(), 1);
        assert_eq!(transport.last_task(), handle.id());
        assert_eq!(*created.0.lock().unwrap(), vec![handle.id()]);

        transport.finish_data(handle.id(), ok_response(200, "abcd"));
        assert!(handle.is_finished());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![format!("prepare {}", handle.id().get()), "sink Ok(4)".to_string()]
        );
    }

    #[test]
    fn finish_is_skipped_after_cancel() {
        let transport = MockTransport::new();
        let session = Session::new(transport.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = spawn_data(&session, seen.clone());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(transport.cancelled(), vec![handle.id()]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], format!("sink {:?}", Err::<usize, _>(NetworkingError::Cancelled)));
    }
}
