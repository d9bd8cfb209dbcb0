//! Connection lifecycle shared by the SSE and WebSocket clients.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{NetworkingError, Result, StateError};
use crate::events::{EventStream, Subscribers};
use crate::transport::TaskId;

/// Lifecycle of a long-lived connection.
///
/// ```text
/// disconnected -> connecting -> connected -> disconnecting -> disconnected
///                                         -> failed
/// any -> terminated
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed(NetworkingError),
    /// Shut down for good; the client cannot connect again.
    Terminated,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub(crate) fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnecting => f.write_str("disconnecting"),
            ConnectionState::Failed(err) => write!(f, "failed ({err})"),
            ConnectionState::Terminated => f.write_str("terminated"),
        }
    }
}

/// State guarded by the connection lock.
pub(crate) struct Current<X> {
    pub(crate) state: ConnectionState,
    /// Transport task of the live connection attempt.
    pub(crate) task: Option<TaskId>,
    pub(crate) extra: X,
}

impl<X> Current<X> {
    pub(crate) fn is_current(&self, task: TaskId) -> bool {
        self.task == Some(task)
    }
}

/// State machine plus the subscribers that watch it.
///
/// Transitions are published while the lock is held, so every subscriber
/// sees each transition exactly once and in order.
pub(crate) struct ConnectionCore<X> {
    name: &'static str,
    current: Mutex<Current<X>>,
    changes: Subscribers<ConnectionState>,
}

impl<X> ConnectionCore<X> {
    pub(crate) fn new(name: &'static str, extra: X) -> Self {
        Self {
            name,
            current: Mutex::new(Current {
                state: ConnectionState::Disconnected,
                task: None,
                extra,
            }),
            // State changes are never dropped, so the bound is never consulted.
            changes: Subscribers::new(usize::MAX),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Current<X>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    pub(crate) fn changes(&self) -> EventStream<ConnectionState> {
        self.changes.subscribe()
    }

    pub(crate) fn transition(&self, current: &mut Current<X>, next: ConnectionState) {
        tracing::debug!(client = self.name, from = %current.state, to = %next, "connection state");
        current.state = next.clone();
        let terminated = next == ConnectionState::Terminated;
        self.changes.publish(next);
        if terminated {
            self.changes.close();
        }
    }

    /// Move to `Connecting`, failing unless disconnected or failed.
    pub(crate) fn begin_connect(&self, current: &mut Current<X>) -> Result<()> {
        if !current.state.can_connect() {
            return Err(StateError::new("connect", &current.state).into());
        }
        current.task = None;
        self.transition(current, ConnectionState::Connecting);
        Ok(())
    }

    /// Enter the terminal state. Returns the task that was live, if any.
    pub(crate) fn terminate(&self, current: &mut Current<X>) -> Option<TaskId> {
        if current.state == ConnectionState::Terminated {
            return None;
        }
        let task = current.task.take();
        self.transition(current, ConnectionState::Terminated);
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn connect_is_allowed_only_when_idle_or_failed() {
        assert!(ConnectionState::Disconnected.can_connect());
        assert!(ConnectionState::Failed(NetworkingError::Cancelled).can_connect());
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Terminated,
        ] {
            assert!(!state.can_connect(), "{state}");
        }
    }

    #[tokio::test]
    async fn every_transition_is_published_once_in_order() {
        let core = ConnectionCore::new("test", ());
        let mut changes = core.changes();
        {
            let mut current = core.lock();
            core.begin_connect(&mut current).unwrap();
            assert!(core.begin_connect(&mut current).is_err());
            core.transition(&mut current, ConnectionState::Connected);
            core.terminate(&mut current);
            assert_eq!(core.terminate(&mut current), None);
        }
        let seen: Vec<_> = changes.by_ref().collect().await;
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Terminated
            ]
        );
    }

    #[test]
    fn state_error_names_the_state() {
        let core = ConnectionCore::new("test", ());
        let mut current = core.lock();
        current.state = ConnectionState::Connected;
        let err = core.begin_connect(&mut current).unwrap_err();
        assert_eq!(err.to_string(), "cannot connect while connected");
    }
}
