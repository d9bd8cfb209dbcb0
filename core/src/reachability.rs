//! Network reachability monitoring.
//!
//! The host owns the platform path observer and reports snapshots through
//! `PathObserver`. `NetworkMonitor` classifies each snapshot and fans it out
//! to subscribers.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};

use crate::events::{EventStream, Subscribers};

/// Physical interface kinds a platform path can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    Wifi,
    Cellular,
    WiredEthernet,
    Loopback,
    Other,
}

/// Snapshot of the platform's current network path.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkPath {
    pub satisfied: bool,
    pub interfaces: Vec<InterfaceType>,
    pub expensive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Wired,
    Unknown,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionType::Wifi => "wifi",
            ConnectionType::Cellular => "cellular",
            ConnectionType::Wired => "wired",
            ConnectionType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub connected: bool,
    pub connection_type: ConnectionType,
    pub expensive: bool,
}

impl From<&NetworkPath> for NetworkStatus {
    /// Wi-Fi wins over wired, wired over cellular.
    fn from(path: &NetworkPath) -> Self {
        let has = |kind| path.interfaces.contains(&kind);
        let connection_type = if has(InterfaceType::Wifi) {
            ConnectionType::Wifi
        } else if has(InterfaceType::WiredEthernet) {
            ConnectionType::Wired
        } else if has(InterfaceType::Cellular) {
            ConnectionType::Cellular
        } else {
            ConnectionType::Unknown
        };
        Self {
            connected: path.satisfied,
            connection_type,
            expensive: path.expensive,
        }
    }
}

pub type PathHandler = Arc<dyn Fn(NetworkPath) + Send + Sync>;

/// Host-side observer of platform connectivity.
///
/// `start` begins one observation that calls `handler` on every path change;
/// `stop` ends it.
pub trait PathObserver: Send + Sync {
    fn start(&self, handler: PathHandler);
    fn stop(&self);
}

struct Shared {
    current: Mutex<Option<NetworkStatus>>,
    updates: Subscribers<NetworkStatus>,
}

impl Shared {
    fn observe(&self, path: NetworkPath) {
        let status = NetworkStatus::from(&path);
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(
            connected = status.connected,
            connection_type = %status.connection_type,
            expensive = status.expensive,
            "network path changed"
        );
        *current = Some(status);
        self.updates.publish(status);
    }
}

pub struct NetworkMonitor {
    observer: Arc<dyn PathObserver>,
    shared: Arc<Shared>,
    monitoring: Mutex<bool>,
}

impl NetworkMonitor {
    pub fn new(observer: Arc<dyn PathObserver>) -> Self {
        Self {
            observer,
            shared: Arc::new(Shared {
                current: Mutex::new(None),
                updates: Subscribers::new(usize::MAX),
            }),
            monitoring: Mutex::new(false),
        }
    }

    /// Begin observing. Calling it again while monitoring does nothing.
    pub fn start_monitoring(&self) {
        let mut monitoring = self.monitoring.lock().unwrap_or_else(PoisonError::into_inner);
        if *monitoring {
            return;
        }
        *monitoring = true;
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        self.observer.start(Arc::new(move |path| {
            if let Some(shared) = shared.upgrade() {
                shared.observe(path);
            }
        }));
    }

    /// Stop observing. Does nothing if not monitoring.
    pub fn stop_monitoring(&self) {
        let mut monitoring = self.monitoring.lock().unwrap_or_else(PoisonError::into_inner);
        if !*monitoring {
            return;
        }
        *monitoring = false;
        self.observer.stop();
    }

    pub fn is_monitoring(&self) -> bool {
        *self.monitoring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The latest status, or `None` before the first snapshot.
    pub fn current_status(&self) -> Option<NetworkStatus> {
        *self.shared.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Statuses observed from now on.
    pub fn status_updates(&self) -> EventStream<NetworkStatus> {
        self.shared.updates.subscribe()
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
        self.shared.updates.close();
    }
}

impl fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("monitoring", &self.is_monitoring())
            .field("current", &self.current_status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[derive(Default)]
    struct FakeObserver {
        starts: Mutex<usize>,
        stops: Mutex<usize>,
        handler: Mutex<Option<PathHandler>>,
    }

    impl FakeObserver {
        fn emit(&self, path: NetworkPath) {
            let handler = self.handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler(path);
            }
        }
    }

    impl PathObserver for FakeObserver {
        fn start(&self, handler: PathHandler) {
            *self.starts.lock().unwrap() += 1;
            *self.handler.lock().unwrap() = Some(handler);
        }

        fn stop(&self) {
            *self.stops.lock().unwrap() += 1;
            self.handler.lock().unwrap().take();
        }
    }

    fn path(satisfied: bool, interfaces: &[InterfaceType]) -> NetworkPath {
        NetworkPath {
            satisfied,
            interfaces: interfaces.to_vec(),
            expensive: false,
        }
    }

    #[test]
    fn classification_prefers_wifi_then_wired_then_cellular() {
        use InterfaceType::*;
        let kind = |interfaces: &[InterfaceType]| NetworkStatus::from(&path(true, interfaces)).connection_type;
        assert_eq!(kind(&[Cellular, Wifi]), ConnectionType::Wifi);
        assert_eq!(kind(&[Cellular, WiredEthernet]), ConnectionType::Wired);
        assert_eq!(kind(&[Cellular]), ConnectionType::Cellular);
        assert_eq!(kind(&[Loopback, Other]), ConnectionType::Unknown);
        assert_eq!(kind(&[]), ConnectionType::Unknown);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let observer = Arc::new(FakeObserver::default());
        let monitor = NetworkMonitor::new(observer.clone());
        monitor.stop_monitoring();
        monitor.start_monitoring();
        monitor.start_monitoring();
        assert_eq!(*observer.starts.lock().unwrap(), 1);
        monitor.stop_monitoring();
        monitor.stop_monitoring();
        assert_eq!(*observer.stops.lock().unwrap(), 1);
        assert!(!monitor.is_monitoring());
    }

    #[tokio::test]
    async fn emits_a_snapshot_per_change() {
        let observer = Arc::new(FakeObserver::default());
        let monitor = NetworkMonitor::new(observer.clone());
        let mut updates = monitor.status_updates();
        assert_eq!(monitor.current_status(), None);

        monitor.start_monitoring();
        observer.emit(path(true, &[InterfaceType::Wifi]));
        observer.emit(NetworkPath {
            satisfied: true,
            interfaces: vec![InterfaceType::Cellular],
            expensive: true,
        });
        observer.emit(path(false, &[]));

        let expected = NetworkStatus {
            connected: false,
            connection_type: ConnectionType::Unknown,
            expensive: false,
        };
        assert_eq!(monitor.current_status(), Some(expected));
        drop(monitor);

        let seen: Vec<_> = updates.by_ref().collect().await;
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].connection_type, ConnectionType::Wifi);
        assert!(seen[1].expensive);
        assert_eq!(seen[2], expected);
        assert_eq!(*observer.stops.lock().unwrap(), 1);
    }
}
