//! Connection lifecycle for the single ring link.
//!
//! [`ConnectionManager`] is the only place that creates, replaces or tears
//! down a link. Everything else holds a [`Connection`], a cheap handle that
//! observes the lifecycle but cannot change it.

use futures::StreamExt;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle, time::timeout};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, RingError, TransportError},
    events::{ListenerRegistry, Subscription},
    protocol::Channel,
    transport::{LinkEvent, LinkEventStream, LinkOptions, RingTransport, ServiceInfo},
    types::{ConnectionParams, ConnectionState, DeviceId},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why the connection state changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    /// A connect call completed
    Established,
    /// The caller asked for a disconnect
    Requested,
    /// The link dropped without being asked to
    LinkLost,
    /// A connect to a different ring replaced this link
    Replaced,
}

/// Notification delivered to connection-change listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChange {
    /// Ring the change applies to
    pub device_id: DeviceId,
    /// State after the change
    pub state: ConnectionState,
    /// What triggered it
    pub cause: ChangeCause,
}

struct ActiveMonitor {
    channel: Channel,
    task: JoinHandle<()>,
}

struct ConnectionInner {
    serial: u64,
    device_id: DeviceId,
    adopted: bool,
    services: Vec<ServiceInfo>,
    transport: Arc<dyn RingTransport>,
    state: Mutex<ConnectionState>,
    monitors: Mutex<HashMap<u64, ActiveMonitor>>,
    next_monitor: AtomicU64,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a live (or formerly live) ring link
///
/// Clones share the same link. Once the manager tears the link down, every
/// clone reports [`ConnectionState::Disconnected`] and refuses new monitors.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("device_id", &self.inner.device_id)
            .field("state", &self.state())
            .field("adopted", &self.inner.adopted)
            .finish_non_exhaustive()
    }
}

/// Removal outcome for one monitor registration
pub(crate) struct ReleasedMonitor {
    pub(crate) channel: Channel,
    pub(crate) last_on_channel: bool,
}

impl Connection {
    fn new(
        serial: u64,
        device_id: DeviceId,
        adopted: bool,
        services: Vec<ServiceInfo>,
        transport: Arc<dyn RingTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                serial,
                device_id,
                adopted,
                services,
                transport,
                state: Mutex::new(ConnectionState::Ready),
                monitors: Mutex::new(HashMap::new()),
                next_monitor: AtomicU64::new(0),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Ring this link belongs to
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    /// Current lifecycle state of this link
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// Whether monitors and commands may use this link
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Whether the link was already up at the platform level and was adopted
    #[must_use]
    pub fn was_adopted(&self) -> bool {
        self.inner.adopted
    }

    /// Services enumerated when the link came up
    #[must_use]
    pub fn services(&self) -> &[ServiceInfo] {
        &self.inner.services
    }

    /// Whether the ring exposes a channel
    #[must_use]
    pub fn exposes(&self, channel: &Channel) -> bool {
        ServiceInfo::exposes(&self.inner.services, channel)
    }

    /// Number of monitors registered on this link
    #[must_use]
    pub fn active_monitors(&self) -> usize {
        lock(&self.inner.monitors).len()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn RingTransport> {
        &self.inner.transport
    }

    pub(crate) fn require_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RingError::NoActiveConnection)
        }
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }

    /// Track a monitor task; a link that is no longer ready aborts it instead
    pub(crate) fn register_monitor(&self, channel: Channel, task: JoinHandle<()>) -> Result<u64> {
        let mut monitors = lock(&self.inner.monitors);
        if !self.is_ready() {
            task.abort();
            return Err(RingError::NoActiveConnection);
        }

        let id = self.inner.next_monitor.fetch_add(1, Ordering::Relaxed);
        monitors.insert(id, ActiveMonitor { channel, task });
        Ok(id)
    }

    pub(crate) fn release_monitor(&self, id: u64) -> Option<ReleasedMonitor> {
        let mut monitors = lock(&self.inner.monitors);
        let monitor = monitors.remove(&id)?;
        monitor.task.abort();

        let last_on_channel = !monitors.values().any(|m| m.channel == monitor.channel);
        Some(ReleasedMonitor {
            channel: monitor.channel,
            last_on_channel,
        })
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.inner.state) = state;
    }

    fn set_watcher(&self, watcher: JoinHandle<()>) {
        *lock(&self.inner.watcher) = Some(watcher);
    }

    fn take_watcher(&self) -> Option<JoinHandle<()>> {
        lock(&self.inner.watcher).take()
    }

    /// Abort every monitor task, returning the distinct channels they used
    fn release_all_monitors(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = Vec::new();
        for (_, monitor) in lock(&self.inner.monitors).drain() {
            monitor.task.abort();
            if !channels.contains(&monitor.channel) {
                channels.push(monitor.channel);
            }
        }
        channels
    }
}

/// Non-owning reference held by monitor handles
#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}

struct Shared {
    transport: Arc<dyn RingTransport>,
    params: ConnectionParams,
    current: Mutex<Option<Connection>>,
    state: Mutex<ConnectionState>,
    listeners: ListenerRegistry<ConnectionChange>,
    operation: AsyncMutex<()>,
    next_serial: AtomicU64,
}

/// Owner of the single ring connection
///
/// Connect and disconnect are serialized; a link loss reported by the
/// transport is handled by a watcher task and surfaces to listeners as a
/// [`ChangeCause::LinkLost`] change.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("params", &self.shared.params)
            .finish_non_exhaustive()
    }
}

fn map_connect_error(error: TransportError, timeout_ms: u64) -> RingError {
    match error {
        TransportError::Timeout => RingError::ConnectionTimeout { timeout_ms },
        TransportError::Cancelled => RingError::ConnectionCancelled,
        TransportError::AlreadyConnected => RingError::AlreadyConnectedElsewhere,
        TransportError::PermissionDenied => RingError::PermissionDenied,
        other => RingError::ConnectionFailed(other.to_string()),
    }
}

impl ConnectionManager {
    /// Create a manager driving `transport`
    #[must_use]
    pub fn new(transport: Arc<dyn RingTransport>, params: ConnectionParams) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                params,
                current: Mutex::new(None),
                state: Mutex::new(ConnectionState::Disconnected),
                listeners: ListenerRegistry::new(),
                operation: AsyncMutex::new(()),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    /// Connection parameters in use
    #[must_use]
    pub fn params(&self) -> &ConnectionParams {
        &self.shared.params
    }

    /// Lifecycle state of the managed link
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    /// Whether a ready link exists
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|connection| connection.is_ready())
    }

    /// The live connection, if any
    #[must_use]
    pub fn current(&self) -> Option<Connection> {
        lock(&self.shared.current).clone()
    }

    /// The live connection
    ///
    /// # Errors
    ///
    /// Returns [`RingError::NoActiveConnection`] when no ready link exists.
    pub fn require_connection(&self) -> Result<Connection> {
        self.current()
            .filter(Connection::is_ready)
            .ok_or(RingError::NoActiveConnection)
    }

    /// Register a connection-change listener
    pub fn on_connection_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionChange) + Send + Sync + 'static,
    {
        self.shared.listeners.add(listener)
    }

    /// Connect to a ring
    ///
    /// Returns the existing handle when already connected to `id`, replaces a
    /// link to any other ring, and adopts a link the platform already holds
    /// without negotiating a new one.
    ///
    /// # Errors
    ///
    /// - [`RingError::ConnectionTimeout`] if negotiation exceeds the connect timeout
    /// - [`RingError::ConnectionCancelled`] if the peer or platform cancelled
    /// - [`RingError::AlreadyConnectedElsewhere`] if the ring is held by another central
    /// - [`RingError::ConnectionFailed`] for any other failure, including service discovery
    pub async fn connect(&self, id: &DeviceId) -> Result<Connection> {
        let _operation = self.shared.operation.lock().await;

        let existing = lock(&self.shared.current).clone();
        if let Some(existing) = existing {
            if existing.device_id() == id && existing.is_ready() {
                debug!("Already connected to {id}");
                return Ok(existing);
            }

            info!("Replacing connection to {} with {id}", existing.device_id());
            self.shared.teardown(ChangeCause::Replaced).await;
        }

        self.shared.set_state(ConnectionState::Connecting);
        match self.shared.establish(id).await {
            Ok(connection) => {
                *lock(&self.shared.current) = Some(connection.clone());
                self.shared.set_state(ConnectionState::Ready);
                info!(
                    "Connected to {id} ({} services{})",
                    connection.services().len(),
                    if connection.was_adopted() { ", adopted" } else { "" }
                );
                self.shared.listeners.emit(&ConnectionChange {
                    device_id: id.clone(),
                    state: ConnectionState::Ready,
                    cause: ChangeCause::Established,
                });
                Ok(connection)
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                warn!("Connection to {id} failed: {e}");
                Err(e)
            }
        }
    }

    /// Tear down the current link
    ///
    /// Releases every monitor, asks the transport to terminate the link and
    /// clears state. Transport errors during teardown are logged; the local
    /// state is cleared regardless. Does nothing when disconnected.
    pub async fn disconnect(&self) {
        let _operation = self.shared.operation.lock().await;
        self.shared.teardown(ChangeCause::Requested).await;
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    async fn establish(self: &Arc<Self>, id: &DeviceId) -> Result<Connection> {
        let timeout_ms = self.params.connect_timeout_ms;

        let adopted = match self.transport.is_connected(id).await {
            Ok(connected) => connected,
            Err(e) => {
                debug!("Could not query link state for {id}: {e}");
                false
            }
        };

        if adopted {
            info!("{id} is already linked at the platform level, adopting");
        } else {
            info!("Connecting to {id}");
            let options = LinkOptions {
                mtu: self.params.requested_mtu,
            };
            match timeout(
                Duration::from_millis(timeout_ms),
                self.transport.connect(id, &options),
            )
            .await
            {
                Err(_) => return Err(RingError::ConnectionTimeout { timeout_ms }),
                Ok(Err(e)) => return Err(map_connect_error(e, timeout_ms)),
                Ok(Ok(())) => {}
            }
        }

        let link_events = match self.transport.link_events().await {
            Ok(events) => Some(events),
            Err(e) => {
                warn!("Link-loss events unavailable for {id}: {e}");
                None
            }
        };

        let services = match self.transport.discover_services(id).await {
            Ok(services) => services,
            Err(e) => {
                if !adopted {
                    if let Err(disconnect_error) = self.transport.disconnect(id).await {
                        debug!("Cleanup disconnect of {id} failed: {disconnect_error}");
                    }
                }
                return Err(map_connect_error(e, timeout_ms));
            }
        };
        debug!("Discovered {} services on {id}", services.len());

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(
            serial,
            id.clone(),
            adopted,
            services,
            Arc::clone(&self.transport),
        );

        if let Some(events) = link_events {
            connection.set_watcher(self.spawn_watcher(events, id.clone(), serial));
        }

        Ok(connection)
    }

    fn spawn_watcher(self: &Arc<Self>, mut events: LinkEventStream, id: DeviceId, serial: u64) -> JoinHandle<()> {
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let LinkEvent::Disconnected(lost) = event;
                if lost != id {
                    continue;
                }

                if let Some(shared) = shared.upgrade() {
                    shared.handle_link_loss(serial).await;
                }
                break;
            }
        })
    }

    async fn handle_link_loss(&self, serial: u64) {
        let _operation = self.operation.lock().await;

        let lost = {
            let mut current = lock(&self.current);
            match current.as_ref() {
                Some(connection) if connection.inner.serial == serial => current.take(),
                _ => None,
            }
        };
        let Some(connection) = lost else {
            return;
        };

        warn!("Link to {} lost", connection.device_id());
        connection.set_state(ConnectionState::Disconnected);
        // Running on the watcher itself; detach rather than abort.
        drop(connection.take_watcher());
        connection.release_all_monitors();
        self.set_state(ConnectionState::Disconnected);

        self.listeners.emit(&ConnectionChange {
            device_id: connection.device_id().clone(),
            state: ConnectionState::Disconnected,
            cause: ChangeCause::LinkLost,
        });
    }

    /// Caller holds the operation lock
    async fn teardown(&self, cause: ChangeCause) {
        let Some(connection) = lock(&self.current).take() else {
            debug!("Disconnect requested with no active connection");
            return;
        };

        let id = connection.device_id().clone();
        info!("Disconnecting from {id}");
        self.set_state(ConnectionState::Disconnecting);
        connection.set_state(ConnectionState::Disconnecting);

        if let Some(watcher) = connection.take_watcher() {
            watcher.abort();
        }

        for channel in connection.release_all_monitors() {
            if let Err(e) = self.transport.unsubscribe(&id, &channel).await {
                debug!("Unsubscribe from {channel} during teardown failed: {e}");
            }
        }

        if let Err(e) = self.transport.disconnect(&id).await {
            error!("Failed to terminate link to {id}: {e}");
        }

        connection.set_state(ConnectionState::Disconnected);
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected from {id}");

        self.listeners.emit(&ConnectionChange {
            device_id: id,
            state: ConnectionState::Disconnected,
            cause,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTransport, TransportCall};
    use tokio_test::{assert_err, assert_ok};

    fn manager(mock: &Arc<MockTransport>) -> ConnectionManager {
        let transport: Arc<dyn RingTransport> = Arc::clone(mock) as Arc<dyn RingTransport>;
        ConnectionManager::new(transport, ConnectionParams::default())
    }

    fn record_changes(manager: &ConnectionManager) -> (Arc<Mutex<Vec<ConnectionChange>>>, Subscription) {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let subscription = manager.on_connection_change(move |change| {
            lock(&sink).push(change.clone());
        });
        (changes, subscription)
    }

    #[tokio::test]
    async fn test_connect_negotiates_new_link() {
        let mock = Arc::new(MockTransport::new());
        let manager = manager(&mock);
        let (changes, _subscription) = record_changes(&manager);

        let connection = assert_ok!(manager.connect(&DeviceId::from("ring-1")).await);

        assert!(manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Ready);
        assert!(!connection.was_adopted());
        assert!(connection.exposes(&Channel::VENDOR_COMMAND));
        assert_eq!(mock.count_calls(|c| matches!(c, TransportCall::Connect(_))), 1);

        let changes = lock(&changes);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].cause, ChangeCause::Established);
    }

    #[tokio::test]
    async fn test_connect_adopts_platform_link() {
        let mock = Arc::new(MockTransport::new());
        mock.add_os_connected("ring-1", Some("R02_AB12"));
        let manager = manager(&mock);

        let connection = assert_ok!(manager.connect(&DeviceId::from("ring-1")).await);

        assert!(connection.was_adopted());
        assert_eq!(mock.count_calls(|c| matches!(c, TransportCall::Connect(_))), 0);
        assert_eq!(
            mock.count_calls(|c| matches!(c, TransportCall::DiscoverServices(_))),
            1
        );
    }

    #[tokio::test]
    async fn test_connect_same_ring_returns_existing_handle() {
        let mock = Arc::new(MockTransport::new());
        let manager = manager(&mock);
        let id = DeviceId::from("ring-1");

        let first = assert_ok!(manager.connect(&id).await);
        let second = assert_ok!(manager.connect(&id).await);

        assert_eq!(first.inner.serial, second.inner.serial);
        assert_eq!(mock.count_calls(|c| matches!(c, TransportCall::Connect(_))), 1);
    }

    #[tokio::test]
    async fn test_connect_other_ring_replaces_link() {
        let mock = Arc::new(MockTransport::new());
        let manager = manager(&mock);
        let (changes, _subscription) = record_changes(&manager);

        let first = assert_ok!(manager.connect(&DeviceId::from("ring-1")).await);
        let second = assert_ok!(manager.connect(&DeviceId::from("ring-2")).await);

        assert_eq!(first.state(), ConnectionState::Disconnected);
        assert!(second.is_ready());
        assert_eq!(manager.current().unwrap().device_id().as_str(), "ring-2");
        assert!(mock
            .calls()
            .contains(&TransportCall::Disconnect(DeviceId::from("ring-1"))));

        let causes: Vec<ChangeCause> = lock(&changes).iter().map(|c| c.cause).collect();
        assert_eq!(
            causes,
            vec![
                ChangeCause::Established,
                ChangeCause::Replaced,
                ChangeCause::Established
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let mock = Arc::new(MockTransport::new());
        mock.hang_on_connect(true);
        let manager = manager(&mock);

        let error = assert_err!(manager.connect(&DeviceId::from("ring-1")).await);

        assert!(matches!(
            error,
            RingError::ConnectionTimeout { timeout_ms: 10_000 }
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_connect_error_mapping() {
        let cases = [
            (TransportError::Cancelled, "cancelled"),
            (TransportError::AlreadyConnected, "busy"),
            (TransportError::Other("GATT 133".to_string()), "other"),
        ];

        for (transport_error, label) in cases {
            let mock = Arc::new(MockTransport::new());
            mock.fail_next_connect(transport_error);
            let manager = manager(&mock);

            let error = assert_err!(manager.connect(&DeviceId::from("ring-1")).await);
            match label {
                "cancelled" => assert!(matches!(error, RingError::ConnectionCancelled)),
                "busy" => assert!(matches!(error, RingError::AlreadyConnectedElsewhere)),
                _ => assert!(matches!(error, RingError::ConnectionFailed(_))),
            }
            assert!(error.user_guidance().is_some() || label == "other");
        }
    }

    #[tokio::test]
    async fn test_failed_discovery_cleans_up_fresh_link() {
        let mock = Arc::new(MockTransport::new());
        mock.fail_next_discovery(TransportError::Other("GATT error".to_string()));
        let manager = manager(&mock);

        let error = assert_err!(manager.connect(&DeviceId::from("ring-1")).await);

        assert!(matches!(error, RingError::ConnectionFailed(_)));
        assert!(!mock.is_linked("ring-1"));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_clears_state_even_on_error() {
        let mock = Arc::new(MockTransport::new());
        mock.fail_disconnect(true);
        let manager = manager(&mock);
        let connection = assert_ok!(manager.connect(&DeviceId::from("ring-1")).await);

        manager.disconnect().await;

        assert!(!manager.is_connected());
        assert!(manager.current().is_none());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            connection.require_ready(),
            Err(RingError::NoActiveConnection)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_noop() {
        let mock = Arc::new(MockTransport::new());
        let manager = manager(&mock);

        manager.disconnect().await;
        manager.disconnect().await;

        assert!(mock.calls().is_empty());
        assert!(matches!(
            manager.require_connection(),
            Err(RingError::NoActiveConnection)
        ));
    }

    #[tokio::test]
    async fn test_link_loss_notifies_listeners() {
        let mock = Arc::new(MockTransport::new());
        let manager = manager(&mock);
        let (changes, _subscription) = record_changes(&manager);
        let connection = assert_ok!(manager.connect(&DeviceId::from("ring-1")).await);

        let deliveries = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&deliveries);
        let handle = assert_ok!(
            crate::monitor::CharacteristicMonitor::new()
                .monitor(&connection, Channel::VENDOR_DATA, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await
        );
        assert_eq!(connection.active_monitors(), 1);

        mock.drop_link("ring-1");
        for _ in 0..50 {
            if !manager.is_connected() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!manager.is_connected());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        let last = lock(&changes).last().cloned().unwrap();
        assert_eq!(last.cause, ChangeCause::LinkLost);
        assert_eq!(last.state, ConnectionState::Disconnected);

        assert_eq!(connection.active_monitors(), 0);
        assert!(!handle.is_active());
        mock.notify(Channel::VENDOR_DATA, vec![0x01, 70, 30, 0]);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(deliveries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listener_unsubscribe_is_independent() {
        let mock = Arc::new(MockTransport::new());
        let manager = manager(&mock);
        let (first, first_subscription) = record_changes(&manager);
        let (second, _second_subscription) = record_changes(&manager);

        first_subscription.unsubscribe();
        first_subscription.unsubscribe();
        assert_ok!(manager.connect(&DeviceId::from("ring-1")).await);

        assert!(lock(&first).is_empty());
        assert_eq!(lock(&second).len(), 1);
    }
}
