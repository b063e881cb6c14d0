//! In-memory [`RingTransport`] for tests and demos without hardware.
//!
//! The mock records every call it receives, lets the caller inject
//! notifications and link loss, and can be told to fail specific operations
//! the way real firmware and radio stacks do.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::sync::{broadcast, mpsc};

use crate::{
    error::TransportError,
    protocol::Channel,
    transport::{
        Advertisement, AdvertisementStream, LinkEvent, LinkEventStream, LinkOptions,
        NotificationStream, RingTransport, ServiceInfo, TransportResult, WriteKind,
    },
    types::DeviceId,
};

/// A call received by the mock, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `request_permissions`
    RequestPermissions,
    /// `connected_devices`
    ConnectedDevices,
    /// `start_scan`
    StartScan,
    /// `stop_scan`
    StopScan,
    /// `is_connected`
    IsConnected(DeviceId),
    /// `connect`
    Connect(DeviceId),
    /// `discover_services`
    DiscoverServices(DeviceId),
    /// `disconnect`
    Disconnect(DeviceId),
    /// `subscribe`
    Subscribe(Channel),
    /// `unsubscribe`
    Unsubscribe(Channel),
    /// `write`
    Write {
        /// Target channel
        channel: Channel,
        /// Bytes written
        data: Vec<u8>,
        /// Acknowledgment mode
        kind: WriteKind,
    },
    /// `read`
    Read(Channel),
}

type NotificationSender = mpsc::UnboundedSender<TransportResult<Bytes>>;

#[derive(Default)]
struct MockState {
    permissions_granted: bool,
    advertisements: Vec<Advertisement>,
    os_connected: Vec<Advertisement>,
    linked: HashSet<DeviceId>,
    services: Vec<ServiceInfo>,
    connect_failure: Option<TransportError>,
    discovery_failure: Option<TransportError>,
    hang_on_connect: bool,
    scan_failure: Option<TransportError>,
    scan_interruption: Option<(usize, TransportError)>,
    failing_writes: HashSet<Channel>,
    fail_disconnect: bool,
    subscribers: HashMap<Channel, Vec<NotificationSender>>,
    read_values: HashMap<Channel, Bytes>,
    calls: Vec<TransportCall>,
}

/// Scriptable in-memory transport
pub struct MockTransport {
    state: Mutex<MockState>,
    link_events: broadcast::Sender<LinkEvent>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("calls", &self.lock().calls.len())
            .finish_non_exhaustive()
    }
}

/// Service table of a ring exposing every known channel
#[must_use]
pub fn ring_services() -> Vec<ServiceInfo> {
    let mut services: Vec<ServiceInfo> = Vec::new();
    for channel in [
        Channel::HEART_RATE_MEASUREMENT,
        Channel::HEART_RATE_CONTROL_POINT,
        Channel::BATTERY_LEVEL,
        Channel::VENDOR_DATA,
        Channel::VENDOR_COMMAND,
        Channel::SECONDARY_DATA,
    ] {
        if let Some(service) = services.iter_mut().find(|s| s.uuid == channel.service) {
            service.characteristics.push(channel.characteristic);
        } else {
            services.push(ServiceInfo {
                uuid: channel.service,
                characteristics: vec![channel.characteristic],
            });
        }
    }
    services
}

impl MockTransport {
    /// A transport with permissions granted and a full ring service table
    #[must_use]
    pub fn new() -> Self {
        let (link_events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(MockState {
                permissions_granted: true,
                services: ring_services(),
                ..MockState::default()
            }),
            link_events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: TransportCall) {
        self.lock().calls.push(call);
    }

    /// Queue an advertisement returned once scanning starts
    pub fn add_advertisement(&self, id: &str, name: Option<&str>, rssi: i16) {
        self.lock().advertisements.push(Advertisement {
            id: DeviceId::from(id),
            name: name.map(str::to_string),
            rssi: Some(rssi),
        });
    }

    /// Mark a device as already linked at the platform level
    pub fn add_os_connected(&self, id: &str, name: Option<&str>) {
        let mut state = self.lock();
        state.linked.insert(DeviceId::from(id));
        state.os_connected.push(Advertisement {
            id: DeviceId::from(id),
            name: name.map(str::to_string),
            rssi: None,
        });
    }

    /// Grant or deny permissions
    pub fn set_permissions(&self, granted: bool) {
        self.lock().permissions_granted = granted;
    }

    /// Replace the service table returned by discovery
    pub fn set_services(&self, services: Vec<ServiceInfo>) {
        self.lock().services = services;
    }

    /// Fail the next link negotiation
    pub fn fail_next_connect(&self, error: TransportError) {
        self.lock().connect_failure = Some(error);
    }

    /// Fail the next service discovery
    pub fn fail_next_discovery(&self, error: TransportError) {
        self.lock().discovery_failure = Some(error);
    }

    /// Make link negotiation never complete
    pub fn hang_on_connect(&self, hang: bool) {
        self.lock().hang_on_connect = hang;
    }

    /// Fail the next scan start
    pub fn fail_scan(&self, error: TransportError) {
        self.lock().scan_failure = Some(error);
    }

    /// Break the next scan stream with an error after `count` advertisements
    pub fn fail_scan_after(&self, count: usize, error: TransportError) {
        self.lock().scan_interruption = Some((count, error));
    }

    /// Reject every write to a channel
    pub fn fail_writes_to(&self, channel: Channel) {
        self.lock().failing_writes.insert(channel);
    }

    /// Make link termination report an error
    pub fn fail_disconnect(&self, fail: bool) {
        self.lock().fail_disconnect = fail;
    }

    /// Value returned by reads of a channel
    pub fn set_read_value(&self, channel: Channel, value: impl Into<Bytes>) {
        self.lock().read_values.insert(channel, value.into());
    }

    /// Deliver a notification to every subscriber of a channel
    pub fn notify(&self, channel: Channel, value: impl Into<Bytes>) {
        self.deliver(channel, Ok(value.into()));
    }

    /// Deliver a read error to every subscriber of a channel
    pub fn notify_error(&self, channel: Channel, error: TransportError) {
        self.deliver(channel, Err(error));
    }

    fn deliver(&self, channel: Channel, item: TransportResult<Bytes>) {
        let mut state = self.lock();
        if let Some(senders) = state.subscribers.get_mut(&channel) {
            senders.retain(|sender| sender.send(item.clone()).is_ok());
        }
    }

    /// Simulate an unsolicited link loss
    pub fn drop_link(&self, id: &str) {
        let id = DeviceId::from(id);
        {
            let mut state = self.lock();
            state.linked.remove(&id);
            state.os_connected.retain(|device| device.id != id);
        }
        let _ = self.link_events.send(LinkEvent::Disconnected(id));
    }

    /// Calls received so far
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    /// Bytes written so far, with their channels
    #[must_use]
    pub fn writes(&self) -> Vec<(Channel, Vec<u8>)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Write { channel, data, .. } => Some((*channel, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Count of recorded calls matching a predicate
    pub fn count_calls(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Whether the mock currently holds a link to `id`
    #[must_use]
    pub fn is_linked(&self, id: &str) -> bool {
        self.lock().linked.contains(&DeviceId::from(id))
    }
}

#[async_trait]
impl RingTransport for MockTransport {
    async fn request_permissions(&self) -> TransportResult<bool> {
        self.record(TransportCall::RequestPermissions);
        Ok(self.lock().permissions_granted)
    }

    async fn connected_devices(&self) -> TransportResult<Vec<Advertisement>> {
        self.record(TransportCall::ConnectedDevices);
        Ok(self.lock().os_connected.clone())
    }

    async fn start_scan(&self) -> TransportResult<AdvertisementStream> {
        self.record(TransportCall::StartScan);
        let mut state = self.lock();
        if let Some(error) = state.scan_failure.take() {
            return Err(error);
        }

        let mut items: Vec<TransportResult<Advertisement>> =
            state.advertisements.iter().cloned().map(Ok).collect();
        if let Some((count, error)) = state.scan_interruption.take() {
            items.insert(count.min(items.len()), Err(error));
        }
        Ok(stream::iter(items).chain(stream::pending()).boxed())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.record(TransportCall::StopScan);
        Ok(())
    }

    async fn is_connected(&self, id: &DeviceId) -> TransportResult<bool> {
        self.record(TransportCall::IsConnected(id.clone()));
        Ok(self.lock().linked.contains(id))
    }

    async fn connect(&self, id: &DeviceId, _options: &LinkOptions) -> TransportResult<()> {
        self.record(TransportCall::Connect(id.clone()));
        let (hang, failure) = {
            let mut state = self.lock();
            (state.hang_on_connect, state.connect_failure.take())
        };

        if hang {
            futures::future::pending::<()>().await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        self.lock().linked.insert(id.clone());
        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId) -> TransportResult<Vec<ServiceInfo>> {
        self.record(TransportCall::DiscoverServices(id.clone()));
        let mut state = self.lock();
        if let Some(error) = state.discovery_failure.take() {
            return Err(error);
        }
        if !state.linked.contains(id) {
            return Err(TransportError::NotConnected);
        }
        Ok(state.services.clone())
    }

    async fn disconnect(&self, id: &DeviceId) -> TransportResult<()> {
        self.record(TransportCall::Disconnect(id.clone()));
        let mut state = self.lock();
        state.linked.remove(id);
        state.os_connected.retain(|device| &device.id != id);
        if state.fail_disconnect {
            return Err(TransportError::Other("link termination failed".to_string()));
        }
        Ok(())
    }

    async fn link_events(&self) -> TransportResult<LinkEventStream> {
        let receiver = self.link_events.subscribe();
        Ok(stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }

    async fn subscribe(&self, id: &DeviceId, channel: &Channel) -> TransportResult<NotificationStream> {
        self.record(TransportCall::Subscribe(*channel));
        let mut state = self.lock();
        if !state.linked.contains(id) {
            return Err(TransportError::NotConnected);
        }
        if !ServiceInfo::exposes(&state.services, channel) {
            return Err(TransportError::MissingCharacteristic(channel.to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscribers.entry(*channel).or_default().push(sender);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn unsubscribe(&self, _id: &DeviceId, channel: &Channel) -> TransportResult<()> {
        self.record(TransportCall::Unsubscribe(*channel));
        Ok(())
    }

    async fn write(
        &self,
        id: &DeviceId,
        channel: &Channel,
        data: &[u8],
        kind: WriteKind,
    ) -> TransportResult<()> {
        self.record(TransportCall::Write {
            channel: *channel,
            data: data.to_vec(),
            kind,
        });
        let state = self.lock();
        if !state.linked.contains(id) {
            return Err(TransportError::NotConnected);
        }
        if state.failing_writes.contains(channel) {
            return Err(TransportError::Other(format!("write to {channel} rejected")));
        }
        Ok(())
    }

    async fn read(&self, id: &DeviceId, channel: &Channel) -> TransportResult<Bytes> {
        self.record(TransportCall::Read(*channel));
        let state = self.lock();
        if !state.linked.contains(id) {
            return Err(TransportError::NotConnected);
        }
        state
            .read_values
            .get(channel)
            .cloned()
            .ok_or_else(|| TransportError::MissingCharacteristic(channel.to_string()))
    }
}
