use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::{error::TransportError, protocol::Channel, types::DeviceId};

/// Result type for transport backends
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Stream of advertisements produced while scanning
pub type AdvertisementStream = BoxStream<'static, TransportResult<Advertisement>>;

/// Stream of characteristic notifications, in transmission order
pub type NotificationStream = BoxStream<'static, TransportResult<Bytes>>;

/// Stream of unsolicited link events
pub type LinkEventStream = BoxStream<'static, LinkEvent>;

/// One advertisement (or OS-level connected device) seen by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform identifier
    pub id: DeviceId,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength, if the platform reported one
    pub rssi: Option<i16>,
}

/// A discovered GATT service and its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristic UUIDs exposed by the service
    pub characteristics: Vec<Uuid>,
}

impl ServiceInfo {
    /// Whether `services` exposes the given channel
    #[must_use]
    pub fn exposes(services: &[Self], channel: &Channel) -> bool {
        services.iter().any(|service| {
            service.uuid == channel.service && service.characteristics.contains(&channel.characteristic)
        })
    }
}

/// Unsolicited event on a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link to this device dropped
    Disconnected(DeviceId),
}

/// Link negotiation options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    /// Payload size to request; backends without MTU negotiation ignore it
    pub mtu: u16,
}

/// Write acknowledgment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Wait for the ring to acknowledge the write
    WithResponse,
    /// Fire and forget
    WithoutResponse,
}

/// Radio backend the core drives
///
/// The core never touches a platform handle directly; everything it needs
/// from the radio goes through this trait, so the same connection and
/// dispatch logic runs against btleplug or the in-memory [`crate::mock`]
/// backend.
#[async_trait]
pub trait RingTransport: Send + Sync {
    /// Request the permissions discovery and connection need
    async fn request_permissions(&self) -> TransportResult<bool>;

    /// Devices the platform already holds a link to
    async fn connected_devices(&self) -> TransportResult<Vec<Advertisement>>;

    /// Start radio discovery
    async fn start_scan(&self) -> TransportResult<AdvertisementStream>;

    /// Stop radio discovery
    async fn stop_scan(&self) -> TransportResult<()>;

    /// Whether the platform reports a live link to `id`
    async fn is_connected(&self, id: &DeviceId) -> TransportResult<bool>;

    /// Negotiate a new link
    async fn connect(&self, id: &DeviceId, options: &LinkOptions) -> TransportResult<()>;

    /// Enumerate services and characteristics on a live link
    async fn discover_services(&self, id: &DeviceId) -> TransportResult<Vec<ServiceInfo>>;

    /// Terminate the link
    async fn disconnect(&self, id: &DeviceId) -> TransportResult<()>;

    /// Unsolicited link events for all devices
    async fn link_events(&self) -> TransportResult<LinkEventStream>;

    /// Enable notifications on a channel
    async fn subscribe(&self, id: &DeviceId, channel: &Channel) -> TransportResult<NotificationStream>;

    /// Disable notifications on a channel
    async fn unsubscribe(&self, id: &DeviceId, channel: &Channel) -> TransportResult<()>;

    /// Write bytes to a channel
    async fn write(
        &self,
        id: &DeviceId,
        channel: &Channel,
        data: &[u8],
        kind: WriteKind,
    ) -> TransportResult<()>;

    /// Read the current value of a channel
    async fn read(&self, id: &DeviceId, channel: &Channel) -> TransportResult<Bytes>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_table_lookup() {
        let services = vec![ServiceInfo {
            uuid: Channel::BATTERY_LEVEL.service,
            characteristics: vec![Channel::BATTERY_LEVEL.characteristic],
        }];

        assert!(ServiceInfo::exposes(&services, &Channel::BATTERY_LEVEL));
        assert!(!ServiceInfo::exposes(&services, &Channel::VENDOR_DATA));
    }
}
