use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::TransportError,
    protocol::Channel,
    transport::{
        Advertisement, AdvertisementStream, LinkEvent, LinkEventStream, LinkOptions,
        NotificationStream, RingTransport, ServiceInfo, TransportResult, WriteKind,
    },
    types::DeviceId,
};

type PeripheralCache = Arc<Mutex<HashMap<DeviceId, Peripheral>>>;

impl From<btleplug::Error> for TransportError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::TimedOut(_) => Self::Timeout,
            btleplug::Error::NotConnected => Self::NotConnected,
            btleplug::Error::PermissionDenied => Self::PermissionDenied,
            btleplug::Error::DeviceNotFound => Self::DeviceNotFound(error.to_string()),
            btleplug::Error::NoSuchCharacteristic => Self::MissingCharacteristic(error.to_string()),
            other => Self::from_message(other.to_string()),
        }
    }
}

/// Desktop radio backend built on btleplug
///
/// Uses the first adapter the platform reports. Peripherals are cached by
/// their platform identifier as they are seen during scanning.
pub struct BtleplugTransport {
    adapter: Adapter,
    peripherals: PeripheralCache,
}

impl std::fmt::Debug for BtleplugTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugTransport").finish_non_exhaustive()
    }
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unavailable`] if no adapter is present, or the
    /// converted btleplug error if the platform manager cannot be created.
    pub async fn new() -> TransportResult<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Unavailable("no Bluetooth adapter found".to_string()))?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter: {info}");
        }

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn peripheral(&self, id: &DeviceId) -> TransportResult<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(id) {
            return Ok(peripheral.clone());
        }

        for peripheral in self.adapter.peripherals().await? {
            let peripheral_id = DeviceId::new(peripheral.id().to_string());
            if &peripheral_id == id {
                self.peripherals
                    .lock()
                    .await
                    .insert(peripheral_id, peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(TransportError::DeviceNotFound(id.to_string()))
    }

    async fn characteristic(&self, id: &DeviceId, channel: &Channel) -> TransportResult<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(id).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == channel.characteristic && c.service_uuid == channel.service)
            .ok_or_else(|| TransportError::MissingCharacteristic(channel.to_string()))?;
        Ok((peripheral, characteristic))
    }
}

async fn advertisement(peripheral: &Peripheral) -> Advertisement {
    let id = DeviceId::new(peripheral.id().to_string());
    match peripheral.properties().await {
        Ok(Some(properties)) => Advertisement {
            id,
            name: properties.local_name,
            rssi: properties.rssi,
        },
        _ => Advertisement {
            id,
            name: None,
            rssi: None,
        },
    }
}

#[async_trait]
impl RingTransport for BtleplugTransport {
    async fn request_permissions(&self) -> TransportResult<bool> {
        // Desktop platforms grant access at the OS level; a powered-off
        // adapter is the only refusal we can observe.
        let state = self.adapter.adapter_state().await?;
        debug!("Adapter state: {state:?}");
        Ok(!matches!(state, CentralState::PoweredOff))
    }

    async fn connected_devices(&self) -> TransportResult<Vec<Advertisement>> {
        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.is_connected().await.unwrap_or(false) {
                let device = advertisement(&peripheral).await;
                self.peripherals
                    .lock()
                    .await
                    .insert(device.id.clone(), peripheral);
                devices.push(device);
            }
        }
        Ok(devices)
    }

    async fn start_scan(&self) -> TransportResult<AdvertisementStream> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Radio scan started");

        let adapter = self.adapter.clone();
        let cache = Arc::clone(&self.peripherals);
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let cache = Arc::clone(&cache);
            async move {
                let peripheral_id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };

                match adapter.peripheral(&peripheral_id).await {
                    Ok(peripheral) => {
                        let device = advertisement(&peripheral).await;
                        cache.lock().await.insert(device.id.clone(), peripheral);
                        Some(Ok(device))
                    }
                    Err(e) => Some(Err(TransportError::from(e))),
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.adapter.stop_scan().await?;
        info!("Radio scan stopped");
        Ok(())
    }

    async fn is_connected(&self, id: &DeviceId) -> TransportResult<bool> {
        match self.peripheral(id).await {
            Ok(peripheral) => Ok(peripheral.is_connected().await?),
            Err(TransportError::DeviceNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn connect(&self, id: &DeviceId, options: &LinkOptions) -> TransportResult<()> {
        let peripheral = self.peripheral(id).await?;
        debug!(
            "Requested MTU {} for {id}; btleplug negotiates the MTU itself",
            options.mtu
        );
        peripheral.connect().await?;
        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId) -> TransportResult<Vec<ServiceInfo>> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;

        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn disconnect(&self, id: &DeviceId) -> TransportResult<()> {
        let peripheral = self.peripheral(id).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn link_events(&self) -> TransportResult<LinkEventStream> {
        let events = self.adapter.events().await?;
        Ok(events
            .filter_map(|event| async move {
                match event {
                    CentralEvent::DeviceDisconnected(id) => {
                        Some(LinkEvent::Disconnected(DeviceId::new(id.to_string())))
                    }
                    _ => None,
                }
            })
            .boxed())
    }

    async fn subscribe(&self, id: &DeviceId, channel: &Channel) -> TransportResult<NotificationStream> {
        let (peripheral, characteristic) = self.characteristic(id, channel).await?;
        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&characteristic).await?;
        debug!("Subscribed to {channel} on {id}");

        let uuid = characteristic.uuid;
        Ok(notifications
            .filter_map(move |notification| async move {
                (notification.uuid == uuid).then(|| Ok(Bytes::from(notification.value)))
            })
            .boxed())
    }

    async fn unsubscribe(&self, id: &DeviceId, channel: &Channel) -> TransportResult<()> {
        let (peripheral, characteristic) = self.characteristic(id, channel).await?;
        peripheral.unsubscribe(&characteristic).await?;
        debug!("Unsubscribed from {channel} on {id}");
        Ok(())
    }

    async fn write(
        &self,
        id: &DeviceId,
        channel: &Channel,
        data: &[u8],
        kind: WriteKind,
    ) -> TransportResult<()> {
        let (peripheral, characteristic) = self.characteristic(id, channel).await?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };

        peripheral.write(&characteristic, data, write_type).await?;
        Ok(())
    }

    async fn read(&self, id: &DeviceId, channel: &Channel) -> TransportResult<Bytes> {
        let (peripheral, characteristic) = self.characteristic(id, channel).await?;
        let value = peripheral.read(&characteristic).await?;
        if value.is_empty() {
            warn!("Empty read from {channel} on {id}");
        }
        Ok(Bytes::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_btleplug_error_mapping() {
        assert_eq!(
            TransportError::from(btleplug::Error::TimedOut(Duration::from_secs(10))),
            TransportError::Timeout
        );
        assert_eq!(
            TransportError::from(btleplug::Error::NotConnected),
            TransportError::NotConnected
        );
        assert_eq!(
            TransportError::from(btleplug::Error::PermissionDenied),
            TransportError::PermissionDenied
        );
        assert!(matches!(
            TransportError::from(btleplug::Error::NoSuchCharacteristic),
            TransportError::MissingCharacteristic(_)
        ));
    }

    #[test]
    fn test_runtime_error_classified_by_message() {
        let error = btleplug::Error::RuntimeError("Peer cancelled the connection".to_string());
        assert_eq!(TransportError::from(error), TransportError::Cancelled);
    }
}
