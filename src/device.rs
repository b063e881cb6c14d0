use crate::{
    ble::BtleplugTransport,
    connection::{Connection, ConnectionChange, ConnectionManager},
    dispatcher::{CommandDispatcher, DispatchReport, DispatchState},
    error::{Result, RingError},
    events::Subscription,
    monitor::{CharacteristicMonitor, MonitorHandle},
    protocol::Channel,
    scanner::{DeviceScanner, ScanHandle},
    telemetry::{parse_battery, TelemetryParser},
    transport::RingTransport,
    types::{
        ConnectionState, DecoderKind, DeviceId, DiscoveredDevice, RingConfig, TelemetrySample,
        TelemetryValue,
    },
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Channels streamed into the sample feed on connect, with their decoders
const TELEMETRY_CHANNELS: [(Channel, DecoderKind); 4] = [
    (Channel::HEART_RATE_MEASUREMENT, DecoderKind::StandardHeartRate),
    (Channel::BATTERY_LEVEL, DecoderKind::Battery),
    (Channel::VENDOR_DATA, DecoderKind::Vendor),
    (Channel::SECONDARY_DATA, DecoderKind::Vendor),
];

/// Main interface for talking to a smart ring
///
/// `RingDevice` ties the pieces of the core together: it discovers rings,
/// owns the single connection, streams decoded telemetry to subscribers and
/// sends the command sequences that switch the ring between continuous and
/// one-shot measurement.
///
/// # Features
///
/// - **Discovery**: name-based ring detection, including rings the platform
///   already holds a link to
/// - **Single connection**: connecting to another ring replaces the current
///   link; links held by the platform are adopted instead of renegotiated
/// - **Telemetry feed**: every known telemetry channel the ring exposes is
///   decoded into [`TelemetrySample`]s on a broadcast channel
/// - **Measurement control**: continuous monitoring and manual readings
///   across firmware variants
///
/// # Examples
///
/// ```no_run
/// use ringlink::RingDevice;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let device = RingDevice::new().await?;
///
///     let rings = device.discover().await?;
///     let Some(ring) = rings.first() else {
///         return Ok(());
///     };
///
///     device.connect(&ring.id).await?;
///     let mut samples = device.subscribe_samples();
///     device.start_live_monitoring().await?;
///
///     while let Ok(sample) = samples.recv().await {
///         println!("{}", sample.value);
///     }
///     Ok(())
/// }
/// ```
pub struct RingDevice {
    config: RingConfig,
    transport: Arc<dyn RingTransport>,
    scanner: DeviceScanner,
    connections: ConnectionManager,
    monitor: CharacteristicMonitor,
    dispatcher: Arc<CommandDispatcher>,
    parser: TelemetryParser,
    samples: broadcast::Sender<TelemetrySample>,
    streams: Mutex<Vec<MonitorHandle>>,
    reset_on_disconnect: Subscription,
}

impl std::fmt::Debug for RingDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingDevice")
            .field("config", &self.config)
            .field("connections", &self.connections)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl RingDevice {
    /// Create a device interface on the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`RingError::Transport`] if no Bluetooth adapter can be opened.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use ringlink::RingDevice;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let device = RingDevice::new().await?;
    /// if !device.request_permissions().await {
    ///     eprintln!("Bluetooth is not available");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new() -> Result<Self> {
        Self::with_config(RingConfig::default()).await
    }

    /// Create a device interface on the first Bluetooth adapter with custom settings
    ///
    /// # Errors
    ///
    /// Returns [`RingError::Transport`] if no Bluetooth adapter can be opened.
    pub async fn with_config(config: RingConfig) -> Result<Self> {
        let transport = BtleplugTransport::new().await?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    /// Create a device interface on any transport
    ///
    /// Useful with [`crate::mock::MockTransport`] to exercise an application
    /// without hardware.
    #[must_use]
    pub fn with_transport(transport: Arc<dyn RingTransport>, config: RingConfig) -> Self {
        let (samples, _) = broadcast::channel(config.sample_buffer.max(1));
        let connections = ConnectionManager::new(Arc::clone(&transport), config.connection.clone());
        let dispatcher = Arc::new(CommandDispatcher::new(config.timing.clone()));

        let reset_target = Arc::clone(&dispatcher);
        let reset_on_disconnect = connections.on_connection_change(move |change| {
            if change.state == ConnectionState::Disconnected {
                reset_target.reset();
            }
        });

        Self {
            scanner: DeviceScanner::new(Arc::clone(&transport), config.scan.clone()),
            parser: TelemetryParser::new(config.plausibility.clone()),
            monitor: CharacteristicMonitor::new(),
            streams: Mutex::new(Vec::new()),
            transport,
            connections,
            dispatcher,
            samples,
            reset_on_disconnect,
            config,
        }
    }

    /// Replace the telemetry decoder, for example to plug in another stress curve
    #[must_use]
    pub fn with_parser(mut self, parser: TelemetryParser) -> Self {
        self.parser = parser;
        self
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Ask the platform for the permissions discovery and connection need
    pub async fn request_permissions(&self) -> bool {
        self.scanner.request_permissions().await
    }

    /// Start discovery, calling `on_found` once per matching ring
    pub fn scan<F>(&self, on_found: F) -> ScanHandle
    where
        F: Fn(&DiscoveredDevice) + Send + Sync + 'static,
    {
        self.scanner.scan(on_found)
    }

    /// Stop the running discovery, if any
    pub fn stop_scan(&self) {
        self.scanner.stop();
    }

    /// Scan for one window and return the rings found, strongest first
    ///
    /// # Errors
    ///
    /// Returns [`RingError::ScanTransport`] if radio discovery could not be
    /// started.
    pub async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        self.scanner.discover().await
    }

    /// Connect to a ring and start streaming its telemetry
    ///
    /// Every telemetry channel the ring exposes (standard heart rate, battery
    /// and both vendor data paths) is decoded into the sample feed. A
    /// channel that cannot be subscribed is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns the connection error from [`ConnectionManager::connect`]; see
    /// [`RingError::user_guidance`] for text to show the user.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use ringlink::{DeviceId, RingDevice};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let device = RingDevice::new().await?;
    /// match device.connect(&DeviceId::from("hci0/dev_AA_BB_CC_DD_EE_FF")).await {
    ///     Ok(connection) => println!("Connected to {}", connection.device_id()),
    ///     Err(e) => eprintln!("{}", e.user_guidance().unwrap_or("Connection failed")),
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(&self, id: &DeviceId) -> Result<Connection> {
        let connection = self.connections.connect(id).await?;

        let mut streams = self.streams.lock().await;
        if streams.iter().any(MonitorHandle::is_active) {
            return Ok(connection);
        }
        streams.clear();

        for (channel, kind) in TELEMETRY_CHANNELS {
            if !connection.exposes(&channel) {
                debug!("{id} does not expose {channel}");
                continue;
            }

            let parser = self.parser.clone();
            let samples = self.samples.clone();
            let on_update = move |payload: Option<Bytes>| {
                let Some(bytes) = payload else {
                    return;
                };
                for sample in parser.decode(kind, &bytes) {
                    debug!("Telemetry: {}", sample.value);
                    // No receivers is fine; samples are simply dropped.
                    let _ = samples.send(sample);
                }
            };

            match self.monitor.monitor(&connection, channel, on_update).await {
                Ok(handle) => streams.push(handle),
                Err(e) => warn!("Could not stream {channel} from {id}: {e}"),
            }
        }

        info!("Streaming {} telemetry channel(s) from {id}", streams.len());
        Ok(connection)
    }

    /// Disconnect from the current ring
    ///
    /// Always leaves the device disconnected; teardown errors are logged.
    /// Does nothing when no ring is connected.
    pub async fn disconnect(&self) {
        self.streams.lock().await.clear();
        self.connections.disconnect().await;
        self.dispatcher.reset();
    }

    /// Whether a ring is connected and ready
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connections.is_connected()
    }

    /// Lifecycle state of the ring connection
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connections.state()
    }

    /// Current connection handle, if any
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        self.connections.current()
    }

    /// Register a connection-change listener
    ///
    /// Link loss is reported here without polling. Each registration is
    /// removed independently through its [`Subscription`].
    pub fn on_connection_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionChange) + Send + Sync + 'static,
    {
        self.connections.on_connection_change(listener)
    }

    /// Receive decoded telemetry from every streamed channel
    #[must_use]
    pub fn subscribe_samples(&self) -> broadcast::Receiver<TelemetrySample> {
        self.samples.subscribe()
    }

    /// Monitor a channel with a custom callback
    ///
    /// # Errors
    ///
    /// Returns [`RingError::NoActiveConnection`] without a ready connection.
    pub async fn monitor<F>(&self, channel: Channel, on_update: F) -> Result<MonitorHandle>
    where
        F: Fn(Option<Bytes>) + Send + Sync + 'static,
    {
        let connection = self.connections.require_connection()?;
        self.monitor.monitor(&connection, channel, on_update).await
    }

    /// Measurement mode the ring was last put in
    #[must_use]
    pub fn measurement_state(&self) -> DispatchState {
        self.dispatcher.state()
    }

    /// Switch the ring to continuous heart-rate and blood-oxygen monitoring
    ///
    /// # Errors
    ///
    /// Returns [`RingError::NoActiveConnection`] without a ready connection.
    /// Individual write failures are reported in the [`DispatchReport`].
    pub async fn start_live_monitoring(&self) -> Result<DispatchReport> {
        let connection = self.connections.require_connection()?;
        self.dispatcher.start_live_monitoring(&connection).await
    }

    /// Request a single heart-rate and blood-oxygen reading
    ///
    /// The reading arrives later on the sample feed.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::NoActiveConnection`] without a ready connection.
    pub async fn trigger_manual_scan(&self) -> Result<DispatchReport> {
        let connection = self.connections.require_connection()?;
        self.dispatcher.trigger_manual_scan(&connection).await
    }

    /// Read the battery level once
    ///
    /// The reading is also published on the sample feed.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::NoActiveConnection`] without a ready connection,
    /// [`RingError::Transport`] if the read fails, or
    /// [`RingError::MalformedTelemetry`] if the ring returned no value.
    pub async fn read_battery(&self) -> Result<u8> {
        let connection = self.connections.require_connection()?;
        let bytes = self
            .transport
            .read(connection.device_id(), &Channel::BATTERY_LEVEL)
            .await?;

        let percent = parse_battery(&bytes)
            .ok_or_else(|| RingError::MalformedTelemetry("Empty battery level".to_string()))?;
        let _ = self
            .samples
            .send(TelemetrySample::now(TelemetryValue::Battery { percent }));
        Ok(percent)
    }
}

impl Drop for RingDevice {
    fn drop(&mut self) {
        self.reset_on_disconnect.unsubscribe();
        self.scanner.stop();

        if !self.connections.is_connected() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let connections = self.connections.clone();
        runtime.spawn(async move {
            connections.disconnect().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{ring_services, MockTransport, TransportCall},
        transport::ServiceInfo,
    };

    fn device(mock: &Arc<MockTransport>) -> RingDevice {
        let transport: Arc<dyn RingTransport> = Arc::clone(mock) as Arc<dyn RingTransport>;
        RingDevice::with_transport(transport, RingConfig::default())
    }

    #[tokio::test]
    async fn test_connect_streams_exposed_channels() {
        let mock = Arc::new(MockTransport::new());
        let device = device(&mock);

        device.connect(&DeviceId::from("ring-1")).await.unwrap();

        assert!(device.is_connected());
        assert_eq!(
            mock.count_calls(|c| matches!(c, TransportCall::Subscribe(_))),
            4
        );
    }

    #[tokio::test]
    async fn test_connect_skips_missing_channels() {
        let mock = Arc::new(MockTransport::new());
        let services: Vec<ServiceInfo> = ring_services()
            .into_iter()
            .filter(|service| service.uuid != Channel::SECONDARY_DATA.service)
            .collect();
        mock.set_services(services);
        let device = device(&mock);

        device.connect(&DeviceId::from("ring-1")).await.unwrap();
        device.connect(&DeviceId::from("ring-1")).await.unwrap();

        assert_eq!(
            mock.count_calls(|c| matches!(c, TransportCall::Subscribe(_))),
            3
        );
    }

    #[tokio::test]
    async fn test_vendor_telemetry_reaches_sample_feed() {
        let mock = Arc::new(MockTransport::new());
        let device = device(&mock);
        let mut samples = device.subscribe_samples();
        device.connect(&DeviceId::from("ring-1")).await.unwrap();

        mock.notify(Channel::VENDOR_DATA, vec![0x01, 72, 0, 0]);
        mock.notify(Channel::VENDOR_DATA, vec![0x02, 97, 0, 0]);

        let first = samples.recv().await.unwrap();
        let second = samples.recv().await.unwrap();
        assert_eq!(first.value, TelemetryValue::HeartRate { bpm: 72 });
        assert_eq!(second.value, TelemetryValue::BloodOxygen { percent: 97 });
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let mock = Arc::new(MockTransport::new());
        let device = device(&mock);

        assert!(matches!(
            device.start_live_monitoring().await,
            Err(RingError::NoActiveConnection)
        ));
        assert!(matches!(
            device.trigger_manual_scan().await,
            Err(RingError::NoActiveConnection)
        ));
        assert!(matches!(
            device.read_battery().await,
            Err(RingError::NoActiveConnection)
        ));
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_read_battery() {
        let mock = Arc::new(MockTransport::new());
        mock.set_read_value(Channel::BATTERY_LEVEL, vec![87]);
        let device = device(&mock);
        let mut samples = device.subscribe_samples();
        device.connect(&DeviceId::from("ring-1")).await.unwrap();

        assert_eq!(device.read_battery().await.unwrap(), 87);
        assert_eq!(
            samples.recv().await.unwrap().value,
            TelemetryValue::Battery { percent: 87 }
        );
    }

    #[tokio::test]
    async fn test_link_loss_resets_measurement_state() {
        let mock = Arc::new(MockTransport::new());
        let config = RingConfig {
            timing: crate::types::CommandTiming { settle_delay_ms: 0 },
            ..RingConfig::default()
        };
        let transport: Arc<dyn RingTransport> = Arc::clone(&mock) as Arc<dyn RingTransport>;
        let device = RingDevice::with_transport(transport, config);
        device.connect(&DeviceId::from("ring-1")).await.unwrap();
        device.start_live_monitoring().await.unwrap();
        assert_eq!(device.measurement_state(), DispatchState::ContinuousActive);

        mock.drop_link("ring-1");
        for _ in 0..50 {
            if !device.is_connected() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!device.is_connected());
        assert_eq!(device.measurement_state(), DispatchState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect_restarts_streams() {
        let mock = Arc::new(MockTransport::new());
        let device = device(&mock);
        let id = DeviceId::from("ring-1");

        device.connect(&id).await.unwrap();
        device.disconnect().await;
        assert!(!device.is_connected());
        assert_eq!(device.connection_state(), ConnectionState::Disconnected);

        mock.clear_calls();
        device.connect(&id).await.unwrap();
        assert_eq!(
            mock.count_calls(|c| matches!(c, TransportCall::Subscribe(_))),
            4
        );
    }
}
