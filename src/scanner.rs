use futures::StreamExt;
use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, RingError},
    transport::{Advertisement, RingTransport},
    types::{DeviceId, DiscoveredDevice, ScanConfig, UNKNOWN_RSSI},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scores advertised names against known ring naming patterns
///
/// Matching is a case-insensitive substring test; the best-scoring pattern
/// wins. Devices that advertise no name never match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameMatcher {
    patterns: Vec<(String, u8)>,
}

impl Default for NameMatcher {
    fn default() -> Self {
        Self::new([
            ("colmi", 90),
            ("smart ring", 80),
            ("ring", 60),
            ("r02", 50),
            ("r06", 50),
            ("r10", 50),
        ])
    }
}

impl NameMatcher {
    /// Build a matcher from `(token, confidence)` pairs
    pub fn new<S: Into<String>>(patterns: impl IntoIterator<Item = (S, u8)>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(|(token, confidence)| (token.into().to_lowercase(), confidence))
                .collect(),
        }
    }

    /// Best confidence for `name`, or `None` if nothing matches
    #[must_use]
    pub fn confidence(&self, name: Option<&str>) -> Option<u8> {
        let name = name?.to_lowercase();
        self.patterns
            .iter()
            .filter(|(token, _)| name.contains(token.as_str()))
            .map(|(_, confidence)| *confidence)
            .max()
    }

    /// Whether `name` matches with at least `min_confidence`
    #[must_use]
    pub fn matches(&self, name: Option<&str>, min_confidence: u8) -> bool {
        self.confidence(name)
            .is_some_and(|confidence| confidence >= min_confidence)
    }
}

/// Order devices by descending signal strength
pub fn sort_by_signal(devices: &mut [DiscoveredDevice]) {
    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
}

type FoundCallback = Arc<dyn Fn(&DiscoveredDevice) + Send + Sync>;

struct ScanShared {
    stop: watch::Sender<bool>,
    devices: Mutex<Vec<DiscoveredDevice>>,
    failure: Mutex<Option<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScanShared {
    fn stop(&self) {
        self.stop.send_replace(true);
    }
}

/// Control over one running discovery
#[derive(Clone)]
pub struct ScanHandle {
    shared: Arc<ScanShared>,
}

impl fmt::Debug for ScanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanHandle")
            .field("found", &lock(&self.shared.devices).len())
            .field("stopped", &*self.shared.stop.borrow())
            .finish()
    }
}

impl ScanHandle {
    /// Stop discovery; safe to call repeatedly or after the window elapsed
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Rings reported so far, strongest signal first
    #[must_use]
    pub fn discovered(&self) -> Vec<DiscoveredDevice> {
        let mut devices = lock(&self.shared.devices).clone();
        sort_by_signal(&mut devices);
        devices
    }

    /// Wait until discovery ends
    ///
    /// # Errors
    ///
    /// Returns [`RingError::ScanTransport`] if radio discovery could not be
    /// started.
    pub async fn finished(&self) -> Result<()> {
        let task = lock(&self.shared.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!("Scan task ended abnormally: {e}");
            }
        }

        match lock(&self.shared.failure).clone() {
            Some(reason) => Err(RingError::ScanTransport(reason)),
            None => Ok(()),
        }
    }
}

/// Finds rings by advertised name
pub struct DeviceScanner {
    transport: Arc<dyn RingTransport>,
    config: ScanConfig,
    matcher: NameMatcher,
    active: Mutex<Option<ScanHandle>>,
}

impl fmt::Debug for DeviceScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceScanner")
            .field("config", &self.config)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

impl DeviceScanner {
    /// Create a scanner with the default name table
    #[must_use]
    pub fn new(transport: Arc<dyn RingTransport>, config: ScanConfig) -> Self {
        Self::with_matcher(transport, config, NameMatcher::default())
    }

    /// Create a scanner with a custom name table
    #[must_use]
    pub fn with_matcher(transport: Arc<dyn RingTransport>, config: ScanConfig, matcher: NameMatcher) -> Self {
        Self {
            transport,
            config,
            matcher,
            active: Mutex::new(None),
        }
    }

    /// Ask the platform for the permissions discovery needs
    ///
    /// Transport errors are logged and reported as not granted.
    pub async fn request_permissions(&self) -> bool {
        match self.transport.request_permissions().await {
            Ok(granted) => {
                if !granted {
                    warn!("Bluetooth permissions not granted");
                }
                granted
            }
            Err(e) => {
                warn!("Permission request failed: {e}");
                false
            }
        }
    }

    /// Start discovery, reporting each matching ring once
    ///
    /// Rings the platform already holds a link to are reported first. The
    /// scan ends when the configured window elapses, when it is stopped, or
    /// when the transport reports an error. Starting a new scan stops the
    /// previous one.
    pub fn scan<F>(&self, on_found: F) -> ScanHandle
    where
        F: Fn(&DiscoveredDevice) + Send + Sync + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let handle = ScanHandle {
            shared: Arc::new(ScanShared {
                stop,
                devices: Mutex::new(Vec::new()),
                failure: Mutex::new(None),
                task: Mutex::new(None),
            }),
        };

        if let Some(previous) = lock(&self.active).replace(handle.clone()) {
            previous.stop();
        }

        let run = ScanRun {
            transport: Arc::clone(&self.transport),
            matcher: self.matcher.clone(),
            min_confidence: self.config.min_confidence,
            window: Duration::from_millis(self.config.window_ms),
            shared: Arc::clone(&handle.shared),
            on_found: Arc::new(on_found),
            seen: HashSet::new(),
        };
        let task = tokio::spawn(run.run(stop_rx));
        *lock(&handle.shared.task) = Some(task);

        handle
    }

    /// Stop the current scan, if any
    pub fn stop(&self) {
        if let Some(active) = lock(&self.active).as_ref() {
            active.stop();
        }
    }

    /// Run a full scan window and return the rings found, strongest first
    ///
    /// # Errors
    ///
    /// Returns [`RingError::ScanTransport`] if radio discovery could not be
    /// started.
    pub async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        let handle = self.scan(|_| {});
        handle.finished().await?;
        Ok(handle.discovered())
    }
}

struct ScanRun {
    transport: Arc<dyn RingTransport>,
    matcher: NameMatcher,
    min_confidence: u8,
    window: Duration,
    shared: Arc<ScanShared>,
    on_found: FoundCallback,
    seen: HashSet<DeviceId>,
}

impl ScanRun {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        match self.transport.connected_devices().await {
            Ok(devices) => {
                for device in devices {
                    self.report(device);
                }
            }
            Err(e) => debug!("Could not list platform-connected devices: {e}"),
        }

        if *stop.borrow() {
            return;
        }

        let mut advertisements = match self.transport.start_scan().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to start scan: {e}");
                *lock(&self.shared.failure) = Some(e.to_string());
                return;
            }
        };
        info!("Scanning for rings for {}ms", self.window.as_millis());

        let window = sleep(self.window);
        tokio::pin!(window);

        loop {
            tokio::select! {
                () = &mut window => {
                    debug!("Scan window elapsed");
                    break;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!("Scan stopped");
                        break;
                    }
                }
                item = advertisements.next() => match item {
                    Some(Ok(advertisement)) => self.report(advertisement),
                    Some(Err(e)) => {
                        warn!("Scan ended by transport error: {e}");
                        break;
                    }
                    None => break,
                },
            }
        }

        if let Err(e) = self.transport.stop_scan().await {
            debug!("Failed to stop scan: {e}");
        }
        info!("Scan finished. Found {} ring(s)", self.seen.len());
    }

    fn report(&mut self, advertisement: Advertisement) {
        let rssi = advertisement.rssi.unwrap_or(UNKNOWN_RSSI);

        if self.seen.contains(&advertisement.id) {
            if let Some(known) = lock(&self.shared.devices)
                .iter_mut()
                .find(|device| device.id == advertisement.id)
            {
                known.rssi = rssi;
            }
            return;
        }

        let name = advertisement.name.as_deref();
        if !self.matcher.matches(name, self.min_confidence) {
            return;
        }

        let device = DiscoveredDevice::new(advertisement.id.clone(), advertisement.name.clone(), rssi);
        info!(
            "Found ring: {} ({}, {} dBm)",
            name.unwrap_or_default(),
            device.id,
            device.rssi
        );
        self.seen.insert(advertisement.id);
        lock(&self.shared.devices).push(device.clone());
        (self.on_found)(&device);
    }
}
