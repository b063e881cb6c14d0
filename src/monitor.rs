use bytes::Bytes;
use futures::StreamExt;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

use crate::{
    connection::{Connection, WeakConnection},
    error::Result,
    protocol::Channel,
    transport::NotificationStream,
};

/// Callback receiving each notification, or `None` for an unreadable one
pub type UpdateCallback = Arc<dyn Fn(Option<Bytes>) + Send + Sync>;

/// Subscribes callbacks to characteristic notifications on a connection
#[derive(Debug, Default, Clone, Copy)]
pub struct CharacteristicMonitor;

impl CharacteristicMonitor {
    /// Create a monitor
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Subscribe `on_update` to notifications from `channel`
    ///
    /// Payloads are delivered in the order the ring sent them. A read error
    /// or an empty payload is delivered as `None`; the subscription stays
    /// alive either way.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RingError::NoActiveConnection`] if `connection` is not
    /// ready, or [`crate::RingError::Transport`] if notifications cannot be
    /// enabled on the channel.
    pub async fn monitor<F>(&self, connection: &Connection, channel: Channel, on_update: F) -> Result<MonitorHandle>
    where
        F: Fn(Option<Bytes>) + Send + Sync + 'static,
    {
        connection.require_ready()?;

        let stream = connection
            .transport()
            .subscribe(connection.device_id(), &channel)
            .await?;
        debug!("Monitoring {channel} on {}", connection.device_id());

        let task = tokio::spawn(pump(stream, channel, Arc::new(on_update)));
        let id = connection.register_monitor(channel, task)?;

        Ok(MonitorHandle {
            connection: connection.downgrade(),
            channel,
            id,
            released: AtomicBool::new(false),
        })
    }
}

async fn pump(mut stream: NotificationStream, channel: Channel, on_update: UpdateCallback) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(bytes) if !bytes.is_empty() => on_update(Some(bytes)),
            Ok(_) => {
                warn!("Empty notification on {channel}");
                on_update(None);
            }
            Err(e) => {
                warn!("Notification error on {channel}: {e}");
                on_update(None);
            }
        }
    }
    debug!("Notification stream on {channel} ended");
}

/// Cancels one monitor registration
pub struct MonitorHandle {
    connection: WeakConnection,
    channel: Channel,
    id: u64,
    released: AtomicBool,
}

impl fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("channel", &self.channel)
            .field("active", &self.is_active())
            .finish()
    }
}

impl MonitorHandle {
    /// Channel this handle monitors
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Whether the monitor is still delivering updates
    ///
    /// Turns false after [`Self::unsubscribe`] or once the connection is torn
    /// down.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.released.load(Ordering::Acquire)
            && self
                .connection
                .upgrade()
                .is_some_and(|connection| connection.is_ready())
    }

    /// Stop delivering updates
    ///
    /// Notifications are disabled on the ring only when this was the last
    /// monitor on the channel. Calling this again, or after the connection
    /// was torn down, does nothing.
    pub async fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        let Some(released) = connection.release_monitor(self.id) else {
            return;
        };

        if released.last_on_channel && connection.is_ready() {
            if let Err(e) = connection
                .transport()
                .unsubscribe(connection.device_id(), &released.channel)
                .await
            {
                warn!("Failed to disable notifications on {}: {e}", released.channel);
            }
        }
    }
}
