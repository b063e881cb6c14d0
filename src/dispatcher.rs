//! Timed command sequences that switch the ring between measurement modes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::Mutex as AsyncMutex, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    connection::Connection,
    error::{Result, RingError, TransportError},
    protocol::{
        Channel, CommandPacket, Opcode, CONTROL_POINT_START, LEGACY_BLOOD_OXYGEN_TRIGGER,
        LEGACY_HEART_RATE_TRIGGER, MODE_CONTINUOUS, MODE_MANUAL,
    },
    transport::WriteKind,
    types::CommandTiming,
};

/// Measurement mode the dispatcher has put the ring in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DispatchState {
    /// No measurement requested
    #[default]
    Idle,
    /// Continuous-mode commands are being sent
    ArmingContinuous,
    /// The ring was asked to stream continuously
    ContinuousActive,
    /// A one-shot measurement batch is being sent
    ManualPending,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::ArmingContinuous => write!(f, "Arming continuous"),
            Self::ContinuousActive => write!(f, "Continuous"),
            Self::ManualPending => write!(f, "Manual pending"),
        }
    }
}

/// Outcome of one command batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Writes the transport accepted
    pub sent: usize,
    /// Writes that failed or were skipped
    pub failed: usize,
}

impl DispatchReport {
    /// Whether every write in the batch went through
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

struct Command {
    label: &'static str,
    channel: Channel,
    bytes: Bytes,
    kind: WriteKind,
}

impl Command {
    fn packet(label: &'static str, channel: Channel, packet: &CommandPacket, kind: WriteKind) -> Self {
        Self {
            label,
            channel,
            bytes: match packet {
                CommandPacket::Structured(bytes) | CommandPacket::Raw(bytes) => bytes.clone(),
            },
            kind,
        }
    }

    fn failure(&self, error: &TransportError) -> RingError {
        RingError::CommandSendFailure(format!("{}: {error}", self.label))
    }
}

/// Sends continuous and one-shot measurement batches
///
/// Batches never interleave: a manual trigger issued while continuous mode
/// is being armed waits until arming finishes.
pub struct CommandDispatcher {
    timing: CommandTiming,
    state: Mutex<DispatchState>,
    gate: AsyncMutex<()>,
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("timing", &self.timing)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new(CommandTiming::default())
    }
}

impl CommandDispatcher {
    /// Create a dispatcher in [`DispatchState::Idle`]
    #[must_use]
    pub fn new(timing: CommandTiming) -> Self {
        Self {
            timing,
            state: Mutex::new(DispatchState::Idle),
            gate: AsyncMutex::new(()),
        }
    }

    /// Current measurement mode
    #[must_use]
    pub fn state(&self) -> DispatchState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: DispatchState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Forget the measurement mode after the connection went away
    pub fn reset(&self) {
        self.set_state(DispatchState::Idle);
    }

    /// Put the ring into continuous monitoring
    ///
    /// Sends enable-data-transfer, continuous heart-rate and continuous
    /// blood-oxygen frames in that order, waiting the settle delay between
    /// them. Failed writes are logged and counted in the report.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RingError::NoActiveConnection`] without sending
    /// anything if `connection` is not ready.
    pub async fn start_live_monitoring(&self, connection: &Connection) -> Result<DispatchReport> {
        connection.require_ready()?;
        let _gate = self.gate.lock().await;
        connection.require_ready()?;

        let commands = [
            Command::packet(
                "enable data transfer",
                Channel::VENDOR_COMMAND,
                &CommandPacket::vendor(Opcode::DataTransfer, &[MODE_CONTINUOUS])?,
                WriteKind::WithResponse,
            ),
            Command::packet(
                "continuous heart rate",
                Channel::VENDOR_COMMAND,
                &CommandPacket::vendor(Opcode::HeartRate, &[MODE_CONTINUOUS])?,
                WriteKind::WithResponse,
            ),
            Command::packet(
                "continuous blood oxygen",
                Channel::VENDOR_COMMAND,
                &CommandPacket::vendor(Opcode::BloodOxygen, &[MODE_CONTINUOUS])?,
                WriteKind::WithResponse,
            ),
        ];

        info!("Arming continuous monitoring on {}", connection.device_id());
        self.set_state(DispatchState::ArmingContinuous);

        let settle = Duration::from_millis(self.timing.settle_delay_ms);
        let report = self.send_batch(connection, &commands, Some(settle)).await;

        let next = if report.sent > 0 {
            DispatchState::ContinuousActive
        } else {
            DispatchState::Idle
        };
        self.set_state(next);
        info!(
            "Continuous monitoring armed: {} sent, {} failed",
            report.sent, report.failed
        );
        Ok(report)
    }

    /// Ask the ring for a single heart-rate and blood-oxygen reading
    ///
    /// Covers every firmware variant by sending the standard control-point
    /// start, the structured manual frames and both legacy triggers. Each
    /// write is independent; the reading itself arrives later on a
    /// monitored channel.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RingError::NoActiveConnection`] without sending
    /// anything if `connection` is not ready.
    pub async fn trigger_manual_scan(&self, connection: &Connection) -> Result<DispatchReport> {
        connection.require_ready()?;
        let _gate = self.gate.lock().await;
        connection.require_ready()?;

        let resting = match self.state() {
            DispatchState::ContinuousActive => DispatchState::ContinuousActive,
            _ => DispatchState::Idle,
        };
        let commands = [
            Command::packet(
                "control point start",
                Channel::HEART_RATE_CONTROL_POINT,
                &CommandPacket::raw(Bytes::from_static(&CONTROL_POINT_START)),
                WriteKind::WithResponse,
            ),
            Command::packet(
                "manual heart rate",
                Channel::VENDOR_COMMAND,
                &CommandPacket::vendor(Opcode::HeartRate, &[MODE_MANUAL])?,
                WriteKind::WithResponse,
            ),
            Command::packet(
                "manual blood oxygen",
                Channel::VENDOR_COMMAND,
                &CommandPacket::vendor(Opcode::BloodOxygen, &[MODE_MANUAL])?,
                WriteKind::WithResponse,
            ),
            Command::packet(
                "legacy heart rate trigger",
                Channel::VENDOR_COMMAND,
                &CommandPacket::raw(Bytes::from_static(&LEGACY_HEART_RATE_TRIGGER)),
                WriteKind::WithoutResponse,
            ),
            Command::packet(
                "legacy blood oxygen trigger",
                Channel::VENDOR_COMMAND,
                &CommandPacket::raw(Bytes::from_static(&LEGACY_BLOOD_OXYGEN_TRIGGER)),
                WriteKind::WithoutResponse,
            ),
        ];

        info!("Triggering manual measurement on {}", connection.device_id());
        self.set_state(DispatchState::ManualPending);

        let report = self.send_batch(connection, &commands, None).await;
        self.set_state(resting);
        debug!(
            "Manual trigger batch: {} sent, {} failed",
            report.sent, report.failed
        );
        Ok(report)
    }

    async fn send_batch(
        &self,
        connection: &Connection,
        commands: &[Command],
        spacing: Option<Duration>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        for (index, command) in commands.iter().enumerate() {
            if index > 0 {
                if let Some(spacing) = spacing {
                    sleep(spacing).await;
                }
            }

            if !connection.is_ready() {
                warn!("Connection lost, skipping {}", command.label);
                report.failed += 1;
                continue;
            }

            debug!("Sending {}: {:02X?}", command.label, &command.bytes[..]);
            match connection
                .transport()
                .write(connection.device_id(), &command.channel, &command.bytes, command.kind)
                .await
            {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    warn!("{}", command.failure(&e));
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::ConnectionManager,
        mock::MockTransport,
        protocol::{checksum, STRUCTURED_HEADER},
        transport::RingTransport,
        types::{ConnectionParams, DeviceId},
    };
    use std::sync::Arc;

    async fn connected(mock: &Arc<MockTransport>) -> (ConnectionManager, Connection) {
        let transport: Arc<dyn RingTransport> = Arc::clone(mock) as Arc<dyn RingTransport>;
        let manager = ConnectionManager::new(transport, ConnectionParams::default());
        let connection = manager.connect(&DeviceId::from("ring-1")).await.unwrap();
        mock.clear_calls();
        (manager, connection)
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_monitoring_sequence_and_spacing() {
        let mock = Arc::new(MockTransport::new());
        let (_manager, connection) = connected(&mock).await;
        let dispatcher = CommandDispatcher::default();

        let started = tokio::time::Instant::now();
        let report = dispatcher.start_live_monitoring(&connection).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(400));
        assert_eq!(report, DispatchReport { sent: 3, failed: 0 });
        assert_eq!(dispatcher.state(), DispatchState::ContinuousActive);

        let writes = mock.writes();
        assert_eq!(writes.len(), 3);
        let opcodes: Vec<u8> = writes.iter().map(|(_, bytes)| bytes[1]).collect();
        assert_eq!(opcodes, vec![0x01, 0x02, 0x03]);
        for (channel, bytes) in &writes {
            assert_eq!(*channel, Channel::VENDOR_COMMAND);
            assert_eq!(bytes.len(), 16);
            assert_eq!(bytes[0], STRUCTURED_HEADER);
            assert_eq!(bytes[2], MODE_CONTINUOUS);
            assert_eq!(bytes[15], checksum(&bytes[..15]));
        }
    }

    #[tokio::test]
    async fn test_live_monitoring_without_connection_sends_nothing() {
        let mock = Arc::new(MockTransport::new());
        let (manager, connection) = connected(&mock).await;
        manager.disconnect().await;
        mock.clear_calls();

        let dispatcher = CommandDispatcher::default();
        let result = dispatcher.start_live_monitoring(&connection).await;

        assert!(matches!(result, Err(RingError::NoActiveConnection)));
        assert!(mock.writes().is_empty());
        assert_eq!(dispatcher.state(), DispatchState::Idle);
    }

    #[test]
    fn test_send_failure_names_command() {
        let packet = CommandPacket::raw(LEGACY_HEART_RATE_TRIGGER.to_vec());
        let command = Command::packet(
            "legacy heart-rate trigger",
            Channel::VENDOR_COMMAND,
            &packet,
            WriteKind::WithoutResponse,
        );

        let error = command.failure(&TransportError::NotConnected);

        assert!(matches!(error, RingError::CommandSendFailure(_)));
        assert!(error.is_recoverable());
        assert!(error.to_string().contains("legacy heart-rate trigger"));
    }

    #[tokio::test]
    async fn test_manual_scan_is_best_effort() {
        let mock = Arc::new(MockTransport::new());
        let (_manager, connection) = connected(&mock).await;
        mock.fail_writes_to(Channel::HEART_RATE_CONTROL_POINT);

        let dispatcher = CommandDispatcher::default();
        let report = dispatcher.trigger_manual_scan(&connection).await.unwrap();

        assert_eq!(report, DispatchReport { sent: 4, failed: 1 });
        assert!(!report.is_complete());
        assert_eq!(dispatcher.state(), DispatchState::Idle);

        let writes = mock.writes();
        assert_eq!(writes.len(), 5);
        assert_eq!(writes[0], (Channel::HEART_RATE_CONTROL_POINT, vec![0x01]));
        assert_eq!(writes[1].1[1], Opcode::HeartRate as u8);
        assert_eq!(writes[1].1[2], MODE_MANUAL);
        assert_eq!(writes[2].1[1], Opcode::BloodOxygen as u8);
        assert_eq!(writes[3].1, LEGACY_HEART_RATE_TRIGGER.to_vec());
        assert_eq!(writes[4].1, LEGACY_BLOOD_OXYGEN_TRIGGER.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_waits_for_arming() {
        let mock = Arc::new(MockTransport::new());
        let (_manager, connection) = connected(&mock).await;
        let dispatcher = Arc::new(CommandDispatcher::default());

        let arming = {
            let dispatcher = Arc::clone(&dispatcher);
            let connection = connection.clone();
            tokio::spawn(async move { dispatcher.start_live_monitoring(&connection).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.state(), DispatchState::ArmingContinuous);

        let manual = dispatcher.trigger_manual_scan(&connection).await.unwrap();
        let armed = arming.await.unwrap().unwrap();

        assert_eq!(armed.sent, 3);
        assert_eq!(manual.sent, 5);
        assert_eq!(dispatcher.state(), DispatchState::ContinuousActive);

        let writes = mock.writes();
        assert_eq!(writes.len(), 8);
        for (_, bytes) in &writes[..3] {
            assert_eq!(bytes[2], MODE_CONTINUOUS);
        }
        assert_eq!(writes[3].0, Channel::HEART_RATE_CONTROL_POINT);
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let mock = Arc::new(MockTransport::new());
        let (_manager, connection) = connected(&mock).await;
        let dispatcher = CommandDispatcher::new(CommandTiming { settle_delay_ms: 0 });

        dispatcher.start_live_monitoring(&connection).await.unwrap();
        assert_eq!(dispatcher.state(), DispatchState::ContinuousActive);

        dispatcher.reset();
        assert_eq!(dispatcher.state(), DispatchState::Idle);
    }
}
