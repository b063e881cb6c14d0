//! Telemetry decoding for every dialect the ring firmware speaks.
//!
//! Heart-rate payloads are told apart only by their shape, so detection runs
//! in a fixed priority order:
//!
//! 1. **Compact**: exactly `[0x01, bpm, hrv, status]`. Out-of-range `bpm` is
//!    noise and yields nothing; later dialects are not tried.
//! 2. **Structured frame**: at least 7 bytes starting `[0xEF, 0x02]`, heart
//!    rate at byte 6.
//! 3. **Standard profile**: at least 2 bytes, flags byte first. Bit 0 selects
//!    a 16-bit little-endian value over an 8-bit one, bit 3 marks an energy
//!    field and bit 4 trailing RR intervals in 1/1024 s.
//!
//! Vendor channels also carry checksummed replies to commands. A verified
//! reply whose opcode is not a measurement is an acknowledgement and yields
//! no sample.
//!
//! Every function here is total. Malformed input is logged and produces no
//! sample.

use crate::{
    error::{Result, RingError},
    protocol::{
        CommandPacket, Opcode, COMPACT_BLOOD_OXYGEN_TAG, COMPACT_HEART_RATE_TAG, FRAME_SIZE,
        STRUCTURED_HEADER,
    },
    types::{DecoderKind, PlausibilityLimits, TelemetrySample, TelemetryValue},
};
use bytes::Buf;
use std::sync::Arc;
use tracing::debug;

const COMPACT_LEN: usize = 4;
const STRUCTURED_MIN_LEN: usize = 7;
const STRUCTURED_VALUE_OFFSET: usize = 6;

const FLAG_HR_U16: u8 = 0x01;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_INTERVALS: u8 = 0x10;

/// Byte layout a heart-rate payload was recognised as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartRateDialect {
    /// `[0x01, bpm, hrv, status]`
    Compact,
    /// `[0xEF, 0x02, .., .., .., .., bpm, ..]`
    StructuredFrame,
    /// Standard heart-rate measurement characteristic
    Standard,
}

/// Heart rate plus any variability data carried alongside it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateReading {
    /// Beats per minute
    pub bpm: u16,
    /// Heart-rate variability in milliseconds, when the payload carries it
    pub hrv_ms: Option<u16>,
    /// Dialect the payload was decoded with
    pub dialect: HeartRateDialect,
}

/// Detect which heart-rate dialect `bytes` is written in
#[must_use]
pub fn detect_dialect(bytes: &[u8]) -> Option<HeartRateDialect> {
    if bytes.len() == COMPACT_LEN && bytes[0] == COMPACT_HEART_RATE_TAG {
        Some(HeartRateDialect::Compact)
    } else if bytes.len() >= STRUCTURED_MIN_LEN
        && bytes[0] == STRUCTURED_HEADER
        && bytes[1] == Opcode::HeartRate as u8
    {
        Some(HeartRateDialect::StructuredFrame)
    } else if bytes.len() >= 2 {
        Some(HeartRateDialect::Standard)
    } else {
        None
    }
}

/// Decode a heart-rate payload in any supported dialect
#[must_use]
pub fn decode_heart_rate(bytes: &[u8], limits: &PlausibilityLimits) -> Option<HeartRateReading> {
    let Some(dialect) = detect_dialect(bytes) else {
        debug!("Heart-rate payload too short: {:02X?}", bytes);
        return None;
    };

    match dialect {
        HeartRateDialect::Compact => decode_compact(bytes, limits),
        HeartRateDialect::StructuredFrame => Some(HeartRateReading {
            bpm: u16::from(bytes[STRUCTURED_VALUE_OFFSET]),
            hrv_ms: None,
            dialect,
        }),
        HeartRateDialect::Standard => decode_standard(bytes),
    }
}

fn decode_compact(bytes: &[u8], limits: &PlausibilityLimits) -> Option<HeartRateReading> {
    let bpm = bytes[1];
    if !limits.accepts_bpm(bpm) {
        debug!("Discarding compact heart rate {} as noise", bpm);
        return None;
    }

    let hrv = bytes[2];
    Some(HeartRateReading {
        bpm: u16::from(bpm),
        hrv_ms: (hrv > 0).then_some(u16::from(hrv)),
        dialect: HeartRateDialect::Compact,
    })
}

fn decode_standard(bytes: &[u8]) -> Option<HeartRateReading> {
    let mut buf = bytes;
    let flags = buf.get_u8();

    let bpm = if flags & FLAG_HR_U16 != 0 {
        if buf.remaining() < 2 {
            debug!("16-bit heart rate flagged but payload truncated: {:02X?}", bytes);
            return None;
        }
        buf.get_u16_le()
    } else {
        u16::from(buf.get_u8())
    };

    if flags & FLAG_ENERGY_EXPENDED != 0 {
        if buf.remaining() < 2 {
            return Some(HeartRateReading {
                bpm,
                hrv_ms: None,
                dialect: HeartRateDialect::Standard,
            });
        }
        buf.advance(2);
    }

    let mut rr_ms = Vec::new();
    if flags & FLAG_RR_INTERVALS != 0 {
        while buf.remaining() >= 2 {
            let raw = u32::from(buf.get_u16_le());
            rr_ms.push(raw * 1000 / 1024);
        }
    }

    Some(HeartRateReading {
        bpm,
        hrv_ms: rmssd(&rr_ms),
        dialect: HeartRateDialect::Standard,
    })
}

/// Root mean square of successive RR differences, in milliseconds
fn rmssd(rr_ms: &[u32]) -> Option<u16> {
    if rr_ms.len() < 2 {
        return None;
    }

    let squares: f64 = rr_ms
        .windows(2)
        .map(|pair| {
            let diff = f64::from(pair[1]) - f64::from(pair[0]);
            diff * diff
        })
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let mean = squares / (rr_ms.len() - 1) as f64;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rmssd = mean.sqrt().round().min(f64::from(u16::MAX)) as u16;
    Some(rmssd)
}

/// Heart rate from any dialect, using the default noise gate
#[must_use]
pub fn parse_heart_rate(bytes: &[u8]) -> Option<u16> {
    decode_heart_rate(bytes, &PlausibilityLimits::default()).map(|reading| reading.bpm)
}

/// Battery percentage from the leading byte
///
/// The value is passed through unclamped.
#[must_use]
pub fn parse_battery(bytes: &[u8]) -> Option<u8> {
    let level = bytes.first().copied();
    if level.is_none() {
        debug!("Empty battery payload");
    }
    level
}

/// Blood oxygen percentage, accepted only above the plausibility floor
///
/// Accepted shapes are a lone percentage byte, the compact
/// `[0x02, spo2, ..]` form, and structured frames tagged with the
/// blood-oxygen opcode carrying the value at byte 6.
#[must_use]
pub fn parse_blood_oxygen(bytes: &[u8], limits: &PlausibilityLimits) -> Option<u8> {
    let percent = match bytes {
        [value] => *value,
        [COMPACT_BLOOD_OXYGEN_TAG, value, _, _] => *value,
        _ if is_structured_blood_oxygen(bytes) => bytes[STRUCTURED_VALUE_OFFSET],
        _ => {
            debug!("Unrecognised blood-oxygen payload: {:02X?}", bytes);
            return None;
        }
    };

    if limits.accepts_blood_oxygen(percent) {
        Some(percent)
    } else {
        debug!("Discarding blood oxygen {}% as noise", percent);
        None
    }
}

fn is_structured_blood_oxygen(bytes: &[u8]) -> bool {
    bytes.len() >= STRUCTURED_MIN_LEN
        && bytes[0] == STRUCTURED_HEADER
        && bytes[1] == Opcode::BloodOxygen as u8
}

/// Whether a vendor payload is a command acknowledgement rather than a reading
fn is_command_reply(bytes: &[u8]) -> bool {
    if bytes.len() != FRAME_SIZE || bytes[0] != STRUCTURED_HEADER {
        return false;
    }
    let Ok(frame) = CommandPacket::parse_structured(bytes) else {
        return false;
    };

    match Opcode::from_u8(frame.opcode) {
        Some(Opcode::HeartRate | Opcode::BloodOxygen) => false,
        Some(opcode) => {
            debug!("Ring acknowledged {:?}: {:02X?}", opcode, frame.payload);
            true
        }
        None => {
            debug!("Ignoring reply with unknown opcode {:02X}", frame.opcode);
            true
        }
    }
}

fn is_blood_oxygen_shape(bytes: &[u8]) -> bool {
    matches!(bytes, [_] | [COMPACT_BLOOD_OXYGEN_TAG, _, _, _]) || is_structured_blood_oxygen(bytes)
}

/// Maps heart-rate variability onto a 0-100 stress score
///
/// The curve is a product decision rather than part of the wire protocol, so
/// it is pluggable.
pub trait StressScorer: Send + Sync {
    /// Score for an HRV value in milliseconds; must stay within 0-100
    fn score(&self, hrv_ms: u16) -> u8;
}

/// Linear placeholder curve between a relaxed and a stressed HRV bound
///
/// The relaxed bound is always above the stressed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearStressScorer {
    relaxed_hrv_ms: u16,
    stressed_hrv_ms: u16,
}

impl LinearStressScorer {
    /// Create a curve scoring 0 at `relaxed_hrv_ms` and above, 100 at
    /// `stressed_hrv_ms` and below
    ///
    /// # Errors
    ///
    /// Returns [`RingError::InvalidParameters`] unless `relaxed_hrv_ms` is
    /// greater than `stressed_hrv_ms`.
    pub fn new(relaxed_hrv_ms: u16, stressed_hrv_ms: u16) -> Result<Self> {
        if relaxed_hrv_ms <= stressed_hrv_ms {
            return Err(RingError::InvalidParameters(format!(
                "Relaxed HRV bound {relaxed_hrv_ms}ms must exceed stressed bound {stressed_hrv_ms}ms"
            )));
        }
        Ok(Self {
            relaxed_hrv_ms,
            stressed_hrv_ms,
        })
    }

    /// HRV at or above which the score is 0
    #[must_use]
    pub const fn relaxed_hrv_ms(&self) -> u16 {
        self.relaxed_hrv_ms
    }

    /// HRV at or below which the score is 100
    #[must_use]
    pub const fn stressed_hrv_ms(&self) -> u16 {
        self.stressed_hrv_ms
    }
}

impl Default for LinearStressScorer {
    fn default() -> Self {
        Self {
            relaxed_hrv_ms: 100,
            stressed_hrv_ms: 20,
        }
    }
}

impl StressScorer for LinearStressScorer {
    fn score(&self, hrv_ms: u16) -> u8 {
        if hrv_ms >= self.relaxed_hrv_ms {
            return 0;
        }
        if hrv_ms <= self.stressed_hrv_ms {
            return 100;
        }

        let span = u32::from(self.relaxed_hrv_ms - self.stressed_hrv_ms);
        let above_floor = u32::from(hrv_ms - self.stressed_hrv_ms);
        let score = 100 - (above_floor * 100 / span);
        u8::try_from(score).unwrap_or(100)
    }
}

/// Derive a stress score with the default curve
#[must_use]
pub fn derive_stress(hrv_ms: u16) -> u8 {
    LinearStressScorer::default().score(hrv_ms)
}

/// Decoder turning channel payloads into [`TelemetrySample`]s
#[derive(Clone)]
pub struct TelemetryParser {
    limits: PlausibilityLimits,
    scorer: Arc<dyn StressScorer>,
}

impl Default for TelemetryParser {
    fn default() -> Self {
        Self::new(PlausibilityLimits::default())
    }
}

impl std::fmt::Debug for TelemetryParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryParser")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl TelemetryParser {
    /// Create a parser with the linear stress curve
    #[must_use]
    pub fn new(limits: PlausibilityLimits) -> Self {
        Self {
            limits,
            scorer: Arc::new(LinearStressScorer::default()),
        }
    }

    /// Replace the stress curve
    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn StressScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Active noise gates
    #[must_use]
    pub const fn limits(&self) -> &PlausibilityLimits {
        &self.limits
    }

    /// Decode one payload received on a channel of the given kind
    ///
    /// A heart-rate payload that carries variability data also yields a
    /// derived stress sample. An empty vector means the payload produced no
    /// sample.
    #[must_use]
    pub fn decode(&self, kind: DecoderKind, bytes: &[u8]) -> Vec<TelemetrySample> {
        match kind {
            DecoderKind::Battery => parse_battery(bytes)
                .map(|percent| TelemetrySample::now(TelemetryValue::Battery { percent }))
                .into_iter()
                .collect(),
            DecoderKind::StandardHeartRate => self.heart_rate_samples(bytes),
            DecoderKind::Vendor if is_command_reply(bytes) => Vec::new(),
            DecoderKind::Vendor if is_blood_oxygen_shape(bytes) => {
                parse_blood_oxygen(bytes, &self.limits)
                    .map(|percent| TelemetrySample::now(TelemetryValue::BloodOxygen { percent }))
                    .into_iter()
                    .collect()
            }
            DecoderKind::Vendor => self.heart_rate_samples(bytes),
        }
    }

    fn heart_rate_samples(&self, bytes: &[u8]) -> Vec<TelemetrySample> {
        let Some(reading) = decode_heart_rate(bytes, &self.limits) else {
            return Vec::new();
        };

        let mut samples = vec![TelemetrySample::now(TelemetryValue::HeartRate {
            bpm: reading.bpm,
        })];
        if let Some(hrv) = reading.hrv_ms {
            let score = self.scorer.score(hrv).min(100);
            samples.push(TelemetrySample::now(TelemetryValue::Stress { score }));
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn values(samples: &[TelemetrySample]) -> Vec<TelemetryValue> {
        samples.iter().map(|s| s.value).collect()
    }

    #[test]
    fn test_compact_dialect() {
        assert_eq!(parse_heart_rate(&[0x01, 72, 45, 0x00]), Some(72));
        assert_eq!(parse_heart_rate(&[0x01, 29, 45, 0x00]), None);
        assert_eq!(parse_heart_rate(&[0x01, 221, 45, 0x00]), None);
        assert_eq!(detect_dialect(&[0x01, 72, 45, 0x00]), Some(HeartRateDialect::Compact));
    }

    #[test]
    fn test_compact_noise_does_not_fall_through() {
        // Would read as standard 8-bit heart rate 10 if the gate fell through
        assert_eq!(parse_heart_rate(&[0x01, 10, 0, 0]), None);
    }

    #[test]
    fn test_structured_frame_dialect() {
        let frame = [0xEF, 0x02, 0xAA, 0xBB, 0xCC, 0xDD, 64, 0x00];
        assert_eq!(parse_heart_rate(&frame), Some(64));
        assert_eq!(detect_dialect(&frame), Some(HeartRateDialect::StructuredFrame));
    }

    #[test]
    fn test_standard_dialect() {
        assert_eq!(parse_heart_rate(&[0x00, 80]), Some(80));
        assert_eq!(parse_heart_rate(&[0x01, 0x2C, 0x01]), Some(300));
        assert_eq!(parse_heart_rate(&[0x01, 0x2C]), None);
    }

    #[test]
    fn test_standard_rr_intervals_yield_hrv() {
        // flags: 8-bit HR + RR present; RR 1024 (1000ms) then 1126 (~1099ms)
        let payload = [0x10, 60, 0x00, 0x04, 0x66, 0x04];
        let reading = decode_heart_rate(&payload, &PlausibilityLimits::default()).unwrap();
        assert_eq!(reading.bpm, 60);
        assert_eq!(reading.hrv_ms, Some(99));
    }

    #[test]
    fn test_short_buffers_yield_nothing() {
        assert_eq!(parse_heart_rate(&[]), None);
        assert_eq!(parse_heart_rate(&[0x00]), None);
    }

    #[test]
    fn test_battery() {
        assert_eq!(parse_battery(&[87]), Some(87));
        assert_eq!(parse_battery(&[250, 1]), Some(250));
        assert_eq!(parse_battery(&[]), None);
    }

    #[test]
    fn test_blood_oxygen_shapes_and_floor() {
        let limits = PlausibilityLimits::default();
        assert_eq!(parse_blood_oxygen(&[97], &limits), Some(97));
        assert_eq!(parse_blood_oxygen(&[80], &limits), None);
        assert_eq!(parse_blood_oxygen(&[0x02, 95, 0, 0], &limits), Some(95));
        assert_eq!(
            parse_blood_oxygen(&[0xEF, 0x03, 0, 0, 0, 0, 98, 0], &limits),
            Some(98)
        );
        assert_eq!(parse_blood_oxygen(&[0xEF, 0x03, 0, 0, 0, 0, 120], &limits), None);
        assert_eq!(parse_blood_oxygen(&[], &limits), None);
    }

    #[test]
    fn test_linear_stress_curve() {
        assert_eq!(derive_stress(150), 0);
        assert_eq!(derive_stress(100), 0);
        assert_eq!(derive_stress(60), 50);
        assert_eq!(derive_stress(20), 100);
        assert_eq!(derive_stress(0), 100);
    }

    #[test]
    fn test_linear_stress_bounds_validated() {
        assert!(matches!(
            LinearStressScorer::new(20, 100),
            Err(RingError::InvalidParameters(_))
        ));
        assert!(LinearStressScorer::new(50, 50).is_err());

        let scorer = LinearStressScorer::new(80, 40).unwrap();
        assert_eq!(scorer.relaxed_hrv_ms(), 80);
        assert_eq!(scorer.stressed_hrv_ms(), 40);
        assert_eq!(scorer.score(60), 50);
        assert_eq!(scorer.score(90), 0);
        assert_eq!(scorer.score(10), 100);
    }

    #[test]
    fn test_command_acknowledgements_yield_nothing() {
        let parser = TelemetryParser::default();
        let ack = CommandPacket::vendor(Opcode::DataTransfer, &[0x01]).unwrap();
        let unknown = CommandPacket::structured(STRUCTURED_HEADER, 0x7F, &[0x01]).unwrap();

        assert!(parser.decode(DecoderKind::Vendor, ack.as_bytes()).is_empty());
        assert!(parser.decode(DecoderKind::Vendor, unknown.as_bytes()).is_empty());
    }

    #[test]
    fn test_checksummed_measurement_replies_decoded() {
        let parser = TelemetryParser::default();
        let heart_rate = CommandPacket::vendor(Opcode::HeartRate, &[0, 0, 0, 0, 72]).unwrap();
        let blood_oxygen = CommandPacket::vendor(Opcode::BloodOxygen, &[0, 0, 0, 0, 97]).unwrap();

        assert_eq!(
            values(&parser.decode(DecoderKind::Vendor, heart_rate.as_bytes())),
            vec![TelemetryValue::HeartRate { bpm: 72 }]
        );
        assert_eq!(
            values(&parser.decode(DecoderKind::Vendor, blood_oxygen.as_bytes())),
            vec![TelemetryValue::BloodOxygen { percent: 97 }]
        );
    }

    #[test]
    fn test_parser_emits_stress_for_compact_hrv() {
        let parser = TelemetryParser::default();
        let samples = parser.decode(DecoderKind::Vendor, &[0x01, 70, 60, 0x00]);
        assert_eq!(
            values(&samples),
            vec![
                TelemetryValue::HeartRate { bpm: 70 },
                TelemetryValue::Stress { score: 50 }
            ]
        );
    }

    #[test]
    fn test_parser_vendor_blood_oxygen() {
        let parser = TelemetryParser::default();
        let samples = parser.decode(DecoderKind::Vendor, &[0x02, 96, 0, 0]);
        assert_eq!(values(&samples), vec![TelemetryValue::BloodOxygen { percent: 96 }]);
    }

    #[test]
    fn test_parser_custom_scorer() {
        struct Fixed;
        impl StressScorer for Fixed {
            fn score(&self, _hrv_ms: u16) -> u8 {
                42
            }
        }

        let parser = TelemetryParser::default().with_scorer(Arc::new(Fixed));
        let samples = parser.decode(DecoderKind::Vendor, &[0x01, 70, 10, 0x00]);
        assert_eq!(samples[1].value, TelemetryValue::Stress { score: 42 });
    }

    #[test]
    fn test_parser_battery_and_empty() {
        let parser = TelemetryParser::default();
        assert_eq!(
            values(&parser.decode(DecoderKind::Battery, &[55])),
            vec![TelemetryValue::Battery { percent: 55 }]
        );
        assert!(parser.decode(DecoderKind::Battery, &[]).is_empty());
        assert!(parser.decode(DecoderKind::StandardHeartRate, &[]).is_empty());
    }

    proptest! {
        #[test]
        fn compact_in_range_returns_bpm(bpm in 30u8..=220, hrv in any::<u8>(), status in any::<u8>()) {
            prop_assert_eq!(parse_heart_rate(&[0x01, bpm, hrv, status]), Some(u16::from(bpm)));
        }

        #[test]
        fn compact_out_of_range_is_noise(
            bpm in prop_oneof![0u8..30, 221u8..=255],
            hrv in any::<u8>(),
            status in any::<u8>(),
        ) {
            prop_assert_eq!(parse_heart_rate(&[0x01, bpm, hrv, status]), None);
        }

        #[test]
        fn structured_frame_reads_byte_six(rest in proptest::collection::vec(any::<u8>(), 5..32)) {
            let mut frame = vec![0xEF, 0x02];
            frame.extend_from_slice(&rest);
            prop_assert_eq!(parse_heart_rate(&frame), Some(u16::from(frame[6])));
        }

        #[test]
        fn short_buffers_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..2)) {
            prop_assert_eq!(parse_heart_rate(&bytes), None);
        }

        #[test]
        fn battery_passes_through(level in any::<u8>()) {
            prop_assert_eq!(parse_battery(&[level]), Some(level));
        }

        #[test]
        fn stress_stays_in_range(hrv in any::<u16>()) {
            prop_assert!(derive_stress(hrv) <= 100);
        }

        #[test]
        fn decode_is_total(bytes in proptest::collection::vec(any::<u8>(), 0..40)) {
            let parser = TelemetryParser::default();
            let _ = parser.decode(DecoderKind::Vendor, &bytes);
            let _ = parser.decode(DecoderKind::StandardHeartRate, &bytes);
            let _ = parser.decode(DecoderKind::Battery, &bytes);
        }
    }
}
