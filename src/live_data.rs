use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{EncodeError, Result, RowbridgeError},
    hub::{RowerState, Subscription},
    types::EncoderConfig,
};

/// Flags word size
pub const FLAGS_SIZE: usize = 2;

/// Flags plus the fields that are always emitted: stroke rate and count, total
/// distance, heart rate
pub const MANDATORY_SIZE: usize = FLAGS_SIZE + 3 + 3 + 1;

const FLAG_AVERAGE_STROKE_RATE: u16 = 1 << 1;
const FLAG_TOTAL_DISTANCE: u16 = 1 << 2;
const FLAG_INSTANTANEOUS_PACE: u16 = 1 << 3;
const FLAG_AVERAGE_PACE: u16 = 1 << 4;
const FLAG_INSTANTANEOUS_POWER: u16 = 1 << 5;
const FLAG_EXPENDED_ENERGY: u16 = 1 << 8;
const FLAG_HEART_RATE: u16 = 1 << 9;
const FLAG_ELAPSED_TIME: u16 = 1 << 11;

const ENERGY_NOT_AVAILABLE_U16: u16 = 0xFFFF;
const ENERGY_NOT_AVAILABLE_U8: u8 = 0xFF;

/// Optional live-data fields, as a bit set
///
/// Bit positions match the rower-data flags word, so a set can be OR-ed straight into
/// the encoded flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LiveFields(u16);

impl LiveFields {
    /// Average stroke rate (1 byte)
    pub const AVERAGE_STROKE_RATE: Self = Self(FLAG_AVERAGE_STROKE_RATE);
    /// Instantaneous pace (2 bytes)
    pub const INSTANTANEOUS_PACE: Self = Self(FLAG_INSTANTANEOUS_PACE);
    /// Average pace (2 bytes)
    pub const AVERAGE_PACE: Self = Self(FLAG_AVERAGE_PACE);
    /// Instantaneous power (2 bytes)
    pub const INSTANTANEOUS_POWER: Self = Self(FLAG_INSTANTANEOUS_POWER);
    /// Expended energy (5 bytes)
    pub const EXPENDED_ENERGY: Self = Self(FLAG_EXPENDED_ENERGY);
    /// Elapsed time (2 bytes)
    pub const ELAPSED_TIME: Self = Self(FLAG_ELAPSED_TIME);

    /// Optional fields in the order they are dropped when a payload is too large
    pub const DROP_ORDER: [Self; 6] = [
        Self::AVERAGE_PACE,
        Self::AVERAGE_STROKE_RATE,
        Self::EXPENDED_ENERGY,
        Self::ELAPSED_TIME,
        Self::INSTANTANEOUS_POWER,
        Self::INSTANTANEOUS_PACE,
    ];

    /// No optional fields
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every optional field
    #[must_use]
    pub const fn all() -> Self {
        Self(
            FLAG_AVERAGE_STROKE_RATE
                | FLAG_INSTANTANEOUS_PACE
                | FLAG_AVERAGE_PACE
                | FLAG_INSTANTANEOUS_POWER
                | FLAG_EXPENDED_ENERGY
                | FLAG_ELAPSED_TIME,
        )
    }

    /// Raw bits (only known optional bits are kept)
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0 & Self::all().0
    }

    /// Whether every field of `other` is in the set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.bits() & other.0 == other.0
    }

    /// Whether the set is empty
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits() == 0
    }

    /// Set with the fields of `other` added
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Set with the fields of `other` removed
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Encoded size of the optional fields in the set
    #[must_use]
    pub const fn payload_size(self) -> usize {
        let mut size = 0;
        if self.contains(Self::AVERAGE_STROKE_RATE) {
            size += 1;
        }
        if self.contains(Self::INSTANTANEOUS_PACE) {
            size += 2;
        }
        if self.contains(Self::AVERAGE_PACE) {
            size += 2;
        }
        if self.contains(Self::INSTANTANEOUS_POWER) {
            size += 2;
        }
        if self.contains(Self::EXPENDED_ENERGY) {
            size += 5;
        }
        if self.contains(Self::ELAPSED_TIME) {
            size += 2;
        }
        size
    }
}

impl fmt::Display for LiveFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::AVERAGE_STROKE_RATE, "avg-stroke-rate"),
            (Self::INSTANTANEOUS_PACE, "pace"),
            (Self::AVERAGE_PACE, "avg-pace"),
            (Self::INSTANTANEOUS_POWER, "power"),
            (Self::EXPENDED_ENERGY, "energy"),
            (Self::ELAPSED_TIME, "elapsed"),
        ];
        let present: Vec<&str> = names
            .iter()
            .filter(|(field, _)| self.contains(*field))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", present.join(", "))
    }
}

/// Encoded notification payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    /// Payload bytes
    pub bytes: Bytes,
    /// Requested optional fields that were dropped to fit the limit
    pub dropped: LiveFields,
}

fn saturate_u8(value: u64) -> u8 {
    u8::try_from(value).unwrap_or(u8::MAX)
}

fn saturate_u16(value: u64) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// Stroke rate in half strokes per minute
fn half_spm(rate: f64) -> u8 {
    if !rate.is_finite() || rate <= 0.0 {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let halves = (rate * 2.0).round().min(f64::from(u8::MAX)) as u8;
    halves
}

fn average_stroke_rate(state: &RowerState) -> u8 {
    match (state.stroke_count, state.elapsed_s) {
        (Some(strokes), Some(elapsed)) if elapsed > 0 => {
            saturate_u8(u64::from(strokes) * 120 / u64::from(elapsed))
        }
        _ => 0,
    }
}

fn average_pace(state: &RowerState) -> u16 {
    match (state.elapsed_s, state.distance_m) {
        (Some(elapsed), Some(distance)) if distance > 0 => {
            saturate_u16(u64::from(elapsed) * 500 / u64::from(distance))
        }
        _ => 0,
    }
}

/// Encode a snapshot as a rower-data notification no larger than `limit` bytes
///
/// Requested optional fields are dropped lowest priority first (see
/// [`LiveFields::DROP_ORDER`]) until the payload fits. Unset mandatory fields encode as
/// zero.
///
/// # Errors
///
/// Returns [`EncodeError::LimitTooSmall`] if `limit` cannot hold the mandatory fields.
pub fn encode(
    state: &RowerState,
    fields: LiveFields,
    limit: usize,
) -> std::result::Result<EncodedPayload, EncodeError> {
    if limit < MANDATORY_SIZE {
        return Err(EncodeError::LimitTooSmall {
            limit,
            required: MANDATORY_SIZE,
        });
    }

    let requested = LiveFields(fields.bits());
    let mut selected = requested;
    for field in LiveFields::DROP_ORDER {
        if MANDATORY_SIZE + selected.payload_size() <= limit {
            break;
        }
        selected = selected.without(field);
    }

    let flags = FLAG_TOTAL_DISTANCE | FLAG_HEART_RATE | selected.bits();
    let mut buf = BytesMut::with_capacity(MANDATORY_SIZE + selected.payload_size());
    buf.put_u16_le(flags);

    // bit 0 clear: stroke rate and count present
    buf.put_u8(half_spm(state.stroke_rate.unwrap_or(0.0)));
    buf.put_u16_le(saturate_u16(u64::from(state.stroke_count.unwrap_or(0))));

    if selected.contains(LiveFields::AVERAGE_STROKE_RATE) {
        buf.put_u8(average_stroke_rate(state));
    }

    let distance = state.distance_m.unwrap_or(0).min(0x00FF_FFFF);
    buf.put_uint_le(u64::from(distance), 3);

    if selected.contains(LiveFields::INSTANTANEOUS_PACE) {
        buf.put_u16_le(saturate_u16(u64::from(state.pace_500m_s.unwrap_or(0))));
    }
    if selected.contains(LiveFields::AVERAGE_PACE) {
        buf.put_u16_le(average_pace(state));
    }
    if selected.contains(LiveFields::INSTANTANEOUS_POWER) {
        let power = state
            .power_w
            .unwrap_or(0)
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX));
        buf.put_i16_le(i16::try_from(power).unwrap_or_default());
    }
    if selected.contains(LiveFields::EXPENDED_ENERGY) {
        buf.put_u16_le(saturate_u16(u64::from(state.total_calories.unwrap_or(0))));
        buf.put_u16_le(ENERGY_NOT_AVAILABLE_U16);
        buf.put_u8(ENERGY_NOT_AVAILABLE_U8);
    }

    buf.put_u8(saturate_u8(u64::from(state.heart_rate_bpm.unwrap_or(0))));

    if selected.contains(LiveFields::ELAPSED_TIME) {
        buf.put_u16_le(saturate_u16(u64::from(state.elapsed_s.unwrap_or(0))));
    }

    Ok(EncodedPayload {
        bytes: buf.freeze(),
        dropped: requested.without(selected),
    })
}

/// Outbound notification transport
///
/// Implemented by the GATT server that owns the live-data characteristic.
#[async_trait]
pub trait NotifySink: Send + Sync {
    /// Send one notification payload to connected clients
    async fn notify(&self, payload: Bytes) -> Result<()>;
}

/// Sink forwarding payloads into an in-process channel
#[derive(Debug, Clone)]
pub struct ChannelNotifySink {
    sender: mpsc::Sender<Bytes>,
}

impl ChannelNotifySink {
    /// Sink plus the receiver its payloads arrive on
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl NotifySink for ChannelNotifySink {
    async fn notify(&self, payload: Bytes) -> Result<()> {
        self.sender
            .send(payload)
            .await
            .map_err(|_| RowbridgeError::ChannelClosed("live-data notifications"))
    }
}

/// Encode every delivered snapshot and hand it to `sink` until shutdown
///
/// Notification failures are logged and the loop carries on with the next snapshot.
/// A notification still pending when shutdown is signalled is abandoned.
///
/// # Errors
///
/// Returns [`RowbridgeError::Encode`] if the configured limit cannot hold the mandatory
/// fields.
pub async fn run_notifications(
    mut subscription: Subscription,
    sink: Arc<dyn NotifySink>,
    config: EncoderConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    if config.max_payload < MANDATORY_SIZE {
        return Err(EncodeError::LimitTooSmall {
            limit: config.max_payload,
            required: MANDATORY_SIZE,
        }
        .into());
    }

    info!(
        "Live-data notifications started (limit {} bytes, fields {})",
        config.max_payload, config.fields
    );
    let mut reported_drop = LiveFields::empty();

    loop {
        let snapshot = tokio::select! {
            () = shutdown.cancelled() => break,
            next = subscription.next() => match next {
                Some(snapshot) => snapshot,
                None => break,
            },
        };

        let payload = encode(&snapshot, config.fields, config.max_payload)?;
        if payload.dropped != reported_drop {
            debug!("Dropping live-data fields {} to fit limit", payload.dropped);
            reported_drop = payload.dropped;
        }
        let sent = tokio::select! {
            () = shutdown.cancelled() => break,
            sent = sink.notify(payload.bytes) => sent,
        };
        if let Err(e) = sent {
            warn!("Live-data notification failed: {}", e);
        }
    }

    info!("Live-data notifications stopped");
    Ok(())
}
