use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::{
    error::{Result, RowbridgeError},
    types::WorkoutKind,
};

/// Number of bytes a register occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// One byte
    Single,
    /// Two bytes
    Double,
    /// Three bytes
    Triple,
}

impl Width {
    /// Width in bytes
    #[must_use]
    pub const fn bytes(self) -> u8 {
        match self {
            Self::Single => 1,
            Self::Double => 2,
            Self::Triple => 3,
        }
    }
}

/// How a register's bytes encode its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Plain binary integer
    Binary,
    /// Packed BCD, two decimal digits per byte
    Decimal,
}

/// Byte order of multi-byte registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first
    Big,
    /// Least significant byte first
    Little,
}

/// Polling frequency class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Read every polling cycle
    High,
    /// Read every `low_tier_every` cycles
    Low,
    /// Never polled; read through the on-demand queue only
    OnDemand,
}

/// Console registers known to the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    /// Intervals left in the programmed workout
    IntervalsRemaining,
    /// Workout mode bit field
    WorkoutFlags,
    /// Whole metres since reset
    Distance,
    /// Instantaneous power in watts
    Power,
    /// Calories since reset, in 1/1000 kcal
    Calories,
    /// Strokes since reset
    StrokeCount,
    /// Average whole-stroke time in 25 ms units
    StrokeTime,
    /// Average drive time in 25 ms units
    DriveTime,
    /// Average speed in cm/s
    Speed,
    /// Heart rate from the console's own receiver
    ConsoleHeartRate,
    /// 500 m pace in seconds, only valid while shown on the console
    Pace,
    /// Integer stroke rate, only valid while shown on the console
    StrokeRate,
    /// Total work and rest legs plus one
    WorkoutIntervals,
    /// Tank volume in decilitres
    TankVolume,
    /// Clock tenths of a second
    ClockTenths,
    /// Clock seconds
    ClockSeconds,
    /// Clock minutes
    ClockMinutes,
    /// Clock hours
    ClockHours,
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One addressable console register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    /// Register identity
    pub kind: RegisterKind,
    /// Console memory address
    pub address: u16,
    /// Value width
    pub width: Width,
    /// Value encoding
    pub encoding: Encoding,
    /// Byte order
    pub order: ByteOrder,
    /// Polling class
    pub tier: Tier,
}

const fn binary(kind: RegisterKind, address: u16, width: Width, tier: Tier) -> Register {
    Register {
        kind,
        address,
        width,
        encoding: Encoding::Binary,
        order: ByteOrder::Big,
        tier,
    }
}

const fn decimal(kind: RegisterKind, address: u16) -> Register {
    Register {
        kind,
        address,
        width: Width::Single,
        encoding: Encoding::Decimal,
        order: ByteOrder::Big,
        tier: Tier::High,
    }
}

static INTERVALS_REMAINING: Register =
    binary(RegisterKind::IntervalsRemaining, 0x00F, Width::Single, Tier::High);
static WORKOUT_FLAGS: Register =
    binary(RegisterKind::WorkoutFlags, 0x03E, Width::Single, Tier::High);
static DISTANCE: Register = binary(RegisterKind::Distance, 0x055, Width::Double, Tier::High);
static POWER: Register = binary(RegisterKind::Power, 0x088, Width::Double, Tier::High);
static CALORIES: Register = binary(RegisterKind::Calories, 0x08A, Width::Triple, Tier::High);
static TANK_VOLUME: Register = binary(RegisterKind::TankVolume, 0x0A9, Width::Single, Tier::Low);
static STROKE_COUNT: Register =
    binary(RegisterKind::StrokeCount, 0x140, Width::Double, Tier::High);
static STROKE_TIME: Register = binary(RegisterKind::StrokeTime, 0x142, Width::Single, Tier::High);
static DRIVE_TIME: Register = binary(RegisterKind::DriveTime, 0x143, Width::Single, Tier::High);
static SPEED: Register = binary(RegisterKind::Speed, 0x14A, Width::Double, Tier::High);
static CONSOLE_HEART_RATE: Register =
    binary(RegisterKind::ConsoleHeartRate, 0x1A0, Width::Single, Tier::High);
static PACE: Register = Register {
    kind: RegisterKind::Pace,
    address: 0x1A5,
    width: Width::Double,
    encoding: Encoding::Binary,
    order: ByteOrder::Little,
    tier: Tier::OnDemand,
};
static STROKE_RATE: Register =
    binary(RegisterKind::StrokeRate, 0x1A9, Width::Single, Tier::OnDemand);
static WORKOUT_INTERVALS: Register =
    binary(RegisterKind::WorkoutIntervals, 0x1D9, Width::Single, Tier::Low);
static CLOCK_TENTHS: Register = decimal(RegisterKind::ClockTenths, 0x1E0);
static CLOCK_SECONDS: Register = decimal(RegisterKind::ClockSeconds, 0x1E1);
static CLOCK_MINUTES: Register = decimal(RegisterKind::ClockMinutes, 0x1E2);
static CLOCK_HOURS: Register = decimal(RegisterKind::ClockHours, 0x1E3);

/// All registers in polling order
///
/// The clock is read from hours down to tenths so elapsed time is assembled when the
/// tenths register arrives.
pub static REGISTERS: [&Register; 18] = [
    &WORKOUT_FLAGS,
    &INTERVALS_REMAINING,
    &STROKE_COUNT,
    &STROKE_TIME,
    &DRIVE_TIME,
    &SPEED,
    &DISTANCE,
    &POWER,
    &CALORIES,
    &CONSOLE_HEART_RATE,
    &CLOCK_HOURS,
    &CLOCK_MINUTES,
    &CLOCK_SECONDS,
    &CLOCK_TENTHS,
    &WORKOUT_INTERVALS,
    &TANK_VOLUME,
    &PACE,
    &STROKE_RATE,
];

/// Register descriptor for a kind
#[must_use]
pub fn by_kind(kind: RegisterKind) -> &'static Register {
    match kind {
        RegisterKind::IntervalsRemaining => &INTERVALS_REMAINING,
        RegisterKind::WorkoutFlags => &WORKOUT_FLAGS,
        RegisterKind::Distance => &DISTANCE,
        RegisterKind::Power => &POWER,
        RegisterKind::Calories => &CALORIES,
        RegisterKind::StrokeCount => &STROKE_COUNT,
        RegisterKind::StrokeTime => &STROKE_TIME,
        RegisterKind::DriveTime => &DRIVE_TIME,
        RegisterKind::Speed => &SPEED,
        RegisterKind::ConsoleHeartRate => &CONSOLE_HEART_RATE,
        RegisterKind::Pace => &PACE,
        RegisterKind::StrokeRate => &STROKE_RATE,
        RegisterKind::WorkoutIntervals => &WORKOUT_INTERVALS,
        RegisterKind::TankVolume => &TANK_VOLUME,
        RegisterKind::ClockTenths => &CLOCK_TENTHS,
        RegisterKind::ClockSeconds => &CLOCK_SECONDS,
        RegisterKind::ClockMinutes => &CLOCK_MINUTES,
        RegisterKind::ClockHours => &CLOCK_HOURS,
    }
}

/// Register descriptor for a console address
#[must_use]
pub fn lookup(address: u16) -> Option<&'static Register> {
    REGISTERS.iter().copied().find(|r| r.address == address)
}

/// Registers of one polling tier, in polling order
pub fn in_tier(tier: Tier) -> impl Iterator<Item = &'static Register> {
    REGISTERS.iter().copied().filter(move |r| r.tier == tier)
}

impl Register {
    /// Encode a canonical value into this register's wire representation
    ///
    /// Values wider than the register are truncated to its low-order digits or bytes.
    #[must_use]
    pub fn encode_value(&self, value: u32) -> Bytes {
        let width = usize::from(self.width.bytes());
        let mut digits = Vec::with_capacity(width);
        let mut rest = value;
        for _ in 0..width {
            #[allow(clippy::cast_possible_truncation)]
            let byte = match self.encoding {
                Encoding::Binary => {
                    let b = (rest & 0xFF) as u8;
                    rest >>= 8;
                    b
                }
                Encoding::Decimal => {
                    let pair = rest % 100;
                    rest /= 100;
                    (((pair / 10) << 4) | (pair % 10)) as u8
                }
            };
            digits.push(byte);
        }

        let mut buf = BytesMut::with_capacity(width);
        match self.order {
            ByteOrder::Little => buf.put_slice(&digits),
            ByteOrder::Big => digits.iter().rev().for_each(|b| buf.put_u8(*b)),
        }
        buf.freeze()
    }
}

/// A register value normalized to one canonical integer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterValue {
    /// Register identity
    pub kind: RegisterKind,
    /// Console address the value came from
    pub address: u16,
    /// Canonical value
    pub raw: u32,
}

impl RegisterValue {
    /// Decode a read-response payload for a register
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::ParseError`] if the payload length does not match the
    /// register width or a BCD nibble is not a decimal digit.
    pub fn decode(register: &Register, payload: &[u8]) -> Result<Self> {
        if payload.len() != usize::from(register.width.bytes()) {
            return Err(RowbridgeError::ParseError(format!(
                "{} expects {} bytes, got {}",
                register.kind,
                register.width.bytes(),
                payload.len()
            )));
        }

        let ordered: Vec<u8> = match register.order {
            ByteOrder::Big => payload.to_vec(),
            ByteOrder::Little => payload.iter().rev().copied().collect(),
        };

        let mut raw: u32 = 0;
        for byte in ordered {
            match register.encoding {
                Encoding::Binary => raw = (raw << 8) | u32::from(byte),
                Encoding::Decimal => {
                    let (hi, lo) = (byte >> 4, byte & 0x0F);
                    if hi > 9 || lo > 9 {
                        return Err(RowbridgeError::ParseError(format!(
                            "{} carries non-decimal byte {byte:02X}",
                            register.kind
                        )));
                    }
                    raw = raw * 100 + u32::from(hi) * 10 + u32::from(lo);
                }
            }
        }

        Ok(Self {
            kind: register.kind,
            address: register.address,
            raw,
        })
    }
}

/// Workout mode bit field, built only from a canonical register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkoutFlags(u32);

impl WorkoutFlags {
    /// Heart-rate zone active
    pub const HEART_RATE_ZONE: u32 = 1 << 0;
    /// Intensity zone active
    pub const INTENSITY_ZONE: u32 = 1 << 1;
    /// Stroke-rate zone active
    pub const STROKE_RATE_ZONE: u32 = 1 << 2;
    /// Prognostics active
    pub const PROGNOSTICS: u32 = 1 << 3;
    /// Single distance workout
    pub const DISTANCE: u32 = 1 << 4;
    /// Single duration workout
    pub const DURATION: u32 = 1 << 5;
    /// Distance interval workout
    pub const DISTANCE_INTERVAL: u32 = 1 << 6;
    /// Duration interval workout
    pub const DURATION_INTERVAL: u32 = 1 << 7;
    /// Bits that denote a programmed workout
    pub const WORKOUT_MASK: u32 =
        Self::DISTANCE | Self::DURATION | Self::DISTANCE_INTERVAL | Self::DURATION_INTERVAL;

    /// Wrap a canonical register value
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Canonical value
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether any workout mode bit is set
    #[must_use]
    pub const fn is_workout(self) -> bool {
        self.0 & Self::WORKOUT_MASK != 0
    }

    /// Whether the workout is an interval workout
    #[must_use]
    pub const fn is_interval(self) -> bool {
        self.0 & (Self::DISTANCE_INTERVAL | Self::DURATION_INTERVAL) != 0
    }

    /// Programmed workout kind, if any
    #[must_use]
    pub const fn kind(self) -> Option<WorkoutKind> {
        if self.0 & (Self::DISTANCE | Self::DISTANCE_INTERVAL) != 0 {
            Some(WorkoutKind::Distance)
        } else if self.0 & (Self::DURATION | Self::DURATION_INTERVAL) != 0 {
            Some(WorkoutKind::Duration)
        } else {
            None
        }
    }
}
