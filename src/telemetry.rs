use std::collections::VecDeque;
use tracing::{debug, info};

use crate::{
    hub::{FieldUpdate, StateUpdate},
    registers::{RegisterKind, RegisterValue, WorkoutFlags},
    session::{CycleObservation, SessionCommand, SessionMachine, Transition},
    types::SessionPhase,
};

/// Stroke and drive times are reported in 25 ms units
const TIME_UNIT_MS: u32 = 25;

/// Strokes averaged for reported power
const POWER_WINDOW: usize = 4;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Turns console register values into rower-class hub updates
///
/// Derived metrics (stroke rate, stroke ratio, pace, rolling power, elapsed time) are
/// computed here, and every completed polling cycle is fed to the session machine.
#[derive(Debug, Default)]
pub struct TelemetryIngest {
    session: SessionMachine,
    observation: CycleObservation,
    stroke_ms: u32,
    drive_ms: u32,
    console_pace: u32,
    power_window: VecDeque<u32>,
    clock: [u32; 4],
    elapsed_max: u32,
    planned_intervals: Option<u32>,
    tank_volume_dl: Option<u32>,
    console_heart_rate: Option<u16>,
}

impl TelemetryIngest {
    /// Ingest with an idle session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current session phase
    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    /// Work intervals programmed on the console, if known
    #[must_use]
    pub const fn planned_intervals(&self) -> Option<u32> {
        self.planned_intervals
    }

    /// Tank volume in decilitres, if read
    #[must_use]
    pub const fn tank_volume_dl(&self) -> Option<u32> {
        self.tank_volume_dl
    }

    /// Heart rate reported by the console's own receiver since the last call
    pub fn take_console_heart_rate(&mut self) -> Option<u16> {
        self.console_heart_rate.take()
    }

    /// Convert one register value into a hub update
    ///
    /// Session-relevant registers also update the cycle observation.
    pub fn on_value(&mut self, value: RegisterValue) -> StateUpdate {
        let mut update = StateUpdate::new();
        let raw = value.raw;

        match value.kind {
            RegisterKind::StrokeCount => {
                self.observation.stroke_count = Some(raw);
                update.push(FieldUpdate::StrokeCount(Some(raw)));
            }
            RegisterKind::StrokeTime => {
                self.stroke_ms = raw * TIME_UNIT_MS;
                let rate = if self.stroke_ms == 0 {
                    0.0
                } else {
                    round2(60_000.0 / f64::from(self.stroke_ms))
                };
                update.push(FieldUpdate::StrokeRate(Some(rate)));
                if let Some(ratio) = self.stroke_ratio() {
                    update.push(FieldUpdate::StrokeRatio(Some(ratio)));
                }
            }
            RegisterKind::DriveTime => {
                self.drive_ms = raw * TIME_UNIT_MS;
                if let Some(ratio) = self.stroke_ratio() {
                    update.push(FieldUpdate::StrokeRatio(Some(ratio)));
                }
            }
            RegisterKind::Speed => {
                self.observation.speed_cmps = Some(raw);
                if raw == 0 {
                    // standstill
                    self.power_window.clear();
                    update.push(FieldUpdate::Speed(Some(0)));
                    update.push(FieldUpdate::Pace(Some(0)));
                    update.push(FieldUpdate::StrokeRate(Some(0.0)));
                    update.push(FieldUpdate::Power(Some(0)));
                } else {
                    update.push(FieldUpdate::Speed(Some(raw)));
                    if self.console_pace == 0 {
                        let pace = (50_000.0 / f64::from(raw)).round();
                        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                        update.push(FieldUpdate::Pace(Some(pace as u32)));
                    }
                }
            }
            RegisterKind::Pace => {
                self.console_pace = raw;
                if raw != 0 {
                    update.push(FieldUpdate::Pace(Some(raw)));
                }
            }
            RegisterKind::StrokeRate => {
                update.push(FieldUpdate::StrokeRate(Some(f64::from(raw))));
            }
            RegisterKind::Power => {
                if raw > 0 {
                    self.power_window.push_back(raw);
                    while self.power_window.len() > POWER_WINDOW {
                        self.power_window.pop_front();
                    }
                }
                if !self.power_window.is_empty() {
                    let sum: u32 = self.power_window.iter().sum();
                    #[allow(clippy::cast_precision_loss)]
                    let mean = f64::from(sum) / self.power_window.len() as f64;
                    #[allow(clippy::cast_possible_truncation)]
                    update.push(FieldUpdate::Power(Some(mean.round() as i32)));
                }
            }
            RegisterKind::Distance => update.push(FieldUpdate::Distance(Some(raw))),
            RegisterKind::Calories => update.push(FieldUpdate::Calories(Some(raw / 1_000))),
            RegisterKind::ConsoleHeartRate => {
                if raw > 0 {
                    self.console_heart_rate = u16::try_from(raw).ok();
                }
            }
            RegisterKind::ClockHours => self.clock[0] = raw,
            RegisterKind::ClockMinutes => self.clock[1] = raw,
            RegisterKind::ClockSeconds => self.clock[2] = raw,
            RegisterKind::ClockTenths => {
                self.clock[3] = raw;
                let [hours, minutes, seconds, _] = self.clock;
                let compiled = hours * 3_600 + minutes * 60 + seconds;
                // the clock can tick between component reads; never step backwards
                self.elapsed_max = self.elapsed_max.max(compiled);
                update.push(FieldUpdate::Elapsed(Some(self.elapsed_max)));
            }
            RegisterKind::WorkoutFlags => {
                self.observation.flags = Some(WorkoutFlags::from_raw(raw));
            }
            RegisterKind::IntervalsRemaining => {
                self.observation.intervals_remaining = Some(raw);
            }
            RegisterKind::WorkoutIntervals => {
                let planned = raw / 2;
                if self.planned_intervals != Some(planned) {
                    info!("Console workout has {} work interval(s)", planned);
                }
                self.planned_intervals = Some(planned);
            }
            RegisterKind::TankVolume => {
                if self.tank_volume_dl != Some(raw) {
                    debug!("Tank volume {} dl", raw);
                }
                self.tank_volume_dl = Some(raw);
            }
        }

        update
    }

    /// Close a polling cycle and feed it to the session machine
    pub fn on_cycle_complete(&mut self) -> Option<Transition> {
        let transition = self.session.observe(&self.observation)?;
        if transition.to == SessionPhase::NoSession {
            self.clear_session_state();
        }
        Some(transition)
    }

    /// Apply a typed session command
    pub fn on_command(&mut self, command: SessionCommand) -> Option<Transition> {
        if command == SessionCommand::Reset {
            self.clear_session_state();
        }
        self.session.command(command)
    }

    fn stroke_ratio(&self) -> Option<f64> {
        if self.drive_ms == 0 || self.stroke_ms <= self.drive_ms {
            return None;
        }
        let recovery = f64::from(self.stroke_ms - self.drive_ms);
        Some(round2(recovery / (f64::from(self.drive_ms) * 1.25)))
    }

    fn clear_session_state(&mut self) {
        self.elapsed_max = 0;
        self.clock = [0; 4];
        self.power_window.clear();
    }
}
