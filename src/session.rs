use std::time::SystemTime;
use tracing::{debug, info};

use crate::{
    hub::{FieldUpdate, StateUpdate, WorkoutContext},
    registers::WorkoutFlags,
    types::{SessionPhase, WorkoutKind},
};

/// Consecutive cycles a trigger must hold before it commits
pub const DEBOUNCE_CYCLES: u8 = 2;

/// Register readings gathered over one polling cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleObservation {
    /// Strokes since reset
    pub stroke_count: Option<u32>,
    /// Speed in cm/s
    pub speed_cmps: Option<u32>,
    /// Workout mode flags
    pub flags: Option<WorkoutFlags>,
    /// Intervals left in the workout
    pub intervals_remaining: Option<u32>,
}

/// Typed commands that drive the machine outside the polling cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Console or user reset: back to `NoSession` at once
    Reset,
    /// Explicit disconnect or exit
    LinkClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    RowingStarted,
    WorkoutProgrammed(WorkoutKind),
    JustRowing,
    IntervalAdvanced,
    WorkoutFinished,
    WorkoutCleared,
    ConsoleCleared,
}

/// A committed phase change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Phase before the change
    pub from: SessionPhase,
    /// Phase after the change
    pub to: SessionPhase,
    /// Workout context after the change
    pub workout: Option<WorkoutContext>,
    /// When the change was committed
    pub at: SystemTime,
}

impl Transition {
    /// Hub update publishing the new phase and workout context
    #[must_use]
    pub fn to_update(&self) -> StateUpdate {
        StateUpdate::new()
            .with(FieldUpdate::Phase(self.to))
            .with(FieldUpdate::Workout(self.workout.clone()))
    }
}

/// Debounced session lifecycle
///
/// `NoSession -> RowingDetected -> {JustRow | WorkoutActive(i)} -> Completed | Aborted`.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    phase: SessionPhase,
    workout: Option<WorkoutContext>,
    pending: Option<(Trigger, u8)>,
    interval_baseline: Option<u32>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    /// Machine in `NoSession`
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: SessionPhase::NoSession,
            workout: None,
            pending: None,
            interval_baseline: None,
        }
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Current workout context
    #[must_use]
    pub const fn workout(&self) -> Option<&WorkoutContext> {
        self.workout.as_ref()
    }

    /// Feed one completed polling cycle
    pub fn observe(&mut self, observation: &CycleObservation) -> Option<Transition> {
        self.observe_at(observation, SystemTime::now())
    }

    /// Feed one completed polling cycle with an explicit timestamp
    pub fn observe_at(
        &mut self,
        observation: &CycleObservation,
        at: SystemTime,
    ) -> Option<Transition> {
        self.adopt_interval_count(observation);
        let Some(trigger) = self.candidate(observation) else {
            self.pending = None;
            return None;
        };

        let count = match self.pending {
            Some((pending, count)) if pending == trigger => count + 1,
            _ => 1,
        };
        if count < DEBOUNCE_CYCLES {
            debug!("Session trigger {:?} seen for {} cycle(s)", trigger, count);
            self.pending = Some((trigger, count));
            return None;
        }

        self.pending = None;
        Some(self.commit(trigger, observation, at))
    }

    /// Apply a typed command immediately
    pub fn command(&mut self, command: SessionCommand) -> Option<Transition> {
        self.command_at(command, SystemTime::now())
    }

    /// Apply a typed command with an explicit timestamp
    pub fn command_at(&mut self, command: SessionCommand, at: SystemTime) -> Option<Transition> {
        self.pending = None;
        let to = match command {
            SessionCommand::Reset => {
                self.workout = None;
                self.interval_baseline = None;
                SessionPhase::NoSession
            }
            SessionCommand::LinkClosed => match self.phase {
                SessionPhase::RowingDetected
                | SessionPhase::JustRow
                | SessionPhase::WorkoutActive(_) => SessionPhase::Aborted,
                _ => return None,
            },
        };
        if to == self.phase {
            return None;
        }
        Some(self.transition(to, at))
    }

    /// The console publishes the interval count after the workout flags, so a workout
    /// can be programmed while the counter still reads 0. Its first non-zero reading
    /// becomes the baseline.
    fn adopt_interval_count(&mut self, obs: &CycleObservation) {
        if !matches!(self.phase, SessionPhase::WorkoutActive(_)) {
            return;
        }
        match (obs.intervals_remaining, self.interval_baseline) {
            (Some(now), None | Some(0)) if now > 0 => {
                debug!("Workout interval count published late: {}", now);
                self.interval_baseline = Some(now);
            }
            _ => {}
        }
    }

    fn candidate(&self, obs: &CycleObservation) -> Option<Trigger> {
        let rowing = obs.stroke_count.unwrap_or(0) > 0 || obs.speed_cmps.unwrap_or(0) > 0;
        let programmed = obs.flags.and_then(WorkoutFlags::kind);

        match self.phase {
            SessionPhase::NoSession => rowing.then_some(Trigger::RowingStarted),
            SessionPhase::RowingDetected => Some(
                programmed.map_or(Trigger::JustRowing, Trigger::WorkoutProgrammed),
            ),
            SessionPhase::JustRow => programmed.map(Trigger::WorkoutProgrammed),
            SessionPhase::WorkoutActive(_) => {
                let remaining = obs.intervals_remaining;
                match (remaining, self.interval_baseline) {
                    // a zero baseline has not counted down from anything yet
                    (Some(0), Some(baseline)) if baseline > 0 => {
                        return Some(Trigger::WorkoutFinished);
                    }
                    (Some(now), Some(baseline)) if now < baseline => {
                        return Some(Trigger::IntervalAdvanced);
                    }
                    _ => {}
                }
                match obs.flags {
                    Some(flags) if !flags.is_workout() => Some(Trigger::WorkoutCleared),
                    _ => None,
                }
            }
            SessionPhase::Completed | SessionPhase::Aborted => {
                (obs.stroke_count == Some(0)).then_some(Trigger::ConsoleCleared)
            }
        }
    }

    fn commit(&mut self, trigger: Trigger, obs: &CycleObservation, at: SystemTime) -> Transition {
        let to = match trigger {
            Trigger::RowingStarted => SessionPhase::RowingDetected,
            Trigger::JustRowing => {
                self.workout = Some(WorkoutContext::new(WorkoutKind::JustRow, at));
                SessionPhase::JustRow
            }
            Trigger::WorkoutProgrammed(kind) => {
                self.workout = Some(WorkoutContext::new(kind, at));
                self.interval_baseline = obs.intervals_remaining;
                SessionPhase::WorkoutActive(1)
            }
            Trigger::IntervalAdvanced => {
                self.interval_baseline = obs.intervals_remaining;
                let number = self.workout.as_mut().map_or(1, |w| w.advance(at));
                SessionPhase::WorkoutActive(number)
            }
            Trigger::WorkoutFinished => {
                if let Some(workout) = self.workout.as_mut() {
                    workout.finish();
                }
                SessionPhase::Completed
            }
            Trigger::WorkoutCleared => SessionPhase::Aborted,
            Trigger::ConsoleCleared => {
                self.workout = None;
                self.interval_baseline = None;
                SessionPhase::NoSession
            }
        };
        self.transition(to, at)
    }

    fn transition(&mut self, to: SessionPhase, at: SystemTime) -> Transition {
        let from = self.phase;
        self.phase = to;
        info!("Session {} -> {}", from, to);

        Transition {
            from,
            to,
            workout: self.workout.clone(),
            at,
        }
    }
}
