use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    hrv::HrvAnalyzer,
    hub::{RowerHub, RowerState, RrSample, WorkoutContext},
    persistence::{PersistenceQueue, Record, Scope, TelemetrySample, WorkoutId},
    session::Transition,
    types::{HrvConfig, PersistenceConfig, SessionPhase},
};

/// A committed session transition plus what the console knew about the workout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    /// The transition
    pub transition: Transition,
    /// Work intervals programmed on the console, if known
    pub planned_intervals: Option<u32>,
}

#[derive(Debug, Clone)]
struct ActiveWorkout {
    id: WorkoutId,
    interval: usize,
}

/// Turns session transitions, RR samples and periodic snapshots into storage records
///
/// RR samples and HRV windows are only recorded while a workout is open, scoped to
/// its running interval. The HRV buckets restart at every interval boundary.
#[derive(Debug)]
pub struct SessionRecorder {
    user: String,
    active: Option<ActiveWorkout>,
    hrv: HrvAnalyzer,
}

impl SessionRecorder {
    /// Recorder for `user`
    #[must_use]
    pub fn new(user: impl Into<String>, hrv: &HrvConfig) -> Self {
        Self {
            user: user.into(),
            active: None,
            hrv: HrvAnalyzer::new(hrv),
        }
    }

    /// Scope of the running interval
    #[must_use]
    pub fn scope(&self) -> Option<Scope> {
        self.active.as_ref().map(|active| Scope {
            user: self.user.clone(),
            workout: active.id,
            interval: active.interval,
        })
    }

    /// Records produced by a session transition
    pub fn on_transition(&mut self, event: &SessionEvent) -> Vec<Record> {
        let transition = &event.transition;
        let mut records = Vec::new();

        match (transition.from, transition.to) {
            (SessionPhase::JustRow, SessionPhase::WorkoutActive(_)) => {
                self.end_workout(None, &mut records);
                self.start_workout(transition, event.planned_intervals, &mut records);
            }
            (_, SessionPhase::JustRow | SessionPhase::WorkoutActive(1))
                if self.active.is_none() =>
            {
                self.start_workout(transition, event.planned_intervals, &mut records);
            }
            (SessionPhase::WorkoutActive(_), SessionPhase::WorkoutActive(next)) => {
                self.next_interval(next, transition, &mut records);
            }
            (_, SessionPhase::Completed | SessionPhase::Aborted | SessionPhase::NoSession) => {
                self.end_workout(transition.workout.as_ref(), &mut records);
            }
            _ => {}
        }

        records
    }

    /// Records produced by one RR sample
    pub fn on_rr(&mut self, sample: &RrSample) -> Vec<Record> {
        let Some(scope) = self.scope() else {
            return Vec::new();
        };
        let windows = self.hrv.push(sample);

        let mut records = Vec::with_capacity(windows.len() + 1);
        records.push(Record::RrSample {
            scope: scope.clone(),
            timestamp: sample.timestamp,
            rr_ms: sample.rr_ms,
        });
        records.extend(windows.into_iter().map(|window| Record::HrvWindow {
            scope: scope.clone(),
            window,
        }));
        records
    }

    /// Records produced by the periodic sample tick
    pub fn on_tick(&mut self, state: &RowerState, now: SystemTime) -> Vec<Record> {
        let Some(scope) = self.scope() else {
            return Vec::new();
        };
        let mut records: Vec<Record> = self
            .hrv
            .poll(now)
            .into_iter()
            .map(|window| Record::HrvWindow {
                scope: scope.clone(),
                window,
            })
            .collect();
        if state.phase.is_recording() {
            records.push(Record::IntervalSample {
                scope,
                sample: TelemetrySample::from_state(state, now),
            });
        }
        records
    }

    fn start_workout(
        &mut self,
        transition: &Transition,
        planned_intervals: Option<u32>,
        records: &mut Vec<Record>,
    ) {
        let Some(workout) = transition.workout.as_ref() else {
            return;
        };
        let started_at = workout
            .intervals
            .first()
            .map_or(transition.at, |interval| interval.started_at);
        let id = WorkoutId::from_start(started_at);

        info!("Recording {} workout {}", workout.kind, id);
        records.push(Record::WorkoutStarted {
            user: self.user.clone(),
            workout: id,
            kind: workout.kind,
            interval_count: planned_intervals,
        });
        self.hrv.start_at(started_at);
        self.active = Some(ActiveWorkout {
            id,
            interval: workout.interval_number().max(1),
        });
    }

    fn next_interval(&mut self, next: usize, transition: &Transition, records: &mut Vec<Record>) {
        self.flush_hrv(records);
        let started_at = transition
            .workout
            .as_ref()
            .and_then(|w| w.intervals.last())
            .map_or(transition.at, |interval| interval.started_at);
        self.hrv.start_at(started_at);
        if let Some(active) = self.active.as_mut() {
            debug!("{} entering interval {}", active.id, next);
            active.interval = next;
        }
    }

    fn end_workout(&mut self, workout: Option<&WorkoutContext>, records: &mut Vec<Record>) {
        self.flush_hrv(records);
        let Some(active) = self.active.take() else {
            return;
        };
        let completed = workout.is_some_and(|w| w.completed);
        let interval_count = workout.map_or(active.interval, |w| w.intervals.len());

        info!(
            "Workout {} ended ({} intervals, completed: {})",
            active.id, interval_count, completed
        );
        records.push(Record::WorkoutEnded {
            user: self.user.clone(),
            workout: active.id,
            completed,
            interval_count,
        });
    }

    fn flush_hrv(&mut self, records: &mut Vec<Record>) {
        let Some(scope) = self.scope() else {
            self.hrv.finish();
            return;
        };
        if let Some(window) = self.hrv.finish() {
            records.push(Record::HrvWindow { scope, window });
        }
    }
}

/// Feed transitions, RR samples and periodic snapshots into the persistence queue
///
/// Runs until the transition channel closes. After shutdown only transitions are
/// drained, so the closing transition of the serial loop is still recorded.
pub async fn run_recorder(
    mut recorder: SessionRecorder,
    mut transitions: mpsc::Receiver<SessionEvent>,
    mut rr_samples: mpsc::Receiver<RrSample>,
    hub: RowerHub,
    queue: PersistenceQueue,
    config: PersistenceConfig,
    shutdown: CancellationToken,
) {
    let cadence = Duration::from_millis(config.sample_interval_ms.max(1));
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut rr_open = true;

    loop {
        let records = tokio::select! {
            () = shutdown.cancelled() => {
                // the serial loop reports its closing transition before dropping the sender
                while let Some(event) = transitions.recv().await {
                    for record in recorder.on_transition(&event) {
                        queue.submit(record);
                    }
                }
                break;
            }
            event = transitions.recv() => match event {
                Some(event) => recorder.on_transition(&event),
                None => break,
            },
            sample = rr_samples.recv(), if rr_open => match sample {
                Some(sample) => recorder.on_rr(&sample),
                None => {
                    rr_open = false;
                    Vec::new()
                }
            },
            _ = ticker.tick() => recorder.on_tick(&hub.snapshot(), SystemTime::now()),
        };

        for record in records {
            queue.submit(record);
        }
    }

    debug!("Session recorder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkoutKind;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000 + secs)
    }

    fn event(
        from: SessionPhase,
        to: SessionPhase,
        workout: Option<WorkoutContext>,
        secs: u64,
    ) -> SessionEvent {
        SessionEvent {
            transition: Transition {
                from,
                to,
                workout,
                at: at(secs),
            },
            planned_intervals: Some(3),
        }
    }

    fn recorder() -> SessionRecorder {
        SessionRecorder::new("alice", &HrvConfig { window_secs: 60 })
    }

    #[test]
    fn test_workout_lifecycle_records() {
        let mut recorder = recorder();
        let mut workout = WorkoutContext::new(WorkoutKind::Distance, at(0));

        let records = recorder.on_transition(&event(
            SessionPhase::RowingDetected,
            SessionPhase::WorkoutActive(1),
            Some(workout.clone()),
            0,
        ));
        let id = WorkoutId::from_start(at(0));
        assert_eq!(
            records,
            vec![Record::WorkoutStarted {
                user: "alice".to_string(),
                workout: id,
                kind: WorkoutKind::Distance,
                interval_count: Some(3),
            }]
        );
        assert_eq!(recorder.scope().unwrap().interval, 1);

        workout.advance(at(90));
        recorder.on_transition(&event(
            SessionPhase::WorkoutActive(1),
            SessionPhase::WorkoutActive(2),
            Some(workout.clone()),
            90,
        ));
        assert_eq!(recorder.scope().unwrap().interval, 2);

        workout.finish();
        let records = recorder.on_transition(&event(
            SessionPhase::WorkoutActive(2),
            SessionPhase::Completed,
            Some(workout),
            200,
        ));
        assert_eq!(
            records.last(),
            Some(&Record::WorkoutEnded {
                user: "alice".to_string(),
                workout: id,
                completed: true,
                interval_count: 2,
            })
        );
        assert_eq!(recorder.scope(), None);
    }

    #[test]
    fn test_rr_ignored_without_workout() {
        let mut recorder = recorder();
        assert!(recorder.on_rr(&RrSample::new(at(0), 800)).is_empty());
        assert!(recorder
            .on_tick(&RowerState::default(), at(1))
            .is_empty());
    }

    #[test]
    fn test_rr_and_hrv_scoped_to_interval() {
        let mut recorder = recorder();
        let mut workout = WorkoutContext::new(WorkoutKind::Duration, at(0));
        recorder.on_transition(&event(
            SessionPhase::RowingDetected,
            SessionPhase::WorkoutActive(1),
            Some(workout.clone()),
            0,
        ));

        for (i, rr) in [800, 810, 790, 805, 795].into_iter().enumerate() {
            let records = recorder.on_rr(&RrSample::new(at(i as u64), rr));
            assert_eq!(records.len(), 1);
        }

        workout.advance(at(30));
        let records = recorder.on_transition(&event(
            SessionPhase::WorkoutActive(1),
            SessionPhase::WorkoutActive(2),
            Some(workout),
            30,
        ));
        let [Record::HrvWindow { scope, window }] = records.as_slice() else {
            panic!("expected one HRV window, got {records:?}");
        };
        assert_eq!(scope.interval, 1);
        assert_eq!(window.samples, 5);
        assert!(window.sdnn.is_some());

        let records = recorder.on_rr(&RrSample::new(at(31), 820));
        let Record::RrSample { scope, .. } = &records[0] else {
            panic!("expected RR record");
        };
        assert_eq!(scope.interval, 2);
    }

    #[test]
    fn test_tick_samples_recording_phase() {
        let mut recorder = recorder();
        let workout = WorkoutContext::new(WorkoutKind::JustRow, at(0));
        recorder.on_transition(&event(
            SessionPhase::RowingDetected,
            SessionPhase::JustRow,
            Some(workout),
            0,
        ));

        let state = RowerState {
            phase: SessionPhase::JustRow,
            distance_m: Some(250),
            ..RowerState::default()
        };
        let records = recorder.on_tick(&state, at(5));
        let [Record::IntervalSample { scope, sample }] = records.as_slice() else {
            panic!("expected one interval sample, got {records:?}");
        };
        assert_eq!(scope.interval, 1);
        assert_eq!(sample.distance_m, Some(250));

        // a minute later the first HRV bucket closes even without samples
        let records = recorder.on_tick(&state, at(61));
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], Record::HrvWindow { .. }));
    }

    #[test]
    fn test_just_row_then_workout_splits_records() {
        let mut recorder = recorder();
        recorder.on_transition(&event(
            SessionPhase::RowingDetected,
            SessionPhase::JustRow,
            Some(WorkoutContext::new(WorkoutKind::JustRow, at(0))),
            0,
        ));

        let records = recorder.on_transition(&event(
            SessionPhase::JustRow,
            SessionPhase::WorkoutActive(1),
            Some(WorkoutContext::new(WorkoutKind::Distance, at(20))),
            20,
        ));
        let names: Vec<&str> = records.iter().map(Record::name).collect();
        assert_eq!(names, vec!["hrv_window", "workout_ended", "workout_started"]);
        assert_eq!(recorder.scope().unwrap().workout, WorkoutId::from_start(at(20)));
    }

    #[test]
    fn test_abort_marks_incomplete() {
        let mut recorder = recorder();
        let workout = WorkoutContext::new(WorkoutKind::Distance, at(0));
        recorder.on_transition(&event(
            SessionPhase::RowingDetected,
            SessionPhase::WorkoutActive(1),
            Some(workout.clone()),
            0,
        ));

        let records = recorder.on_transition(&event(
            SessionPhase::WorkoutActive(1),
            SessionPhase::Aborted,
            Some(workout),
            10,
        ));
        assert!(matches!(
            records.last(),
            Some(Record::WorkoutEnded {
                completed: false,
                interval_count: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_run_recorder_submits_records() {
        use crate::{hub::RowerHub, persistence::PersistenceQueue, types::HubConfig};

        let hub = RowerHub::new(&HubConfig::default());
        let (queue, mut records) = PersistenceQueue::new(&PersistenceConfig::default());
        let (transition_tx, transition_rx) = mpsc::channel(4);
        let (_rr_tx, rr_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_recorder(
            recorder(),
            transition_rx,
            rr_rx,
            hub,
            queue,
            PersistenceConfig::default(),
            shutdown.clone(),
        ));

        let now = SystemTime::now();
        transition_tx
            .send(SessionEvent {
                transition: Transition {
                    from: SessionPhase::RowingDetected,
                    to: SessionPhase::JustRow,
                    workout: Some(WorkoutContext::new(WorkoutKind::JustRow, now)),
                    at: now,
                },
                planned_intervals: None,
            })
            .await
            .unwrap();

        let first = records.recv().await.unwrap();
        assert_eq!(first.name(), "workout_started");

        shutdown.cancel();
        drop(transition_tx);
        task.await.unwrap();
    }
}
