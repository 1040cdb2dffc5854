use serde::Serialize;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::{Duration, SystemTime},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::HubError,
    types::{HubConfig, LinkStatus, SessionPhase, WorkoutKind, WriterClass},
};

static NEXT_HUB_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one hub instance, stable across resets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HubId(u64);

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hub-{}", self.0)
    }
}

/// One RR interval as delivered by the heart-rate path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RrSample {
    /// Arrival time
    pub timestamp: SystemTime,
    /// Interval between beats in milliseconds
    pub rr_ms: u16,
    /// Workout interval the sample belongs to, stamped by the hub
    pub interval: Option<usize>,
}

impl RrSample {
    /// Sample not yet attached to an interval
    #[must_use]
    pub const fn new(timestamp: SystemTime, rr_ms: u16) -> Self {
        Self {
            timestamp,
            rr_ms,
            interval: None,
        }
    }
}

/// One interval of a workout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interval {
    /// 1-based interval number in detection order
    pub number: usize,
    /// When the interval was detected
    pub started_at: SystemTime,
    /// Whether the interval was finished
    pub completed: bool,
}

/// Workout programmed on (or inferred from) the console
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkoutContext {
    /// Workout type
    pub kind: WorkoutKind,
    /// Intervals in detection order
    pub intervals: Vec<Interval>,
    /// Index into `intervals` of the running interval
    pub current_interval: usize,
    /// Set once every interval is completed; never cleared
    pub completed: bool,
}

impl WorkoutContext {
    /// New context whose first interval starts at `at`
    #[must_use]
    pub fn new(kind: WorkoutKind, at: SystemTime) -> Self {
        Self {
            kind,
            intervals: vec![Interval {
                number: 1,
                started_at: at,
                completed: false,
            }],
            current_interval: 0,
            completed: false,
        }
    }

    /// Number of the running interval
    #[must_use]
    pub fn interval_number(&self) -> usize {
        self.intervals
            .get(self.current_interval)
            .map_or(0, |i| i.number)
    }

    /// Complete the running interval and open the next one
    pub fn advance(&mut self, at: SystemTime) -> usize {
        if let Some(current) = self.intervals.get_mut(self.current_interval) {
            current.completed = true;
        }
        let number = self.intervals.len() + 1;
        self.intervals.push(Interval {
            number,
            started_at: at,
            completed: false,
        });
        self.current_interval = self.intervals.len() - 1;
        number
    }

    /// Complete the running interval, then mark the workout completed if every
    /// interval is
    pub fn finish(&mut self) {
        if let Some(current) = self.intervals.get_mut(self.current_interval) {
            current.completed = true;
        }
        if self.intervals.iter().all(|i| i.completed) {
            self.completed = true;
        }
    }

    /// Number of completed intervals
    #[must_use]
    pub fn completed_intervals(&self) -> usize {
        self.intervals.iter().filter(|i| i.completed).count()
    }
}

/// Last-updated timestamps per field group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GroupTimestamps {
    /// Rower telemetry fields
    pub telemetry: Option<SystemTime>,
    /// Heart-rate and RR fields
    pub heart_rate: Option<SystemTime>,
    /// Workout context and session phase
    pub workout: Option<SystemTime>,
}

/// Canonical live snapshot
///
/// Every telemetry field is always present; `None` means unset, which is distinct
/// from a zero reading.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RowerState {
    /// Strokes per minute
    pub stroke_rate: Option<f64>,
    /// Strokes since reset
    pub stroke_count: Option<u32>,
    /// Metres since reset
    pub distance_m: Option<u32>,
    /// Seconds per 500 m
    pub pace_500m_s: Option<u32>,
    /// Centimetres per second
    pub speed_cmps: Option<u32>,
    /// Watts
    pub power_w: Option<i32>,
    /// Kilocalories since reset
    pub total_calories: Option<u32>,
    /// Beats per minute
    pub heart_rate_bpm: Option<u16>,
    /// Seconds since the console clock started
    pub elapsed_s: Option<u32>,
    /// Recovery to drive time ratio
    pub stroke_ratio: Option<f64>,
    /// RR samples of the running interval, oldest first
    pub rr_samples: VecDeque<RrSample>,
    /// Workout context, if a session is recording
    pub workout: Option<WorkoutContext>,
    /// Session phase
    pub phase: SessionPhase,
    /// Serial link status
    pub link: LinkStatus,
    /// Last-updated timestamps
    pub updated: GroupTimestamps,
}

/// A single field assignment carried by a [`StateUpdate`]
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    /// Stroke rate
    StrokeRate(Option<f64>),
    /// Stroke count
    StrokeCount(Option<u32>),
    /// Distance
    Distance(Option<u32>),
    /// Pace per 500 m
    Pace(Option<u32>),
    /// Speed
    Speed(Option<u32>),
    /// Power
    Power(Option<i32>),
    /// Calories
    Calories(Option<u32>),
    /// Elapsed time
    Elapsed(Option<u32>),
    /// Stroke ratio
    StrokeRatio(Option<f64>),
    /// Workout context
    Workout(Option<WorkoutContext>),
    /// Session phase
    Phase(SessionPhase),
    /// Serial link status
    Link(LinkStatus),
    /// Heart rate
    HeartRate(Option<u16>),
    /// RR samples to append
    RrSamples(Vec<RrSample>),
}

enum Group {
    Telemetry,
    HeartRate,
    Workout,
    Link,
}

impl FieldUpdate {
    /// Writer class that owns this field
    #[must_use]
    pub const fn owner(&self) -> WriterClass {
        match self {
            Self::HeartRate(_) | Self::RrSamples(_) => WriterClass::HeartRate,
            _ => WriterClass::Rower,
        }
    }

    /// Field name used in errors and logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StrokeRate(_) => "stroke_rate",
            Self::StrokeCount(_) => "stroke_count",
            Self::Distance(_) => "distance_m",
            Self::Pace(_) => "pace_500m_s",
            Self::Speed(_) => "speed_cmps",
            Self::Power(_) => "power_w",
            Self::Calories(_) => "total_calories",
            Self::Elapsed(_) => "elapsed_s",
            Self::StrokeRatio(_) => "stroke_ratio",
            Self::Workout(_) => "workout",
            Self::Phase(_) => "phase",
            Self::Link(_) => "link",
            Self::HeartRate(_) => "heart_rate_bpm",
            Self::RrSamples(_) => "rr_samples",
        }
    }

    const fn group(&self) -> Group {
        match self {
            Self::HeartRate(_) | Self::RrSamples(_) => Group::HeartRate,
            Self::Workout(_) | Self::Phase(_) => Group::Workout,
            Self::Link(_) => Group::Link,
            _ => Group::Telemetry,
        }
    }
}

/// Partial field set merged atomically into the hub
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateUpdate {
    fields: Vec<FieldUpdate>,
}

impl StateUpdate {
    /// Empty update
    #[must_use]
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Add a field assignment
    #[must_use]
    pub fn with(mut self, field: FieldUpdate) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a field assignment in place
    pub fn push(&mut self, field: FieldUpdate) {
        self.fields.push(field);
    }

    /// Whether the update assigns nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field assignments in application order
    #[must_use]
    pub fn fields(&self) -> &[FieldUpdate] {
        &self.fields
    }
}

impl From<FieldUpdate> for StateUpdate {
    fn from(field: FieldUpdate) -> Self {
        Self::new().with(field)
    }
}

/// Consumer handle receiving hub snapshots on the delivery tick
#[derive(Debug, Clone)]
pub struct Subscription {
    receiver: watch::Receiver<Arc<RowerState>>,
}

impl Subscription {
    /// Wait for the next delivered snapshot
    ///
    /// Returns `None` once the hub has been dropped.
    pub async fn next(&mut self) -> Option<Arc<RowerState>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Most recently delivered snapshot
    #[must_use]
    pub fn latest(&self) -> Arc<RowerState> {
        self.receiver.borrow().clone()
    }
}

struct HubInner {
    id: HubId,
    state: RwLock<RowerState>,
    delivery: watch::Sender<Arc<RowerState>>,
    rr_capacity: usize,
}

/// Shared, concurrency-safe live state
///
/// Cloning the hub yields another handle onto the same state. Merges are atomic with
/// respect to snapshots: a reader never observes a partially applied update.
#[derive(Clone)]
pub struct RowerHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for RowerHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowerHub").field("id", &self.inner.id).finish()
    }
}

impl RowerHub {
    /// Create a hub with every field unset
    #[must_use]
    pub fn new(config: &HubConfig) -> Self {
        let id = HubId(NEXT_HUB_ID.fetch_add(1, Ordering::Relaxed));
        let (delivery, _) = watch::channel(Arc::new(RowerState::default()));
        info!("Created state hub {}", id);

        Self {
            inner: Arc::new(HubInner {
                id,
                state: RwLock::new(RowerState::default()),
                delivery,
                rr_capacity: config.rr_capacity.max(1),
            }),
        }
    }

    /// Hub identity
    #[must_use]
    pub fn id(&self) -> HubId {
        self.inner.id
    }

    /// Merge a partial update written by `writer`
    ///
    /// The whole update is validated before anything is applied.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Ownership`] if `writer` does not own one of the fields, and
    /// [`HubError::LinkLost`] for rower telemetry while the serial link is down.
    pub fn merge(&self, update: StateUpdate, writer: WriterClass) -> Result<(), HubError> {
        if let Some(field) = update.fields.iter().find(|f| f.owner() != writer) {
            return Err(HubError::Ownership {
                field: field.name(),
                writer,
            });
        }

        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let link_after = update
            .fields
            .iter()
            .rev()
            .find_map(|f| match f {
                FieldUpdate::Link(status) => Some(*status),
                _ => None,
            })
            .unwrap_or(state.link);
        if link_after == LinkStatus::Lost
            && update
                .fields
                .iter()
                .any(|f| matches!(f.group(), Group::Telemetry))
        {
            return Err(HubError::LinkLost);
        }

        let now = SystemTime::now();
        for field in update.fields {
            match field.group() {
                Group::Telemetry => state.updated.telemetry = Some(now),
                Group::HeartRate => state.updated.heart_rate = Some(now),
                Group::Workout => state.updated.workout = Some(now),
                Group::Link => {}
            }
            self.apply(&mut state, field);
        }

        Ok(())
    }

    fn apply(&self, state: &mut RowerState, field: FieldUpdate) {
        match field {
            FieldUpdate::StrokeRate(v) => state.stroke_rate = v,
            FieldUpdate::StrokeCount(v) => state.stroke_count = v,
            FieldUpdate::Distance(v) => state.distance_m = v,
            FieldUpdate::Pace(v) => state.pace_500m_s = v,
            FieldUpdate::Speed(v) => state.speed_cmps = v,
            FieldUpdate::Power(v) => state.power_w = v,
            FieldUpdate::Calories(v) => state.total_calories = v,
            FieldUpdate::Elapsed(v) => state.elapsed_s = v,
            FieldUpdate::StrokeRatio(v) => state.stroke_ratio = v,
            FieldUpdate::Workout(workout) => {
                let interval = workout.as_ref().map(WorkoutContext::interval_number);
                state.rr_samples.retain(|s| s.interval == interval);
                state.workout = workout;
            }
            FieldUpdate::Phase(phase) => state.phase = phase,
            FieldUpdate::Link(status) => {
                if status != state.link {
                    info!("Serial link status: {} -> {}", state.link, status);
                }
                state.link = status;
            }
            FieldUpdate::HeartRate(v) => state.heart_rate_bpm = v,
            FieldUpdate::RrSamples(samples) => {
                let interval = state.workout.as_ref().map(WorkoutContext::interval_number);
                for mut sample in samples {
                    sample.interval = interval;
                    state.rr_samples.push_back(sample);
                }
                while state.rr_samples.len() > self.inner.rr_capacity {
                    state.rr_samples.pop_front();
                }
            }
        }
    }

    /// Immutable point-in-time copy of the state
    #[must_use]
    pub fn snapshot(&self) -> RowerState {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current serial link status
    #[must_use]
    pub fn link_status(&self) -> LinkStatus {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .link
    }

    /// Register a consumer for tick-delivered snapshots
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.inner.delivery.subscribe(),
        }
    }

    /// Number of registered consumers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.delivery.receiver_count()
    }

    /// Deliver the current snapshot to every subscriber
    pub fn publish(&self) {
        let snapshot = Arc::new(self.snapshot());
        self.inner.delivery.send_replace(snapshot);
    }

    /// Zero rower telemetry and clear the workout context
    ///
    /// Heart rate, identity, link status and subscriptions are kept.
    pub fn reset(&self) {
        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let now = SystemTime::now();

        state.stroke_rate = Some(0.0);
        state.stroke_count = Some(0);
        state.distance_m = Some(0);
        state.pace_500m_s = Some(0);
        state.speed_cmps = Some(0);
        state.power_w = Some(0);
        state.total_calories = Some(0);
        state.elapsed_s = Some(0);
        state.stroke_ratio = Some(0.0);
        state.rr_samples.clear();
        state.workout = None;
        state.phase = SessionPhase::NoSession;
        state.updated.telemetry = Some(now);
        state.updated.workout = Some(now);

        info!("Hub {} reset", self.inner.id);
    }

    /// Publish snapshots at a fixed tick until shutdown
    pub async fn run_delivery(self, tick: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("Snapshot delivery stopped");
                    break;
                }
                _ = ticker.tick() => self.publish(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> RowerHub {
        RowerHub::new(&HubConfig::default())
    }

    fn telemetry(strokes: u32) -> StateUpdate {
        StateUpdate::new()
            .with(FieldUpdate::StrokeCount(Some(strokes)))
            .with(FieldUpdate::Distance(Some(strokes * 10)))
    }

    #[test]
    fn test_fields_start_unset() {
        let state = hub().snapshot();
        assert_eq!(state.stroke_rate, None);
        assert_eq!(state.heart_rate_bpm, None);
        assert_eq!(state.phase, SessionPhase::NoSession);
        assert_eq!(state.updated, GroupTimestamps::default());
    }

    #[test]
    fn test_merge_sets_fields_and_timestamps() {
        let hub = hub();
        hub.merge(telemetry(12), WriterClass::Rower).unwrap();

        let state = hub.snapshot();
        assert_eq!(state.stroke_count, Some(12));
        assert_eq!(state.distance_m, Some(120));
        assert!(state.updated.telemetry.is_some());
        assert!(state.updated.heart_rate.is_none());
    }

    #[test]
    fn test_ownership_rejected_without_partial_apply() {
        let hub = hub();
        let update = telemetry(5).with(FieldUpdate::HeartRate(Some(140)));

        let err = hub.merge(update, WriterClass::Rower).unwrap_err();
        assert_eq!(
            err,
            HubError::Ownership {
                field: "heart_rate_bpm",
                writer: WriterClass::Rower
            }
        );
        assert_eq!(hub.snapshot().stroke_count, None);

        let err = hub
            .merge(FieldUpdate::Power(Some(200)).into(), WriterClass::HeartRate)
            .unwrap_err();
        assert!(matches!(err, HubError::Ownership { field: "power_w", .. }));
    }

    #[test]
    fn test_every_field_has_exactly_one_owner() {
        let heart_rate_fields = [
            FieldUpdate::HeartRate(None),
            FieldUpdate::RrSamples(Vec::new()),
        ];
        for field in &heart_rate_fields {
            assert_eq!(field.owner(), WriterClass::HeartRate);
        }

        let rower_fields = [
            FieldUpdate::StrokeRate(None),
            FieldUpdate::StrokeCount(None),
            FieldUpdate::Distance(None),
            FieldUpdate::Pace(None),
            FieldUpdate::Speed(None),
            FieldUpdate::Power(None),
            FieldUpdate::Calories(None),
            FieldUpdate::Elapsed(None),
            FieldUpdate::StrokeRatio(None),
            FieldUpdate::Workout(None),
            FieldUpdate::Phase(SessionPhase::NoSession),
            FieldUpdate::Link(LinkStatus::Connected),
        ];
        for field in &rower_fields {
            assert_eq!(field.owner(), WriterClass::Rower);
            assert!(heart_rate_fields.iter().all(|hr| hr.name() != field.name()));
        }
    }

    #[test]
    fn test_link_lost_pauses_telemetry() {
        let hub = hub();
        hub.merge(telemetry(3), WriterClass::Rower).unwrap();
        hub.merge(FieldUpdate::Link(LinkStatus::Lost).into(), WriterClass::Rower)
            .unwrap();

        assert_eq!(
            hub.merge(telemetry(4), WriterClass::Rower),
            Err(HubError::LinkLost)
        );
        assert_eq!(hub.snapshot().stroke_count, Some(3));

        // heart rate keeps flowing while the console is away
        hub.merge(FieldUpdate::HeartRate(Some(120)).into(), WriterClass::HeartRate)
            .unwrap();

        let resume = telemetry(4).with(FieldUpdate::Link(LinkStatus::Connected));
        hub.merge(resume, WriterClass::Rower).unwrap();
        assert_eq!(hub.snapshot().stroke_count, Some(4));
    }

    #[test]
    fn test_reset_preserves_identity_and_subscribers() {
        let hub = hub();
        let id = hub.id();
        let _first = hub.subscribe();
        let _second = hub.subscribe();

        hub.merge(telemetry(40), WriterClass::Rower).unwrap();
        hub.merge(FieldUpdate::HeartRate(Some(150)).into(), WriterClass::HeartRate)
            .unwrap();
        hub.merge(
            FieldUpdate::Workout(Some(WorkoutContext::new(
                WorkoutKind::Distance,
                SystemTime::now(),
            )))
            .into(),
            WriterClass::Rower,
        )
        .unwrap();

        hub.reset();

        let state = hub.snapshot();
        assert_eq!(hub.id(), id);
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(state.stroke_count, Some(0));
        assert_eq!(state.distance_m, Some(0));
        assert_eq!(state.stroke_rate, Some(0.0));
        assert_eq!(state.power_w, Some(0));
        assert_eq!(state.elapsed_s, Some(0));
        assert_eq!(state.workout, None);
        assert_eq!(state.heart_rate_bpm, Some(150));
        assert!(state.rr_samples.is_empty());
    }

    #[test]
    fn test_rr_samples_bounded_and_tagged() {
        let hub = RowerHub::new(&HubConfig {
            rr_capacity: 3,
            ..HubConfig::default()
        });
        let now = SystemTime::now();
        hub.merge(
            FieldUpdate::Workout(Some(WorkoutContext::new(WorkoutKind::JustRow, now))).into(),
            WriterClass::Rower,
        )
        .unwrap();

        let samples = (0..5).map(|i| RrSample::new(now, 800 + i)).collect();
        hub.merge(FieldUpdate::RrSamples(samples).into(), WriterClass::HeartRate)
            .unwrap();

        let state = hub.snapshot();
        let values: Vec<u16> = state.rr_samples.iter().map(|s| s.rr_ms).collect();
        assert_eq!(values, vec![802, 803, 804]);
        assert!(state.rr_samples.iter().all(|s| s.interval == Some(1)));

        let mut next = state.workout.clone().unwrap();
        next.advance(now);
        hub.merge(FieldUpdate::Workout(Some(next)).into(), WriterClass::Rower)
            .unwrap();
        assert!(hub.snapshot().rr_samples.is_empty());
    }

    #[test]
    fn test_workout_context_completion_is_monotonic() {
        let now = SystemTime::now();
        let mut workout = WorkoutContext::new(WorkoutKind::Distance, now);
        assert_eq!(workout.interval_number(), 1);

        assert_eq!(workout.advance(now), 2);
        assert_eq!(workout.completed_intervals(), 1);
        assert!(!workout.completed);

        workout.finish();
        assert!(workout.completed);
        assert_eq!(workout.completed_intervals(), 2);
    }

    #[tokio::test]
    async fn test_subscription_receives_published_snapshot() {
        let hub = hub();
        let mut subscription = hub.subscribe();

        hub.merge(telemetry(7), WriterClass::Rower).unwrap();
        hub.publish();

        let snapshot = subscription.next().await.unwrap();
        assert_eq!(snapshot.stroke_count, Some(7));

        hub.reset();
        hub.publish();
        let snapshot = subscription.next().await.unwrap();
        assert_eq!(snapshot.stroke_count, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_tick_stops_on_shutdown() {
        let hub = hub();
        let mut subscription = hub.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            hub.clone()
                .run_delivery(Duration::from_millis(200), shutdown.clone()),
        );

        hub.merge(telemetry(9), WriterClass::Rower).unwrap();
        let snapshot = subscription.next().await.unwrap();
        assert_eq!(snapshot.stroke_count, Some(9));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_merges_are_atomic() {
        let hub = hub();
        let mut writers = Vec::new();

        let rower = hub.clone();
        writers.push(tokio::spawn(async move {
            for strokes in 0..500 {
                rower.merge(telemetry(strokes), WriterClass::Rower).unwrap();
                tokio::task::yield_now().await;
            }
        }));
        let heart = hub.clone();
        writers.push(tokio::spawn(async move {
            for bpm in 0..500 {
                heart
                    .merge(FieldUpdate::HeartRate(Some(bpm)).into(), WriterClass::HeartRate)
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));

        for _ in 0..500 {
            let state = hub.snapshot();
            if let (Some(strokes), Some(distance)) = (state.stroke_count, state.distance_m) {
                assert_eq!(distance, strokes * 10);
            }
            tokio::task::yield_now().await;
        }

        for writer in writers {
            writer.await.unwrap();
        }
        assert_eq!(hub.snapshot().stroke_count, Some(499));
        assert_eq!(hub.snapshot().heart_rate_bpm, Some(499));
    }
}
