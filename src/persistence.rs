use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{self, error::TrySendError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, RowbridgeError},
    hrv::HrvWindow,
    hub::RowerState,
    types::{PersistenceConfig, WorkoutKind},
};

/// Identifier of one recorded workout: start time in Unix milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkoutId(pub u64);

impl WorkoutId {
    /// Identifier for a workout that started at `at`
    #[must_use]
    pub fn from_start(at: SystemTime) -> Self {
        let millis = at
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for WorkoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workout-{}", self.0)
    }
}

/// Interval within a workout within a user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// User identifier
    pub user: String,
    /// Workout identifier
    pub workout: WorkoutId,
    /// 1-based interval number
    pub interval: usize,
}

/// Telemetry captured at one instant of an interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Capture time
    pub timestamp: SystemTime,
    /// Strokes per minute
    pub stroke_rate: Option<f64>,
    /// Strokes
    pub stroke_count: Option<u32>,
    /// Metres
    pub distance_m: Option<u32>,
    /// Seconds per 500 m
    pub pace_500m_s: Option<u32>,
    /// Centimetres per second
    pub speed_cmps: Option<u32>,
    /// Watts
    pub power_w: Option<i32>,
    /// Kilocalories
    pub total_calories: Option<u32>,
    /// Beats per minute
    pub heart_rate_bpm: Option<u16>,
    /// Seconds
    pub elapsed_s: Option<u32>,
    /// Recovery to drive ratio
    pub stroke_ratio: Option<f64>,
}

impl TelemetrySample {
    /// Capture the telemetry fields of a snapshot
    #[must_use]
    pub const fn from_state(state: &RowerState, timestamp: SystemTime) -> Self {
        Self {
            timestamp,
            stroke_rate: state.stroke_rate,
            stroke_count: state.stroke_count,
            distance_m: state.distance_m,
            pace_500m_s: state.pace_500m_s,
            speed_cmps: state.speed_cmps,
            power_w: state.power_w,
            total_calories: state.total_calories,
            heart_rate_bpm: state.heart_rate_bpm,
            elapsed_s: state.elapsed_s,
            stroke_ratio: state.stroke_ratio,
        }
    }
}

/// Structured record handed to storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    /// A workout began
    WorkoutStarted {
        /// User identifier
        user: String,
        /// Workout identifier
        workout: WorkoutId,
        /// Workout type
        kind: WorkoutKind,
        /// Planned intervals, when the console reports them
        interval_count: Option<u32>,
    },
    /// A workout finished or was abandoned
    WorkoutEnded {
        /// User identifier
        user: String,
        /// Workout identifier
        workout: WorkoutId,
        /// Whether every interval was completed
        completed: bool,
        /// Intervals recorded
        interval_count: usize,
    },
    /// Periodic interval telemetry
    IntervalSample {
        /// Owning interval
        scope: Scope,
        /// Captured telemetry
        sample: TelemetrySample,
    },
    /// One RR interval
    RrSample {
        /// Owning interval
        scope: Scope,
        /// Arrival time
        timestamp: SystemTime,
        /// Milliseconds between beats
        rr_ms: u16,
    },
    /// One closed HRV window
    HrvWindow {
        /// Owning interval
        scope: Scope,
        /// Metrics
        window: HrvWindow,
    },
}

impl Record {
    /// Short record name for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WorkoutStarted { .. } => "workout_started",
            Self::WorkoutEnded { .. } => "workout_ended",
            Self::IntervalSample { .. } => "interval_sample",
            Self::RrSample { .. } => "rr_sample",
            Self::HrvWindow { .. } => "hrv_window",
        }
    }
}

/// Durable record storage
///
/// The storage engine behind the sink is external; the writer loop owns the sink
/// exclusively.
#[async_trait]
pub trait PersistenceSink: Send {
    /// Store one record
    async fn write(&mut self, record: &Record) -> Result<()>;

    /// Make every stored record durable
    async fn flush(&mut self) -> Result<()>;
}

/// Sink keeping records in memory, shareable across clones
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Record>>>,
    flushes: Arc<AtomicU64>,
}

impl MemorySink {
    /// Empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record written so far
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of completed flushes
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn write(&mut self, record: &Record) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Sink appending one JSON document per line to a file
#[derive(Debug)]
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::Io`] if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        info!("Persisting records to {}", path.as_ref().display());
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

#[async_trait]
impl PersistenceSink for JsonLinesSink {
    async fn write(&mut self, record: &Record) -> Result<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| RowbridgeError::Persistence(format!("cannot serialize record: {e}")))?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_data().await?;
        Ok(())
    }
}

/// Producer handle onto the bounded record queue
///
/// Submission never waits: a full queue drops the record and counts it.
#[derive(Debug, Clone)]
pub struct PersistenceQueue {
    sender: mpsc::Sender<Record>,
    dropped: Arc<AtomicU64>,
}

impl PersistenceQueue {
    /// Bounded queue and the receiver the writer loop drains
    #[must_use]
    pub fn new(config: &PersistenceConfig) -> (Self, mpsc::Receiver<Record>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Queue a record; returns false if it was dropped
    pub fn submit(&self, record: Record) -> bool {
        match self.sender.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(
                        "Persistence queue full, dropped {} record ({} dropped so far)",
                        record.name(),
                        dropped
                    );
                }
                false
            }
            Err(TrySendError::Closed(record)) => {
                debug!("Persistence writer gone, discarding {}", record.name());
                false
            }
        }
    }

    /// Records dropped because the queue was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn store<S: PersistenceSink + ?Sized>(sink: &mut S, record: &Record) {
    if let Err(e) = sink.write(record).await {
        warn!("Failed to persist {}: {}", record.name(), e);
    }
}

/// Drain queued records into `sink` until shutdown or until every producer is gone
///
/// Flushes every `flush_interval` and once more before returning; records still
/// queued at shutdown are written first. Individual write failures are logged and
/// skipped.
///
/// # Errors
///
/// Returns the error of the final flush.
pub async fn run_writer<S: PersistenceSink + ?Sized>(
    mut receiver: mpsc::Receiver<Record>,
    sink: &mut S,
    flush_interval: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(flush_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut written: u64 = 0;

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                receiver.close();
                while let Some(record) = receiver.recv().await {
                    store(sink, &record).await;
                    written += 1;
                }
                break;
            }
            record = receiver.recv() => match record {
                Some(record) => {
                    store(sink, &record).await;
                    written += 1;
                }
                None => break,
            },
            _ = ticker.tick() => {
                if let Err(e) = sink.flush().await {
                    warn!("Periodic persistence flush failed: {}", e);
                }
            }
        }
    }

    info!("Persistence writer stopping after {} records", written);
    sink.flush()
        .await
        .map_err(|e| RowbridgeError::Persistence(format!("final flush failed: {e}")))
}
