use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use tracing::warn;

use crate::{hub::RrSample, types::HrvConfig};

/// Successive differences above this many milliseconds count towards pNN50
pub const NN50_THRESHOLD_MS: f64 = 50.0;

/// Empty windows emitted for one gap; longer gaps (wall-clock jumps) are skipped
pub const MAX_EMPTY_WINDOWS: u64 = 60;

/// HRV metrics for one fixed-width time bucket
///
/// Metrics are `None` when the bucket held fewer than two samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HrvWindow {
    /// Bucket index counted from the analyzer origin
    pub time_block: u64,
    /// Standard deviation of RR intervals (ms)
    pub sdnn: Option<f64>,
    /// Root mean square of successive differences (ms)
    pub rmssd: Option<f64>,
    /// Fraction of successive differences above 50 ms
    pub pnn50: Option<f64>,
    /// Samples in the bucket
    pub samples: usize,
}

impl HrvWindow {
    /// Compute the metrics of one bucket
    #[must_use]
    pub fn compute(time_block: u64, rr_ms: &[u16]) -> Self {
        Self {
            time_block,
            sdnn: sdnn(rr_ms),
            rmssd: rmssd(rr_ms),
            pnn50: pnn50(rr_ms),
            samples: rr_ms.len(),
        }
    }
}

fn successive_differences(rr_ms: &[u16]) -> impl Iterator<Item = f64> + '_ {
    rr_ms
        .windows(2)
        .map(|pair| f64::from(pair[1]) - f64::from(pair[0]))
}

/// Sample standard deviation of RR intervals
#[must_use]
pub fn sdnn(rr_ms: &[u16]) -> Option<f64> {
    if rr_ms.len() < 2 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = rr_ms.len() as f64;
    let mean = rr_ms.iter().map(|v| f64::from(*v)).sum::<f64>() / n;
    let variance = rr_ms
        .iter()
        .map(|v| (f64::from(*v) - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    Some(variance.sqrt())
}

/// Root mean square of successive differences
#[must_use]
pub fn rmssd(rr_ms: &[u16]) -> Option<f64> {
    if rr_ms.len() < 2 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let diffs = (rr_ms.len() - 1) as f64;
    let sum_sq: f64 = successive_differences(rr_ms).map(|d| d * d).sum();
    Some((sum_sq / diffs).sqrt())
}

/// Fraction of successive differences whose magnitude exceeds 50 ms
#[must_use]
pub fn pnn50(rr_ms: &[u16]) -> Option<f64> {
    if rr_ms.len() < 2 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let diffs = (rr_ms.len() - 1) as f64;
    #[allow(clippy::cast_precision_loss)]
    let over = successive_differences(rr_ms)
        .filter(|d| d.abs() > NN50_THRESHOLD_MS)
        .count() as f64;
    Some(over / diffs)
}

/// Buckets RR samples into fixed-width windows and computes HRV per window
///
/// Windows are emitted as soon as their bucket closes, either because a later sample
/// arrived or because wall time moved past the bucket end. Buckets that received no
/// samples still produce a window with null metrics.
#[derive(Debug, Clone)]
pub struct HrvAnalyzer {
    width: Duration,
    origin: Option<SystemTime>,
    block: u64,
    current: Vec<u16>,
}

impl HrvAnalyzer {
    /// Analyzer with the configured window width
    #[must_use]
    pub fn new(config: &HrvConfig) -> Self {
        Self::with_width(Duration::from_secs(config.window_secs.max(1)))
    }

    /// Analyzer with an explicit window width
    #[must_use]
    pub const fn with_width(width: Duration) -> Self {
        Self {
            width,
            origin: None,
            block: 0,
            current: Vec::new(),
        }
    }

    /// Anchor bucket 0 at `origin` instead of at the first sample
    pub fn start_at(&mut self, origin: SystemTime) {
        self.origin = Some(origin);
        self.block = 0;
        self.current.clear();
    }

    /// Whether the analyzer has an open bucket
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.origin.is_some()
    }

    fn block_of(&self, origin: SystemTime, at: SystemTime) -> u64 {
        let offset = at.duration_since(origin).unwrap_or(Duration::ZERO);
        let index = offset.as_nanos() / self.width.as_nanos().max(1);
        u64::try_from(index).unwrap_or(u64::MAX)
    }

    /// Close every bucket before `block`
    fn close_until(&mut self, block: u64) -> Vec<HrvWindow> {
        if self.block >= block {
            return Vec::new();
        }

        let mut closed = vec![HrvWindow::compute(self.block, &self.current)];
        self.current.clear();
        let gap_end = block.min(self.block.saturating_add(1 + MAX_EMPTY_WINDOWS));
        closed.extend((self.block + 1..gap_end).map(|empty| HrvWindow::compute(empty, &[])));
        if gap_end < block {
            warn!(
                "Skipped {} empty HRV windows after a clock jump",
                block - gap_end
            );
        }
        self.block = block;
        closed
    }

    /// Add a sample; returns the windows its timestamp closed
    pub fn push(&mut self, sample: &RrSample) -> Vec<HrvWindow> {
        let origin = *self.origin.get_or_insert(sample.timestamp);
        let block = self.block_of(origin, sample.timestamp);
        let closed = self.close_until(block);
        self.current.push(sample.rr_ms);
        closed
    }

    /// Returns the windows closed by wall time without waiting for samples
    pub fn poll(&mut self, now: SystemTime) -> Vec<HrvWindow> {
        let Some(origin) = self.origin else {
            return Vec::new();
        };
        let block = self.block_of(origin, now);
        self.close_until(block)
    }

    /// Flush the open bucket and return to the unstarted state
    pub fn finish(&mut self) -> Option<HrvWindow> {
        self.origin.take()?;
        let window = HrvWindow::compute(self.block, &self.current);
        self.block = 0;
        self.current.clear();
        Some(window)
    }
}
