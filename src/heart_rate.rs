use bytes::Buf;
use std::{collections::HashMap, fmt, time::SystemTime};
use tokio::{
    sync::mpsc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, RowbridgeError},
    hub::{FieldUpdate, RowerHub, RrSample, StateUpdate},
    types::{FusionConfig, WriterClass},
};

/// Source identifier for heart rate relayed by the rowing console
pub const CONSOLE_SOURCE: &str = "console";

/// Signal quality assigned to the console's own receiver
pub const CONSOLE_SIGNAL_QUALITY: u8 = 10;

/// Sensor contact status (flags bits 1-2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorContact {
    /// Sensor contact is not supported
    Unsupported,
    /// Supported, but no skin contact detected
    NotDetected,
    /// Supported and detected
    Detected,
}

impl fmt::Display for SensorContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "Unsupported"),
            Self::NotDetected => write!(f, "Not Detected"),
            Self::Detected => write!(f, "Detected"),
        }
    }
}

/// Flags byte of the Heart Rate Measurement characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementFlags(u8);

impl MeasurementFlags {
    const VALUE_U16: u8 = 1 << 0;
    const CONTACT_SUPPORTED: u8 = 1 << 1;
    const CONTACT_DETECTED: u8 = 1 << 2;
    const ENERGY_EXPENDED: u8 = 1 << 3;
    const RR_INTERVALS: u8 = 1 << 4;

    /// Wrap a raw flags byte
    #[must_use]
    pub const fn new(bits: u8) -> Self {
        Self(bits)
    }

    /// Heart-rate value is 16-bit
    #[must_use]
    pub const fn value_is_u16(self) -> bool {
        self.0 & Self::VALUE_U16 != 0
    }

    /// Sensor contact status
    #[must_use]
    pub const fn sensor_contact(self) -> SensorContact {
        match (
            self.0 & Self::CONTACT_SUPPORTED != 0,
            self.0 & Self::CONTACT_DETECTED != 0,
        ) {
            (true, true) => SensorContact::Detected,
            (true, false) => SensorContact::NotDetected,
            _ => SensorContact::Unsupported,
        }
    }

    /// Energy-expended field present
    #[must_use]
    pub const fn energy_expended_present(self) -> bool {
        self.0 & Self::ENERGY_EXPENDED != 0
    }

    /// One or more RR-interval fields present
    #[must_use]
    pub const fn rr_present(self) -> bool {
        self.0 & Self::RR_INTERVALS != 0
    }
}

/// A parsed Heart Rate Measurement notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    /// Flags byte
    pub flags: MeasurementFlags,
    /// Beats per minute
    pub bpm: u16,
    /// Energy expended in kilojoules
    pub energy_expended: Option<u16>,
    /// RR intervals in 1/1024 s
    pub rr_intervals: Vec<u16>,
}

impl HeartRateMeasurement {
    /// Parse a characteristic value
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::ParseError`] if the value is shorter than its flags
    /// announce.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < 2 {
            return Err(RowbridgeError::ParseError(format!(
                "heart rate measurement too short: {} bytes",
                data.len()
            )));
        }

        let flags = MeasurementFlags::new(buf.get_u8());
        let bpm = if flags.value_is_u16() {
            if buf.remaining() < 2 {
                return Err(RowbridgeError::ParseError(
                    "16-bit heart rate value truncated".to_string(),
                ));
            }
            buf.get_u16_le()
        } else {
            u16::from(buf.get_u8())
        };

        let energy_expended = if flags.energy_expended_present() {
            if buf.remaining() < 2 {
                return Err(RowbridgeError::ParseError(
                    "energy expended field truncated".to_string(),
                ));
            }
            Some(buf.get_u16_le())
        } else {
            None
        };

        let mut rr_intervals = Vec::new();
        if flags.rr_present() {
            while buf.remaining() >= 2 {
                rr_intervals.push(buf.get_u16_le());
            }
        }

        Ok(Self {
            flags,
            bpm,
            energy_expended,
            rr_intervals,
        })
    }

    /// RR intervals converted to milliseconds
    #[must_use]
    pub fn rr_ms(&self) -> Vec<u16> {
        self.rr_intervals.iter().map(|raw| rr_to_ms(*raw)).collect()
    }
}

/// Convert an RR interval from 1/1024 s to milliseconds
#[must_use]
pub fn rr_to_ms(raw: u16) -> u16 {
    let ms = (u32::from(raw) * 1_000 + 512) / 1_024;
    u16::try_from(ms).unwrap_or(u16::MAX)
}

/// Value carried by a heart-rate sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    /// Heart rate in beats per minute
    Bpm(u16),
    /// RR intervals in milliseconds
    Rr(Vec<u16>),
}

/// A tagged sample from one heart-rate source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HrSample {
    /// Source identifier
    pub source: String,
    /// Sample value
    pub reading: Reading,
    /// Signal quality, 0-100
    pub signal_quality: u8,
}

impl HrSample {
    /// Samples carried by one measurement notification
    #[must_use]
    pub fn from_measurement(
        source: &str,
        signal_quality: u8,
        measurement: &HeartRateMeasurement,
    ) -> Vec<Self> {
        let mut samples = vec![Self {
            source: source.to_string(),
            reading: Reading::Bpm(measurement.bpm),
            signal_quality,
        }];
        if !measurement.rr_intervals.is_empty() {
            samples.push(Self {
                source: source.to_string(),
                reading: Reading::Rr(measurement.rr_ms()),
                signal_quality,
            });
        }
        samples
    }
}

/// Events delivered by heart-rate collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// New sample
    Sample(HrSample),
    /// Source went away
    Disconnected(String),
}

#[derive(Debug, Clone, Copy)]
struct KnownSource {
    signal_quality: u8,
    last_seen: Instant,
}

/// Selects one heart-rate source and writes its readings into the hub
///
/// Binding is sticky until the bound source disconnects (or goes stale), then the
/// known source with the best signal quality is chosen.
#[derive(Debug)]
pub struct HeartRateFusion {
    hub: RowerHub,
    bound: Option<String>,
    known: HashMap<String, KnownSource>,
    rr_forward: Option<mpsc::Sender<RrSample>>,
    stale_after: Duration,
}

impl HeartRateFusion {
    /// Create an unbound fusion stage
    #[must_use]
    pub fn new(hub: RowerHub, config: &FusionConfig) -> Self {
        Self {
            hub,
            bound: None,
            known: HashMap::new(),
            rr_forward: None,
            stale_after: Duration::from_millis(config.stale_after_ms),
        }
    }

    /// Forward accepted RR samples to an analyzer channel
    #[must_use]
    pub fn with_rr_forward(mut self, sender: mpsc::Sender<RrSample>) -> Self {
        self.rr_forward = Some(sender);
        self
    }

    /// Currently bound source
    #[must_use]
    pub fn bound_source(&self) -> Option<&str> {
        self.bound.as_deref()
    }

    /// Handle one source event
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::Hub`] if the hub rejects the merge.
    pub fn handle(&mut self, event: SourceEvent) -> Result<()> {
        match event {
            SourceEvent::Sample(sample) => self.on_sample(sample),
            SourceEvent::Disconnected(source) => self.on_disconnect(&source),
        }
    }

    fn on_sample(&mut self, sample: HrSample) -> Result<()> {
        self.known.insert(
            sample.source.clone(),
            KnownSource {
                signal_quality: sample.signal_quality,
                last_seen: Instant::now(),
            },
        );

        if self.bound.is_none() {
            info!("Heart rate bound to source {}", sample.source);
            self.bound = Some(sample.source.clone());
        }
        if self.bound.as_deref() != Some(sample.source.as_str()) {
            return Ok(());
        }

        match sample.reading {
            Reading::Bpm(0) => Ok(()),
            Reading::Bpm(bpm) => {
                self.hub.merge(
                    FieldUpdate::HeartRate(Some(bpm)).into(),
                    WriterClass::HeartRate,
                )?;
                Ok(())
            }
            Reading::Rr(intervals) => {
                let now = SystemTime::now();
                let samples: Vec<RrSample> = intervals
                    .into_iter()
                    .filter(|ms| *ms > 0)
                    .map(|ms| RrSample::new(now, ms))
                    .collect();
                if samples.is_empty() {
                    return Ok(());
                }

                if let Some(forward) = &self.rr_forward {
                    for sample in &samples {
                        if forward.try_send(*sample).is_err() {
                            warn!("RR forward queue full - dropping sample");
                        }
                    }
                }
                self.hub.merge(
                    StateUpdate::from(FieldUpdate::RrSamples(samples)),
                    WriterClass::HeartRate,
                )?;
                Ok(())
            }
        }
    }

    fn on_disconnect(&mut self, source: &str) -> Result<()> {
        self.known.remove(source);
        if self.bound.as_deref() != Some(source) {
            return Ok(());
        }

        // best signal wins, ties go to the lowest source id
        self.bound = self
            .known
            .iter()
            .max_by(|(a_id, a), (b_id, b)| {
                a.signal_quality
                    .cmp(&b.signal_quality)
                    .then_with(|| b_id.cmp(a_id))
            })
            .map(|(id, _)| id.clone());

        match &self.bound {
            Some(next) => info!("Heart rate source {} lost, rebound to {}", source, next),
            None => info!("Heart rate source {} lost, no other source available", source),
        }
        self.hub
            .merge(FieldUpdate::HeartRate(None).into(), WriterClass::HeartRate)?;
        Ok(())
    }

    /// Treat sources silent for longer than the stale timeout as disconnected
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::Hub`] if the hub rejects the merge.
    pub fn expire_stale(&mut self) -> Result<()> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .known
            .iter()
            .filter(|(_, known)| now.duration_since(known.last_seen) > self.stale_after)
            .map(|(id, _)| id.clone())
            .collect();

        for source in stale {
            debug!("Heart rate source {} went stale", source);
            self.on_disconnect(&source)?;
        }
        Ok(())
    }

    /// Consume source events until shutdown or until every sender is gone
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::Hub`] if the hub rejects a merge.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SourceEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let period = (self.stale_after / 2).max(Duration::from_millis(100));
        let mut stale_check = tokio::time::interval(period);
        stale_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event)?,
                    None => break,
                },
                _ = stale_check.tick() => self.expire_stale()?,
            }
        }

        info!("Heart rate fusion stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HubConfig;
    use pretty_assertions::assert_eq;

    fn bpm(source: &str, value: u16, quality: u8) -> SourceEvent {
        SourceEvent::Sample(HrSample {
            source: source.to_string(),
            reading: Reading::Bpm(value),
            signal_quality: quality,
        })
    }

    fn fusion() -> (HeartRateFusion, RowerHub) {
        let hub = RowerHub::new(&HubConfig::default());
        (HeartRateFusion::new(hub.clone(), &FusionConfig::default()), hub)
    }

    #[test]
    fn test_flags_0x1b() {
        let flags = MeasurementFlags::new(0x1B);
        assert!(flags.value_is_u16());
        assert_eq!(flags.sensor_contact(), SensorContact::NotDetected);
        assert!(flags.energy_expended_present());
        assert!(flags.rr_present());
    }

    #[test]
    fn test_sensor_contact_states() {
        assert_eq!(
            MeasurementFlags::new(0x00).sensor_contact(),
            SensorContact::Unsupported
        );
        assert_eq!(
            MeasurementFlags::new(0x02).sensor_contact(),
            SensorContact::NotDetected
        );
        assert_eq!(
            MeasurementFlags::new(0x06).sensor_contact(),
            SensorContact::Detected
        );
    }

    #[test]
    fn test_parse_full_measurement() {
        let data = [0x1B, 0x48, 0x00, 0x2C, 0x01, 0x00, 0x04, 0x33, 0x03];
        let measurement = HeartRateMeasurement::parse(&data).unwrap();

        assert_eq!(measurement.bpm, 72);
        assert_eq!(measurement.energy_expended, Some(300));
        assert_eq!(measurement.rr_intervals, vec![1024, 819]);
        assert_eq!(measurement.rr_ms(), vec![1000, 800]);
    }

    #[test]
    fn test_parse_minimal_measurement() {
        let measurement = HeartRateMeasurement::parse(&[0x00, 0x8C]).unwrap();
        assert_eq!(measurement.bpm, 140);
        assert_eq!(measurement.energy_expended, None);
        assert!(measurement.rr_intervals.is_empty());
    }

    #[test]
    fn test_parse_truncated() {
        assert!(HeartRateMeasurement::parse(&[0x01]).is_err());
        assert!(HeartRateMeasurement::parse(&[0x01, 0x48]).is_err());
        assert!(HeartRateMeasurement::parse(&[0x08, 0x48, 0x01]).is_err());
    }

    #[test]
    fn test_measurement_to_samples() {
        let measurement = HeartRateMeasurement::parse(&[0x10, 0x50, 0x00, 0x04]).unwrap();
        let samples = HrSample::from_measurement("strap", 80, &measurement);

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].reading, Reading::Bpm(80));
        assert_eq!(samples[1].reading, Reading::Rr(vec![1000]));
    }

    #[tokio::test]
    async fn test_sticky_binding_ignores_other_sources() {
        let (mut fusion, hub) = fusion();

        fusion.handle(bpm("strap", 120, 40)).unwrap();
        fusion.handle(bpm("watch", 90, 95)).unwrap();

        assert_eq!(fusion.bound_source(), Some("strap"));
        assert_eq!(hub.snapshot().heart_rate_bpm, Some(120));
    }

    #[tokio::test]
    async fn test_disconnect_rebinds_to_best_quality() {
        let (mut fusion, hub) = fusion();

        fusion.handle(bpm("strap", 120, 40)).unwrap();
        fusion.handle(bpm("watch", 90, 95)).unwrap();
        fusion.handle(bpm(CONSOLE_SOURCE, 100, CONSOLE_SIGNAL_QUALITY)).unwrap();

        fusion
            .handle(SourceEvent::Disconnected("strap".to_string()))
            .unwrap();
        assert_eq!(fusion.bound_source(), Some("watch"));

        fusion.handle(bpm("watch", 91, 95)).unwrap();
        assert_eq!(hub.snapshot().heart_rate_bpm, Some(91));
    }

    #[tokio::test]
    async fn test_last_source_lost_unsets_heart_rate() {
        let (mut fusion, hub) = fusion();
        fusion.handle(bpm("strap", 120, 40)).unwrap();

        fusion
            .handle(SourceEvent::Disconnected("strap".to_string()))
            .unwrap();

        assert_eq!(fusion.bound_source(), None);
        assert_eq!(hub.snapshot().heart_rate_bpm, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_source_treated_as_disconnected() {
        let (mut fusion, hub) = fusion();
        fusion.handle(bpm("strap", 120, 40)).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        fusion.handle(bpm("watch", 88, 60)).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        fusion.expire_stale().unwrap();

        assert_eq!(fusion.bound_source(), Some("watch"));
        assert_eq!(hub.snapshot().heart_rate_bpm, None);
    }

    #[tokio::test]
    async fn test_rebind_clears_old_reading_until_new_source_reports() {
        let (mut fusion, hub) = fusion();
        fusion.handle(bpm("strap", 120, 40)).unwrap();
        // a zero reading registers the watch without giving it a value
        fusion.handle(bpm("watch", 0, 60)).unwrap();

        fusion
            .handle(SourceEvent::Disconnected("strap".to_string()))
            .unwrap();
        assert_eq!(fusion.bound_source(), Some("watch"));
        assert_eq!(hub.snapshot().heart_rate_bpm, None);

        fusion.handle(bpm("watch", 97, 60)).unwrap();
        assert_eq!(hub.snapshot().heart_rate_bpm, Some(97));
    }

    #[tokio::test]
    async fn test_rebind_tie_breaks_on_source_id() {
        for order in [["c", "b"], ["b", "c"]] {
            let (mut fusion, _hub) = fusion();
            fusion.handle(bpm("a", 100, 50)).unwrap();
            for source in order {
                fusion.handle(bpm(source, 100, 70)).unwrap();
            }

            fusion
                .handle(SourceEvent::Disconnected("a".to_string()))
                .unwrap();
            assert_eq!(fusion.bound_source(), Some("b"));
        }
    }

    #[tokio::test]
    async fn test_rr_forwarded_and_merged() {
        let (fusion, hub) = fusion();
        let (rr_tx, mut rr_rx) = mpsc::channel(8);
        let mut fusion = fusion.with_rr_forward(rr_tx);

        fusion
            .handle(SourceEvent::Sample(HrSample {
                source: "strap".to_string(),
                reading: Reading::Rr(vec![800, 0, 810]),
                signal_quality: 70,
            }))
            .unwrap();

        assert_eq!(rr_rx.recv().await.unwrap().rr_ms, 800);
        assert_eq!(rr_rx.recv().await.unwrap().rr_ms, 810);
        assert_eq!(hub.snapshot().rr_samples.len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (fusion, hub) = fusion();
        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(fusion.run(rx, shutdown.clone()));

        tx.send(bpm("strap", 133, 50)).await.unwrap();
        while hub.snapshot().heart_rate_bpm.is_none() {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(hub.snapshot().heart_rate_bpm, Some(133));
    }
}
