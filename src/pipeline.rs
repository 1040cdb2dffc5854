use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    ble::HeartRateScanner,
    engine::{OnDemandHandle, ProtocolEngine, TickOutcome, TickReport},
    error::{EncodeError, HubError, Result, RowbridgeError},
    heart_rate::{HeartRateFusion, HrSample, Reading, SourceEvent, CONSOLE_SIGNAL_QUALITY, CONSOLE_SOURCE},
    hub::{FieldUpdate, RowerHub, StateUpdate},
    live_data::{run_notifications, NotifySink, MANDATORY_SIZE},
    persistence::{run_writer, PersistenceQueue, PersistenceSink},
    protocol::Opcode,
    recorder::{run_recorder, SessionEvent, SessionRecorder},
    serial::{connect_with_retry, SerialConnector},
    session::{SessionCommand, Transition},
    telemetry::TelemetryIngest,
    types::{LinkStatus, PipelineConfig, WriterClass},
};

/// Capacity of the session transition channel
const TRANSITION_CAPACITY: usize = 16;

/// Back-off while every polled register is unsupported
const IDLE_BACKOFF: Duration = Duration::from_millis(500);

type Task = (&'static str, JoinHandle<Result<()>>);

/// A running bridge: serial loop, heart-rate fusion, live notifications and persistence
///
/// Built by [`Pipeline::start`]; stopped by [`Pipeline::shutdown`], which joins every
/// task and flushes persistence last.
pub struct Pipeline {
    hub: RowerHub,
    on_demand: OnDemandHandle,
    heart_rate: mpsc::Sender<SourceEvent>,
    queue: PersistenceQueue,
    shutdown: CancellationToken,
    writer_shutdown: CancellationToken,
    tasks: Vec<Task>,
    writer: JoinHandle<Result<()>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("hub", &self.hub)
            .field("tasks", &self.tasks.iter().map(|(name, _)| *name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Validate the configuration, open the console and spawn every loop
    ///
    /// `scanner` is optional so the bridge can run with the console's own heart-rate
    /// receiver only.
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::Startup`] if the first serial connection fails, and
    /// [`RowbridgeError::Encode`] if the live-data limit cannot carry the mandatory
    /// fields. Nothing is spawned in either case.
    pub async fn start<C, P>(
        config: PipelineConfig,
        connector: C,
        notify: Arc<dyn NotifySink>,
        mut persistence: P,
        scanner: Option<HeartRateScanner>,
    ) -> Result<Self>
    where
        C: SerialConnector + 'static,
        P: PersistenceSink + 'static,
    {
        if config.encoder.max_payload < MANDATORY_SIZE {
            return Err(EncodeError::LimitTooSmall {
                limit: config.encoder.max_payload,
                required: MANDATORY_SIZE,
            }
            .into());
        }

        let first = connector.connect().await.map_err(|e| {
            RowbridgeError::Startup(format!("cannot open {}: {e}", connector.describe()))
        })?;
        info!("Console opened on {}", connector.describe());

        let hub = RowerHub::new(&config.hub);
        let on_demand = OnDemandHandle::new(&config.engine);
        let shutdown = CancellationToken::new();
        let writer_shutdown = CancellationToken::new();

        let (hr_tx, hr_rx) = mpsc::channel(config.fusion.channel_capacity.max(1));
        let (rr_tx, rr_rx) = mpsc::channel(config.fusion.channel_capacity.max(1));
        let (transition_tx, transition_rx) = mpsc::channel(TRANSITION_CAPACITY);
        let (queue, records) = PersistenceQueue::new(&config.persistence);

        let flush_interval = Duration::from_millis(config.persistence.flush_interval_ms);
        let writer = {
            let token = writer_shutdown.clone();
            tokio::spawn(async move {
                run_writer(records, &mut persistence, flush_interval, token).await
            })
        };

        let mut tasks: Vec<Task> = Vec::new();

        let serial = SerialLoop {
            hub: hub.clone(),
            ingest: TelemetryIngest::new(),
            heart_rate: hr_tx.clone(),
            transitions: transition_tx,
        };
        tasks.push((
            "serial",
            tokio::spawn(serial.run(
                connector,
                first,
                config.clone(),
                on_demand.clone(),
                shutdown.clone(),
            )),
        ));

        let fusion = HeartRateFusion::new(hub.clone(), &config.fusion).with_rr_forward(rr_tx);
        tasks.push(("fusion", tokio::spawn(fusion.run(hr_rx, shutdown.clone()))));

        {
            let hub = hub.clone();
            let tick = Duration::from_millis(config.hub.delivery_tick_ms.max(1));
            let token = shutdown.clone();
            tasks.push((
                "delivery",
                tokio::spawn(async move {
                    hub.run_delivery(tick, token).await;
                    Ok(())
                }),
            ));
        }

        tasks.push((
            "notifications",
            tokio::spawn(run_notifications(
                hub.subscribe(),
                notify,
                config.encoder.clone(),
                shutdown.clone(),
            )),
        ));

        {
            let recorder = SessionRecorder::new(config.persistence.user_id.clone(), &config.hrv);
            let hub = hub.clone();
            let queue = queue.clone();
            let persistence = config.persistence.clone();
            let token = shutdown.clone();
            tasks.push((
                "recorder",
                tokio::spawn(async move {
                    run_recorder(recorder, transition_rx, rr_rx, hub, queue, persistence, token)
                        .await;
                    Ok(())
                }),
            ));
        }

        if let Some(scanner) = scanner {
            tasks.push((
                "heart-rate scanner",
                tokio::spawn(scanner.run(hr_tx.clone(), shutdown.clone())),
            ));
        }

        info!("Bridge started with {} task(s)", tasks.len() + 1);

        Ok(Self {
            hub,
            on_demand,
            heart_rate: hr_tx,
            queue,
            shutdown,
            writer_shutdown,
            tasks,
            writer,
        })
    }

    /// Live-state hub shared by every task
    #[must_use]
    pub const fn hub(&self) -> &RowerHub {
        &self.hub
    }

    /// Handle for one-off console reads, writes and resets
    #[must_use]
    pub const fn on_demand(&self) -> &OnDemandHandle {
        &self.on_demand
    }

    /// Sender for additional heart-rate sources
    #[must_use]
    pub fn heart_rate_events(&self) -> mpsc::Sender<SourceEvent> {
        self.heart_rate.clone()
    }

    /// Records dropped because the persistence queue was full
    #[must_use]
    pub fn dropped_records(&self) -> u64 {
        self.queue.dropped()
    }

    /// Token observed by every loop except the persistence writer
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every loop, then flush and stop the persistence writer
    ///
    /// # Errors
    ///
    /// Returns the first error reported by a task, or the writer's final flush error.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down bridge");
        self.shutdown.cancel();

        let mut first_error = None;
        for (name, task) in self.tasks {
            match task.await {
                Ok(Ok(())) => debug!("{} task stopped", name),
                Ok(Err(e)) => {
                    error!("{} task failed: {}", name, e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("{} task panicked: {}", name, e);
                    first_error.get_or_insert(RowbridgeError::Io(e.into()));
                }
            }
        }

        self.on_demand.abandon();
        drop(self.queue);
        self.writer_shutdown.cancel();
        match self.writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(RowbridgeError::Io(e.into()));
            }
        }

        info!("Bridge stopped");
        first_error.map_or(Ok(()), Err)
    }
}

/// Serial side of the bridge: polls the console and publishes what it reads
struct SerialLoop {
    hub: RowerHub,
    ingest: TelemetryIngest,
    heart_rate: mpsc::Sender<SourceEvent>,
    transitions: mpsc::Sender<SessionEvent>,
}

impl SerialLoop {
    async fn run<C: SerialConnector>(
        mut self,
        connector: C,
        first: C::Stream,
        config: PipelineConfig,
        on_demand: OnDemandHandle,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let spacing = Duration::from_millis(config.engine.request_spacing_ms);
        let mut next = Some(first);

        let result = loop {
            let io = match next.take() {
                Some(io) => io,
                None => match connect_with_retry(&connector, &config.serial, &shutdown).await {
                    Ok(Some(io)) => io,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
            };

            self.set_link(LinkStatus::Connected);
            let mut engine = ProtocolEngine::new(io, config.engine.clone(), on_demand.clone());

            let lost = loop {
                let report = tokio::select! {
                    () = shutdown.cancelled() => break Ok(false),
                    report = engine.tick() => report,
                };
                let idle = match report {
                    Ok(report) => self.handle(report),
                    Err(e) if e.is_connection_error() => {
                        warn!("Console link lost: {}", e);
                        break Ok(true);
                    }
                    Err(e) => break Err(e),
                };

                let pause = if idle { IDLE_BACKOFF } else { spacing };
                if !pause.is_zero() {
                    tokio::select! {
                        () = shutdown.cancelled() => break Ok(false),
                        () = tokio::time::sleep(pause) => {}
                    }
                }
            };

            drop(engine.into_inner());
            match lost {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
            self.set_link(LinkStatus::Lost);
        };

        if let Some(transition) = self.ingest.on_command(SessionCommand::LinkClosed) {
            self.emit(transition);
        }
        info!("Serial loop stopped");
        result
    }

    /// Apply one tick; returns true if the engine had nothing to send
    fn handle(&mut self, report: TickReport) -> bool {
        let idle = match report.outcome {
            TickOutcome::Reading(value) => {
                let update = self.ingest.on_value(value);
                self.merge(update);
                if let Some(bpm) = self.ingest.take_console_heart_rate() {
                    self.forward_console_heart_rate(bpm);
                }
                false
            }
            TickOutcome::Ack {
                opcode: Opcode::Reset,
                ..
            } => {
                info!("Console reset acknowledged");
                self.hub.reset();
                if let Some(transition) = self.ingest.on_command(SessionCommand::Reset) {
                    self.emit(transition);
                }
                false
            }
            TickOutcome::Ack { address, opcode } => {
                debug!("Console acknowledged {:?} of {:03X}", opcode, address);
                false
            }
            TickOutcome::Unsupported(address) => {
                info!("Register {:03X} unsupported, removed from polling", address);
                false
            }
            TickOutcome::Retrying(address) => {
                debug!("Retrying register {:03X}", address);
                false
            }
            TickOutcome::Stale(address) => {
                debug!("Register {:03X} stale this cycle", address);
                false
            }
            TickOutcome::Idle => true,
        };

        if report.cycle_complete {
            if let Some(transition) = self.ingest.on_cycle_complete() {
                self.emit(transition);
            }
        }
        idle
    }

    fn merge(&self, update: StateUpdate) {
        if update.is_empty() {
            return;
        }
        match self.hub.merge(update, WriterClass::Rower) {
            Ok(()) => {}
            Err(HubError::LinkLost) => debug!("Telemetry dropped while link is lost"),
            Err(e) => warn!("Hub rejected telemetry: {}", e),
        }
    }

    fn set_link(&self, status: LinkStatus) {
        self.merge(FieldUpdate::Link(status).into());
    }

    fn forward_console_heart_rate(&self, bpm: u16) {
        let sample = HrSample {
            source: CONSOLE_SOURCE.to_string(),
            reading: Reading::Bpm(bpm),
            signal_quality: CONSOLE_SIGNAL_QUALITY,
        };
        if let Err(e) = self.heart_rate.try_send(SourceEvent::Sample(sample)) {
            debug!("Console heart rate not forwarded: {}", e);
        }
    }

    fn emit(&self, transition: Transition) {
        info!("Session {} -> {}", transition.from, transition.to);
        self.merge(transition.to_update());

        let event = SessionEvent {
            transition,
            planned_intervals: self.ingest.planned_intervals(),
        };
        if let Err(e) = self.transitions.try_send(event) {
            warn!("Session transition not recorded: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::RequestOutcome,
        live_data::ChannelNotifySink,
        persistence::{MemorySink, Record},
        protocol::{Frame, FrameCodec},
        registers::{lookup, RegisterKind},
        serial::ChannelConnector,
        types::{EngineConfig, SessionPhase},
    };
    use futures::{SinkExt, StreamExt};
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    /// Fake console reporting a steady pace with a fixed stroke count
    fn spawn_console(io: DuplexStream, strokes: u32) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut framed = Framed::new(io, FrameCodec);
            while let Some(Ok(request)) = framed.next().await {
                let answer = match (request.opcode, lookup(request.address)) {
                    (Opcode::Read, Some(register)) => {
                        let value = match register.kind {
                            RegisterKind::StrokeCount => strokes,
                            RegisterKind::Speed => 400,
                            RegisterKind::Distance => 1_250,
                            _ => 0,
                        };
                        Frame::response(request.address, Opcode::Read, register.encode_value(value))
                    }
                    (opcode, _) => Frame::response(request.address, opcode, Vec::new()),
                };
                if framed.send(answer).await.is_err() {
                    return;
                }
            }
        })
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.engine = EngineConfig {
            response_timeout_ms: 100,
            request_spacing_ms: 0,
            ..EngineConfig::default()
        };
        config.hub.delivery_tick_ms = 20;
        config.persistence.sample_interval_ms = 50;
        config.persistence.flush_interval_ms = 50;
        config.serial.reconnect_delay_ms = 20;
        config
    }

    async fn wait_for(hub: &RowerHub, check: impl Fn(&crate::hub::RowerState) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check(&hub.snapshot()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("hub never reached the expected state");
    }

    #[tokio::test]
    async fn test_startup_fails_without_console() {
        let (connector, streams) = ChannelConnector::new(1);
        drop(streams);
        let (notify, _payloads) = ChannelNotifySink::new(4);

        let err = Pipeline::start(config(), connector, Arc::new(notify), MemorySink::new(), None)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_startup_rejects_tiny_payload_limit() {
        let (connector, streams) = ChannelConnector::new(1);
        let (host, _device) = tokio::io::duplex(64);
        streams.send(host).await.unwrap();
        let (notify, _payloads) = ChannelNotifySink::new(4);
        let mut config = config();
        config.encoder.max_payload = 4;

        let err = Pipeline::start(config, connector, Arc::new(notify), MemorySink::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RowbridgeError::Encode(_)));
    }

    #[tokio::test]
    async fn test_bridge_end_to_end() {
        let (connector, streams) = ChannelConnector::new(2);
        let (host, device) = tokio::io::duplex(256);
        spawn_console(device, 12);
        streams.send(host).await.unwrap();

        let (notify, mut payloads) = ChannelNotifySink::new(64);
        let sink = MemorySink::new();
        let pipeline = Pipeline::start(config(), connector, Arc::new(notify), sink.clone(), None)
            .await
            .unwrap();
        let hub = pipeline.hub().clone();

        wait_for(&hub, |s| s.phase == SessionPhase::JustRow && s.stroke_count == Some(12)).await;
        assert_eq!(hub.link_status(), LinkStatus::Connected);
        assert_eq!(hub.snapshot().distance_m, Some(1_250));

        let payload = tokio::time::timeout(Duration::from_secs(2), payloads.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(payload.len() <= 20);

        pipeline
            .heart_rate_events()
            .send(SourceEvent::Sample(HrSample {
                source: "AA:BB".to_string(),
                reading: Reading::Bpm(131),
                signal_quality: 90,
            }))
            .await
            .unwrap();
        wait_for(&hub, |s| s.heart_rate_bpm == Some(131)).await;

        let reset = pipeline.on_demand().reset();
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(2), reset).await.unwrap().unwrap(),
            RequestOutcome::Ack
        );

        pipeline.shutdown().await.unwrap();

        let names: Vec<&str> = sink.records().iter().map(Record::name).collect();
        assert!(names.contains(&"workout_started"));
        assert_eq!(names.last(), Some(&"workout_ended"));
        assert!(sink.flush_count() >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_with_stalled_notification_consumer() {
        let (connector, streams) = ChannelConnector::new(1);
        let (host, device) = tokio::io::duplex(256);
        spawn_console(device, 5);
        streams.send(host).await.unwrap();

        // the receiver is kept but never read, so the sink fills after one payload
        let (notify, _payloads) = ChannelNotifySink::new(1);
        let mut config = config();
        config.hub.delivery_tick_ms = 10;
        let pipeline = Pipeline::start(config, connector, Arc::new(notify), MemorySink::new(), None)
            .await
            .unwrap();
        wait_for(pipeline.hub(), |s| s.stroke_count == Some(5)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        tokio::time::timeout(Duration::from_secs(3), pipeline.shutdown())
            .await
            .expect("shutdown blocked on the notification sink")
            .unwrap();
    }

    #[tokio::test]
    async fn test_link_loss_and_reconnect() {
        let (connector, streams) = ChannelConnector::new(2);
        let (host, device) = tokio::io::duplex(256);
        let console = spawn_console(device, 3);
        streams.send(host).await.unwrap();

        let (notify, _payloads) = ChannelNotifySink::new(64);
        let pipeline = Pipeline::start(config(), connector, Arc::new(notify), MemorySink::new(), None)
            .await
            .unwrap();
        let hub = pipeline.hub().clone();
        wait_for(&hub, |s| s.stroke_count == Some(3)).await;

        console.abort();
        wait_for(&hub, |s| s.link == LinkStatus::Lost).await;
        assert_eq!(hub.snapshot().stroke_count, Some(3));

        let (host, device) = tokio::io::duplex(256);
        spawn_console(device, 7);
        streams.send(host).await.unwrap();

        wait_for(&hub, |s| s.stroke_count == Some(7)).await;
        assert_eq!(hub.link_status(), LinkStatus::Connected);

        pipeline.shutdown().await.unwrap();
    }
}
