use futures::{SinkExt, StreamExt};
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::oneshot,
    time::Instant,
};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::{
    error::{Result, RowbridgeError},
    protocol::{Command, Frame, FrameCodec, FrameKind, Opcode, Priority},
    registers::{self, by_kind, Register, RegisterKind, RegisterValue, Tier},
    types::EngineConfig,
};

/// Result delivered to the submitter of an on-demand request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Read answered
    Value(RegisterValue),
    /// Write or reset acknowledged
    Ack,
    /// Console answered with an error frame
    Unsupported,
    /// Every attempt timed out
    TimedOut,
    /// The serial link went away while the request was in flight
    LinkLost,
    /// Evicted from a full queue before it was sent
    Dropped,
}

/// Result of one channel exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A read was answered
    Reading(RegisterValue),
    /// A write or reset was acknowledged
    Ack {
        /// Register address
        address: u16,
        /// Acknowledged operation
        opcode: Opcode,
    },
    /// The console does not support this register
    Unsupported(u16),
    /// The command timed out and will be reissued on the next tick
    Retrying(u16),
    /// Retries exhausted or the answer was unusable; the field keeps its value
    Stale(u16),
    /// Nothing to send
    Idle,
}

/// Outcome of a tick plus cycle bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// What the exchange produced
    pub outcome: TickOutcome,
    /// Set on the tick that finished the last register of a polling cycle
    pub cycle_complete: bool,
}

impl TickReport {
    const fn new(outcome: TickOutcome) -> Self {
        Self {
            outcome,
            cycle_complete: false,
        }
    }
}

struct Pending {
    command: Command,
    register: Option<&'static Register>,
    reply: Option<oneshot::Sender<RequestOutcome>>,
}

impl Pending {
    fn resolve(&mut self, outcome: RequestOutcome) {
        if let Some(reply) = self.reply.take() {
            // submitter may have stopped waiting
            let _ = reply.send(outcome);
        }
    }
}

struct OnDemandQueue {
    pending: VecDeque<Pending>,
    capacity: usize,
    dropped: u64,
}

/// Submits one-off commands to the protocol engine
///
/// The queue is bounded; when it is full the oldest pending request is evicted and its
/// submitter receives [`RequestOutcome::Dropped`]. The handle outlives individual serial
/// connections, so requests queued during a reconnect are served afterwards.
#[derive(Clone)]
pub struct OnDemandHandle {
    queue: Arc<Mutex<OnDemandQueue>>,
    retries: u8,
}

impl std::fmt::Debug for OnDemandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnDemandHandle")
            .field("pending", &self.pending())
            .field("retries", &self.retries)
            .finish()
    }
}

impl OnDemandHandle {
    /// Empty queue sized from the engine configuration
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            queue: Arc::new(Mutex::new(OnDemandQueue {
                pending: VecDeque::new(),
                capacity: config.on_demand_capacity.max(1),
                dropped: 0,
            })),
            retries: config.max_retries,
        }
    }

    /// Read a register out of the polling schedule
    pub fn read(&self, kind: RegisterKind) -> oneshot::Receiver<RequestOutcome> {
        let register = by_kind(kind);
        self.submit(
            Command::read(register, Priority::OnDemand, self.retries),
            Some(register),
        )
    }

    /// Write a canonical value to a register
    pub fn write(&self, kind: RegisterKind, value: u32) -> oneshot::Receiver<RequestOutcome> {
        let register = by_kind(kind);
        self.submit(Command::write(register, value, self.retries), Some(register))
    }

    /// Reset the console session counters
    pub fn reset(&self) -> oneshot::Receiver<RequestOutcome> {
        self.submit(Command::reset(self.retries), None)
    }

    /// Requests waiting to be sent
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Requests evicted by overflow so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Answer every queued request with [`RequestOutcome::LinkLost`]
    ///
    /// Called once the serial side has stopped for good.
    pub fn abandon(&self) {
        let abandoned: Vec<Pending> = self.lock().pending.drain(..).collect();
        if !abandoned.is_empty() {
            info!("Abandoning {} queued on-demand request(s)", abandoned.len());
        }
        for mut pending in abandoned {
            pending.resolve(RequestOutcome::LinkLost);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OnDemandQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(
        &self,
        command: Command,
        register: Option<&'static Register>,
    ) -> oneshot::Receiver<RequestOutcome> {
        let (reply, receiver) = oneshot::channel();
        let mut queue = self.lock();

        if queue.pending.len() >= queue.capacity {
            if let Some(mut evicted) = queue.pending.pop_front() {
                warn!(
                    "On-demand queue full, dropping {:?} of {:03X}",
                    evicted.command.opcode, evicted.command.address
                );
                evicted.resolve(RequestOutcome::Dropped);
                queue.dropped += 1;
            }
        }

        queue.pending.push_back(Pending {
            command,
            register,
            reply: Some(reply),
        });
        receiver
    }

    fn pop(&self) -> Option<Pending> {
        self.lock().pending.pop_front()
    }
}

/// Owns the serial channel and runs the single-outstanding command discipline
///
/// Each [`tick`](Self::tick) performs exactly one exchange: reissue a timed-out
/// command, else send one on-demand command, else the next register of the polling
/// cycle. At most one command is ever in flight.
pub struct ProtocolEngine<T> {
    framed: Framed<T, FrameCodec>,
    config: EngineConfig,
    on_demand: OnDemandHandle,
    schedule: Vec<&'static Register>,
    cursor: usize,
    cycle: u64,
    unsupported: HashSet<u16>,
    in_flight: Option<Pending>,
}

impl<T> std::fmt::Debug for ProtocolEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("cycle", &self.cycle)
            .field("cursor", &self.cursor)
            .field("in_flight", &self.in_flight.as_ref().map(|p| p.command.address))
            .finish_non_exhaustive()
    }
}

impl<T> ProtocolEngine<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Engine over an open channel, serving requests from `on_demand`
    pub fn new(io: T, config: EngineConfig, on_demand: OnDemandHandle) -> Self {
        let mut engine = Self {
            framed: Framed::new(io, FrameCodec),
            config,
            on_demand,
            schedule: Vec::new(),
            cursor: 0,
            cycle: 0,
            unsupported: HashSet::new(),
            in_flight: None,
        };
        engine.plan_cycle();
        engine
    }

    /// Command awaiting an answer, if any
    #[must_use]
    pub fn in_flight(&self) -> Option<&Command> {
        self.in_flight.as_ref().map(|p| &p.command)
    }

    /// Completed polling cycles
    #[must_use]
    pub const fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Addresses the console answered with an error frame
    #[must_use]
    pub fn unsupported(&self) -> &HashSet<u16> {
        &self.unsupported
    }

    /// Release the channel
    ///
    /// A command still in flight is answered with [`RequestOutcome::LinkLost`].
    pub fn into_inner(mut self) -> T {
        self.abandon_in_flight();
        self.framed.into_inner()
    }

    fn abandon_in_flight(&mut self) {
        if let Some(mut pending) = self.in_flight.take() {
            debug!("Abandoning {:03X} on a lost link", pending.command.address);
            pending.resolve(RequestOutcome::LinkLost);
        }
    }

    fn link_lost(&mut self) -> RowbridgeError {
        self.abandon_in_flight();
        RowbridgeError::LinkLost
    }

    fn plan_cycle(&mut self) {
        let include_low = self.cycle % u64::from(self.config.low_tier_every.max(1)) == 0;
        self.schedule = registers::REGISTERS
            .iter()
            .copied()
            .filter(|r| match r.tier {
                Tier::High => true,
                Tier::Low => include_low,
                Tier::OnDemand => false,
            })
            .filter(|r| !self.unsupported.contains(&r.address))
            .collect();
        self.cursor = 0;
        trace!(
            "Cycle {} schedules {} registers",
            self.cycle,
            self.schedule.len()
        );
    }

    fn next_command(&mut self) -> Option<Pending> {
        if let Some(pending) = self.on_demand.pop() {
            return Some(pending);
        }
        if self.schedule.is_empty() {
            self.cycle += 1;
            self.plan_cycle();
        }
        let register = self.schedule.get(self.cursor).copied()?;
        Some(Pending {
            command: Command::read(register, Priority::Poll, self.config.max_retries),
            register: Some(register),
            reply: None,
        })
    }

    /// Move the poll cursor past a finished command; returns whether the cycle ended
    fn finish(&mut self, pending: &Pending) -> bool {
        if pending.command.priority != Priority::Poll {
            return false;
        }
        self.cursor += 1;
        if self.cursor < self.schedule.len() {
            return false;
        }
        self.cycle += 1;
        self.plan_cycle();
        true
    }

    /// Perform one channel exchange
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::LinkLost`] if the channel fails or reaches end of
    /// stream. The in-flight command is dropped and its submitter receives
    /// [`RequestOutcome::LinkLost`].
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut pending = match self.in_flight.take() {
            Some(pending) => pending,
            None => match self.next_command() {
                Some(pending) => pending,
                None => return Ok(TickReport::new(TickOutcome::Idle)),
            },
        };

        pending.command.issued_at = Instant::now();
        let frame = pending.command.to_frame();
        let address = frame.address;
        trace!("Sending {:?} {:03X}", frame.opcode, address);

        if let Err(e) = self.framed.send(frame).await {
            warn!("Serial write failed: {}", e);
            self.in_flight = Some(pending);
            return Err(self.link_lost());
        }
        self.in_flight = Some(pending);

        let deadline = Instant::now() + self.config.response_timeout();
        let answer = loop {
            match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Err(_) => break None,
                Ok(None) => {
                    info!("Serial channel reached end of stream");
                    return Err(self.link_lost());
                }
                Ok(Some(Err(e))) => {
                    warn!("Serial read failed: {}", e);
                    return Err(self.link_lost());
                }
                Ok(Some(Ok(frame))) => {
                    let matches = self
                        .in_flight
                        .as_ref()
                        .is_some_and(|p| frame.answers(&p.command));
                    if matches {
                        break Some(frame);
                    }
                    debug!(
                        "Discarding unmatched {:?} frame for {:03X}",
                        frame.kind, frame.address
                    );
                }
            }
        };

        let Some(mut pending) = self.in_flight.take() else {
            return Ok(TickReport::new(TickOutcome::Idle));
        };

        let outcome = match answer {
            Some(frame) => self.resolve_answer(&mut pending, &frame),
            None if pending.command.retries_left > 0 => {
                pending.command.retries_left -= 1;
                debug!(
                    "{:03X} timed out, {} retries left",
                    address, pending.command.retries_left
                );
                self.in_flight = Some(pending);
                return Ok(TickReport::new(TickOutcome::Retrying(address)));
            }
            None => {
                warn!("{:03X} timed out after all retries, marking stale", address);
                pending.resolve(RequestOutcome::TimedOut);
                TickOutcome::Stale(address)
            }
        };

        let cycle_complete = self.finish(&pending);
        Ok(TickReport {
            outcome,
            cycle_complete,
        })
    }

    fn resolve_answer(&mut self, pending: &mut Pending, frame: &Frame) -> TickOutcome {
        let address = frame.address;
        if frame.kind == FrameKind::Error {
            if pending.command.priority == Priority::Poll && self.unsupported.insert(address) {
                info!("Register {:03X} unsupported, removed from polling", address);
            }
            pending.resolve(RequestOutcome::Unsupported);
            return TickOutcome::Unsupported(address);
        }

        match (frame.opcode, pending.register) {
            (Opcode::Read, Some(register)) => match RegisterValue::decode(register, &frame.payload) {
                Ok(value) => {
                    pending.resolve(RequestOutcome::Value(value));
                    TickOutcome::Reading(value)
                }
                Err(e) => {
                    warn!("Discarding answer for {:03X}: {}", address, e);
                    pending.resolve(RequestOutcome::TimedOut);
                    TickOutcome::Stale(address)
                }
            },
            (opcode, _) => {
                pending.resolve(RequestOutcome::Ack);
                TickOutcome::Ack { address, opcode }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

    /// Fake console answering every request through `respond`
    fn console(io: DuplexStream, mut respond: Responder) -> tokio::sync::mpsc::UnboundedReceiver<Frame> {
        let (seen_tx, seen_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut framed = Framed::new(io, FrameCodec);
            while let Some(Ok(request)) = framed.next().await {
                let _ = seen_tx.send(request.clone());
                for answer in respond(&request) {
                    if framed.send(answer).await.is_err() {
                        return;
                    }
                }
            }
        });
        seen_rx
    }

    /// Answers reads with a zero value of the requested width and acks everything else
    fn zero_console() -> Responder {
        Box::new(|request: &Frame| {
            let payload = match request.opcode {
                Opcode::Read => vec![0; usize::from(request.payload[0])],
                _ => Vec::new(),
            };
            vec![Frame::response(request.address, request.opcode, payload)]
        })
    }

    fn config() -> EngineConfig {
        EngineConfig {
            response_timeout_ms: 100,
            max_retries: 1,
            low_tier_every: 2,
            on_demand_capacity: 2,
            request_spacing_ms: 0,
        }
    }

    fn engine(respond: Responder) -> (
        ProtocolEngine<DuplexStream>,
        OnDemandHandle,
        tokio::sync::mpsc::UnboundedReceiver<Frame>,
    ) {
        let (host, device) = duplex(256);
        let seen = console(device, respond);
        let handle = OnDemandHandle::new(&config());
        (ProtocolEngine::new(host, config(), handle.clone()), handle, seen)
    }

    #[tokio::test]
    async fn test_poll_read_decodes_value() {
        let (mut engine, _handle, mut seen) = engine(Box::new(|request: &Frame| {
            vec![Frame::response(request.address, Opcode::Read, vec![0x30])]
        }));

        let report = engine.tick().await.unwrap();
        let flags = by_kind(RegisterKind::WorkoutFlags);
        assert_eq!(
            report.outcome,
            TickOutcome::Reading(RegisterValue {
                kind: RegisterKind::WorkoutFlags,
                address: flags.address,
                raw: 0x30,
            })
        );
        assert!(!report.cycle_complete);
        assert!(engine.in_flight().is_none());

        let request = seen.recv().await.unwrap();
        assert_eq!(request.kind, FrameKind::Request);
        assert_eq!(request.payload.as_ref(), &[1]);
    }

    #[tokio::test]
    async fn test_exchange_against_scripted_io() {
        let flags = by_kind(RegisterKind::WorkoutFlags);
        let request = crate::protocol::encode_command(&Command::read(
            flags,
            Priority::Poll,
            config().max_retries,
        ))
        .unwrap();
        let answer =
            crate::protocol::encode_frame(&Frame::response(flags.address, Opcode::Read, vec![0x01]))
                .unwrap();
        let io = tokio_test::io::Builder::new()
            .write(&request)
            .read(&answer)
            .build();

        let mut engine = ProtocolEngine::new(io, config(), OnDemandHandle::new(&config()));
        let report = engine.tick().await.unwrap();
        assert_eq!(
            report.outcome,
            TickOutcome::Reading(RegisterValue {
                kind: RegisterKind::WorkoutFlags,
                address: flags.address,
                raw: 1,
            })
        );
    }

    #[tokio::test]
    async fn test_cycle_complete_and_low_tier_cadence() {
        let (mut engine, _handle, _seen) = engine(zero_console());
        let high = registers::in_tier(Tier::High).count();
        let low = registers::in_tier(Tier::Low).count();

        let mut ticks = 0;
        loop {
            ticks += 1;
            if engine.tick().await.unwrap().cycle_complete {
                break;
            }
        }
        assert_eq!(ticks, high + low);
        assert_eq!(engine.cycle(), 1);

        ticks = 0;
        loop {
            ticks += 1;
            if engine.tick().await.unwrap().cycle_complete {
                break;
            }
        }
        assert_eq!(ticks, high);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_then_stale() {
        let (mut engine, _handle, mut seen) = engine(Box::new(|_: &Frame| Vec::new()));
        let address = by_kind(RegisterKind::WorkoutFlags).address;

        let first = engine.tick().await.unwrap();
        assert_eq!(first.outcome, TickOutcome::Retrying(address));
        assert_eq!(engine.in_flight().map(|c| c.retries_left), Some(0));

        let second = engine.tick().await.unwrap();
        assert_eq!(second.outcome, TickOutcome::Stale(address));
        assert!(engine.in_flight().is_none());

        let a = seen.recv().await.unwrap();
        let b = seen.recv().await.unwrap();
        assert_eq!(a, b);

        // polling moves on to the next register
        let third = engine.tick().await.unwrap();
        assert_eq!(
            third.outcome,
            TickOutcome::Retrying(by_kind(RegisterKind::IntervalsRemaining).address)
        );
    }

    #[tokio::test]
    async fn test_error_frame_is_unsupported_not_fatal() {
        let flags = by_kind(RegisterKind::WorkoutFlags).address;
        let (mut engine, _handle, _seen) = engine(Box::new(move |request: &Frame| {
            if request.address == flags {
                vec![Frame::error(request.address, request.opcode)]
            } else {
                vec![Frame::response(
                    request.address,
                    request.opcode,
                    vec![0; usize::from(request.payload[0])],
                )]
            }
        }));

        assert_eq!(
            engine.tick().await.unwrap().outcome,
            TickOutcome::Unsupported(flags)
        );
        assert!(engine.unsupported().contains(&flags));

        while !engine.tick().await.unwrap().cycle_complete {}
        let next = engine.tick().await.unwrap();
        assert!(matches!(
            next.outcome,
            TickOutcome::Reading(RegisterValue {
                kind: RegisterKind::IntervalsRemaining,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_on_demand_preempts_polling() {
        let (mut engine, handle, _seen) = engine(Box::new(|request: &Frame| {
            let payload = match request.address {
                0x1A5 => vec![0x7D, 0x00],
                _ => vec![0; usize::from(request.payload[0])],
            };
            vec![Frame::response(request.address, request.opcode, payload)]
        }));

        let reply = handle.read(RegisterKind::Pace);
        let report = engine.tick().await.unwrap();
        let expected = RegisterValue {
            kind: RegisterKind::Pace,
            address: 0x1A5,
            raw: 125,
        };
        assert_eq!(report.outcome, TickOutcome::Reading(expected));
        assert_eq!(reply.await.unwrap(), RequestOutcome::Value(expected));

        // the poll schedule did not advance
        let next = engine.tick().await.unwrap();
        assert!(matches!(
            next.outcome,
            TickOutcome::Reading(RegisterValue {
                kind: RegisterKind::WorkoutFlags,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_on_demand_overflow_drops_oldest() {
        let handle = OnDemandHandle::new(&config());
        let first = handle.read(RegisterKind::Pace);
        let _second = handle.read(RegisterKind::StrokeRate);
        let _third = handle.reset();

        assert_eq!(first.await.unwrap(), RequestOutcome::Dropped);
        assert_eq!(handle.pending(), 2);
        assert_eq!(handle.dropped(), 1);
    }

    #[tokio::test]
    async fn test_reset_and_write_acknowledged() {
        let (mut engine, handle, mut seen) = engine(zero_console());

        let reset = handle.reset();
        let report = engine.tick().await.unwrap();
        assert_eq!(
            report.outcome,
            TickOutcome::Ack {
                address: 0,
                opcode: Opcode::Reset
            }
        );
        assert_eq!(reset.await.unwrap(), RequestOutcome::Ack);

        let write = handle.write(RegisterKind::WorkoutIntervals, 9);
        engine.tick().await.unwrap();
        assert_eq!(write.await.unwrap(), RequestOutcome::Ack);

        let _reset_request = seen.recv().await.unwrap();
        let write_request = seen.recv().await.unwrap();
        assert_eq!(write_request.opcode, Opcode::Write);
        assert_eq!(write_request.payload.as_ref(), &[9]);
    }

    #[tokio::test]
    async fn test_unmatched_late_answer_discarded() {
        let (mut engine, _handle, _seen) = engine(Box::new(|request: &Frame| {
            vec![
                Frame::response(0x140, Opcode::Read, vec![0, 7]),
                Frame::response(request.address, request.opcode, vec![0x01]),
            ]
        }));

        let report = engine.tick().await.unwrap();
        assert!(matches!(
            report.outcome,
            TickOutcome::Reading(RegisterValue {
                kind: RegisterKind::WorkoutFlags,
                raw: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_end_of_stream_is_link_lost() {
        let (host, device) = duplex(64);
        drop(device);
        let mut engine =
            ProtocolEngine::new(host, config(), OnDemandHandle::new(&config()));

        let err = engine.tick().await.unwrap_err();
        assert!(matches!(err, RowbridgeError::LinkLost));
        assert!(engine.in_flight().is_none());
    }

    #[tokio::test]
    async fn test_link_lost_mid_request_answers_submitter() {
        let (host, device) = duplex(64);
        // console reads the request, then hangs up without answering
        tokio::spawn(async move {
            let mut framed = Framed::new(device, FrameCodec);
            let _ = framed.next().await;
        });
        let handle = OnDemandHandle::new(&config());
        let mut engine = ProtocolEngine::new(host, config(), handle.clone());
        let reply = handle.read(RegisterKind::Pace);

        let err = engine.tick().await.unwrap_err();
        assert!(matches!(err, RowbridgeError::LinkLost));
        assert_eq!(reply.await.unwrap(), RequestOutcome::LinkLost);
    }

    #[test]
    fn test_abandon_answers_queued_requests() {
        let handle = OnDemandHandle::new(&config());
        let mut pace = handle.read(RegisterKind::Pace);
        let mut reset = handle.reset();

        handle.abandon();
        assert_eq!(handle.pending(), 0);
        assert_eq!(pace.try_recv().unwrap(), RequestOutcome::LinkLost);
        assert_eq!(reset.try_recv().unwrap(), RequestOutcome::LinkLost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_engine_answers_interrupted_request() {
        let (mut engine, handle, _seen) = engine(Box::new(|_: &Frame| Vec::new()));
        let reply = handle.read(RegisterKind::Pace);

        // shutdown interrupts the exchange before the response timeout
        let interrupted =
            tokio::time::timeout(Duration::from_millis(10), engine.tick()).await;
        assert!(interrupted.is_err());
        assert!(engine.in_flight().is_some());

        drop(engine.into_inner());
        assert_eq!(reply.await.unwrap(), RequestOutcome::LinkLost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_outstanding_command() {
        let (mut engine, handle, mut seen) = engine(Box::new(|_: &Frame| Vec::new()));
        let _queued = handle.read(RegisterKind::Pace);

        // a timed-out command is reissued before anything else is sent
        engine.tick().await.unwrap();
        engine.tick().await.unwrap();
        let a = seen.recv().await.unwrap();
        let b = seen.recv().await.unwrap();
        assert_eq!(a.address, 0x1A5);
        assert_eq!(b.address, 0x1A5);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(seen.try_recv().is_err());
    }
}
