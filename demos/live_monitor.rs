use futures::{SinkExt, StreamExt};
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;
use tracing::info;

use rowbridge::{
    heart_rate::{HrSample, Reading, SourceEvent},
    live_data::ChannelNotifySink,
    persistence::MemorySink,
    protocol::{Frame, FrameCodec, Opcode},
    registers::{lookup, RegisterKind},
    serial::ChannelConnector,
    Pipeline, PipelineConfig, Result,
};

/// Simulated console: rows at a steady 2:05 pace and counts strokes as time passes
fn simulate_console(io: DuplexStream) {
    let strokes = Arc::new(AtomicU32::new(0));
    let ticker = strokes.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(2_400));
        loop {
            interval.tick().await;
            ticker.fetch_add(1, Ordering::Relaxed);
        }
    });

    tokio::spawn(async move {
        let mut framed = Framed::new(io, FrameCodec);
        while let Some(Ok(request)) = framed.next().await {
            let answer = match (request.opcode, lookup(request.address)) {
                (Opcode::Read, Some(register)) => {
                    let count = strokes.load(Ordering::Relaxed);
                    let value = match register.kind {
                        RegisterKind::StrokeCount => count,
                        RegisterKind::Distance => count * 10,
                        RegisterKind::Speed => 400,
                        RegisterKind::StrokeTime => 96,
                        RegisterKind::DriveTime => 32,
                        RegisterKind::Power => 180,
                        _ => 0,
                    };
                    Frame::response(request.address, Opcode::Read, register.encode_value(value))
                }
                (opcode, _) => Frame::response(request.address, opcode, Vec::new()),
            };
            if framed.send(answer).await.is_err() {
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("📊 Rowbridge Live Monitor (simulated console)");

    let (connector, streams) = ChannelConnector::new(1);
    let (host, device) = tokio::io::duplex(256);
    simulate_console(device);
    streams
        .send(host)
        .await
        .map_err(|_| rowbridge::RowbridgeError::ChannelClosed("simulated console"))?;

    let (notify, mut payloads) = ChannelNotifySink::new(32);
    tokio::spawn(async move { while payloads.recv().await.is_some() {} });

    let sink = MemorySink::new();
    let bridge = Pipeline::start(
        PipelineConfig::default(),
        connector,
        Arc::new(notify),
        sink.clone(),
        None,
    )
    .await?;

    // A strap with a steady 60 bpm beat
    let heart_rate = bridge.heart_rate_events();
    tokio::spawn(async move {
        loop {
            let rr = SourceEvent::Sample(HrSample {
                source: "simulated-strap".to_string(),
                reading: Reading::Rr(vec![1_000]),
                signal_quality: 80,
            });
            let bpm = SourceEvent::Sample(HrSample {
                source: "simulated-strap".to_string(),
                reading: Reading::Bpm(60),
                signal_quality: 80,
            });
            if heart_rate.send(bpm).await.is_err() || heart_rate.send(rr).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });

    let mut snapshots = bridge.hub().subscribe();
    let monitor = tokio::time::timeout(Duration::from_secs(20), async {
        let mut printed = 0_u32;
        while let Some(state) = snapshots.next().await {
            printed += 1;
            if printed % 5 != 0 {
                continue;
            }
            println!(
                "{:>16} | strokes {:>4} | {:>5} m | pace {:>3} s | {:>4} W | {:>3} bpm",
                state.phase.to_string(),
                state.stroke_count.unwrap_or(0),
                state.distance_m.unwrap_or(0),
                state.pace_500m_s.unwrap_or(0),
                state.power_w.unwrap_or(0),
                state.heart_rate_bpm.unwrap_or(0),
            );
        }
    });
    let _ = monitor.await;

    bridge.shutdown().await?;

    println!("\n📈 Records captured:");
    for record in sink.records() {
        println!("  {}", record.name());
    }
    Ok(())
}
