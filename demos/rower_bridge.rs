use std::{env, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rowbridge::{
    ble::HeartRateScanner,
    live_data::ChannelNotifySink,
    persistence::JsonLinesSink,
    serial::{available_ports, TokioSerialConnector},
    Pipeline, PipelineConfig, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🚣 Rowbridge {}", rowbridge::VERSION);

    // Optional JSON configuration file as the first argument
    let config = match env::args().nth(1) {
        Some(path) => PipelineConfig::from_json(&tokio::fs::read_to_string(&path).await?)?,
        None => PipelineConfig::default(),
    };

    let ports = available_ports();
    if !ports.contains(&config.serial.port) {
        warn!(
            "{} is not among the detected ports {:?}",
            config.serial.port, ports
        );
    }

    let scanner = HeartRateScanner::new(config.scan.clone()).await?;
    let connector = TokioSerialConnector::new(config.serial.clone());
    let sink = JsonLinesSink::open("rowbridge.jsonl").await?;

    // The GATT server is external; show the payloads it would notify
    let (notify, mut payloads) = ChannelNotifySink::new(32);
    tokio::spawn(async move {
        while let Some(payload) = payloads.recv().await {
            info!("Rower Data: {:02X?}", payload.as_ref());
        }
    });

    let bridge = match Pipeline::start(config, connector, Arc::new(notify), sink, Some(scanner)).await
    {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("❌ Failed to start bridge: {}", e);
            return Err(e);
        }
    };

    info!("✅ Bridge running. Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    bridge.shutdown().await?;
    info!("🎉 Bridge stopped cleanly");
    Ok(())
}
