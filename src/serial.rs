use async_trait::async_trait;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    sync::{mpsc, Mutex},
};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, RowbridgeError},
    types::SerialConfig,
};

/// Opens the byte channel to the rowing console
#[async_trait]
pub trait SerialConnector: Send + Sync {
    /// Channel type produced by the connector
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a fresh channel
    async fn connect(&self) -> Result<Self::Stream>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Connector for a real serial device
#[derive(Debug, Clone)]
pub struct TokioSerialConnector {
    config: SerialConfig,
}

impl TokioSerialConnector {
    /// Connector for the configured port
    #[must_use]
    pub const fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SerialConnector for TokioSerialConnector {
    type Stream = SerialStream;

    async fn connect(&self) -> Result<SerialStream> {
        debug!(
            "Opening {} at {} baud",
            self.config.port, self.config.baud_rate
        );
        let stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .open_native_async()?;
        info!("Opened serial port {}", self.config.port);
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.config.port, self.config.baud_rate)
    }
}

/// Connector handing out in-memory channels, one per connection attempt
///
/// Used to drive the pipeline from a simulated console.
#[derive(Debug)]
pub struct ChannelConnector {
    streams: Mutex<mpsc::Receiver<DuplexStream>>,
}

impl ChannelConnector {
    /// Connector plus the sender that supplies its channels
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<DuplexStream>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                streams: Mutex::new(receiver),
            },
            sender,
        )
    }
}

#[async_trait]
impl SerialConnector for ChannelConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<DuplexStream> {
        self.streams
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| RowbridgeError::ConnectionFailed("no simulated console".to_string()))
    }

    fn describe(&self) -> String {
        "in-memory console".to_string()
    }
}

/// Names of the serial ports present on this host
#[must_use]
pub fn available_ports() -> Vec<String> {
    tokio_serial::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|port| port.port_name)
        .collect()
}

/// Open a channel, retrying with a fixed delay
///
/// Returns `Ok(None)` if shutdown is signalled while waiting.
///
/// # Errors
///
/// Returns the last connection error once `max_reconnect_attempts` (when non-zero) are
/// used up.
pub async fn connect_with_retry<C: SerialConnector + ?Sized>(
    connector: &C,
    config: &SerialConfig,
    shutdown: &CancellationToken,
) -> Result<Option<C::Stream>> {
    let delay = Duration::from_millis(config.reconnect_delay_ms);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = tokio::select! {
            () = shutdown.cancelled() => return Ok(None),
            result = connector.connect() => result,
        };

        match result {
            Ok(stream) => return Ok(Some(stream)),
            Err(e) if config.max_reconnect_attempts != 0
                && attempt >= config.max_reconnect_attempts =>
            {
                warn!(
                    "Giving up on {} after {} attempts",
                    connector.describe(),
                    attempt
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Connecting to {} failed (attempt {}): {}, retrying in {:?}",
                    connector.describe(),
                    attempt,
                    e,
                    delay
                );
            }
        }

        tokio::select! {
            () = shutdown.cancelled() => return Ok(None),
            () = tokio::time::sleep(delay) => {}
        }
    }
}
