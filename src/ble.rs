use btleplug::{
    api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter},
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, RowbridgeError},
    heart_rate::{HeartRateMeasurement, HrSample, SourceEvent},
    types::{DeviceInfo, ScanConfig},
    BATTERY_LEVEL_UUID, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
};

/// Interval between connection and battery checks while streaming
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Parse one of the GATT UUID constants
///
/// # Errors
///
/// Returns [`RowbridgeError::ParseError`] if the string is not a valid UUID.
pub fn parse_uuid(uuid: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid).map_err(|e| RowbridgeError::ParseError(format!("Invalid UUID {uuid}: {e}")))
}

/// Pick the discovered device with the strongest signal
#[must_use]
pub fn strongest<T>(candidates: Vec<(DeviceInfo, T)>) -> Option<(DeviceInfo, T)> {
    candidates.into_iter().max_by_key(|(device, _)| device.rssi)
}

/// Turn one measurement notification into fusion events
///
/// Malformed notifications yield no events.
#[must_use]
pub fn measurement_events(source: &str, signal_quality: u8, data: &[u8]) -> Vec<SourceEvent> {
    match HeartRateMeasurement::parse(data) {
        Ok(measurement) => HrSample::from_measurement(source, signal_quality, &measurement)
            .into_iter()
            .map(SourceEvent::Sample)
            .collect(),
        Err(e) => {
            debug!("Dropping heart-rate notification from {}: {}", source, e);
            Vec::new()
        }
    }
}

/// BLE central that finds heart-rate monitors and streams their measurements
pub struct HeartRateScanner {
    adapter: Adapter,
    config: ScanConfig,
    service_uuid: Uuid,
    measurement_uuid: Uuid,
    battery_uuid: Uuid,
}

impl std::fmt::Debug for HeartRateScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartRateScanner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HeartRateScanner {
    /// Open the first Bluetooth adapter on this host
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::Startup`] if the Bluetooth stack cannot be initialized
    /// or no adapter is present.
    pub async fn new(config: ScanConfig) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| RowbridgeError::Startup(format!("Bluetooth unavailable: {e}")))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| RowbridgeError::Startup(format!("Bluetooth unavailable: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| RowbridgeError::Startup("no Bluetooth adapter found".to_string()))?;

        Ok(Self {
            adapter,
            config,
            service_uuid: parse_uuid(HEART_RATE_SERVICE_UUID)?,
            measurement_uuid: parse_uuid(HEART_RATE_MEASUREMENT_UUID)?,
            battery_uuid: parse_uuid(BATTERY_LEVEL_UUID)?,
        })
    }

    /// Scan for heart-rate monitors for the configured scan window
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::Ble`] if the adapter rejects the scan.
    pub async fn scan(&self) -> Result<Vec<(DeviceInfo, Peripheral)>> {
        info!("Scanning for heart-rate monitors...");

        self.adapter
            .start_scan(ScanFilter {
                services: vec![self.service_uuid],
            })
            .await?;
        tokio::time::sleep(Duration::from_millis(self.config.scan_timeout_ms)).await;
        self.adapter.stop_scan().await?;

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            if !properties.services.contains(&self.service_uuid) {
                continue;
            }
            let device = DeviceInfo::new(
                properties
                    .local_name
                    .unwrap_or_else(|| "Unknown HRM".to_string()),
                properties.address.to_string(),
                properties.rssi.unwrap_or(-100),
            );
            info!("Found heart-rate monitor: {} [{}]", device.name, device.address);
            found.push((device, peripheral));
        }

        info!("Scan completed. Found {} monitor(s)", found.len());
        Ok(found)
    }

    /// Connect and subscribe to the measurement characteristic
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::Timeout`] if the connection does not complete in time,
    /// [`RowbridgeError::ConnectionFailed`] if it is refused or the characteristic is
    /// missing, or [`RowbridgeError::Ble`] for other Bluetooth errors.
    pub async fn connect(&self, device: &DeviceInfo, peripheral: &Peripheral) -> Result<()> {
        info!("Connecting to {} [{}]", device.name, device.address);

        timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            peripheral.connect(),
        )
        .await
        .map_err(|_| RowbridgeError::Timeout {
            timeout_ms: self.config.connect_timeout_ms,
        })?
        .map_err(|e| RowbridgeError::ConnectionFailed(e.to_string()))?;

        peripheral.discover_services().await?;

        let measurement = self
            .characteristic(peripheral, self.measurement_uuid)
            .ok_or_else(|| {
                RowbridgeError::ConnectionFailed(
                    "heart rate measurement characteristic not found".to_string(),
                )
            })?;
        peripheral.subscribe(&measurement).await?;

        info!("Subscribed to heart-rate notifications from {}", device.name);
        Ok(())
    }

    fn characteristic(&self, peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
    }

    async fn log_battery(&self, device: &DeviceInfo, peripheral: &Peripheral) {
        let Some(battery) = self.characteristic(peripheral, self.battery_uuid) else {
            return;
        };
        match peripheral.read(&battery).await {
            Ok(value) => match value.first() {
                Some(level) => info!("{} battery level: {}%", device.name, level),
                None => debug!("{} returned an empty battery level", device.name),
            },
            Err(e) => warn!("Battery read from {} failed: {}", device.name, e),
        }
    }

    /// Forward measurements until the peripheral drops or shutdown is signalled
    ///
    /// Returns `false` if the event receiver has gone away.
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::Ble`] if the notification stream cannot be opened.
    pub async fn stream(
        &self,
        device: &DeviceInfo,
        peripheral: &Peripheral,
        events: &mpsc::Sender<SourceEvent>,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let mut notifications = peripheral.notifications().await?;
        let signal_quality = device.signal_quality();
        let mut link_check = tokio::time::interval(LINK_CHECK_INTERVAL);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    if let Err(e) = peripheral.disconnect().await {
                        debug!("Disconnect from {} failed: {}", device.name, e);
                    }
                    return Ok(true);
                }
                notification = notifications.next() => {
                    let Some(notification) = notification else {
                        break;
                    };
                    if notification.uuid != self.measurement_uuid {
                        continue;
                    }
                    for event in measurement_events(&device.address, signal_quality, &notification.value) {
                        if events.send(event).await.is_err() {
                            return Ok(false);
                        }
                    }
                }
                _ = link_check.tick() => {
                    if !peripheral.is_connected().await.unwrap_or(false) {
                        break;
                    }
                    self.log_battery(device, peripheral).await;
                }
            }
        }

        warn!("Heart-rate monitor {} disconnected", device.name);
        Ok(events
            .send(SourceEvent::Disconnected(device.address.clone()))
            .await
            .is_ok())
    }

    /// Scan, connect and stream until shutdown
    ///
    /// Failures of a single scan or connection are logged and retried after
    /// `rescan_delay_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`RowbridgeError::ChannelClosed`] if the fusion receiver goes away.
    pub async fn run(
        self,
        events: mpsc::Sender<SourceEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let rescan_delay = Duration::from_millis(self.config.rescan_delay_ms);

        while !shutdown.is_cancelled() {
            let scanned = tokio::select! {
                () = shutdown.cancelled() => break,
                scanned = self.scan() => scanned,
            };

            let found = scanned.unwrap_or_else(|e| {
                warn!("Heart-rate scan failed: {}", e);
                Vec::new()
            });

            if let Some((device, peripheral)) = strongest(found) {
                let connected = tokio::select! {
                    () = shutdown.cancelled() => break,
                    connected = self.connect(&device, &peripheral) => connected,
                };
                let streamed = match connected {
                    Ok(()) => self.stream(&device, &peripheral, &events, &shutdown).await,
                    Err(e) => Err(e),
                };
                match streamed {
                    Ok(true) => {}
                    Ok(false) => return Err(RowbridgeError::ChannelClosed("heart-rate events")),
                    Err(e) => warn!("Heart-rate monitor {} failed: {}", device.name, e),
                }
            } else {
                info!("No heart-rate monitor found, rescanning in {:?}", rescan_delay);
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(rescan_delay) => {}
            }
        }

        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Stopping scan failed: {}", e);
        }
        info!("Heart-rate scanner stopped");
        Ok(())
    }
}
