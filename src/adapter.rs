use async_trait::async_trait;
use btleplug::{
    api::{Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{PuckError, Result},
    PUCK_COMMAND_CHAR_UUID, PUCK_EVENT_CHAR_UUID, PUCK_SERVICE_UUID,
};

/// Opaque, adapter-scoped device identifier
///
/// Stable only for the current scan session; never assume it survives a
/// reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a raw adapter identifier
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw identifier string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single scan sighting of some nearby device
#[derive(Debug, Clone)]
pub struct DeviceObservation {
    /// Adapter-scoped identifier to connect with
    pub device_id: DeviceId,
    /// Advertised local name, if any
    pub advertised_name: Option<String>,
    /// RSSI in dBm; higher means closer
    pub signal_strength: i16,
    /// Advertised service UUIDs
    pub advertised_services: Vec<Uuid>,
}

/// Events flowing from an established link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A value arrived on the event characteristic
    Notification(Vec<u8>),
    /// The device disconnected without being asked to
    Disconnected,
}

/// Platform BLE primitives the core needs
///
/// The production implementation is [`SystemAdapter`]; tests use
/// [`crate::testing::MockAdapter`]. Keeping the adapter injectable is what
/// lets the whole connection pipeline run without radio hardware.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Verify the adapter exists and Bluetooth is powered on
    async fn ensure_powered(&self) -> Result<()>;

    /// Start scanning; observations are pushed into `observations`
    async fn start_scan(
        &self,
        service_filter: Option<Uuid>,
        observations: mpsc::UnboundedSender<DeviceObservation>,
    ) -> Result<()>;

    /// Stop an active scan (no-op when idle)
    async fn stop_scan(&self) -> Result<()>;

    /// Establish the physical connection
    async fn connect(&self, device: &DeviceId) -> Result<()>;

    /// Tear down the physical connection (no-op when already down)
    async fn disconnect(&self, device: &DeviceId) -> Result<()>;

    /// Subscribe to the event characteristic; values and unsolicited
    /// disconnects are pushed into `events`
    async fn subscribe(
        &self,
        device: &DeviceId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<()>;

    /// Drop the notification subscription
    async fn unsubscribe(&self, device: &DeviceId) -> Result<()>;

    /// Write one frame to the command characteristic
    async fn write_command(&self, device: &DeviceId, bytes: &[u8]) -> Result<()>;
}

struct LinkTasks {
    notifications: JoinHandle<()>,
}

impl Drop for LinkTasks {
    fn drop(&mut self) {
        self.notifications.abort();
    }
}

/// Production [`BleAdapter`] backed by the platform Bluetooth stack
pub struct SystemAdapter {
    central: Adapter,
    peripherals: Arc<Mutex<HashMap<DeviceId, Peripheral>>>,
    scan_sink: Arc<Mutex<Option<mpsc::UnboundedSender<DeviceObservation>>>>,
    link_sinks: Arc<Mutex<HashMap<DeviceId, mpsc::UnboundedSender<LinkEvent>>>>,
    link_tasks: Mutex<HashMap<DeviceId, LinkTasks>>,
    _event_task: JoinHandle<()>,
}

impl SystemAdapter {
    /// Create an adapter bound to the first Bluetooth controller
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::AdapterUnavailable`] when no controller is
    /// present, or [`PuckError::Ble`] if the platform manager fails.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let central = adapters.into_iter().next().ok_or_else(|| {
            PuckError::AdapterUnavailable("no Bluetooth controller present".to_string())
        })?;

        let peripherals: Arc<Mutex<HashMap<DeviceId, Peripheral>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let scan_sink: Arc<Mutex<Option<mpsc::UnboundedSender<DeviceObservation>>>> =
            Arc::new(Mutex::new(None));
        let link_sinks: Arc<Mutex<HashMap<DeviceId, mpsc::UnboundedSender<LinkEvent>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let event_task = tokio::spawn(Self::pump_central_events(
            central.clone(),
            peripherals.clone(),
            scan_sink.clone(),
            link_sinks.clone(),
        ));

        Ok(Self {
            central,
            peripherals,
            scan_sink,
            link_sinks,
            link_tasks: Mutex::new(HashMap::new()),
            _event_task: event_task,
        })
    }

    async fn pump_central_events(
        central: Adapter,
        peripherals: Arc<Mutex<HashMap<DeviceId, Peripheral>>>,
        scan_sink: Arc<Mutex<Option<mpsc::UnboundedSender<DeviceObservation>>>>,
        link_sinks: Arc<Mutex<HashMap<DeviceId, mpsc::UnboundedSender<LinkEvent>>>>,
    ) {
        let mut events = match central.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("could not open central event stream: {e}");
                return;
            }
        };

        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    let Ok(peripheral) = central.peripheral(&id).await else {
                        continue;
                    };
                    let device_id = DeviceId::new(id.to_string());
                    let observation = Self::observe(&device_id, &peripheral).await;
                    peripherals.lock().await.insert(device_id, peripheral);

                    if let (Some(obs), Some(sink)) =
                        (observation, scan_sink.lock().await.as_ref())
                    {
                        let _ = sink.send(obs);
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let device_id = DeviceId::new(id.to_string());
                    if let Some(sink) = link_sinks.lock().await.remove(&device_id) {
                        let _ = sink.send(LinkEvent::Disconnected);
                    }
                }
                _ => {}
            }
        }
    }

    async fn observe(device_id: &DeviceId, peripheral: &Peripheral) -> Option<DeviceObservation> {
        let properties = peripheral.properties().await.ok()??;
        Some(DeviceObservation {
            device_id: device_id.clone(),
            advertised_name: properties.local_name,
            signal_strength: properties.rssi.unwrap_or(i16::MIN),
            advertised_services: properties.services,
        })
    }

    async fn peripheral(&self, device: &DeviceId) -> Result<Peripheral> {
        self.peripherals
            .lock()
            .await
            .get(device)
            .cloned()
            .ok_or_else(|| PuckError::ConnectFailed(format!("device {device} not seen in scan")))
    }

    async fn characteristic(
        &self,
        peripheral: &Peripheral,
        char_uuid: Uuid,
    ) -> Result<btleplug::api::Characteristic> {
        let services = peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == PUCK_SERVICE_UUID)
            .ok_or_else(|| {
                PuckError::SubscriptionFailed("Puck service not found on device".to_string())
            })?;
        service
            .characteristics
            .iter()
            .find(|c| c.uuid == char_uuid)
            .cloned()
            .ok_or_else(|| {
                PuckError::SubscriptionFailed(format!("characteristic {char_uuid} not found"))
            })
    }
}

#[async_trait]
impl BleAdapter for SystemAdapter {
    async fn ensure_powered(&self) -> Result<()> {
        match self.central.adapter_state().await? {
            CentralState::PoweredOn => Ok(()),
            CentralState::PoweredOff => Err(PuckError::AdapterUnavailable(
                "Bluetooth is powered off".to_string(),
            )),
            // Some platforms never report a definite state; proceed and let
            // the scan surface real failures.
            other => {
                debug!("adapter state {other:?}, proceeding");
                Ok(())
            }
        }
    }

    async fn start_scan(
        &self,
        service_filter: Option<Uuid>,
        observations: mpsc::UnboundedSender<DeviceObservation>,
    ) -> Result<()> {
        *self.scan_sink.lock().await = Some(observations);

        let filter = ScanFilter {
            services: service_filter.into_iter().collect(),
        };
        info!("starting BLE scan");
        self.central.start_scan(filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scan_sink.lock().await.take();
        self.central.stop_scan().await?;
        debug!("scan stopped");
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| PuckError::ConnectFailed(e.to_string()))?;
        peripheral.discover_services().await?;
        info!("connected to {device}");
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        let Ok(peripheral) = self.peripheral(device).await else {
            return Ok(());
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        device: &DeviceId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        let event_char = self.characteristic(&peripheral, PUCK_EVENT_CHAR_UUID).await?;

        peripheral.subscribe(&event_char).await?;
        self.link_sinks
            .lock()
            .await
            .insert(device.clone(), events.clone());

        let mut stream = peripheral.notifications().await?;
        let char_uuid = event_char.uuid;
        let task = tokio::spawn(async move {
            while let Some(data) = stream.next().await {
                if data.uuid == char_uuid && events.send(LinkEvent::Notification(data.value)).is_err()
                {
                    break;
                }
            }
        });
        self.link_tasks
            .lock()
            .await
            .insert(device.clone(), LinkTasks { notifications: task });

        debug!("subscribed to event notifications on {device}");
        Ok(())
    }

    async fn unsubscribe(&self, device: &DeviceId) -> Result<()> {
        self.link_tasks.lock().await.remove(device);
        self.link_sinks.lock().await.remove(device);

        let Ok(peripheral) = self.peripheral(device).await else {
            return Ok(());
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            let event_char = self.characteristic(&peripheral, PUCK_EVENT_CHAR_UUID).await?;
            peripheral.unsubscribe(&event_char).await?;
        }
        Ok(())
    }

    async fn write_command(&self, device: &DeviceId, bytes: &[u8]) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        let command_char = self
            .characteristic(&peripheral, PUCK_COMMAND_CHAR_UUID)
            .await?;
        peripheral
            .write(&command_char, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| PuckError::WriteFailed(e.to_string()))
    }
}
