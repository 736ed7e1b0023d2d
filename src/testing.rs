//! Scripted in-memory [`BleAdapter`] for tests and host-side development
//!
//! The mock plays back a scripted set of scan observations, records every
//! connect and write, and lets a test inject notifications or a link drop
//! as if the radio produced them. No Bluetooth hardware is touched.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::{sync::mpsc, time::sleep};

use crate::{
    adapter::{BleAdapter, DeviceId, DeviceObservation, LinkEvent},
    error::{PuckError, Result},
    PUCK_SERVICE_UUID,
};

#[derive(Default)]
struct MockState {
    powered_off: bool,
    observations: Vec<DeviceObservation>,
    scan_sink: Option<mpsc::UnboundedSender<DeviceObservation>>,
    link_sink: Option<mpsc::UnboundedSender<LinkEvent>>,
    connected: Option<DeviceId>,
    connect_calls: u32,
    scan_starts: u32,
    connect_failures: u32,
    connect_delay_ms: u64,
    fail_subscribe: bool,
    fail_writes_after: Option<usize>,
    writes: Vec<Vec<u8>>,
}

/// Scripted [`BleAdapter`] double
///
/// Observations added with [`add_observation`](Self::add_observation) are
/// replayed at the start of every scan, so retry loops see the same world
/// on each attempt. The scan channel stays open until `stop_scan`, which
/// matches a real radio: silence means "nothing found yet", not "scan over".
#[derive(Default)]
pub struct MockAdapter {
    state: Mutex<MockState>,
}

impl MockAdapter {
    /// Empty mock: powered on, nothing advertising
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observation shaped like a real Puck advertisement
    #[must_use]
    pub fn puck_observation(id: &str, name: &str, rssi: i16) -> DeviceObservation {
        DeviceObservation {
            device_id: DeviceId::new(id),
            advertised_name: Some(name.to_string()),
            signal_strength: rssi,
            advertised_services: vec![PUCK_SERVICE_UUID],
        }
    }

    /// Script an observation for every future scan
    pub fn add_observation(&self, observation: DeviceObservation) {
        self.lock().observations.push(observation);
    }

    /// Fail the next `count` connect calls
    pub fn set_connect_failures(&self, count: u32) {
        self.lock().connect_failures = count;
    }

    /// Make every connect call take this long
    pub fn set_connect_delay_ms(&self, delay_ms: u64) {
        self.lock().connect_delay_ms = delay_ms;
    }

    /// Make subscribe calls fail
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    /// Allow this many writes, then fail every later one
    pub fn set_fail_writes_after(&self, allowed: usize) {
        self.lock().fail_writes_after = Some(allowed);
    }

    /// Power the simulated radio on or off
    pub fn set_powered(&self, powered: bool) {
        self.lock().powered_off = !powered;
    }

    /// How many times connect was called
    #[must_use]
    pub fn connect_calls(&self) -> u32 {
        self.lock().connect_calls
    }

    /// How many scans were started
    #[must_use]
    pub fn scan_starts(&self) -> u32 {
        self.lock().scan_starts
    }

    /// Every frame written so far, in order
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Deliver raw notification bytes as if the device sent them
    ///
    /// Returns `false` when no subscription is active.
    pub fn inject_notification(&self, bytes: &[u8]) -> bool {
        self.lock()
            .link_sink
            .as_ref()
            .is_some_and(|sink| sink.send(LinkEvent::Notification(bytes.to_vec())).is_ok())
    }

    /// Drop the link as if the device went out of range
    ///
    /// Returns `false` when no subscription is active.
    pub fn inject_disconnect(&self) -> bool {
        let mut state = self.lock();
        state.connected = None;
        state
            .link_sink
            .as_ref()
            .is_some_and(|sink| sink.send(LinkEvent::Disconnected).is_ok())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn ensure_powered(&self) -> Result<()> {
        if self.lock().powered_off {
            return Err(PuckError::AdapterUnavailable(
                "simulated radio powered off".to_string(),
            ));
        }
        Ok(())
    }

    async fn start_scan(
        &self,
        _service_filter: Option<uuid::Uuid>,
        observations: mpsc::UnboundedSender<DeviceObservation>,
    ) -> Result<()> {
        let mut state = self.lock();
        state.scan_starts += 1;
        for observation in state.observations.clone() {
            let _ = observations.send(observation);
        }
        state.scan_sink = Some(observations);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.lock().scan_sink = None;
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        let (delay_ms, fail) = {
            let mut state = self.lock();
            state.connect_calls += 1;
            let fail = if state.connect_failures > 0 {
                state.connect_failures -= 1;
                true
            } else {
                false
            };
            (state.connect_delay_ms, fail)
        };
        if delay_ms > 0 {
            sleep(Duration::from_millis(delay_ms)).await;
        }
        if fail {
            return Err(PuckError::ConnectFailed(
                "simulated connect failure".to_string(),
            ));
        }
        self.lock().connected = Some(device.clone());
        Ok(())
    }

    async fn disconnect(&self, _device: &DeviceId) -> Result<()> {
        let mut state = self.lock();
        state.connected = None;
        state.link_sink = None;
        Ok(())
    }

    async fn subscribe(
        &self,
        _device: &DeviceId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.fail_subscribe {
            return Err(PuckError::SubscriptionFailed(
                "simulated subscribe failure".to_string(),
            ));
        }
        state.link_sink = Some(events);
        Ok(())
    }

    async fn unsubscribe(&self, _device: &DeviceId) -> Result<()> {
        self.lock().link_sink = None;
        Ok(())
    }

    async fn write_command(&self, _device: &DeviceId, bytes: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if let Some(allowed) = state.fail_writes_after {
            if state.writes.len() >= allowed {
                return Err(PuckError::WriteFailed(
                    "simulated write failure".to_string(),
                ));
            }
        }
        state.writes.push(bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_replays_script_and_stays_open() {
        let adapter = MockAdapter::new();
        adapter.add_observation(MockAdapter::puck_observation("p1", "TapFit Puck", -40));

        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.start_scan(None, tx).await.unwrap();
        assert!(rx.try_recv().is_ok());
        // Channel open until stop_scan: empty, not disconnected.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));

        adapter.stop_scan().await.unwrap();
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_injection_requires_subscription() {
        let adapter = MockAdapter::new();
        assert!(!adapter.inject_notification(&[0x01, 0x02]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter
            .subscribe(&DeviceId::new("p1"), tx)
            .await
            .unwrap();
        assert!(adapter.inject_notification(&[0x01, 0x02]));
        assert!(matches!(
            rx.try_recv(),
            Ok(LinkEvent::Notification(bytes)) if bytes == vec![0x01, 0x02]
        ));
    }

    #[tokio::test]
    async fn test_write_budget_counts_successful_writes() {
        let adapter = MockAdapter::new();
        adapter.set_fail_writes_after(1);
        let device = DeviceId::new("p1");
        assert!(adapter.write_command(&device, &[0x10]).await.is_ok());
        assert!(adapter.write_command(&device, &[0x11]).await.is_err());
        assert_eq!(adapter.writes(), vec![vec![0x10]]);
    }
}
