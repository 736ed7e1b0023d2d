use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    time::{sleep, sleep_until, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    adapter::{BleAdapter, DeviceId, LinkEvent},
    error::{PuckError, Result},
    manager::{EventBus, PuckNotification},
    protocol::{Command, ProtocolProfile},
    selector::{DeviceSelector, SelectedCandidate, SelectorConfig},
};

/// Where the connection pipeline currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPhase {
    /// No session and no attempt in progress
    Idle,
    /// Discovery scan running
    Scanning,
    /// Physical connect in progress
    Connecting,
    /// Subscribing to event notifications and handshaking
    Subscribing,
    /// Link established, no workout session running
    Connected,
    /// Link established and a workout session is active
    SessionActive,
    /// Link established, workout session ended
    SessionIdle,
    /// Graceful teardown in progress
    Disconnecting,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "Idle",
            Self::Scanning => "Scanning",
            Self::Connecting => "Connecting",
            Self::Subscribing => "Subscribing",
            Self::Connected => "Connected",
            Self::SessionActive => "SessionActive",
            Self::SessionIdle => "SessionIdle",
            Self::Disconnecting => "Disconnecting",
        };
        f.write_str(label)
    }
}

/// Time budgets for one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Scan window for manually triggered attempts
    pub scan_timeout_ms: u64,
    /// Shorter scan window for NFC-triggered attempts; the user is
    /// standing next to the device
    pub nfc_scan_timeout_ms: u64,
    /// Bound on the physical connect call; a hung connect is cancelled
    /// at the adapter rather than leaked
    pub connect_timeout_ms: u64,
    /// Gap between the handshake and the initial status request
    pub handshake_gap_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 15_000,
            nfc_scan_timeout_ms: 8_000,
            connect_timeout_ms: 10_000,
            handshake_gap_ms: 200,
        }
    }
}

/// One live link to a Puck
///
/// Owns the device's command queue: writes to the command characteristic are
/// serialized behind an internal lock because concurrent writes to one
/// characteristic are undefined on several BLE stacks. Created by the
/// connection pipeline in [`crate::manager::PuckManager`]; destroyed by
/// [`disconnect`](Self::disconnect) or link loss.
pub struct PuckSession {
    adapter: Arc<dyn BleAdapter>,
    profile: ProtocolProfile,
    candidate: SelectedCandidate,
    events: EventBus,
    write_gate: Mutex<()>,
    torn_down: AtomicBool,
}

impl PuckSession {
    /// Run the full scan → select → connect → subscribe → handshake pipeline
    ///
    /// Emits a `PhaseChanged` notification at every stage. The `cancel`
    /// signal interrupts an in-progress scan or pending connect instead of
    /// waiting it out.
    ///
    /// # Errors
    ///
    /// [`PuckError::NoDeviceFound`] when the scan window elapses without an
    /// accepted candidate, [`PuckError::ConnectFailed`] /
    /// [`PuckError::Timeout`] when the physical connect fails after its one
    /// immediate retry, [`PuckError::SubscriptionFailed`] when notification
    /// setup or the handshake fails, [`PuckError::Cancelled`] on explicit
    /// interruption.
    pub(crate) async fn establish(
        adapter: Arc<dyn BleAdapter>,
        selector_config: SelectorConfig,
        profile: ProtocolProfile,
        config: &SessionConfig,
        scan_budget_ms: u64,
        events: EventBus,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>)> {
        adapter.ensure_powered().await?;

        events.emit(PuckNotification::PhaseChanged(ConnectionPhase::Scanning));
        let service_uuid = selector_config.service_uuid;
        let (obs_tx, mut obs_rx) = mpsc::unbounded_channel();
        adapter.start_scan(Some(service_uuid), obs_tx).await?;

        let mut selector = DeviceSelector::new(selector_config);
        let deadline = Instant::now() + Duration::from_millis(scan_budget_ms);
        let committed = loop {
            tokio::select! {
                observation = obs_rx.recv() => match observation {
                    Some(observation) => {
                        if let Some(candidate) = selector.observe(&observation) {
                            break Some(candidate);
                        }
                    }
                    None => break selector.best().cloned(),
                },
                () = sleep_until(deadline) => break selector.best().cloned(),
                () = cancelled(&mut cancel) => {
                    let _ = adapter.stop_scan().await;
                    return Err(PuckError::Cancelled);
                }
            }
        };

        // Stop the radio the moment a candidate commits; waiting out the
        // budget only adds latency.
        if let Err(e) = adapter.stop_scan().await {
            warn!("stop_scan failed: {e}");
        }
        let candidate = committed.ok_or(PuckError::NoDeviceFound {
            budget_ms: scan_budget_ms,
        })?;
        info!(
            device = %candidate.device_id,
            name = ?candidate.advertised_name,
            rssi = candidate.signal_strength,
            "candidate selected"
        );

        events.emit(PuckNotification::PhaseChanged(ConnectionPhase::Connecting));
        let connect_result = tokio::select! {
            result = connect_with_retry(adapter.as_ref(), &candidate.device_id, config.connect_timeout_ms) => result,
            () = cancelled(&mut cancel) => {
                let _ = adapter.disconnect(&candidate.device_id).await;
                return Err(PuckError::Cancelled);
            }
        };
        connect_result?;

        events.emit(PuckNotification::PhaseChanged(ConnectionPhase::Subscribing));
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        if let Err(e) = adapter.subscribe(&candidate.device_id, link_tx).await {
            let _ = adapter.disconnect(&candidate.device_id).await;
            return Err(PuckError::SubscriptionFailed(e.to_string()));
        }

        let session = Self {
            adapter,
            profile,
            candidate,
            events: events.clone(),
            write_gate: Mutex::new(()),
            torn_down: AtomicBool::new(false),
        };

        if let Err(e) = session.send(Command::Handshake).await {
            session.abandon().await;
            return Err(PuckError::SubscriptionFailed(format!("handshake: {e}")));
        }
        // Firmware races when commands arrive back-to-back right after
        // subscription; give the handshake time to land first.
        sleep(Duration::from_millis(config.handshake_gap_ms)).await;
        if let Err(e) = session.send(Command::StatusRequest).await {
            // Non-critical: the next heartbeat carries the same data.
            warn!("initial status request failed: {e}");
        }

        events.emit(PuckNotification::PhaseChanged(ConnectionPhase::Connected));
        info!(device = %session.candidate.device_id, "session established");
        Ok((session, link_rx))
    }

    /// The candidate this session connected to
    #[must_use]
    pub const fn candidate(&self) -> &SelectedCandidate {
        &self.candidate
    }

    /// Identifier of the connected device
    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        &self.candidate.device_id
    }

    /// Protocol profile active on this link
    #[must_use]
    pub const fn profile(&self) -> &ProtocolProfile {
        &self.profile
    }

    /// Send a command with an empty payload
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::WriteFailed`] when the write does not reach the
    /// device.
    pub async fn send(&self, command: Command) -> Result<()> {
        self.send_with_payload(command, &[]).await
    }

    /// Send a command with a payload
    ///
    /// # Errors
    ///
    /// [`PuckError::PayloadTooLarge`] for payloads over the write limit,
    /// [`PuckError::WriteFailed`] when the write does not reach the device.
    pub async fn send_with_payload(&self, command: Command, payload: &[u8]) -> Result<()> {
        let frame = self.profile.encode(command, payload)?;

        // One write in flight per characteristic: a send issued while a
        // previous write completes queues here instead of racing it.
        let _gate = self.write_gate.lock().await;
        debug!(?command, frame = ?frame.as_ref(), "writing command");
        self.adapter
            .write_command(&self.candidate.device_id, &frame)
            .await
            .map_err(|e| match e {
                PuckError::WriteFailed(_) => e,
                other => PuckError::WriteFailed(other.to_string()),
            })
    }

    /// Gracefully tear the session down
    ///
    /// Sends a best-effort end-session command, then drops the notification
    /// subscription and the physical link unconditionally. Idempotent:
    /// calling this on an already-torn-down session is a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for adapters that
    /// must report teardown failures.
    pub async fn disconnect(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.events
            .emit(PuckNotification::PhaseChanged(ConnectionPhase::Disconnecting));

        // Best effort: teardown proceeds whether or not the device hears it.
        if let Err(e) = self.send(Command::EndSession).await {
            debug!("graceful end-session command failed: {e}");
        }
        if let Err(e) = self.adapter.unsubscribe(&self.candidate.device_id).await {
            debug!("unsubscribe failed: {e}");
        }
        if let Err(e) = self.adapter.disconnect(&self.candidate.device_id).await {
            warn!("physical disconnect failed: {e}");
        }

        self.events
            .emit(PuckNotification::PhaseChanged(ConnectionPhase::Idle));
        info!(device = %self.candidate.device_id, "disconnected");
        Ok(())
    }

    /// Tear down after the link is already gone; skips the graceful command
    pub(crate) async fn abandon(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.adapter.unsubscribe(&self.candidate.device_id).await;
        let _ = self.adapter.disconnect(&self.candidate.device_id).await;
    }
}

async fn connect_with_retry(
    adapter: &dyn BleAdapter,
    device: &DeviceId,
    timeout_ms: u64,
) -> Result<()> {
    match connect_once(adapter, device, timeout_ms).await {
        Ok(()) => Ok(()),
        Err(first) => {
            // Some adapters transiently fail the first raw connect.
            warn!("connect attempt failed ({first}), retrying once immediately");
            connect_once(adapter, device, timeout_ms).await
        }
    }
}

async fn connect_once(adapter: &dyn BleAdapter, device: &DeviceId, timeout_ms: u64) -> Result<()> {
    match timeout(Duration::from_millis(timeout_ms), adapter.connect(device)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(match e {
            PuckError::ConnectFailed(_) => e,
            other => PuckError::ConnectFailed(other.to_string()),
        }),
        Err(_) => {
            // Cancel the hung connect at the adapter, do not leak it.
            let _ = adapter.disconnect(device).await;
            Err(PuckError::Timeout { timeout_ms })
        }
    }
}

/// Resolves when cancellation is requested; never resolves if the sender is
/// gone (a dropped controller must not read as a cancel)
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|&cancelled| cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAdapter;

    fn never_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the whole test process.
        std::mem::forget(tx);
        rx
    }

    async fn establish(
        adapter: Arc<MockAdapter>,
    ) -> Result<(PuckSession, mpsc::UnboundedReceiver<LinkEvent>)> {
        PuckSession::establish(
            adapter,
            SelectorConfig::default(),
            ProtocolProfile::standard(),
            &SessionConfig::default(),
            1_000,
            EventBus::new(),
            never_cancel(),
        )
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_scan_times_out_with_no_device_found() {
        let adapter = Arc::new(MockAdapter::new());
        let result = establish(adapter).await;
        assert!(matches!(
            result,
            Err(PuckError::NoDeviceFound { budget_ms: 1_000 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_floor_observation_is_never_forced() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_observation(MockAdapter::puck_observation("weak", "TapFit Puck", -92));
        let result = establish(adapter).await;
        assert!(matches!(result, Err(PuckError::NoDeviceFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gets_one_immediate_retry() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_observation(MockAdapter::puck_observation("p1", "TapFit Puck", -50));
        adapter.set_connect_failures(1);

        let (session, _link) = establish(adapter.clone()).await.unwrap();
        assert_eq!(adapter.connect_calls(), 2);
        session.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_fails_the_attempt() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_observation(MockAdapter::puck_observation("p1", "TapFit Puck", -50));
        adapter.set_fail_writes_after(0);

        let result = establish(adapter).await;
        assert!(matches!(result, Err(PuckError::SubscriptionFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_request_failure_is_swallowed() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_observation(MockAdapter::puck_observation("p1", "TapFit Puck", -50));
        // Handshake succeeds, the follow-up status request fails.
        adapter.set_fail_writes_after(1);

        let result = establish(adapter).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_observation(MockAdapter::puck_observation("p1", "TapFit Puck", -50));

        let (session, _link) = establish(adapter.clone()).await.unwrap();
        session.disconnect().await.unwrap();
        let writes_after_first = adapter.writes().len();
        session.disconnect().await.unwrap();
        assert_eq!(adapter.writes().len(), writes_after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_cancelled_attempt_aborts_scan() {
        let adapter = Arc::new(MockAdapter::new());
        let (cancel_tx, cancel_rx) = watch::channel(true);

        let result = PuckSession::establish(
            adapter,
            SelectorConfig::default(),
            ProtocolProfile::standard(),
            &SessionConfig::default(),
            1_000,
            EventBus::new(),
            cancel_rx,
        )
        .await;
        drop(cancel_tx);
        assert!(matches!(result, Err(PuckError::Cancelled)));
    }
}
