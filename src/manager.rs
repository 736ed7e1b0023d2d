use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use futures::{future::BoxFuture, FutureExt};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{
    adapter::{BleAdapter, LinkEvent},
    error::{ErrorKind, PuckError, Result},
    protocol::{Command, Packet, ProtocolProfile},
    selector::SelectorConfig,
    session::{cancelled, ConnectionPhase, PuckSession, SessionConfig},
    state::{DeviceState, StateProjection},
};

/// Why a connection is being requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTrigger {
    /// Explicit user action in the app
    Manual,
    /// The phone was tapped against an NFC station
    NfcTap {
        /// Opaque station identifier from the tap, for logging only
        target: Option<String>,
    },
    /// The app came to the foreground
    ///
    /// Skipped silently when a session already exists or an attempt is
    /// in flight.
    AppForeground,
    /// Internal: the previous link dropped and auto-reconnect is on
    LinkLoss,
}

/// Fire-and-forget notifications for UI collaborators
///
/// Delivered over unbounded per-subscriber queues so a slow consumer can
/// never block the connection pipeline.
#[derive(Debug, Clone)]
pub enum PuckNotification {
    /// The connection pipeline moved to a new phase
    PhaseChanged(ConnectionPhase),
    /// The rep count changed to this value
    RepCount(u32),
    /// Any field of the projected device state changed
    StateUpdated(DeviceState),
    /// The device reported an NFC tap
    NfcDetected,
    /// The device asked to be treated as a connection trigger
    AutoConnectRequested,
    /// The link dropped without being asked to; reconnection may follow
    LinkLost,
    /// A terminal or device-reported error
    Error {
        /// Coarse classification
        kind: ErrorKind,
        /// Human-readable detail
        message: String,
    },
}

/// Non-blocking notification fan-out
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<StdMutex<Vec<mpsc::UnboundedSender<PuckNotification>>>>,
}

impl EventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber; dropping the receiver unsubscribes
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PuckNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, notification: PuckNotification) {
        self.lock()
            .retain(|subscriber| subscriber.send(notification.clone()).is_ok());
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<PuckNotification>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Retry and reconnection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Per-attempt time budgets
    pub session: SessionConfig,
    /// Automatic retries after a failed attempt (total attempts = this + 1)
    pub max_retries: u32,
    /// First backoff delay; doubles per retry
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    pub backoff_cap_ms: u64,
    /// Re-enter the scan path eagerly after unsolicited link loss
    pub auto_reconnect: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            max_retries: 2,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 5_000,
            auto_reconnect: true,
        }
    }
}

struct ActiveLink {
    session: Arc<PuckSession>,
    pump: JoinHandle<()>,
}

struct Inner {
    adapter: Arc<dyn BleAdapter>,
    selector: SelectorConfig,
    profile: ProtocolProfile,
    config: ManagerConfig,
    attempt_in_flight: AtomicBool,
    attempt_cancel: StdMutex<Option<watch::Sender<bool>>>,
    active: Mutex<Option<ActiveLink>>,
    projection: Mutex<StateProjection>,
    events: EventBus,
}

/// Owns the single process-wide Puck session
///
/// Wraps [`PuckSession`] with the retry/backoff policy, the "at most one
/// attempt in flight" guard, trigger normalization, and link-loss
/// auto-reconnect. Construct one at the application's composition root and
/// inject it wherever connection control is needed; the one-session rule is
/// an invariant of this object, not ambient global state.
pub struct PuckManager {
    inner: Arc<Inner>,
}

impl PuckManager {
    /// Manager with default selector, profile, and policy
    #[must_use]
    pub fn new(adapter: Arc<dyn BleAdapter>) -> Self {
        Self::with_settings(
            adapter,
            SelectorConfig::default(),
            ProtocolProfile::standard(),
            ManagerConfig::default(),
        )
    }

    /// Manager with explicit selector, protocol profile, and policy
    #[must_use]
    pub fn with_settings(
        adapter: Arc<dyn BleAdapter>,
        selector: SelectorConfig,
        profile: ProtocolProfile,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapter,
                selector,
                profile,
                config,
                attempt_in_flight: AtomicBool::new(false),
                attempt_cancel: StdMutex::new(None),
                active: Mutex::new(None),
                projection: Mutex::new(StateProjection::new()),
                events: EventBus::new(),
            }),
        }
    }

    /// Register for notifications
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PuckNotification> {
        self.inner.events.subscribe()
    }

    /// Request a connection; completes when connected or terminally failed
    ///
    /// All trigger sources funnel through here. Retries per the configured
    /// backoff policy before surfacing a failure.
    ///
    /// # Errors
    ///
    /// [`PuckError::AlreadyConnecting`] when an attempt is already in
    /// flight; otherwise the terminal error of the last attempt.
    pub async fn request_connection(&self, trigger: ConnectionTrigger) -> Result<()> {
        self.inner.clone().request(trigger).await
    }

    /// Disconnect, interrupting any in-flight attempt
    ///
    /// Idempotent: disconnecting while already disconnected is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates session teardown failures.
    pub async fn disconnect(&self) -> Result<()> {
        if let Some(cancel) = self.inner.lock_cancel().take() {
            let _ = cancel.send(true);
        }
        if let Some(link) = self.inner.active.lock().await.take() {
            link.pump.abort();
            link.session.disconnect().await?;
        }
        Ok(())
    }

    /// Whether a live session exists right now
    pub async fn is_connected(&self) -> bool {
        self.inner.active.lock().await.is_some()
    }

    /// Snapshot of the projected device state
    pub async fn device_state(&self) -> DeviceState {
        self.inner.projection.lock().await.state().clone()
    }

    /// Send a user-initiated command
    ///
    /// # Errors
    ///
    /// [`PuckError::NotConnected`] without a session;
    /// [`PuckError::WriteFailed`] is surfaced (not swallowed) so the caller
    /// knows the action did not take effect.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        self.send_command_with_payload(command, &[]).await
    }

    /// Send a user-initiated command with a payload
    ///
    /// # Errors
    ///
    /// As [`send_command`](Self::send_command), plus
    /// [`PuckError::PayloadTooLarge`].
    pub async fn send_command_with_payload(&self, command: Command, payload: &[u8]) -> Result<()> {
        let guard = self.inner.active.lock().await;
        let link = guard.as_ref().ok_or(PuckError::NotConnected)?;
        link.session.send_with_payload(command, payload).await
    }

    /// Begin a workout session on the device
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn start_session(&self) -> Result<()> {
        info!("starting workout session");
        self.send_command(Command::StartSession).await
    }

    /// End the workout session on the device
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn end_session(&self) -> Result<()> {
        info!("ending workout session");
        self.send_command(Command::EndSession).await
    }

    /// Run the on-device calibration routine
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn calibrate(&self) -> Result<()> {
        info!("requesting calibration");
        self.send_command(Command::Calibrate).await
    }

    /// Reset the rep counter to zero
    ///
    /// The counter actually resets when the device acknowledges; the
    /// acknowledgment also tells the projection that a lower count is
    /// legitimate.
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn reset_reps(&self) -> Result<()> {
        info!("requesting rep counter reset");
        self.send_command(Command::ResetReps).await
    }

    /// Ask the device to report its current status
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn request_status(&self) -> Result<()> {
        self.send_command(Command::StatusRequest).await
    }

    /// Acknowledge an NFC-detected event and clear the flag
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn acknowledge_nfc(&self) -> Result<()> {
        self.send_command(Command::NfcAck).await?;
        self.inner.projection.lock().await.acknowledge_nfc();
        Ok(())
    }
}

impl Inner {
    // Boxed rather than an `async fn`: the link-loss path in `pump` spawns
    // this future again, and that recursion needs a nominal future type to
    // be well-formed.
    fn request(self: Arc<Self>, trigger: ConnectionTrigger) -> BoxFuture<'static, Result<()>> {
        async move {
            if trigger == ConnectionTrigger::AppForeground
                && (self.attempt_in_flight.load(Ordering::SeqCst)
                    || self.active.lock().await.is_some())
            {
                debug!("foreground trigger skipped: session exists or attempt in flight");
                return Ok(());
            }

            // Single uninterrupted check-and-set: at most one attempt
            // process-wide, and a duplicate is rejected rather than queued.
            if self.attempt_in_flight.swap(true, Ordering::SeqCst) {
                return Err(PuckError::AlreadyConnecting);
            }

            let result = Self::run_attempts(&self, &trigger).await;

            self.lock_cancel().take();
            self.attempt_in_flight.store(false, Ordering::SeqCst);

            if let Err(e) = &result {
                // Cancellation was asked for; only real failures fan out.
                if !matches!(e, PuckError::Cancelled) {
                    self.events.emit(PuckNotification::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
            result
        }
        .boxed()
    }

    async fn run_attempts(inner: &Arc<Self>, trigger: &ConnectionTrigger) -> Result<()> {
        // A new attempt fully tears down any prior session first.
        if let Some(link) = inner.active.lock().await.take() {
            link.pump.abort();
            link.session.disconnect().await.ok();
        }
        *inner.projection.lock().await = StateProjection::new();

        if let ConnectionTrigger::NfcTap { target } = trigger {
            info!(target = ?target, "connection requested by NFC tap");
        }
        let budget_ms = match trigger {
            ConnectionTrigger::NfcTap { .. } => inner.config.session.nfc_scan_timeout_ms,
            _ => inner.config.session.scan_timeout_ms,
        };

        // One cancel channel covers the whole retry loop, so a disconnect
        // issued between attempts (during backoff) still lands.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        *inner.lock_cancel() = Some(cancel_tx);
        let mut cancel = cancel_rx;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if *cancel.borrow() {
                return Err(PuckError::Cancelled);
            }

            match PuckSession::establish(
                inner.adapter.clone(),
                inner.selector.clone(),
                inner.profile,
                &inner.config.session,
                budget_ms,
                inner.events.clone(),
                cancel.clone(),
            )
            .await
            {
                Ok((session, link_rx)) => {
                    let session = Arc::new(session);
                    let pump = tokio::spawn(Self::pump(inner.clone(), session.clone(), link_rx));
                    *inner.active.lock().await = Some(ActiveLink { session, pump });
                    return Ok(());
                }
                Err(e) if e.triggers_retry() && attempt <= inner.config.max_retries => {
                    let exponential = inner
                        .config
                        .backoff_base_ms
                        .saturating_mul(1_u64 << (attempt - 1));
                    let delay_ms = exponential.min(inner.config.backoff_cap_ms);
                    warn!(
                        "connection attempt {attempt}/{} failed: {e}; retrying in {delay_ms}ms",
                        inner.config.max_retries + 1
                    );
                    tokio::select! {
                        () = sleep(Duration::from_millis(delay_ms)) => {}
                        () = cancelled(&mut cancel) => return Err(PuckError::Cancelled),
                    }
                }
                Err(e) => {
                    error!("connection attempt {attempt} failed terminally: {e}");
                    return Err(e);
                }
            }
        }
    }

    async fn pump(
        inner: Arc<Self>,
        session: Arc<PuckSession>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        while let Some(event) = link_rx.recv().await {
            match event {
                LinkEvent::Notification(bytes) => {
                    inner.handle_notification(&session, &bytes).await;
                }
                LinkEvent::Disconnected => {
                    warn!(device = %session.device_id(), "link lost");
                    // Surfaced immediately so the UI can show "reconnecting"
                    // while recovery runs in the background.
                    inner.events.emit(PuckNotification::LinkLost);
                    session.abandon().await;
                    inner.active.lock().await.take();

                    if inner.config.auto_reconnect {
                        // Link loss means the device is nearby and was just
                        // working, unlike an outright connect failure, so
                        // re-enter the scan path without waiting for the UI.
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.request(ConnectionTrigger::LinkLoss).await {
                                warn!("automatic reconnect failed: {e}");
                            }
                        });
                    }
                    return;
                }
            }
        }
    }

    async fn handle_notification(&self, session: &PuckSession, bytes: &[u8]) {
        let packet = match Packet::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(_) => {
                debug!("dropping empty notification");
                return;
            }
        };
        let event = match session.profile().classify(&packet) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping corrupt packet: {e}");
                return;
            }
        };

        let (delta, snapshot) = {
            let mut projection = self.projection.lock().await;
            let delta = projection.apply(&event);
            (delta, projection.state().clone())
        };

        if delta.nfc_detected {
            self.events.emit(PuckNotification::NfcDetected);
        }
        if delta.auto_connect {
            self.events.emit(PuckNotification::AutoConnectRequested);
        }
        if let Some(code) = delta.device_error {
            self.events.emit(PuckNotification::Error {
                kind: ErrorKind::DeviceReported,
                message: format!("device reported error code {code:#04X}"),
            });
        }
        if let Some(count) = delta.rep_changed {
            self.events.emit(PuckNotification::RepCount(count));
        }
        if let Some(active) = delta.session_transition {
            self.events.emit(PuckNotification::PhaseChanged(if active {
                ConnectionPhase::SessionActive
            } else {
                ConnectionPhase::SessionIdle
            }));
        }
        if delta.updated {
            self.events.emit(PuckNotification::StateUpdated(snapshot));
        }
    }

    fn lock_cancel(&self) -> MutexGuard<'_, Option<watch::Sender<bool>>> {
        self.attempt_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAdapter;

    fn connected_mock() -> Arc<MockAdapter> {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_observation(MockAdapter::puck_observation("p1", "TapFit Puck", -50));
        adapter
    }

    fn drain_phases(events: &mut mpsc::UnboundedReceiver<PuckNotification>) -> Vec<ConnectionPhase> {
        let mut phases = Vec::new();
        while let Ok(notification) = events.try_recv() {
            if let PuckNotification::PhaseChanged(phase) = notification {
                phases.push(phase);
            }
        }
        phases
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_phase_order() {
        let adapter = connected_mock();
        let manager = PuckManager::new(adapter.clone());
        let mut events = manager.subscribe();

        manager
            .request_connection(ConnectionTrigger::Manual)
            .await
            .unwrap();

        assert_eq!(
            drain_phases(&mut events),
            vec![
                ConnectionPhase::Scanning,
                ConnectionPhase::Connecting,
                ConnectionPhase::Subscribing,
                ConnectionPhase::Connected,
            ]
        );
        assert!(manager.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_rejected_while_first_pending() {
        let adapter = connected_mock();
        adapter.set_connect_delay_ms(50);
        let manager = PuckManager::new(adapter.clone());

        let (first, second) = tokio::join!(
            manager.request_connection(ConnectionTrigger::Manual),
            manager.request_connection(ConnectionTrigger::Manual),
        );

        assert!(first.is_ok());
        assert!(matches!(second, Err(PuckError::AlreadyConnecting)));
        assert_eq!(adapter.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_attempts_with_backoff_then_terminal_error() {
        let adapter = connected_mock();
        adapter.set_connect_failures(u32::MAX);
        let manager = PuckManager::new(adapter.clone());

        let started = tokio::time::Instant::now();
        let result = manager.request_connection(ConnectionTrigger::Manual).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(PuckError::ConnectFailed(_))));
        // 3 attempts, each containing the immediate in-attempt retry of the
        // raw connect call.
        assert_eq!(adapter.connect_calls(), 6);
        // Backoff of 1s then 2s between attempts, measured on virtual time.
        assert_eq!(elapsed.as_millis(), 3_000);

        // The guard resets: a later manual attempt starts fresh.
        adapter.set_connect_failures(0);
        assert!(manager
            .request_connection(ConnectionTrigger::Manual)
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_backoff_stops_retrying() {
        let adapter = connected_mock();
        adapter.set_connect_failures(u32::MAX);
        let manager = PuckManager::new(adapter.clone());

        let request = tokio::spawn(
            manager
                .inner
                .clone()
                .request(ConnectionTrigger::Manual),
        );

        // The first attempt fails immediately and enters its 1s backoff;
        // disconnect lands inside that window.
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.disconnect().await.unwrap();

        let result = request.await.unwrap();
        assert!(matches!(result, Err(PuckError::Cancelled)));

        // One attempt happened (raw call plus its immediate retry) and no
        // further attempt starts once the backoff would have elapsed.
        assert_eq!(adapter.connect_calls(), 2);
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(adapter.connect_calls(), 2);
        assert!(!manager.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_reconnects_without_ui_involvement() {
        let adapter = connected_mock();
        let manager = PuckManager::new(adapter.clone());
        let mut events = manager.subscribe();

        manager
            .request_connection(ConnectionTrigger::Manual)
            .await
            .unwrap();
        drain_phases(&mut events);
        assert_eq!(adapter.scan_starts(), 1);

        assert!(adapter.inject_disconnect());

        let mut seen = Vec::new();
        loop {
            let notification = events.recv().await.expect("bus closed");
            let connected = matches!(
                notification,
                PuckNotification::PhaseChanged(ConnectionPhase::Connected)
            );
            seen.push(notification);
            if connected {
                break;
            }
        }

        // LinkLost is surfaced before the fresh scan begins.
        assert!(matches!(seen.first(), Some(PuckNotification::LinkLost)));
        let scan_position = seen
            .iter()
            .position(|n| matches!(n, PuckNotification::PhaseChanged(ConnectionPhase::Scanning)))
            .expect("no rescan observed");
        assert!(scan_position >= 1);
        assert!(adapter.scan_starts() >= 2);
        assert!(manager.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_trigger_skipped_when_session_exists() {
        let adapter = connected_mock();
        let manager = PuckManager::new(adapter.clone());

        manager
            .request_connection(ConnectionTrigger::Manual)
            .await
            .unwrap();
        assert_eq!(adapter.connect_calls(), 1);

        manager
            .request_connection(ConnectionTrigger::AppForeground)
            .await
            .unwrap();
        assert_eq!(adapter.connect_calls(), 1);
        assert_eq!(adapter.scan_starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_unavailable_never_retries() {
        let adapter = connected_mock();
        adapter.set_powered(false);
        let manager = PuckManager::new(adapter.clone());

        let result = manager.request_connection(ConnectionTrigger::Manual).await;
        assert!(matches!(result, Err(PuckError::AdapterUnavailable(_))));
        assert_eq!(adapter.scan_starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nfc_trigger_connects_and_state_folds() {
        let adapter = connected_mock();
        let manager = PuckManager::new(adapter.clone());
        let mut events = manager.subscribe();

        manager
            .request_connection(ConnectionTrigger::NfcTap {
                target: Some("station-12".to_string()),
            })
            .await
            .unwrap();
        drain_phases(&mut events);

        let profile = ProtocolProfile::standard();
        assert!(adapter.inject_notification(&[profile.tags.rep_count, 4]));
        assert!(adapter.inject_notification(&[profile.tags.heartbeat, 90]));

        let mut rep = None;
        let mut battery = None;
        while rep.is_none() || battery.is_none() {
            match events.recv().await.expect("bus closed") {
                PuckNotification::RepCount(count) => rep = Some(count),
                PuckNotification::StateUpdated(state) => battery = Some(state.battery_level),
                _ => {}
            }
        }
        assert_eq!(rep, Some(4));
        assert_eq!(manager.device_state().await.rep_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_command_write_failure_is_surfaced() {
        let adapter = connected_mock();
        let manager = PuckManager::new(adapter.clone());

        manager
            .request_connection(ConnectionTrigger::Manual)
            .await
            .unwrap();
        // Setup performed two writes (handshake + status request); fail the
        // next one.
        adapter.set_fail_writes_after(2);

        let result = manager.start_session().await;
        assert!(matches!(result, Err(PuckError::WriteFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_without_session_report_not_connected() {
        let adapter = Arc::new(MockAdapter::new());
        let manager = PuckManager::new(adapter);
        assert!(matches!(
            manager.start_session().await,
            Err(PuckError::NotConnected)
        ));
        // Disconnecting while already disconnected is a no-op.
        assert!(manager.disconnect().await.is_ok());
    }
}
