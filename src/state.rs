use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::protocol::InboundEvent;

/// Projected snapshot of the connected Puck
///
/// Created empty when a session is established and discarded with it.
/// Callers that want values to survive a reconnect must cache them
/// themselves; that is a UI policy, not a core one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceState {
    /// Reps counted this session; only grows, except across an explicit reset
    pub rep_count: u32,
    /// Whether the device reports itself calibrated
    pub is_calibrated: bool,
    /// Whether a workout session is running on the device
    pub session_active: bool,
    /// Battery level as a fraction, 0.0-1.0
    pub battery_level: f32,
    /// When the last heartbeat arrived
    pub last_heartbeat_at: Option<SystemTime>,
    /// Edge-triggered NFC flag; cleared on acknowledgment
    pub nfc_detected: bool,
}

/// What one folded packet changed
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProjectionDelta {
    /// The snapshot changed and should be re-emitted
    pub updated: bool,
    /// The rep count changed to this value
    ///
    /// Separate from `updated` so UI collaborators get a cheap per-rep
    /// signal (sound, haptic) without diffing full snapshots.
    pub rep_changed: Option<u32>,
    /// Session went active (`true`) or idle (`false`)
    pub session_transition: Option<bool>,
    /// An NFC tap was just reported
    pub nfc_detected: bool,
    /// The device asked to be treated as a connection trigger
    pub auto_connect: bool,
    /// The device reported this error code
    pub device_error: Option<u8>,
}

/// Folds classified packets into a [`DeviceState`]
///
/// Guards rep count monotonicity: BLE notification delivery is not strictly
/// ordered across retransmissions on some stacks, so a count lower than the
/// current one is discarded as stale unless a reset acknowledgment armed
/// acceptance of it.
#[derive(Debug, Default)]
pub struct StateProjection {
    state: DeviceState,
    reset_armed: bool,
}

impl StateProjection {
    /// Fresh projection for a new session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot
    #[must_use]
    pub const fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Clear the edge-triggered NFC flag after the app acknowledged it
    pub fn acknowledge_nfc(&mut self) {
        self.state.nfc_detected = false;
    }

    /// Fold one classified packet into the snapshot
    pub fn apply(&mut self, event: &InboundEvent) -> ProjectionDelta {
        let mut delta = ProjectionDelta::default();

        match event {
            InboundEvent::RepCount(count) => {
                let accepted = self.reset_armed || *count >= self.state.rep_count;
                if !accepted {
                    debug!(
                        current = self.state.rep_count,
                        stale = count,
                        "discarding stale rep count"
                    );
                    return delta;
                }
                self.reset_armed = false;
                if *count != self.state.rep_count {
                    self.state.rep_count = *count;
                    delta.rep_changed = Some(*count);
                    delta.updated = true;
                }
            }
            InboundEvent::Handshake {
                firmware_revision,
                calibrated,
            } => {
                debug!(firmware = firmware_revision, "handshake response");
                self.state.is_calibrated = *calibrated;
                delta.updated = true;
            }
            InboundEvent::SessionStatus { active } => {
                if *active != self.state.session_active {
                    delta.session_transition = Some(*active);
                }
                self.state.session_active = *active;
                delta.updated = true;
            }
            InboundEvent::Heartbeat { battery_level } => {
                self.state.battery_level = *battery_level;
                self.state.last_heartbeat_at = Some(SystemTime::now());
                delta.updated = true;
            }
            InboundEvent::DeviceError { code } => {
                warn!(code, "device reported an error");
                delta.device_error = Some(*code);
            }
            InboundEvent::NfcDetected => {
                self.state.nfc_detected = true;
                delta.nfc_detected = true;
                delta.updated = true;
            }
            InboundEvent::AutoConnect => {
                delta.auto_connect = true;
            }
            InboundEvent::NfcAck => {
                self.state.nfc_detected = false;
                delta.updated = true;
            }
            InboundEvent::RepReset => {
                // The next count may legitimately be lower, including zero.
                self.reset_armed = true;
                if self.state.rep_count != 0 {
                    self.state.rep_count = 0;
                    delta.rep_changed = Some(0);
                    delta.updated = true;
                }
            }
            InboundEvent::Unknown { tag, .. } => {
                debug!(tag, "ignoring unknown packet tag");
            }
        }

        delta
    }
}
