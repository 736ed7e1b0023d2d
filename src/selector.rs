use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    adapter::{DeviceId, DeviceObservation},
    DEFAULT_DEVICE_NAMES, PUCK_SERVICE_UUID,
};

/// When the selector stops scanning and commits to a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitPolicy {
    /// Commit on the first accepted observation
    ///
    /// Minimizes time-to-connect, which matters for NFC-triggered flows
    /// where the user is standing next to exactly one device. Default.
    FirstMatch,
    /// Wait out the scan window and commit to the strongest signal seen
    StrongestSignal,
}

/// Filter and commit policy for device discovery
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Advertised names accepted by exact or substring match, case sensitive
    pub allowed_names: Vec<String>,
    /// Service UUID that also qualifies a device regardless of name
    pub service_uuid: Uuid,
    /// Observations weaker than this RSSI are rejected outright
    pub rssi_floor: i16,
    /// Commit policy
    pub policy: CommitPolicy,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            allowed_names: DEFAULT_DEVICE_NAMES
                .iter()
                .map(|&name| name.to_string())
                .collect(),
            service_uuid: PUCK_SERVICE_UUID,
            rssi_floor: -85,
            policy: CommitPolicy::FirstMatch,
        }
    }
}

/// The one device a scan settled on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedCandidate {
    /// Identifier to connect with
    pub device_id: DeviceId,
    /// Advertised name at selection time
    pub advertised_name: Option<String>,
    /// Signal strength at selection time
    pub signal_strength: i16,
}

/// Folds scan observations into at most one candidate
///
/// Feed observations with [`observe`](Self::observe) during the scan window;
/// a `Some` return means "stop scanning and connect now". When the window
/// elapses first, [`best`](Self::best) yields the strongest accepted
/// candidate seen at any point, or `None` for a failed scan.
#[derive(Debug)]
pub struct DeviceSelector {
    config: SelectorConfig,
    best: Option<SelectedCandidate>,
}

impl DeviceSelector {
    /// Create a selector for one scan window
    #[must_use]
    pub const fn new(config: SelectorConfig) -> Self {
        Self { config, best: None }
    }

    /// Whether an observation passes the filter policy
    #[must_use]
    pub fn accepts(&self, observation: &DeviceObservation) -> bool {
        if observation.signal_strength < self.config.rssi_floor {
            return false;
        }

        let name_match = observation.advertised_name.as_ref().is_some_and(|name| {
            self.config
                .allowed_names
                .iter()
                .any(|allowed| name == allowed || name.contains(allowed.as_str()))
        });
        let service_match = observation
            .advertised_services
            .contains(&self.config.service_uuid);

        name_match || service_match
    }

    /// Fold in one observation; `Some` means commit immediately
    pub fn observe(&mut self, observation: &DeviceObservation) -> Option<SelectedCandidate> {
        if !self.accepts(observation) {
            debug!(
                device = %observation.device_id,
                rssi = observation.signal_strength,
                "observation rejected by filter"
            );
            return None;
        }

        let candidate = SelectedCandidate {
            device_id: observation.device_id.clone(),
            advertised_name: observation.advertised_name.clone(),
            signal_strength: observation.signal_strength,
        };

        let stronger = self
            .best
            .as_ref()
            .is_none_or(|best| candidate.signal_strength > best.signal_strength);
        if stronger {
            self.best = Some(candidate.clone());
        }

        match self.config.policy {
            CommitPolicy::FirstMatch => Some(candidate),
            CommitPolicy::StrongestSignal => None,
        }
    }

    /// Strongest accepted candidate seen so far, for the timeout path
    #[must_use]
    pub const fn best(&self) -> Option<&SelectedCandidate> {
        self.best.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(id: &str, name: &str, rssi: i16) -> DeviceObservation {
        DeviceObservation {
            device_id: DeviceId::new(id),
            advertised_name: Some(name.to_string()),
            signal_strength: rssi,
            advertised_services: Vec::new(),
        }
    }

    fn strongest_config() -> SelectorConfig {
        SelectorConfig {
            policy: CommitPolicy::StrongestSignal,
            ..SelectorConfig::default()
        }
    }

    #[test]
    fn test_strongest_signal_wins_regardless_of_arrival_order() {
        let mut selector = DeviceSelector::new(strongest_config());
        for (i, rssi) in [-90, -70, -95, -60].into_iter().enumerate() {
            let committed = selector.observe(&obs(&format!("d{i}"), "TapFit Puck", rssi));
            assert!(committed.is_none());
        }
        // A weaker device arriving after the -60 one must not displace it.
        assert!(selector.observe(&obs("late", "TapFit Puck", -80)).is_none());

        let best = selector.best().unwrap();
        assert_eq!(best.signal_strength, -60);
        assert_eq!(best.device_id, DeviceId::new("d3"));
    }

    #[test]
    fn test_first_match_commits_immediately() {
        let mut selector = DeviceSelector::new(SelectorConfig::default());
        let committed = selector.observe(&obs("d0", "TapFit Puck", -50));
        assert_eq!(committed.unwrap().device_id, DeviceId::new("d0"));
    }

    #[test]
    fn test_rssi_floor_rejects_even_without_alternatives() {
        let mut selector = DeviceSelector::new(strongest_config());
        assert!(selector.observe(&obs("weak", "TapFit Puck", -90)).is_none());
        assert!(selector.best().is_none());
    }

    #[test]
    fn test_name_substring_and_multiple_names() {
        let selector = DeviceSelector::new(SelectorConfig::default());
        assert!(selector.accepts(&obs("a", "TapFit Puck v2", -50)));
        assert!(selector.accepts(&obs("b", "Puck", -50)));
        // Case sensitive, as observed in the field.
        assert!(!selector.accepts(&obs("c", "tapfit puck", -50)));
    }

    #[test]
    fn test_service_uuid_qualifies_unnamed_device() {
        let selector = DeviceSelector::new(SelectorConfig::default());
        let observation = DeviceObservation {
            device_id: DeviceId::new("anon"),
            advertised_name: None,
            signal_strength: -55,
            advertised_services: vec![PUCK_SERVICE_UUID],
        };
        assert!(selector.accepts(&observation));
    }
}
