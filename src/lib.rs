#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Pucklink
//!
//! Connection management core for the TapFit Puck, a BLE rep-counting
//! sensor worn during strength workouts. The library pairs a phone app
//! with exactly one Puck at a time and keeps that pairing healthy:
//! discovery and device selection, the connect/subscribe/handshake
//! pipeline, automatic retry with backoff, eager reconnection after link
//! loss, and a projected device state with a monotonic rep counter.
//!
//! All connection triggers (a tap on the UI, an NFC station tap, the app
//! returning to the foreground) funnel through one [`PuckManager`], which
//! enforces the single-session rule and publishes progress over a
//! non-blocking [`EventBus`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use pucklink::{ConnectionTrigger, PuckManager, PuckNotification, SystemAdapter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = Arc::new(SystemAdapter::new().await?);
//!     let manager = PuckManager::new(adapter);
//!     let mut events = manager.subscribe();
//!
//!     manager.request_connection(ConnectionTrigger::Manual).await?;
//!     manager.start_session().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let PuckNotification::RepCount(count) = event {
//!             println!("reps: {count}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

/// Transport abstraction and the btleplug-backed system adapter
pub mod adapter;
/// Error types and handling
pub mod error;
/// Connection manager, triggers, and notification fan-out
pub mod manager;
/// Packet framing, protocol profiles, and packet classification
pub mod protocol;
/// Scan filtering and candidate selection
pub mod selector;
/// Connection session pipeline and lifecycle
pub mod session;
/// Device state projection
pub mod state;
/// Scripted mock adapter for tests and host-side development
pub mod testing;

// Re-export the main types for convenient usage
pub use adapter::{BleAdapter, DeviceId, DeviceObservation, LinkEvent, SystemAdapter};
pub use error::{ErrorKind, PuckError, Result};
pub use manager::{ConnectionTrigger, EventBus, ManagerConfig, PuckManager, PuckNotification};
pub use protocol::{Command, InboundEvent, Packet, ProtocolProfile, RepCountWidth};
pub use selector::{CommitPolicy, DeviceSelector, SelectedCandidate, SelectorConfig};
pub use session::{ConnectionPhase, PuckSession, SessionConfig};
pub use state::{DeviceState, ProjectionDelta, StateProjection};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Puck BLE service UUID
///
/// Nordic UART Service derived, as on most hobby-class peripherals. The
/// service carries both characteristics below and is included in the
/// Puck's advertisement, so it doubles as a scan filter for devices that
/// advertise no name.
pub const PUCK_SERVICE_UUID: Uuid = Uuid::from_u128(0x8E40_0001_B5A3_F393_E0A9_E50E_24DC_CA9E);

/// Command characteristic UUID for app-to-device writes
pub const PUCK_COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x8E40_0002_B5A3_F393_E0A9_E50E_24DC_CA9E);

/// Event characteristic UUID for device-to-app notifications
pub const PUCK_EVENT_CHAR_UUID: Uuid = Uuid::from_u128(0x8E40_0003_B5A3_F393_E0A9_E50E_24DC_CA9E);

/// Advertised names accepted by the default selector configuration
pub const DEFAULT_DEVICE_NAMES: &[&str] = &["TapFit Puck", "TapFit-Puck", "Puck"];
