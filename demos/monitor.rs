//! Connect to the nearest Puck and print everything it reports.
//!
//! Run with: `cargo run --example monitor`

use std::sync::Arc;

use pucklink::{ConnectionTrigger, PuckManager, PuckNotification, SystemAdapter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let adapter = Arc::new(SystemAdapter::new().await?);
    let manager = PuckManager::new(adapter);
    let mut events = manager.subscribe();

    println!("Scanning for a TapFit Puck...");
    manager.request_connection(ConnectionTrigger::Manual).await?;
    println!("Connected. Press Ctrl-C to quit.");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PuckNotification::PhaseChanged(phase)) => println!("phase: {phase}"),
                Some(PuckNotification::RepCount(count)) => println!("reps: {count}"),
                Some(PuckNotification::StateUpdated(state)) => {
                    println!(
                        "state: battery {:.0}%, session {}",
                        state.battery_level * 100.0,
                        if state.session_active { "active" } else { "idle" }
                    );
                }
                Some(PuckNotification::NfcDetected) => {
                    println!("NFC tap reported by the device");
                    manager.acknowledge_nfc().await?;
                }
                Some(PuckNotification::AutoConnectRequested) => {
                    println!("device requested auto-connect");
                }
                Some(PuckNotification::LinkLost) => println!("link lost, reconnecting..."),
                Some(PuckNotification::Error { kind, message }) => {
                    eprintln!("error ({kind:?}): {message}");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("disconnecting");
                manager.disconnect().await?;
                break;
            }
        }
    }
    Ok(())
}
