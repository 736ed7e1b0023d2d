//! NFC-style connection flow: short scan window, then a full workout
//! session with a rep reset at the end.
//!
//! Run with: `cargo run --example tap_connect -- [station-id]`

use std::{sync::Arc, time::Duration};

use pucklink::{
    ConnectionTrigger, ManagerConfig, ProtocolProfile, PuckManager, PuckNotification,
    SelectorConfig, SystemAdapter,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let station = std::env::args().nth(1);
    let adapter = Arc::new(SystemAdapter::new().await?);
    let manager = PuckManager::with_settings(
        adapter,
        SelectorConfig::default(),
        ProtocolProfile::standard(),
        ManagerConfig::default(),
    );
    let mut events = manager.subscribe();

    println!("Simulating an NFC tap (station: {station:?})...");
    manager
        .request_connection(ConnectionTrigger::NfcTap { target: station })
        .await?;

    manager.start_session().await?;
    println!("Session started; counting reps for 30 seconds.");

    let window = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(window);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PuckNotification::RepCount(count)) => println!("reps: {count}"),
                Some(PuckNotification::LinkLost) => println!("link lost, reconnecting..."),
                Some(PuckNotification::Error { kind, message }) => {
                    eprintln!("error ({kind:?}): {message}");
                }
                Some(_) => {}
                None => break,
            },
            () = &mut window => break,
        }
    }

    println!(
        "Final state: {} reps",
        manager.device_state().await.rep_count
    );
    manager.reset_reps().await?;
    manager.end_session().await?;
    manager.disconnect().await?;
    Ok(())
}
