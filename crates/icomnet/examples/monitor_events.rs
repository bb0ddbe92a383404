//! Connect to a radio and monitor the client event stream.
//!
//! Demonstrates the full connection bring-up (control handshake, login,
//! CI-V and audio sub-sessions) and prints every event as it arrives:
//! login result, status, capabilities, reassembled CI-V frames, received
//! audio, and the reconnect lifecycle.
//!
//! # Requirements
//!
//! - A network-capable Icom transceiver (e.g. IC-705) with its WLAN server
//!   enabled, reachable from this machine
//! - Host, username, and password adjusted below
//!
//! # Usage
//!
//! ```sh
//! cargo run -p icomnet --example monitor_events
//! ```

use std::time::Duration;

use icomnet::{ClientConfig, ClientEvent, WlanClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "icomnet=debug".into()),
        )
        .init();

    let config = ClientConfig::new("192.168.1.70", "icom", "icom");

    println!("Connecting to {}:{}...", config.host, config.control_port);
    let client = WlanClient::new(config).await?;
    let mut events = client.subscribe();

    client.connect().await?;
    println!("Connected. Monitoring for 60 seconds...\n");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => match event {
                ClientEvent::Login {
                    ok,
                    error_code,
                    connection,
                } => {
                    println!("Login             ok={ok} error={error_code} via {connection}");
                }
                ClientEvent::Status {
                    civ_port,
                    audio_port,
                    connected,
                    ..
                } => {
                    println!(
                        "Status            civ={civ_port} audio={audio_port} connected={connected}"
                    );
                }
                ClientEvent::Capabilities(caps) => {
                    println!(
                        "Capabilities      {} civ={:#04x} tx={}",
                        caps.rig_name, caps.civ_address, caps.supports_tx
                    );
                }
                ClientEvent::CivFrame(frame) => {
                    println!("CivFrame          {frame:02X?}");
                }
                ClientEvent::Civ(_) => {
                    // Raw CI-V payloads are noisy; the reassembled frames
                    // above are the interesting ones.
                }
                ClientEvent::Audio(payload) => {
                    println!("Audio             {} bytes", payload.len());
                }
                ClientEvent::Error(message) => {
                    println!("Error             {message}");
                }
                ClientEvent::Connected => println!("Connected"),
                ClientEvent::Disconnected => {
                    println!("Disconnected");
                    break;
                }
                ClientEvent::ConnectionLost { session, elapsed } => {
                    println!("ConnectionLost    {session} silent for {elapsed:?}");
                }
                ClientEvent::ConnectionRestored { downtime } => {
                    println!("ConnectionRestored after {downtime:?}");
                }
                ClientEvent::ReconnectAttempting { attempt, delay } => {
                    println!("Reconnecting      attempt {attempt} after {delay:?}");
                }
                ClientEvent::ReconnectFailed {
                    attempt,
                    error,
                    will_retry,
                    ..
                } => {
                    println!("ReconnectFailed   attempt {attempt}: {error} (retry={will_retry})");
                }
            },
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                println!("(missed {n} events due to lag)");
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
            Err(_) => break, // monitoring period elapsed
        }
    }

    client.disconnect(None, false).await?;
    println!("\nDone.");
    Ok(())
}
