//! Read the operating frequency with a raw CI-V frame.
//!
//! The core transports CI-V frames without interpreting them; this example
//! sends the read-frequency command (0x03) and prints the BCD-encoded
//! answer frame. Decoding BCD frequencies is the command layer's job and is
//! deliberately not done here.
//!
//! # Usage
//!
//! ```sh
//! cargo run -p icomnet --example read_frequency
//! ```

use std::time::Duration;

use icomnet::{ClientConfig, ClientEvent, WlanClient};

/// Controller CI-V bus address.
const CONTROLLER_ADDR: u8 = 0xE0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "icomnet=info".into()),
        )
        .init();

    let config = ClientConfig::new("192.168.1.70", "icom", "icom");
    let client = WlanClient::new(config).await?;
    let mut events = client.subscribe();

    client.connect().await?;

    // The capability packet tells us the radio's CI-V address; fall back to
    // the IC-705 default if it has not arrived yet.
    let civ_address = client
        .capabilities()
        .await
        .map(|caps| caps.civ_address)
        .unwrap_or(0xA4);

    let read_frequency = [0xFE, 0xFE, civ_address, CONTROLLER_ADDR, 0x03, 0xFD];
    println!("Sending {read_frequency:02X?}");
    client.send_civ(&read_frequency).await?;

    let answer = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(ClientEvent::CivFrame(frame)) = events.recv().await {
                // Answers are addressed to us; frame[2] is the destination.
                if frame.len() > 4 && frame[2] == CONTROLLER_ADDR && frame[4] == 0x03 {
                    return frame;
                }
            }
        }
    })
    .await?;

    println!("Answer: {answer:02X?}");
    println!("(data bytes are BCD, least-significant digit pair first)");

    client.disconnect(None, false).await?;
    Ok(())
}
