//! Simple table client example
//!
//! Run with: cargo run --example simple_client [SERVER_ADDR]
//!
//! Subscribes to every non-metadata topic, publishes `/client/counter` once
//! a second and prints whatever the server sends back.

use std::time::Duration;

use nettables::protocol::Message;
use nettables::{ClientConfig, Properties, SubscriberOptions, TableClient, ValueType};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nettables=info".parse()?),
        )
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "localhost".to_string());
    let config = ClientConfig::new(addr).name("simple_client");

    let mut client = TableClient::connect(config).await?;
    println!("Connected as client {} (version {:#06x})", client.client_id(), client.version());

    client
        .subscribe(&[""], SubscriberOptions::default().prefix_match(true))
        .await?;
    let counter = client
        .publish("/client/counter", ValueType::Int, &Properties::new())
        .await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut count: i64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                count += 1;
                client.set_value(counter, count, 0).await?;
            }
            message = client.recv() => match message? {
                Message::Announce { name, id, value_type, .. } => {
                    println!("+ {} (id {}, {})", name, id, value_type.name());
                }
                Message::Unannounce { name, .. } => println!("- {}", name),
                Message::Value { id, timestamp, value } => {
                    let name = client.topic(id).map(|t| t.name.as_str()).unwrap_or("?");
                    println!("  {} = {:?} @ {}", name, value, timestamp);
                }
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close().await?;
    Ok(())
}
