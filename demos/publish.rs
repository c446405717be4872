//! Publish a few UPS readings and print each delivery outcome.
//!
//! Run with: cargo run --example publish
//!
//! Requires: an MQTT broker. `MQTT_HOST` (default `localhost`), `MQTT_PORT`,
//! `MQTT_USER` and `MQTT_PASSWORD` are read from the environment.

use std::time::Duration;

use mqtt_delivery::{DeliveryCorrelator, MqttConfig, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    env_logger::init();

    let host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string());
    let mut config = MqttConfig::with_broker(host).with_keep_alive_secs(20);

    if let Some(port) = std::env::var("MQTT_PORT").ok().and_then(|p| p.parse().ok()) {
        config = config.with_port(port);
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        let password = std::env::var("MQTT_PASSWORD").unwrap_or_default();
        config = config.with_credentials(user, password);
    }

    let correlator = DeliveryCorrelator::open(&config).await?;
    println!("connected to {}", config.url());

    // ---
    // Fire and forget with a handler
    for (topic, value) in [
        ("ups/ups0/status", "OL"),
        ("ups/ups0/battery.charge", "100"),
        ("ups/ups0/ups.load", "23"),
    ] {
        correlator
            .publish(topic, value, move |outcome| {
                println!("{topic} = {value}: {outcome} (code {})", outcome.reason_code());
            })
            .await;
    }

    // ---
    // Wait for one
    match correlator.publish_confirmed("ups/ups0/input.voltage", "231").await {
        Ok(()) => println!("ups/ups0/input.voltage = 231: delivered"),
        Err(err) => println!("ups/ups0/input.voltage = 231: {err}"),
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("{} publishes still pending", correlator.pending());

    correlator.close().await;
    Ok(())
}
