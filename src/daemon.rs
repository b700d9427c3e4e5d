use anyhow::{Context, Result};
use essbms_lib::battery::BatteryDriver;
use log::{error, info, warn};
use serde_json::json;
use std::time::{Duration, Instant};

use crate::{commandline, mqtt};

/// Flattens `value` into one `(topic, payload)` pair per leaf. Objects and arrays add a
/// topic level per key or index; null values are skipped.
fn simple_format_messages(base_topic: &str, value: &serde_json::Value) -> Vec<(String, String)> {
    fn collect(topic: &str, val: &serde_json::Value, messages: &mut Vec<(String, String)>) {
        let payload = match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    collect(&format!("{topic}/{k}"), v, messages);
                }
                return;
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    collect(&format!("{topic}/{i}"), v, messages);
                }
                return;
            }
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            // Do not publish null values
            serde_json::Value::Null => return,
        };
        messages.push((topic.to_string(), payload));
    }
    let mut messages = Vec::new();
    collect(base_topic, value, &mut messages);
    messages
}

fn publish_simple_format(
    publisher: &mut mqtt::MqttPublisher,
    base_topic: &str,
    value: &serde_json::Value,
) {
    for (topic, payload) in simple_format_messages(base_topic, value) {
        if let Err(e) = publisher.publish(&topic, &payload) {
            error!("Failed to publish message to topic {topic}: {e}");
        }
    }
}

fn effective_interval(requested: Duration, minimum: Option<Duration>) -> Duration {
    match minimum {
        Some(minimum) if minimum > requested => {
            warn!("Poll interval {requested:?} is too short, using {minimum:?}");
            minimum
        }
        _ => requested,
    }
}

/// Builds the document published per poll: the snapshot plus poll metadata.
fn snapshot_document<D: BatteryDriver>(bms: &D, valid: bool) -> Result<serde_json::Value> {
    let mut document = serde_json::Map::new();
    document.insert(
        "timestamp".to_string(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    document.insert("valid".to_string(), json!(valid));
    document.insert(
        "snapshot".to_string(),
        serde_json::to_value(bms.snapshot()).with_context(|| "Cannot serialize snapshot")?,
    );
    Ok(serde_json::Value::Object(document))
}

pub fn run<D: BatteryDriver>(
    mut bms: D,
    output: commandline::DaemonOutput,
    interval: Duration,
) -> Result<()> {
    let interval = effective_interval(interval, bms.min_poll_interval());
    info!(
        "Starting daemon mode: battery={}, output={output:?}, interval={interval:?}",
        bms.unique_identifier()
    );

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;

    if let commandline::DaemonOutput::Mqtt { config_file, .. } = &output {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}: {config:?}");
        let publisher =
            mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?;
        info!("MQTT Publisher created successfully.");
        mqtt_publisher = Some(publisher);
    }

    loop {
        let started = Instant::now();
        let valid = bms.refresh();
        if !valid {
            warn!("Incomplete poll, keeping the previous values of the failed blocks");
        }

        match snapshot_document(&bms, valid) {
            Ok(document) => match &output {
                commandline::DaemonOutput::Console => {
                    println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                    match serde_json::to_string_pretty(&document["snapshot"]) {
                        Ok(text) => println!("{text}"),
                        Err(e) => error!("Failed to format snapshot: {e}"),
                    }
                    println!("--------------------------");
                }
                commandline::DaemonOutput::Mqtt { format, .. } => {
                    if let Some(publisher) = mqtt_publisher.as_mut() {
                        match format {
                            commandline::MqttFormat::Json => {
                                let json_payload = document.to_string();
                                let topic = publisher.topic().to_string();
                                if let Err(e) = publisher.publish(&topic, &json_payload) {
                                    error!("Failed to publish data to MQTT: {e:?}");
                                } else {
                                    info!("Successfully published data to MQTT.");
                                }
                            }
                            commandline::MqttFormat::Simple => {
                                let base_topic = publisher.topic().to_string();
                                publish_simple_format(publisher, &base_topic, &document);
                            }
                        }
                    } else {
                        warn!(
                            "MQTT output selected, but publisher is not initialized. Skipping publish."
                        );
                    }
                }
            },
            Err(e) => error!("Failed to build snapshot document: {e}"),
        }

        if let Some(remaining) = interval.checked_sub(started.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
}
