//! `gestura monitor` – print every snapshot published on the broker topic.

use std::time::Duration;

use colored::Colorize;
use gestura_middleware::{BrokerConfig, mqtt_options};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Packet, QoS};
use serde_json::Value;
use tracing::debug;

const RULE: &str = "--------------------------------------------------";

/// Subscribe to `config.topic` and print messages until the broker session
/// fails for good or the task is cancelled.
pub async fn run(config: &BrokerConfig) -> Result<(), String> {
    let client_id = format!("{}-monitor", config.session_client_id());
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config, &client_id), 16);

    println!("  Connecting to {}:{} …", config.host.bold(), config.port);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    return Err(format!("broker refused connection: {:?}", ack.code));
                }
                println!("  {} Connected, subscribing to {}", "✓".green().bold(), config.topic.bold());
                client
                    .subscribe(config.topic.clone(), QoS::AtLeastOnce)
                    .await
                    .map_err(|e| format!("subscribe failed: {e}"))?;
                println!("  Waiting for messages… (Ctrl-C to exit)");
                println!("{}", RULE.dimmed());
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                println!("{}", render(&publish.payload));
                println!("{}", RULE.dimmed());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                println!("  {}", "Disconnected by broker".yellow());
            }
            Ok(_) => {}
            Err(e) => {
                println!("  {} {}", "connection error:".red(), e);
                debug!(error = %e, "monitor retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Human-readable form of a published payload.
pub(crate) fn render(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    let Ok(value) = serde_json::from_str::<Value>(&text) else {
        return format!("Raw message: {text}");
    };

    let field = |v: &Value, key: &str| -> String {
        match v.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "N/A".to_string(),
        }
    };

    let mut lines = vec![
        "Received robot state:".to_string(),
        format!("   Stopped: {}", field(&value, "stopped")),
    ];
    if let Some(hand) = value.get("hand") {
        if let Some(right) = hand.get("right") {
            lines.push(format!(
                "   Right hand: {} (active: {})",
                field(right, "horizontal"),
                field(right, "active")
            ));
        }
        if let Some(left) = hand.get("left") {
            lines.push(format!(
                "   Left hand: H:{} V:{} (active: {})",
                field(left, "horizontal"),
                field(left, "vertical"),
                field(left, "active")
            ));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_full_snapshot() {
        let payload = serde_json::to_vec(&gestura_types::RobotState::default()).unwrap();
        let out = render(&payload);
        assert!(out.contains("Stopped: false"));
        assert!(out.contains("Right hand: not active (active: true)"));
        assert!(out.contains("Left hand: H:not active V:not active"));
    }

    #[test]
    fn missing_fields_show_na() {
        let out = render(br#"{"hand":{"right":{}}}"#);
        assert!(out.contains("Stopped: N/A"));
        assert!(out.contains("Right hand: N/A (active: N/A)"));
        assert!(!out.contains("Left hand"));
    }

    #[test]
    fn non_json_is_printed_raw() {
        assert_eq!(render(b"hello"), "Raw message: hello");
    }
}
