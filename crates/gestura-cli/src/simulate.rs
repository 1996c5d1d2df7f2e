//! `gestura simulate` – play a scripted gesture session against a relay.
//!
//! Each step is posted to `POST /api/robot-status` exactly as a headset
//! producer would send it, so dashboards and the broker see a realistic
//! sequence of partial updates.

use std::time::Duration;

use colored::Colorize;
use serde_json::{Value, json};

/// The scripted cycle: both hands sweep, then the operator stops and resumes.
pub(crate) fn poses() -> Vec<Value> {
    vec![
        json!({ "stopped": false }),
        json!({ "hand": { "right": { "horizontal": "right", "active": true } } }),
        json!({ "hand": { "right": { "horizontal": "left" } } }),
        json!({ "hand": { "left": { "horizontal": "left", "vertical": "up", "active": true } } }),
        json!({ "hand": { "left": { "vertical": "down" } } }),
        // Older producers send the bare direction.
        json!({ "hand": { "right": "right" } }),
        json!({ "hand": { "right": { "active": false }, "left": { "active": false } } }),
        json!({ "stopped": true }),
    ]
}

/// Endpoint for `base`, tolerating a trailing slash.
pub(crate) fn status_url(base: &str) -> String {
    format!("{}/api/robot-status", base.trim_end_matches('/'))
}

/// Post `count` steps (`0` loops forever), pausing `interval` between them.
pub async fn run(base_url: &str, interval: Duration, count: usize) -> Result<(), String> {
    let url = status_url(base_url);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

    println!("  Sending gestures to {}", url.bold());

    let script = poses();
    let steps = script.iter().cycle().enumerate();
    for (n, pose) in steps {
        if count != 0 && n >= count {
            break;
        }
        let response = client
            .post(&url)
            .json(pose)
            .send()
            .await
            .map_err(|e| format!("Relay unreachable at {}: {}", url, e))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            println!("  {} #{:<3} {} → {}", "↑".green(), n + 1, pose, body.trim().dimmed());
        } else {
            println!("  {} #{:<3} {} → HTTP {} {}", "✗".red(), n + 1, pose, status.as_u16(), body.trim());
        }

        tokio::time::sleep(interval).await;
    }
    Ok(())
}
