//! Slack notification support via Incoming Webhooks.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::Notifier;

/// Structured Slack message for Block Kit rendering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlackMessage {
    pub header: String,
    pub fields: Vec<(String, String)>,
    pub context: String,
}

/// Slack webhook client.
pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    /// Create a new Slack notifier with the given webhook URL.
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Send a Block Kit message to Slack. Errors are logged but not propagated.
    pub async fn send(&self, source: &str, message: &SlackMessage) {
        let payload = build_blocks_payload(message);
        match self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) if !resp.status().is_success() => {
                warn!(
                    cluster = source,
                    status = %resp.status(),
                    "Slack webhook returned non-success status"
                );
            }
            Err(e) => {
                warn!(
                    cluster = source,
                    error = %e,
                    "Failed to send Slack notification"
                );
            }
            Ok(_) => {
                info!(
                    cluster = source,
                    header = message.header.as_str(),
                    "Slack notification sent"
                );
            }
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, source: &str, message: &SlackMessage) {
        self.send(source, message).await;
    }
}

/// Slack caps a section at ten fields.
const MAX_SECTION_FIELDS: usize = 10;

/// Block Kit payload: header, field sections, divider, context. `text` is
/// the fallback for clients that do not render blocks.
pub fn build_blocks_payload(message: &SlackMessage) -> Value {
    let header = json!({
        "type": "header",
        "text": { "type": "plain_text", "text": message.header, "emoji": true }
    });
    let fields: Vec<Value> = message
        .fields
        .iter()
        .map(|(label, value)| json!({ "type": "mrkdwn", "text": format!("*{label}*\n{value}") }))
        .collect();
    let sections = fields
        .chunks(MAX_SECTION_FIELDS)
        .map(|chunk| json!({ "type": "section", "fields": chunk }));
    let context = json!({
        "type": "context",
        "elements": [{ "type": "mrkdwn", "text": message.context }]
    });

    let blocks: Vec<Value> = std::iter::once(header)
        .chain(sections)
        .chain([json!({ "type": "divider" }), context])
        .collect();

    json!({
        "text": format!("{}\n{}", message.header, message.context),
        "blocks": blocks
    })
}
