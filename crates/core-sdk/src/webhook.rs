//! Webhook Dispatcher (C12): renders a domain event per destination kind and
//! delivers it with retry/backoff. Grounded on `payments/boltz.rs`'s
//! async HTTP client shape and `chain_watcher.rs`'s backoff/attempt counting.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::domain::{EventKind, Webhook, WebhookEvent, WebhookKind, MAX_WEBHOOK_ATTEMPTS};
use crate::store_traits::WebhookStore;

const BACKOFFS: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];
const PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Render `event` into the wire body appropriate for `kind`.
pub fn render(kind: WebhookKind, event: &WebhookEvent) -> serde_json::Value {
    match kind {
        WebhookKind::Http => json!(event),
        WebhookKind::Slack => render_slack(event),
        WebhookKind::Discord => render_discord(event),
        WebhookKind::Email => render_email(event),
    }
}

fn headline(event: &WebhookEvent) -> String {
    match event.event {
        EventKind::RuleTriggered => format!(
            "Rule {} triggered on {}",
            event.data.rule_name.as_deref().unwrap_or("?"),
            event.data.market_id.as_deref().unwrap_or("?")
        ),
        EventKind::ExecutionStarted => "Execution started".to_string(),
        EventKind::ExecutionSucceeded => format!(
            "Execution succeeded: {}",
            event.data.tx_signature.as_deref().unwrap_or("?")
        ),
        EventKind::ExecutionFailed => format!(
            "Execution failed: {}",
            event.data.error.as_deref().unwrap_or("unknown error")
        ),
        EventKind::RulePaused => "Rule paused".to_string(),
        EventKind::WalletLowBalance => "Wallet balance low".to_string(),
    }
}

fn render_slack(event: &WebhookEvent) -> serde_json::Value {
    json!({
        "blocks": [{
            "type": "section",
            "text": { "type": "mrkdwn", "text": headline(event) }
        }]
    })
}

/// Discord embed colors, one per event kind (decimal RGB as Discord's API
/// expects). Green for success, red for failure, amber for a pause, blue for
/// routine progress.
fn discord_color(kind: EventKind) -> u32 {
    match kind {
        EventKind::RuleTriggered | EventKind::ExecutionStarted => 0x3B82F6,
        EventKind::ExecutionSucceeded => 0x22C55E,
        EventKind::ExecutionFailed => 0xEF4444,
        EventKind::RulePaused => 0xF59E0B,
        EventKind::WalletLowBalance => 0xF59E0B,
    }
}

fn render_discord(event: &WebhookEvent) -> serde_json::Value {
    json!({
        "embeds": [{
            "title": headline(event),
            "color": discord_color(event.event),
            "timestamp": event.timestamp.to_rfc3339(),
        }]
    })
}

fn render_email(event: &WebhookEvent) -> serde_json::Value {
    json!({
        "subject": headline(event),
        "body": format!("{:#?}", event.data),
    })
}

/// Result of one delivery attempt for a single webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Exhausted,
}

/// Deliver `event` to `webhook`, retrying up to `MAX_WEBHOOK_ATTEMPTS` times
/// with exponential backoff. `failure_count` is not reset on success by this
/// function — the caller (webhook store) owns that bookkeeping once it
/// learns the outcome, per the data model's `failure_count` field living on
/// the persisted row rather than in this stateless dispatcher.
pub async fn deliver(
    http: &reqwest::Client,
    webhook: &Webhook,
    event: &WebhookEvent,
) -> DeliveryOutcome {
    let body = render(webhook.kind, event);

    for attempt in 0..MAX_WEBHOOK_ATTEMPTS {
        let send = http
            .post(&webhook.destination)
            .timeout(PER_ATTEMPT_TIMEOUT)
            .json(&body)
            .send();

        match send.await {
            Ok(response) if response.status().is_success() => return DeliveryOutcome::Delivered,
            Ok(response) => {
                log::warn!(
                    "webhook: delivery to {} returned {} (attempt {}/{MAX_WEBHOOK_ATTEMPTS})",
                    webhook.id,
                    response.status(),
                    attempt + 1,
                );
            }
            Err(e) => {
                log::warn!(
                    "webhook: delivery to {} failed (attempt {}/{MAX_WEBHOOK_ATTEMPTS}): {e}",
                    webhook.id,
                    attempt + 1,
                );
            }
        }

        if attempt + 1 < MAX_WEBHOOK_ATTEMPTS {
            tokio::time::sleep(BACKOFFS[attempt as usize]).await;
        }
    }

    DeliveryOutcome::Exhausted
}

/// Fans an event out to every matching webhook without blocking the caller.
/// Grounded on `discovery/service.rs`'s `broadcast::Sender`-backed fan-out:
/// there the sender hands events to subscribers and moves on; here each
/// delivery is its own `tokio::spawn`'d task so a slow or unreachable
/// endpoint never holds up the coordinator step that raised the event.
pub struct WebhookDispatcher {
    http: reqwest::Client,
    store: Arc<dyn WebhookStore>,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn WebhookStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
        }
    }

    /// Look up webhooks registered for `event.user_id` matching `event.event`,
    /// and deliver to each on its own task. Returns immediately; delivery
    /// outcomes are recorded asynchronously via `WebhookStore::record_delivery`.
    pub fn notify(&self, event: WebhookEvent) {
        let http = self.http.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let webhooks = match store.matching(&event.user_id, event.event).await {
                Ok(webhooks) => webhooks,
                Err(e) => {
                    log::warn!("webhook: failed to look up webhooks for {}: {e}", event.user_id);
                    return;
                }
            };

            for webhook in webhooks {
                let http = http.clone();
                let store = store.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    let outcome = deliver(&http, &webhook, &event).await;
                    let success = outcome == DeliveryOutcome::Delivered;
                    if !success {
                        log::error!(
                            "webhook: delivery to {} exhausted all attempts for {:?}",
                            webhook.id,
                            event.event
                        );
                    }
                    if let Err(e) = store.record_delivery(&webhook.id, success).await {
                        log::warn!("webhook: failed to record delivery outcome for {}: {e}", webhook.id);
                    }
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WebhookEventData;
    use chrono::Utc;

    fn event(kind: EventKind) -> WebhookEvent {
        WebhookEvent {
            event: kind,
            user_id: "u1".into(),
            timestamp: Utc::now(),
            data: WebhookEventData {
                rule_name: Some("Exit on 70%".into()),
                market_id: Some("m1".into()),
                tx_signature: Some("sig1".into()),
                error: Some("route unavailable".into()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn slack_render_is_block_shaped() {
        let body = render(WebhookKind::Slack, &event(EventKind::RuleTriggered));
        assert!(body["blocks"][0]["text"]["text"]
            .as_str()
            .unwrap()
            .contains("Exit on 70%"));
    }

    #[test]
    fn discord_render_has_embeds() {
        let body = render(WebhookKind::Discord, &event(EventKind::ExecutionSucceeded));
        assert!(body["embeds"][0]["title"]
            .as_str()
            .unwrap()
            .contains("sig1"));
    }

    #[test]
    fn discord_color_differs_between_success_and_failure() {
        let succeeded = render(WebhookKind::Discord, &event(EventKind::ExecutionSucceeded));
        let failed = render(WebhookKind::Discord, &event(EventKind::ExecutionFailed));
        assert_ne!(succeeded["embeds"][0]["color"], failed["embeds"][0]["color"]);
    }

    #[test]
    fn email_render_has_subject_and_body() {
        let body = render(WebhookKind::Email, &event(EventKind::ExecutionFailed));
        assert!(body["subject"]
            .as_str()
            .unwrap()
            .contains("route unavailable"));
        assert!(body["body"].is_string());
    }

    #[test]
    fn http_render_is_raw_event_json() {
        let body = render(WebhookKind::Http, &event(EventKind::RulePaused));
        assert_eq!(body["event"], "RULE_PAUSED");
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_exhausts_against_unreachable_destination() {
        let http = reqwest::Client::new();
        let webhook = Webhook {
            id: "w1".into(),
            user_id: "u1".into(),
            kind: WebhookKind::Http,
            destination: "http://127.0.0.1:1/webhook".into(),
            event_mask: vec![EventKind::RuleTriggered],
            enabled: true,
            failure_count: 0,
            last_triggered_at: None,
        };
        let outcome = deliver(&http, &webhook, &event(EventKind::RuleTriggered)).await;
        assert_eq!(outcome, DeliveryOutcome::Exhausted);
    }
}
