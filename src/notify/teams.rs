use super::{NotificationMessage, Notify};
use crate::types::{RelayError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Microsoft Teams incoming-webhook channel, posting an Adaptive Card with
/// the summary up front and the detail behind a see-more toggle.
pub struct TeamsNotifier {
    webhook_url: String,
    client: Client,
}

impl TeamsNotifier {
    pub fn new(webhook_url: String, timeout_seconds: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| RelayError::Delivery {
                destination: "teams".to_string(),
                reason: format!("failed to build client: {}", e),
            })?;

        Ok(Self {
            webhook_url,
            client,
        })
    }
}

#[async_trait]
impl Notify for TeamsNotifier {
    async fn deliver(&self, message: &NotificationMessage) -> Result<()> {
        let card = build_card(message);

        self.client
            .post(&self.webhook_url)
            .json(&card)
            .send()
            .await
            .map_err(|e| RelayError::Delivery {
                destination: "teams".to_string(),
                reason: e.to_string(),
            })?
            .error_for_status()
            .map_err(|e| RelayError::Delivery {
                destination: "teams".to_string(),
                reason: e.to_string(),
            })?;

        debug!("delivered to teams: {}", message.title);
        Ok(())
    }
}

fn build_card(message: &NotificationMessage) -> Value {
    // Teams renders the card body more compactly when ideographic full
    // stops are followed by a carriage return instead of a newline.
    let detail = message
        .detail
        .as_deref()
        .unwrap_or("")
        .replace("\u{3002}\n", "\u{3002}\r");

    json!({
        "type": "message",
        "attachments": [
            {
                "contentType": "application/vnd.microsoft.card.adaptive",
                "content": {
                    "type": "AdaptiveCard",
                    "version": "1.3",
                    "body": [
                        {
                            "type": "ColumnSet",
                            "columns": [
                                {
                                    "type": "Column",
                                    "width": "auto",
                                    "items": [
                                        {
                                            "type": "Container",
                                            "id": "collapsedItems",
                                            "items": [
                                                {
                                                    "type": "TextBlock",
                                                    "text": format!("**{}**", message.title),
                                                },
                                                {
                                                    "type": "TextBlock",
                                                    "wrap": true,
                                                    "text": message.display_text(),
                                                },
                                            ],
                                        },
                                        {
                                            "type": "Container",
                                            "id": "expandedItems",
                                            "isVisible": false,
                                            "items": [
                                                {
                                                    "type": "TextBlock",
                                                    "wrap": true,
                                                    "text": detail,
                                                }
                                            ],
                                        },
                                    ],
                                }
                            ],
                        },
                        {
                            "type": "Container",
                            "items": [
                                {
                                    "type": "ColumnSet",
                                    "columns": [
                                        {
                                            "type": "Column",
                                            "width": "stretch",
                                            "items": [
                                                {
                                                    "type": "TextBlock",
                                                    "text": "see less",
                                                    "id": "collapse",
                                                    "isVisible": false,
                                                    "wrap": true,
                                                    "color": "Accent",
                                                },
                                                {
                                                    "type": "TextBlock",
                                                    "text": "see more",
                                                    "id": "expand",
                                                    "wrap": true,
                                                    "color": "Accent",
                                                },
                                            ],
                                        }
                                    ],
                                    "selectAction": {
                                        "type": "Action.ToggleVisibility",
                                        "targetElements": [
                                            "collapse",
                                            "expand",
                                            "expandedItems",
                                        ],
                                    },
                                }
                            ],
                        },
                    ],
                    "actions": [
                        {
                            "type": "Action.OpenUrl",
                            "title": "Open Link",
                            "wrap": true,
                            "url": message.link,
                        }
                    ],
                    "msteams": {"width": "Full"},
                    "$schema": "http://adaptivecards.io/schemas/adaptive-card.json",
                },
            }
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message() -> NotificationMessage {
        NotificationMessage {
            category: "AWS blog".to_string(),
            title: "New instance family".to_string(),
            link: "https://example.com/post".to_string(),
            published_at: Utc::now(),
            body: Some("raw body".to_string()),
            summary: Some("Short summary.".to_string()),
            detail: Some("- point one\u{3002}\n- point two".to_string()),
        }
    }

    #[test]
    fn card_carries_title_summary_and_link() {
        let card = build_card(&message());

        let content = &card["attachments"][0]["content"];
        assert_eq!(
            card["attachments"][0]["contentType"],
            "application/vnd.microsoft.card.adaptive"
        );
        assert_eq!(content["type"], "AdaptiveCard");
        assert_eq!(content["actions"][0]["url"], "https://example.com/post");

        let collapsed = &content["body"][0]["columns"][0]["items"][0]["items"];
        assert_eq!(collapsed[0]["text"], "**New instance family**");
        assert_eq!(collapsed[1]["text"], "Short summary.");
    }

    #[test]
    fn detail_newlines_adjusted_for_teams() {
        let card = build_card(&message());
        let detail = card["attachments"][0]["content"]["body"][0]["columns"][0]["items"][1]
            ["items"][0]["text"]
            .as_str()
            .unwrap();
        assert!(detail.contains("\u{3002}\r"));
        assert!(!detail.contains("\u{3002}\n"));
    }

    #[test]
    fn falls_back_to_body_without_summary() {
        let mut msg = message();
        msg.summary = None;
        msg.detail = None;
        let card = build_card(&msg);
        let shown = &card["attachments"][0]["content"]["body"][0]["columns"][0]["items"][0]
            ["items"][1]["text"];
        assert_eq!(shown, "raw body");
    }
}
