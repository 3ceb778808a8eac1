use chrono::Utc;
use feed_relay::notify::{NotificationMessage, Notify, SlackNotifier, TeamsNotifier};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn message() -> NotificationMessage {
    NotificationMessage {
        category: "AWS blog".to_string(),
        title: "New instance family".to_string(),
        link: "https://example.com/post".to_string(),
        published_at: Utc::now(),
        body: Some("raw body".to_string()),
        summary: Some("Short summary.".to_string()),
        detail: Some("- detail".to_string()),
    }
}

#[tokio::test]
async fn slack_posts_the_expected_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(json!({
            "category": "AWS blog",
            "title": "New instance family",
            "link": "https://example.com/post",
            "text": "Short summary.",
            "summary": "Short summary.",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = SlackNotifier::new(format!("{}/hook", server.uri()), 5).unwrap();
    notifier.deliver(&message()).await.unwrap();
}

#[tokio::test]
async fn slack_makes_exactly_one_attempt_and_surfaces_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = SlackNotifier::new(format!("{}/hook", server.uri()), 5).unwrap();
    let err = notifier.deliver(&message()).await.unwrap_err();
    assert!(err.to_string().contains("delivery"), "error: {}", err);
}

#[tokio::test]
async fn slack_without_summary_sends_raw_body_as_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(json!({ "text": "raw body" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut msg = message();
    msg.summary = None;
    msg.detail = None;

    let notifier = SlackNotifier::new(format!("{}/hook", server.uri()), 5).unwrap();
    notifier.deliver(&msg).await.unwrap();
}

#[tokio::test]
async fn teams_posts_an_adaptive_card() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(json!({ "type": "message" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = TeamsNotifier::new(format!("{}/hook", server.uri()), 5).unwrap();
    notifier.deliver(&message()).await.unwrap();
}

#[tokio::test]
async fn teams_surfaces_http_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = TeamsNotifier::new(format!("{}/hook", server.uri()), 5).unwrap();
    assert!(notifier.deliver(&message()).await.is_err());
}
