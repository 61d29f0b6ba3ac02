//! Outbound alerts. Sending never blocks the caller and never fails a sync.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tracing::{error, warn};

use crate::config::NotifyConfig;

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

pub trait Notifier: Send + Sync {
    fn notify(&self, topic: &str, message: &str);
}

fn format_alert(prefix: &str, topic: &str, message: &str) -> String {
    let prefix = prefix.trim();
    if prefix.is_empty() {
        format!("{topic}: {message}")
    } else {
        format!("{prefix} {topic}: {message}")
    }
}

/// Writes alerts to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier {
    prefix: String,
}

impl LogNotifier {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, topic: &str, message: &str) {
        error!(topic, alert = %format_alert(&self.prefix, topic, message), "alert");
    }
}

#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    http: reqwest::Client,
    base_url: String,
    token: String,
    chat_id: String,
    prefix: String,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: &str, prefix: &str) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: TELEGRAM_API_URL.to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
            prefix: prefix.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub async fn send(&self, text: &str) -> reqwest::Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        self.http
            .post(url)
            .json(&json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, topic: &str, message: &str) {
        let text = format_alert(&self.prefix, topic, message);
        error!(topic, alert = %text, "alert");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(topic, "no runtime available; alert not sent");
            return;
        };
        let sender = self.clone();
        runtime.spawn(async move {
            if let Err(err) = sender.send(&text).await {
                warn!(error = %err, "telegram alert failed");
            }
        });
    }
}

/// Keeps alerts in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    alerts: Mutex<Vec<(String, String)>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<(String, String)> {
        self.alerts
            .lock()
            .map(|alerts| alerts.clone())
            .unwrap_or_default()
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, topic: &str, message: &str) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push((topic.to_string(), message.to_string()));
        }
    }
}

/// Telegram when both token and chat id are configured, the log otherwise.
pub fn notifier_from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    match (&config.telegram_token, &config.telegram_chat_id) {
        (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => {
            match TelegramNotifier::new(token, chat, &config.prefix) {
                Ok(notifier) => Arc::new(notifier),
                Err(err) => {
                    warn!(error = %err, "telegram client unavailable; alerts go to the log");
                    Arc::new(LogNotifier::new(&config.prefix))
                }
            }
        }
        _ => Arc::new(LogNotifier::new(&config.prefix)),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn alert_text_carries_the_prefix() {
        assert_eq!(format_alert("[prod]", "sales", "boom"), "[prod] sales: boom");
        assert_eq!(format_alert("  ", "sales", "boom"), "sales: boom");
    }

    #[tokio::test]
    async fn telegram_posts_to_the_bot_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botsecret/sendMessage"))
            .and(body_partial_json(json!({ "chat_id": "42", "text": "hello" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new("secret", "42", "")
            .expect("client")
            .with_base_url(&server.uri());
        notifier.send("hello").await.expect("sent");
    }

    #[tokio::test]
    async fn telegram_rejection_is_an_error_for_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new("secret", "42", "")
            .expect("client")
            .with_base_url(&server.uri());
        assert!(notifier.send("hello").await.is_err());
    }

    #[test]
    fn missing_chat_id_falls_back_to_the_log() {
        let config = NotifyConfig {
            telegram_token: Some("secret".into()),
            telegram_chat_id: None,
            prefix: String::new(),
        };
        // Falls back without a runtime and without panicking.
        notifier_from_config(&config).notify("test", "message");
    }
}
