use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const TEST_MESSAGE_TEXT: &str =
    "Test message: your account is linked to this bot and notifications will arrive here.";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("telegram request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram rejected the message ({status}): {description}")]
    Rejected { status: u16, description: String },
}

#[derive(Deserialize)]
struct BotApiReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Sends messages through the Telegram Bot API.
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    token: Secret<String>,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, token: &str) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: Secret::new(token.to_string()),
        })
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base,
            self.token.expose_secret()
        );
        let response = self
            .client
            .post(url)
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await?;

        let status = response.status();
        let reply: Option<BotApiReply> = response.json().await.ok();
        match reply {
            Some(reply) if status.is_success() && reply.ok => Ok(()),
            reply => Err(NotifyError::Rejected {
                status: status.as_u16(),
                description: reply
                    .and_then(|reply| reply.description)
                    .unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }

    pub async fn send_test_message(&self, chat_id: i64) -> Result<(), NotifyError> {
        self.send_message(chat_id, TEST_MESSAGE_TEXT).await?;
        info!(chat_id, "test message delivered");
        Ok(())
    }

    /// Fires the test message on a background task. Failures are logged and
    /// never reach the caller.
    pub fn spawn_test_message(self: &std::sync::Arc<Self>, chat_id: i64) {
        let notifier = self.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send_test_message(chat_id).await {
                warn!(chat_id, error = %e, "test message not delivered");
            }
        });
    }
}
