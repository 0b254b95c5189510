use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::models::UserId;

/// Outbound reachability probe.
#[async_trait]
pub trait PingClient: Send + Sync {
    /// Validate a bot credential before any ping is sent.
    async fn check_credential(&self, token: &str) -> Result<(), PingFailure>;

    /// Send an invisible probe to `user_id` on behalf of the bot.
    async fn ping(&self, token: &str, user_id: UserId) -> Result<(), PingFailure>;
}

/// Structured failure of one Bot API call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PingFailure {
    #[error("Bot API error {error_code}: {description}")]
    Api {
        error_code: i64,
        description: String,
        retry_after: Option<u64>,
    },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl PingFailure {
    pub fn api(error_code: i64, description: impl Into<String>) -> Self {
        PingFailure::Api { error_code, description: description.into(), retry_after: None }
    }
}

/// Client for the Telegram Bot API.
pub struct TelegramClient {
    http: Client,
    api_base: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

impl TelegramClient {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, PingFailure> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PingFailure::Transport(e.to_string()))?;

        Ok(Self { http, api_base: api_base.trim_end_matches('/').to_string() })
    }

    fn method_url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, token, method)
    }

    async fn decode(response: reqwest::Response) -> Result<(), PingFailure> {
        let status = response.status();
        let body: ApiResponse = match response.json().await {
            Ok(body) => body,
            Err(e) if e.is_decode() => {
                return Err(PingFailure::api(
                    i64::from(status.as_u16()),
                    format!("unreadable response body ({status})"),
                ));
            }
            Err(e) => return Err(PingFailure::Transport(e.without_url().to_string())),
        };

        if body.ok {
            return Ok(());
        }

        Err(PingFailure::Api {
            error_code: body.error_code.unwrap_or_else(|| i64::from(status.as_u16())),
            description: body.description.unwrap_or_default(),
            retry_after: body.parameters.and_then(|p| p.retry_after),
        })
    }
}

#[async_trait]
impl PingClient for TelegramClient {
    async fn check_credential(&self, token: &str) -> Result<(), PingFailure> {
        let response = self
            .http
            .get(self.method_url(token, "getMe"))
            .send()
            .await
            .map_err(|e| PingFailure::Transport(e.without_url().to_string()))?;

        Self::decode(response).await
    }

    async fn ping(&self, token: &str, user_id: UserId) -> Result<(), PingFailure> {
        let chat_id = user_id.to_string();
        let response = self
            .http
            .post(self.method_url(token, "sendChatAction"))
            .form(&[("chat_id", chat_id.as_str()), ("action", "typing")])
            .send()
            .await
            .map_err(|e| PingFailure::Transport(e.without_url().to_string()))?;

        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_url_strips_trailing_slash() {
        let client = TelegramClient::new("http://localhost:8081/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.method_url("123:abc", "getMe"),
            "http://localhost:8081/bot123:abc/getMe"
        );
    }

    #[test]
    fn test_error_body_decodes_retry_after() {
        let body: ApiResponse = serde_json::from_str(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 3","parameters":{"retry_after":3}}"#,
        )
        .unwrap();
        assert!(!body.ok);
        assert_eq!(body.error_code, Some(429));
        assert_eq!(body.parameters.and_then(|p| p.retry_after), Some(3));
    }
}
