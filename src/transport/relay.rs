use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{DeliveryReceipt, MailTransport, SendError};
use crate::error::Result;
use crate::models::delivery_job::OutboundMessage;
use crate::utils::time::Clock;

/// Posts rendered messages as JSON to a mail relay (an internal gateway in front
/// of SMTP or a provider API).
pub struct HttpRelayTransport {
    client: Client,
    url: String,
    secret: Option<String>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    #[serde(alias = "messageId", alias = "id")]
    message_id: Option<String>,
}

impl HttpRelayTransport {
    pub fn new(url: String, secret: Option<String>, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            url,
            secret,
            clock,
        })
    }
}

#[async_trait]
impl MailTransport for HttpRelayTransport {
    fn name(&self) -> &'static str {
        "relay"
    }

    async fn send(&self, message: &OutboundMessage) -> std::result::Result<DeliveryReceipt, SendError> {
        let mut request = self.client.post(&self.url).json(message);
        if let Some(secret) = &self.secret {
            request = request.header("X-Relay-Secret", secret);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SendError::Transient(format!("relay unreachable: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            let message_id = serde_json::from_str::<RelayResponse>(&body)
                .ok()
                .and_then(|r| r.message_id);
            return Ok(DeliveryReceipt {
                provider: self.name().to_string(),
                message_id,
                accepted_at: self.clock.now(),
            });
        }

        let detail = format!("relay returned {}: {}", status, body);
        if is_transient_status(status) {
            Err(SendError::Transient(detail))
        } else {
            Err(SendError::Permanent(detail))
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::UNPROCESSABLE_ENTITY));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }
}
