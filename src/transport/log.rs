use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::{DeliveryReceipt, MailTransport, SendError};
use crate::models::delivery_job::OutboundMessage;
use crate::utils::ids::{IdGenerator, UuidGenerator};
use crate::utils::time::{Clock, SystemClock};

/// Accepts every message, logs it, and keeps it for inspection. Nothing leaves the process.
pub struct LogTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl LogTransport {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            clock,
            ids,
        }
    }

    pub async fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }
}

impl Default for LogTransport {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(UuidGenerator))
    }
}

#[async_trait]
impl MailTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, SendError> {
        let message_id = format!("log-{}", self.ids.next_id());
        info!(
            to = %message.to,
            channel = %message.channel,
            subject = %message.subject,
            message_id = %message_id,
            "Message accepted by log transport (not delivered)"
        );
        self.sent.lock().await.push(message.clone());
        Ok(DeliveryReceipt {
            provider: self.name().to_string(),
            message_id: Some(message_id),
            accepted_at: self.clock.now(),
        })
    }
}
