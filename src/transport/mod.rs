//! Outbound delivery seam. Real provider SDKs live behind [`MailTransport`];
//! the service only ever sees a receipt or a [`SendError`].

pub mod log;
pub mod relay;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::delivery_job::OutboundMessage;

pub use self::log::LogTransport;
pub use self::relay::HttpRelayTransport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider: String,
    /// Provider-side id, echoed back later in webhook callbacks.
    pub message_id: Option<String>,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// May succeed if attempted again (network, throttling, 5xx).
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Will not succeed on retry (rejected address, policy, auth).
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn message(&self) -> &str {
        match self {
            SendError::Transient(m) | SendError::Permanent(m) => m,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Permanent(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, SendError>;
}
