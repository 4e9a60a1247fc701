use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use validator::Validate;

use crate::error::{Error, Result};
use crate::utils::validation::{self, FieldError};

/// Closed set of notification types the service knows how to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    OrderConfirmed,
    OrderShipped,
    PaymentFailed,
    PasswordReset,
    EmailVerification,
    Welcome,
}

impl NotificationType {
    pub const ALL: [NotificationType; 6] = [
        NotificationType::OrderConfirmed,
        NotificationType::OrderShipped,
        NotificationType::PaymentFailed,
        NotificationType::PasswordReset,
        NotificationType::EmailVerification,
        NotificationType::Welcome,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::OrderConfirmed => "ORDER_CONFIRMED",
            NotificationType::OrderShipped => "ORDER_SHIPPED",
            NotificationType::PaymentFailed => "PAYMENT_FAILED",
            NotificationType::PasswordReset => "PASSWORD_RESET",
            NotificationType::EmailVerification => "EMAIL_VERIFICATION",
            NotificationType::Welcome => "WELCOME",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        NotificationType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                Error::validation("type", format!("unknown notification type '{}'", wanted))
            })
    }
}

/// Delivery channel of a dispatch request; decides how recipients are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Email,
    Sms,
    Push,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
        }
    }

    /// Returns an error message when `address` is not deliverable on this channel.
    pub fn check_address(&self, address: &str) -> Option<&'static str> {
        let address = address.trim();
        if address.is_empty() {
            return Some("recipient must not be empty");
        }
        match self {
            Channel::Email => {
                use validator::ValidateEmail;
                (!address.validate_email()).then_some("must be a valid email address")
            }
            Channel::Sms => {
                let digits = address.strip_prefix('+').unwrap_or(address);
                let ok = (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit());
                (!ok).then_some("must be an E.164 phone number")
            }
            Channel::Push => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OrderItem {
    #[validate(length(min = 1, message = "is required"))]
    pub name: String,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub quantity: i64,
    #[validate(range(min = 0.0, message = "must not be negative"))]
    pub price: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OrderConfirmedData {
    #[validate(length(min = 1, message = "is required"))]
    pub order_id: String,
    #[validate(length(min = 1, message = "is required"))]
    pub customer_name: String,
    #[validate(range(min = 0.0, message = "must not be negative"))]
    pub total: f64,
    #[validate(length(equal = 3, message = "must be a 3-letter currency code"))]
    pub currency: String,
    #[validate(length(min = 1, message = "must contain at least one item"), nested)]
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OrderShippedData {
    #[validate(length(min = 1, message = "is required"))]
    pub order_id: String,
    #[validate(length(min = 1, message = "is required"))]
    pub carrier: String,
    #[validate(length(min = 1, message = "is required"))]
    pub tracking_number: String,
    #[validate(url(message = "must be a valid URL"))]
    pub tracking_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PaymentFailedData {
    #[validate(length(min = 1, message = "is required"))]
    pub order_id: String,
    #[validate(range(min = 0.0, message = "must not be negative"))]
    pub amount: f64,
    #[validate(length(equal = 3, message = "must be a 3-letter currency code"))]
    pub currency: String,
    pub reason: Option<String>,
    #[validate(url(message = "must be a valid URL"))]
    pub retry_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PasswordResetData {
    pub user_name: Option<String>,
    #[validate(url(message = "must be a valid URL"))]
    pub reset_url: String,
    #[validate(range(min = 1, max = 1440, message = "must be between 1 and 1440"))]
    pub expires_in_minutes: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EmailVerificationData {
    pub user_name: Option<String>,
    #[validate(url(message = "must be a valid URL"))]
    pub verification_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WelcomeData {
    #[validate(length(min = 1, message = "is required"))]
    pub user_name: String,
    #[validate(url(message = "must be a valid URL"))]
    pub login_url: Option<String>,
}

/// A notification type together with its typed, validated payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    OrderConfirmed(OrderConfirmedData),
    OrderShipped(OrderShippedData),
    PaymentFailed(PaymentFailedData),
    PasswordReset(PasswordResetData),
    EmailVerification(EmailVerificationData),
    Welcome(WelcomeData),
}

impl NotificationKind {
    /// Parses and validates the `data` bag for `ty`.
    ///
    /// Shape errors (wrong JSON types) and rule violations are both reported as
    /// field-level `Error::Validation`.
    pub fn parse(ty: NotificationType, data: JsonValue) -> Result<Self> {
        let data = match data {
            JsonValue::Null => JsonValue::Object(Map::new()),
            obj @ JsonValue::Object(_) => obj,
            _ => return Err(Error::validation("data", "must be a JSON object")),
        };
        let kind = match ty {
            NotificationType::OrderConfirmed => {
                NotificationKind::OrderConfirmed(decode(data)?)
            }
            NotificationType::OrderShipped => NotificationKind::OrderShipped(decode(data)?),
            NotificationType::PaymentFailed => NotificationKind::PaymentFailed(decode(data)?),
            NotificationType::PasswordReset => NotificationKind::PasswordReset(decode(data)?),
            NotificationType::EmailVerification => {
                NotificationKind::EmailVerification(decode(data)?)
            }
            NotificationType::Welcome => NotificationKind::Welcome(decode(data)?),
        };
        kind.validate_payload().map_err(Error::Validation)?;
        Ok(kind)
    }

    pub fn notification_type(&self) -> NotificationType {
        match self {
            NotificationKind::OrderConfirmed(_) => NotificationType::OrderConfirmed,
            NotificationKind::OrderShipped(_) => NotificationType::OrderShipped,
            NotificationKind::PaymentFailed(_) => NotificationType::PaymentFailed,
            NotificationKind::PasswordReset(_) => NotificationType::PasswordReset,
            NotificationKind::EmailVerification(_) => NotificationType::EmailVerification,
            NotificationKind::Welcome(_) => NotificationType::Welcome,
        }
    }

    fn validate_payload(&self) -> std::result::Result<(), Vec<FieldError>> {
        let prefixed = |errs: Vec<FieldError>| {
            errs.into_iter()
                .map(|e| FieldError::new(format!("data.{}", e.field), e.message))
                .collect::<Vec<_>>()
        };
        let res = match self {
            NotificationKind::OrderConfirmed(d) => validation::validate(d),
            NotificationKind::OrderShipped(d) => validation::validate(d),
            NotificationKind::PaymentFailed(d) => validation::validate(d),
            NotificationKind::PasswordReset(d) => validation::validate(d),
            NotificationKind::EmailVerification(d) => validation::validate(d),
            NotificationKind::Welcome(d) => validation::validate(d),
        };
        res.map_err(prefixed)
    }

    /// Template variables: the typed payload, plus a few derived display values.
    pub fn template_variables(&self) -> Map<String, JsonValue> {
        let mut vars = match serde_json::to_value(self) {
            Ok(JsonValue::Object(mut tagged)) => match tagged.remove("data") {
                Some(JsonValue::Object(map)) => map,
                _ => Map::new(),
            },
            _ => Map::new(),
        };
        match self {
            NotificationKind::OrderConfirmed(d) => {
                vars.insert("total".into(), JsonValue::String(format!("{:.2}", d.total)));
                vars.insert("item_count".into(), JsonValue::from(d.items.len()));
                let lines = d
                    .items
                    .iter()
                    .map(|i| format!("{} x{}", i.name, i.quantity))
                    .collect::<Vec<_>>()
                    .join(", ");
                vars.insert("items_summary".into(), JsonValue::String(lines));
            }
            NotificationKind::PaymentFailed(d) => {
                vars.insert("amount".into(), JsonValue::String(format!("{:.2}", d.amount)));
            }
            _ => {}
        }
        vars.retain(|_, v| !v.is_null());
        vars
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: JsonValue) -> Result<T> {
    serde_json::from_value(data).map_err(|e| Error::validation("data", e.to_string()))
}
