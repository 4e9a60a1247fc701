use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::models::delivery_job::RenderedContent;
use crate::models::notification::NotificationType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: String,
    pub html: String,
    pub text: String,
}

impl EmailTemplate {
    pub fn new(subject: &str, html: &str, text: &str) -> Self {
        Self {
            subject: subject.to_string(),
            html: html.to_string(),
            text: text.to_string(),
        }
    }
}

/// Maps notification types to templates and fills `{{key}}` placeholders.
#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    templates: HashMap<NotificationType, EmailTemplate>,
}

impl TemplateRenderer {
    /// A renderer with no templates; every lookup fails until `register` is called.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut renderer = Self::empty();
        for ty in NotificationType::ALL {
            renderer.register(ty, default_template(ty));
        }
        renderer
    }

    pub fn register(&mut self, ty: NotificationType, template: EmailTemplate) {
        self.templates.insert(ty, template);
    }

    pub fn has_template(&self, ty: NotificationType) -> bool {
        self.templates.contains_key(&ty)
    }

    pub fn render(
        &self,
        ty: NotificationType,
        variables: &Map<String, JsonValue>,
    ) -> Result<RenderedContent> {
        let template = self
            .templates
            .get(&ty)
            .ok_or(Error::TemplateNotFound(ty))?;
        Ok(RenderedContent {
            subject: interpolate(&template.subject, variables),
            html: interpolate_with(&template.html, variables, escape_html),
            text: interpolate(&template.text, variables),
        })
    }
}

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}")
            .expect("placeholder pattern is valid")
    })
}

/// Replaces every `{{key}}` with the stringified variable. Unknown keys and null
/// values leave the placeholder exactly as written.
pub fn interpolate(template: &str, variables: &Map<String, JsonValue>) -> String {
    interpolate_with(template, variables, |s| s.to_string())
}

fn interpolate_with(
    template: &str,
    variables: &Map<String, JsonValue>,
    encode: impl Fn(&str) -> String,
) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures<'_>| {
            match lookup(variables, &caps[1]).and_then(stringify) {
                Some(value) => encode(&value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Exact key first, then a dotted path into nested objects.
fn lookup<'a>(variables: &'a Map<String, JsonValue>, key: &str) -> Option<&'a JsonValue> {
    if let Some(value) = variables.get(key) {
        return Some(value);
    }
    let mut parts = key.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = match current {
            JsonValue::Object(map) => map.get(part)?,
            JsonValue::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn stringify(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn default_template(ty: NotificationType) -> EmailTemplate {
    match ty {
        NotificationType::OrderConfirmed => EmailTemplate::new(
            "Order {{order_id}} confirmed",
            "<h1>Thanks for your order, {{customer_name}}!</h1>\
             <p>Order <strong>{{order_id}}</strong> ({{item_count}} items: {{items_summary}}) \
             totals {{total}} {{currency}}.</p>",
            "Thanks for your order, {{customer_name}}!\n\
             Order {{order_id}} ({{item_count}} items: {{items_summary}}) totals {{total}} {{currency}}.",
        ),
        NotificationType::OrderShipped => EmailTemplate::new(
            "Order {{order_id}} has shipped",
            "<p>Your order <strong>{{order_id}}</strong> is on its way with {{carrier}}.</p>\
             <p>Tracking number: {{tracking_number}}</p><p>{{tracking_url}}</p>",
            "Your order {{order_id}} is on its way with {{carrier}}.\n\
             Tracking number: {{tracking_number}}\n{{tracking_url}}",
        ),
        NotificationType::PaymentFailed => EmailTemplate::new(
            "Payment for order {{order_id}} failed",
            "<p>We could not charge {{amount}} {{currency}} for order {{order_id}}.</p>\
             <p>{{reason}}</p><p><a href=\"{{retry_url}}\">Update payment details</a></p>",
            "We could not charge {{amount}} {{currency}} for order {{order_id}}.\n\
             {{reason}}\nUpdate payment details: {{retry_url}}",
        ),
        NotificationType::PasswordReset => EmailTemplate::new(
            "Reset your password",
            "<p>Hello {{user_name}},</p><p><a href=\"{{reset_url}}\">Reset your password</a>. \
             The link expires in {{expires_in_minutes}} minutes.</p>",
            "Hello {{user_name}},\nReset your password: {{reset_url}}\n\
             The link expires in {{expires_in_minutes}} minutes.",
        ),
        NotificationType::EmailVerification => EmailTemplate::new(
            "Verify your email address",
            "<p>Hello {{user_name}},</p><p><a href=\"{{verification_url}}\">Verify your email</a></p>",
            "Hello {{user_name}},\nVerify your email: {{verification_url}}",
        ),
        NotificationType::Welcome => EmailTemplate::new(
            "Welcome, {{user_name}}!",
            "<h1>Welcome aboard, {{user_name}}!</h1><p>Sign in at {{login_url}}</p>",
            "Welcome aboard, {{user_name}}!\nSign in at {{login_url}}",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn known_placeholders_are_all_replaced() {
        let out = interpolate(
            "Hi {{name}}, order {{ order_id }} costs {{total}} ({{paid}})",
            &vars(json!({ "name": "Ada", "order_id": "A-1", "total": 9.5, "paid": true })),
        );
        assert_eq!(out, "Hi Ada, order A-1 costs 9.5 (true)");
        assert!(!placeholder().is_match(&out));
    }

    #[test]
    fn unresolved_placeholders_stay_verbatim() {
        let out = interpolate(
            "{{greeting}} {{name}}, see {{ missing }} and {{gone}}",
            &vars(json!({ "greeting": "Hello", "name": "Ada", "gone": null })),
        );
        assert_eq!(out, "Hello Ada, see {{ missing }} and {{gone}}");
    }

    #[test]
    fn every_occurrence_is_replaced() {
        let out = interpolate("{{x}}-{{x}}-{{x}}", &vars(json!({ "x": 1 })));
        assert_eq!(out, "1-1-1");
    }

    #[test]
    fn dotted_paths_reach_nested_values() {
        let out = interpolate(
            "{{customer.name}} bought {{items.0.name}}",
            &vars(json!({ "customer": { "name": "Ada" }, "items": [{ "name": "Lamp" }] })),
        );
        assert_eq!(out, "Ada bought Lamp");
    }

    #[test]
    fn html_values_are_escaped_but_text_is_not() {
        let renderer = TemplateRenderer::with_defaults();
        let rendered = renderer
            .render(
                NotificationType::Welcome,
                &vars(json!({ "user_name": "<Ada & Co>", "login_url": "https://x.test" })),
            )
            .unwrap();
        assert_eq!(rendered.subject, "Welcome, <Ada & Co>!");
        assert!(rendered.html.contains("&lt;Ada &amp; Co&gt;"));
        assert!(rendered.text.contains("<Ada & Co>"));
    }

    #[test]
    fn missing_template_is_reported() {
        let renderer = TemplateRenderer::empty();
        let err = renderer
            .render(NotificationType::PasswordReset, &Map::new())
            .unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound(NotificationType::PasswordReset)));
    }

    #[test]
    fn defaults_cover_every_type() {
        let renderer = TemplateRenderer::with_defaults();
        assert!(NotificationType::ALL.iter().all(|t| renderer.has_template(*t)));
    }
}
