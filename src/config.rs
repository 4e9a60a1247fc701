use crate::error::{Error, Result};
use crate::services::notification_service::DispatchSettings;
use crate::services::queue_service::QueueSettings;
use crate::services::retry_service::RetryPolicy;
use crate::services::webhook_service::WebhookSettings;
use dotenvy::dotenv;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppEnv {
    Production,
    #[default]
    Development,
    Test,
}

impl AppEnv {
    pub fn is_production(&self) -> bool {
        matches!(self, AppEnv::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppEnv::Production => "production",
            AppEnv::Development => "development",
            AppEnv::Test => "test",
        }
    }
}

impl fmt::Display for AppEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppEnv {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(AppEnv::Production),
            "development" | "dev" => Ok(AppEnv::Development),
            "test" => Ok(AppEnv::Test),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub app_env: AppEnv,
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub webhook_secret: Option<String>,
    pub mail_from: String,
    pub mail_relay_url: Option<String>,
    pub mail_relay_secret: Option<String>,
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub auto_retry: bool,
    pub queue_concurrency: usize,
    pub queue_max_attempts: u32,
    pub queue_backoff_ms: u64,
    pub dispatch_timeout_ms: u64,
    pub completed_job_retention_secs: u64,
    pub failed_job_retention_secs: u64,
    pub queue_stall_timeout_secs: u64,
    pub log_retention_days: u32,
    pub maintenance_cron: String,
    pub webhook_recipient_fallback: bool,
    pub permanent_error_patterns: Vec<String>,
    pub log_format: LogFormat,
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let app_env: AppEnv = get_env_or("APP_ENV", AppEnv::Development)?;
        let database_url = get_env_opt("DATABASE_URL");
        if app_env.is_production() && database_url.is_none() {
            return Err(Error::Config(
                "DATABASE_URL is required when APP_ENV=production".to_string(),
            ));
        }

        Ok(Self {
            server_address: get_env("SERVER_ADDRESS")?,
            app_env,
            database_url,
            jwt_secret: get_env("JWT_SECRET")?,
            webhook_secret: get_env_opt("WEBHOOK_SECRET"),
            mail_from: get_env_opt("MAIL_FROM").unwrap_or_else(|| "no-reply@localhost".to_string()),
            mail_relay_url: get_env_opt("MAIL_RELAY_URL"),
            mail_relay_secret: get_env_opt("MAIL_RELAY_SECRET"),
            max_retries: get_env_or("MAX_RETRIES", 3)?,
            base_retry_delay_ms: get_env_or("BASE_RETRY_DELAY_MS", 60_000)?,
            auto_retry: get_env_or("AUTO_RETRY", true)?,
            queue_concurrency: get_env_or("QUEUE_CONCURRENCY", 4)?,
            queue_max_attempts: get_env_or("QUEUE_MAX_ATTEMPTS", 3)?,
            queue_backoff_ms: get_env_or("QUEUE_BACKOFF_MS", 1_000)?,
            dispatch_timeout_ms: get_env_or("DISPATCH_TIMEOUT_MS", 10_000)?,
            completed_job_retention_secs: get_env_or("COMPLETED_JOB_RETENTION_SECS", 3_600)?,
            failed_job_retention_secs: get_env_or("FAILED_JOB_RETENTION_SECS", 604_800)?,
            queue_stall_timeout_secs: get_env_or("QUEUE_STALL_TIMEOUT_SECS", 300)?,
            log_retention_days: get_env_or("LOG_RETENTION_DAYS", 30)?,
            maintenance_cron: get_env_opt("MAINTENANCE_CRON")
                .unwrap_or_else(|| "0 0 3 * * *".to_string()),
            webhook_recipient_fallback: get_env_or("WEBHOOK_RECIPIENT_FALLBACK", true)?,
            permanent_error_patterns: get_env_opt("PERMANENT_ERROR_PATTERNS")
                .map(|raw| {
                    raw.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            log_format: get_env_or("LOG_FORMAT", LogFormat::Text)?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_retry_delay_ms),
            auto_reschedule: self.auto_retry,
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            name: "notifications".to_string(),
            concurrency: self.queue_concurrency.max(1),
            max_attempts: self.queue_max_attempts.max(1),
            backoff_base: Duration::from_millis(self.queue_backoff_ms),
            completed_retention: Duration::from_secs(self.completed_job_retention_secs),
            failed_retention: Duration::from_secs(self.failed_job_retention_secs),
            stall_timeout: Duration::from_secs(self.queue_stall_timeout_secs),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            environment: self.app_env,
            dispatch_timeout: Duration::from_millis(self.dispatch_timeout_ms),
            default_from: self.mail_from.clone(),
        }
    }

    pub fn webhook_settings(&self) -> WebhookSettings {
        WebhookSettings {
            secret: self.webhook_secret.clone(),
            allow_recipient_fallback: self.webhook_recipient_fallback,
            environment: self.app_env,
        }
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn get_env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get_env_opt(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e))),
        None => Ok(default),
    }
}

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> Result<&'static Config> {
    CONFIG
        .get()
        .ok_or_else(|| Error::Config("Configuration has not been initialized".to_string()))
}
