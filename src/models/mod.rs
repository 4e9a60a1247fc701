pub mod delivery_job;
pub mod notification;
pub mod notification_log;
