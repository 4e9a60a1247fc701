pub mod delivery_service;
pub mod history_service;
pub mod maintenance_service;
pub mod notification_service;
pub mod pg_queue_service;
pub mod queue_service;
pub mod retry_service;
pub mod template_service;
pub mod webhook_service;
