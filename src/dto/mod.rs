pub mod notification_dto;
pub mod webhook_dto;
