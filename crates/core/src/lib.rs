//! Shared configuration, error model, and event bus for the outreach
//! conversation flow services.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use config::AppConfig;
pub use error::{ErrorKind, OutreachError, OutreachResult};
