//! Core application infrastructure

pub mod app;
pub mod cli;
pub mod config;
pub mod constants;
pub mod shutdown;

pub use app::CoreApp;
pub use cli::Cli;
pub use config::{AppConfig, DatabaseConfig, MqttConfig};
pub use shutdown::ShutdownService;
