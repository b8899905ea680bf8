pub mod config;
pub mod interfaces;
pub mod lifecycle;

pub use config::AppConfig;
pub use interfaces::{AssistantStatus, NoopNotifier, StatusReceiver, StatusSender, SyncNotifier};
