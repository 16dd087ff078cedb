// Data model module

pub mod account;
pub mod config;
pub mod health;
pub mod proxy;

pub use account::{mask_username, Account, Cookie};
pub use config::{load_config, OrchestratorConfig};
pub use health::{AccountHealth, ErrorKind, ErrorRecord, HealthStatus};
pub use proxy::Proxy;
