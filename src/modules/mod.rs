// Durable-state components

pub mod proxy_pool;
pub mod registry;

pub use proxy_pool::{PoolError, ProxyPool, Reservation};
pub use registry::{AccountRegistry, RegistryError};
