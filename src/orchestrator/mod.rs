// Orchestration engine

pub mod breaker;
pub mod catalog;
pub mod classifier;
pub mod dispatcher;
pub mod gate;
pub mod health;
pub mod monitor;
pub mod session;

pub use breaker::{BreakerState, CircuitBreaker};
pub use catalog::Catalog;
pub use classifier::classify_error;
pub use dispatcher::{Dispatcher, OpContext, OpSpec, Payload, TimeoutClass};
pub use gate::ConcurrencyGate;
pub use health::{Admission, HealthConfig, HealthTracker};
pub use monitor::StatsReport;
pub use session::DriverSession;
