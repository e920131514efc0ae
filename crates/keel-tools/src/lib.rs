pub mod breaker;
pub mod fallback;
pub mod invoker;
pub mod registry;

pub use breaker::{BreakerPermit, BreakerSnapshot, BreakerState, CircuitBreakerRegistry};
pub use fallback::{cache_key, great_circle_nm, FallbackDispatcher};
pub use invoker::ResilientToolInvoker;
pub use registry::ToolRegistry;
