#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod breaker;
pub mod engine;
pub mod error;
pub mod health;
pub mod limiter;
pub mod pool;
pub mod retry;
pub mod router;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use engine::DispatchEngine;
pub use error::DispatchError;
pub use health::{HealthStatus, HealthTracker};
pub use limiter::{Decision, LimitScope, LimiterConfig, RateLimiter};
pub use pool::{
    MemoryAudit, PoolConfig, PoolMember, SelectionAudit, SelectionRecord, SelectionStrategy,
};
pub use retry::RetryPolicy;
pub use router::{Route, RouteError, Router, RoutingSnapshot, RoutingTable};
