#[macro_use]
mod macros;

mod config;
mod deferral;
mod discovery;
mod error;
mod events;
mod handler;
mod metrics;
mod pipeline;
mod queue;
mod retry;
mod rollback;
mod signals;
mod speculation;

// Re-export
pub use config::{
    BackpressureConfig, BatchItem, ConfigError, ExecutorConfig, ExecutorMode, RetryPolicy,
    SchedulingStrategy, SpeculationConfig,
};
pub use deferral::{DeferralEvent, DeferralManager};
pub use discovery::{Discovered, DiscoveryFeed, DiscoveryOrigin, SubscriptionId};
pub use error::ExecutorError;
pub use events::{ExecutorHooks, HookSet};
pub use handler::{TaskContext, TaskHandler};
pub use metrics::{ExecutorMetrics, MetricsSnapshot, SpeculationMetrics, SpeculationSnapshot};
pub use pipeline::{Executor, ExecutorStatus};
pub use rollback::{CancelReason, CancelResult, RollbackReason, RollbackResult};
pub use signals::{SignalRegistry, SpeculationTimers};
pub use speculation::{
    DenialReason, SpeculationDecision, SpeculativeScheduler, MIN_SPECULATION_SAMPLES,
};
