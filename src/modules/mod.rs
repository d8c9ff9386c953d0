//! Cross-cutting services module
//!
//! Token storage, proxy rotation, metrics and the event hooks the bank
//! publishes through.

pub mod events;
pub mod metrics;
pub mod proxy;
pub mod queue;

// Re-export commonly used types
pub use events::{
    BankEvent, EventDispatcher, EventHandler, LifecycleEvent, LoggingHandler, MetricsHandler,
    SIZE_EVENT_NAME, SizeEvent, SolveEvent, TokenEvent,
};
pub use metrics::{GlobalStats, MetricsCollector, MetricsSnapshot, ProviderStats, TokenFlow};
pub use proxy::{ProxyDescriptor, ProxyGroup, ProxyRotation};
pub use queue::{SweepPass, TOKEN_TTL, Token, TokenCounters, TokenOrigin, TokenQueue};
