mod metrics;
mod tracing;

pub use self::metrics::{ListenerStats, Metrics, PerHandlerStats, Timespan};
pub use self::tracing::{init_tracing, TracingConfig};
