pub mod config;
pub mod logging;

pub mod control;
pub mod executor;
pub mod limiter;
pub mod lock;
pub mod queue;
pub mod scheduler;
pub mod store;
