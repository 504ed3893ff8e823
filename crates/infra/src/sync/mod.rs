//! The sync engine: normalization, remote reconciliation and lifecycle.

pub mod control;
pub mod debouncer;
pub mod executor;
pub mod remote_ops;
pub mod resolver;

pub use control::ControlPlane;
pub use debouncer::Debouncer;
pub use executor::{Executor, ExecutorConfig};
pub use remote_ops::RemoteOps;
pub use resolver::PathResolver;
