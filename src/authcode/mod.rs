//! Single-use auth codes bridging a login back to the host application.

pub mod store;
pub mod sweep;

pub use store::{AuthCodeStore, PendingAuthCode, DEFAULT_CODE_TTL_SECS};
pub use sweep::{spawn_sweep_task, DEFAULT_SWEEP_INTERVAL_SECS};
