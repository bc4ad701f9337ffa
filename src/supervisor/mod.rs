//! Connection lifecycle supervision
//!
//! [`ConnectionSupervisor`] owns one transport client per identity and keeps
//! the caller-visible [`ConnectionStatus`] of every identity it has seen.

pub mod manager;
pub mod state;

pub use manager::{ConnectionObserver, ConnectionSupervisor};
pub use state::{ConnectionState, ConnectionStatus};
