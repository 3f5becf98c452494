//! Federation session state.
//!
//! This module provides the per browser session federation markers, the
//! guard that binds and invalidates them, persistent storage backed by redb
//! and background cleanup.

pub mod cleanup;
pub mod guard;
pub mod store;
pub mod types;

pub use cleanup::{spawn_cleanup_task, sweep, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use guard::{BindingState, GuardDecision, InvalidationReason, SessionGuard};
pub use store::SessionStore;
pub use types::{AuthSource, FederationSession, PendingEmailRequest, SessionId};
