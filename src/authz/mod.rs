//! Authorization module using attribute rules.
//!
//! Derives role grants from asserted attributes after authentication.

pub mod engine;

pub use engine::{AuthorizationEngine, GrantEvaluation};
