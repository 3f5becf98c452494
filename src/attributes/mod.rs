//! Extraction of IdP-asserted attributes from the request context.

pub mod source;
pub mod types;

pub use source::{AttributeSource, IDP_PRESENCE_FIELDS};
pub use types::{AssertedIdentity, RequestContext};
