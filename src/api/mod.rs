//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (for federation)
//! - Well-known discovery
//! - Owner API
//! - Metrics (Prometheus)

mod activitypub;
mod admin;
mod converters;
mod dto;
pub mod metrics;
mod wellknown;

pub use converters::*;
pub use dto::*;

pub use activitypub::activitypub_router;
pub use admin::admin_router;
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;
