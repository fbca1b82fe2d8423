//! API layer - HTTP endpoint handlers organized by resource.

mod actor;
mod health;
mod jobs;
mod metrics;
mod queue;
mod routes;
mod templates;

pub use actor::{Actor, ACTOR_HEADER, ANONYMOUS_ACTOR};
pub use health::health;
pub use jobs::ListJobsQuery;
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
