pub mod analytics;
pub mod artifacts;
pub mod config;
pub mod convex;
pub mod dispatch;
pub mod entitlement;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod middleware;
pub mod pdf;
pub mod pipeline;
pub mod queue;
pub mod quota;
pub mod router;
pub mod state;
pub mod store;
pub mod upload;
pub mod users;
pub mod worker;
