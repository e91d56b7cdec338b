//! HTTP surface: player actions, the tick trigger and health

pub mod middleware;
pub mod routes;

pub use routes::build_router;
