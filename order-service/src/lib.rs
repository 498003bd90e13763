pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod orders;
pub mod releaser;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod warehouses;
