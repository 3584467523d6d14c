pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod processor;
pub mod reservations;
pub mod schema;
pub mod store;
pub mod sweeper;
pub mod webhooks;
