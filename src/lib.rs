pub mod api;
pub mod config;
pub mod consensus;
pub mod ledger;
pub mod metrics;
pub mod security;
pub mod types;
