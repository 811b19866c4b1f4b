pub mod access;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod health;
pub mod limit;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod routing;
pub mod server;
