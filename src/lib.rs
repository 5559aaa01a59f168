pub mod backoff;
pub mod config;
pub mod default_route;
pub mod errors;
pub mod family;
pub mod host;
pub mod logging;
pub mod manager;
pub mod net;
pub mod resolver;
pub mod routing_table;
mod serde_safe;

#[cfg(test)]
mod resolver_test;
