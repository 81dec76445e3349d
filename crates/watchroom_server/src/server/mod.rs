#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod health;
pub mod heartbeat;
pub mod history;
pub mod registry;
pub mod router;

#[cfg(test)]
mod router_tests;
