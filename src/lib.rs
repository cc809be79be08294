//! fleetwatch - container fleet monitoring.
//!
//! Polls container hosts, turns consecutive observations into lifecycle
//! events and dispatches notifications for the ones that match a rule.

pub mod config;
pub mod connector;
pub mod db;
pub mod downstream;
pub mod health;
pub mod lifecycle;
pub mod notify;
pub mod scheduler;
pub mod settings;

#[cfg(test)]
mod testutil;
