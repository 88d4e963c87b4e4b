pub mod auth;
pub mod cli;
pub mod commands;
pub mod config;
pub mod connection;
pub mod events;
pub mod fallback;
pub mod model;
pub mod normalize;
pub mod reconcile;
pub mod session;
pub mod telemetry;
pub mod transport;
