pub mod adapters;
pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod ports;
pub mod server;
