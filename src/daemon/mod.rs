//! The daemon: workers, collaborators and the HTTP front door.

pub mod auth;
pub mod ca;
pub mod checker;
pub mod config;
pub mod crypto;
pub mod http;
pub mod lifecycle;
pub mod processor;
pub mod scheduler;
pub mod server;
pub mod start;
pub mod store;
