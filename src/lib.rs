//! The _certward_ library crate.
//!
//! Certward automates the lifecycle of TLS certificates issued by a
//! third-party CA: enrollment, collection, periodic health verification,
//! renewal and revocation. All state changes flow through a message bus;
//! no worker ever calls another worker directly.

pub mod api;
pub mod commons;
pub mod constants;
pub mod daemon;
