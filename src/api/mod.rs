//! Data types shared between the workers and the administrative API.

pub mod events;
pub mod subject;

pub use self::subject::{LifecycleState, Subject, Timestamp};
