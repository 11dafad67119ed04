//! Common types used by the various certward components.

pub mod bus;
pub mod error;
pub mod rpc;

pub use self::error::Error;

//------------ Response Aliases ----------------------------------------------

pub type WardResult<T> = std::result::Result<T, self::error::Error>;
