//! Shared message types and error hierarchy for Parlor.

pub mod error;
pub mod message;
pub mod util;

pub use error::{ConfigError, ParlorError};
pub use message::*;
pub use util::{preview, truncate_str};
