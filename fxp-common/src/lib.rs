mod config;
mod error;
mod types;

pub use error::*;
pub use types::*;

pub use self::config::*;
