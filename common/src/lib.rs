pub mod bus;
pub mod cache;
pub mod config;
pub mod envelope;
pub mod error;
pub mod replay;
pub mod signing;
pub mod types;

pub use config::{Config, ReplayConfig};
pub use error::{ProtocolError, Result};
pub use types::*;
