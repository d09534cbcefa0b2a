//! Sensor identity directory and signature-based tenant resolution.

pub mod directory;
pub mod resolver;

pub use directory::{InMemoryDirectory, RedisDirectory, SensorDirectory};
pub use resolver::{IdentityResolver, ResolveError};
