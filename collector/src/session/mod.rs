//! Device session lifecycle: challenge issuance and token management.

pub mod challenge;
pub mod store;

pub use challenge::{ChallengeAuthority, ChallengeError};
pub use store::{
    AdvanceResult, MemorySessionBacking, RedisSessionBacking, SessionBacking, SessionError,
    SessionStore,
};
