pub mod provision;
pub mod session;
pub mod vault;

pub use provision::{ProvisionAgent, ProvisionOutcome, ProvisionState};
pub use session::DeviceSessionManager;
pub use vault::KeyVault;
