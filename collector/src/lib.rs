pub mod identity;
pub mod keysub;
pub mod provision;
pub mod readings;
pub mod server;
pub mod session;

pub use server::CollectorServer;
