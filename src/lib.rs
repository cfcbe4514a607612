pub mod api;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod forker;
pub mod lifecycle;
pub mod platform;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::WardenError;
pub use platform::Platform;
