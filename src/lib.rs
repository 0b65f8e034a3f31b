pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod error;
pub mod metrics;
pub mod providers;
pub mod proxy;
pub mod server;
pub mod status;
pub mod streaming;
pub mod transport;
pub mod types;

pub use error::RelayError;
pub type Result<T> = std::result::Result<T, RelayError>;
