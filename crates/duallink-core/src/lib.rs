pub mod errors;
pub mod store;
pub mod types;

pub use errors::{ConfigError, DualLinkError};
pub use store::DomainConfig;
pub use types::*;
