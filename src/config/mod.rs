pub mod loader;
mod types;

pub use loader::{check_permissions, ConfigError};
pub use types::*;
