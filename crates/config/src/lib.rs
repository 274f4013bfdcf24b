// Configuration loading

pub mod settings;

pub use settings::{AuthMode, AuthSettings, ConfigError, Role, ServerSettings, TokenGrant};
