pub mod global;
pub mod loader;

pub use global::{BusConfig, LoggingConfig, RulesConfig, RuntimeConfig, ScriptConfig};
pub use loader::ConfigLoader;
