pub mod loader;
pub mod schema;

pub use loader::{find_config_path, load_config, read_config, resolve_path, save_config};
pub use schema::{
    ActivityConfig, Config, ContextConfig, DeliveryConfig, EngineConfig, EngineKind, FocusConfig,
    NudgeConfig, SchedulerConfig, ScoreWeights, StoreConfig, FOCUS_LEVELS,
};

/// A configuration value the system cannot start with.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
