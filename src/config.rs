pub mod settings;
pub mod user;

pub use settings::{CacheConfig, CacheSettings, ControllerConfig, Settings};
pub use user::{default_config_path, load_settings};
