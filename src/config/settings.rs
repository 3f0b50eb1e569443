use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::cache::DialTimeout;
use crate::connection::EndpointInfo;
use crate::error::{CacheError, CacheResult};

/// Contents of an `apiconn.toml` settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheSettings,
    pub controllers: Vec<ControllerConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub dial_timeout_secs: Option<u64>,
}

/// One controller the cache may connect to, keyed by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ControllerConfig {
    pub name: String,
    #[serde(flatten)]
    pub endpoint: EndpointInfo,
}

/// Validated runtime configuration for a [`Cache`](crate::cache::Cache).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheConfig {
    pub dial_timeout: DialTimeout,
}

impl Settings {
    /// Parse and validate settings from TOML text.
    pub fn from_toml_str(text: &str) -> CacheResult<Self> {
        let settings: Settings = toml::from_str(text)
            .map_err(|e| CacheError::config(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// The cache configuration these settings describe.
    pub fn cache_config(&self) -> CacheResult<CacheConfig> {
        let dial_timeout = match self.cache.dial_timeout_secs {
            Some(secs) => DialTimeout::from_secs(secs)?,
            None => DialTimeout::default(),
        };
        Ok(CacheConfig { dial_timeout })
    }

    pub fn controller(&self, name: &str) -> Option<&ControllerConfig> {
        self.controllers.iter().find(|c| c.name == name)
    }

    fn validate(&self) -> CacheResult<()> {
        self.cache_config()?;

        let mut seen = HashSet::new();
        for controller in &self.controllers {
            if controller.name.is_empty() {
                return Err(CacheError::config("controller with empty name"));
            }
            if !seen.insert(controller.name.as_str()) {
                return Err(CacheError::config(format!(
                    "controller {:?} is configured twice",
                    controller.name
                )));
            }
            if controller.endpoint.addresses.is_empty() {
                return Err(CacheError::config(format!(
                    "controller {:?} has no addresses",
                    controller.name
                )));
            }
        }
        Ok(())
    }
}
