use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_ENV_VAR_PREFIX: &str = "FLOWGATE";

#[derive(Debug, Error)]
pub enum ConfigErr {
    #[error("unable to read configuration: {0}")]
    Read(#[from] config::ConfigError),
}

/// Layered configuration: an optional YAML file overridden by
/// `FLOWGATE__SECTION__KEY` environment variables.
pub struct ConfigCache {
    config: Config,
    config_path: String,
}

impl ConfigCache {
    pub fn new(config_path: &str) -> Result<Self, ConfigErr> {
        Ok(Self {
            config: Self::load_config(config_path)?,
            config_path: config_path.to_owned(),
        })
    }

    fn load_config(config_path: &str) -> Result<Config, ConfigErr> {
        let base_config_builder = ConfigBuilder::<DefaultState>::default();
        let config = base_config_builder
            .add_source(File::with_name(config_path).required(false))
            .add_source(
                Environment::with_prefix(DEFAULT_ENV_VAR_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config)
    }

    pub fn path(&self) -> &str {
        &self.config_path
    }

    pub fn get_config<'d, T: Deserialize<'d>>(&self) -> Result<T, ConfigErr> {
        Ok(self.config.clone().try_deserialize()?)
    }
}
