use crate::config::AppConfig;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads application configuration by merging `config/Config.toml`, an
    /// optional profile overlay (`config/Config.{profile}.toml`),
    /// `POSSYNC_`-prefixed environment variables (`__` separates nesting
    /// levels, e.g. `POSSYNC_QUEUE_WORKER__BATCH_SIZE`), and
    /// `config/Config.json` as a fallback layer. The merged result is
    /// validated before it is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed, or
    /// if the merged configuration fails validation.
    pub fn load(profile: Option<&str>) -> Result<AppConfig> {
        let mut figment = Figment::new().merge(Toml::file("config/Config.toml"));
        if let Some(profile) = profile {
            figment = figment.merge(Toml::file(format!("config/Config.{profile}.toml")));
        }
        let config: AppConfig = figment
            .merge(Env::prefixed("POSSYNC_").split("__"))
            .join(Json::file("config/Config.json"))
            .extract()?;
        config.validate()?;

        Ok(config)
    }
}
