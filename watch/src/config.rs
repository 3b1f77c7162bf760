use crate::database::Config as DatabaseConfig;
use crate::server::Config as ServerConfig;
use crate::updater::Config as UpdaterConfig;

use serde::{Deserialize, Serialize};
use std::fs::File;

pub const LOG_LEVEL: &str = "info";

fn log_level() -> String {
    LOG_LEVEL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub updater: UpdaterConfig,
    /// The minimum severity for log messages.
    #[serde(default = "log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            server: ServerConfig::default(),
            updater: UpdaterConfig::default(),
            log_level: log_level(),
        }
    }
}

impl Config {
    pub fn load_from_file(path_to_file: String) -> Result<Config, String> {
        let file =
            File::open(path_to_file).map_err(|e| format!("Error reading config file: {:?}", e))?;
        let config: Config = serde_yaml::from_reader(file)
            .map_err(|e| format!("Error parsing config file: {:?}", e))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updater::Reindex;

    #[test]
    fn default_config_file_parses() {
        let config: Config =
            serde_yaml::from_str(include_str!("../config.yaml.default")).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.server.listen_port, 5059);
        assert_eq!(config.updater.reindex, Reindex::None);
        assert_eq!(config.updater.max_concurrent_slots, 10);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.database.dbname, "rewards");
        assert_eq!(config.updater.update_period_seconds, 60);
        assert!(config.updater.relay_urls.is_none());
    }
}
