use std::str::FromStr;

use serde::Deserialize;
use tracing::metadata::Level;
use tracing::level_filters::LevelFilter;

#[derive(Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_level", deserialize_with = "deserialize_level")]
    pub level: Level,

    /// Log every message going through the daemon.
    #[serde(default)]
    pub debug_all_messages: bool,
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;

    Level::from_str(&s).map_err(serde::de::Error::custom)
}

fn default_level() -> Level {
    Level::INFO
}

impl LoggerConfig {
    pub fn level_filter(&self) -> LevelFilter {
        LevelFilter::from_level(self.level)
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            debug_all_messages: false,
        }
    }
}
