use crate::error::CommonResult;
use config::{Config, Environment, File};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix; `PLCWIRE__LOGGING__LEVEL=debug` overrides `logging.level`.
pub const ENV_PREFIX: &str = "PLCWIRE";

/// Load a settings tree from an optional TOML file overlaid with environment variables.
///
/// A missing file is not an error so a deployment can be configured purely
/// through the environment.
pub fn load_settings<T: DeserializeOwned>(path: Option<&Path>) -> CommonResult<T> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(false));
    }
    let builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("tags"),
    );
    Ok(builder.build()?.try_deserialize()?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::level_default")]
    pub level: String,
    #[serde(default = "LoggingSettings::directory_default")]
    pub directory: String,
    #[serde(default = "LoggingSettings::file_prefix_default")]
    pub file_prefix: String,
    #[serde(default)]
    pub to_file: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::level_default(),
            directory: Self::directory_default(),
            file_prefix: Self::file_prefix_default(),
            to_file: false,
        }
    }
}

impl LoggingSettings {
    fn level_default() -> String {
        "info".into()
    }

    fn directory_default() -> String {
        "logs".into()
    }

    fn file_prefix_default() -> String {
        "plcwire.log".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default)]
        logging: LoggingSettings,
        #[serde(default)]
        name: String,
    }

    #[test]
    fn file_values_are_loaded_and_missing_sections_default() {
        let path = std::env::temp_dir().join(format!("plcwire-settings-{}.toml", std::process::id()));
        {
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, "name = \"line-3\"").unwrap();
            writeln!(f, "[logging]\nlevel = \"debug\"").unwrap();
        }
        let s: Sample = load_settings(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(s.name, "line-3");
        assert_eq!(s.logging.level, "debug");
        assert_eq!(s.logging.directory, "logs");
        assert!(!s.logging.to_file);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let s: Sample = load_settings(Some(Path::new("/nonexistent/plcwire.toml"))).unwrap();
        assert_eq!(s.logging.level, "info");
    }
}
