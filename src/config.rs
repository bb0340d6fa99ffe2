use crate::error::{Error, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "PERPBOT";
const DEFAULT_CONFIG_FILE: &str = "perpbot.toml";

/// Conventional variable names, applied after the prefixed environment.
const CREDENTIAL_VARS: &[(&str, &str)] = &[
    ("TAAPI_API_KEY", "taapi.api_key"),
    ("OKX_API_KEY", "okx.api_key"),
    ("OKX_SECRET_KEY", "okx.secret_key"),
    ("OKX_PASSPHRASE", "okx.passphrase"),
    ("OKX_FLAG", "okx.flag"),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub taapi: TaapiSettings,
    pub okx: OkxSettings,
    pub diary_path: String,
    pub assets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaapiSettings {
    pub api_key: String,
    pub base_url: String,
    pub bulk_url: String,
    /// Exchange TAAPI computes candles from (not the one we trade on)
    pub exchange: String,
    pub enable_cache: bool,
    pub cache_ttl_secs: u64,
    pub horizon_delay_secs: u64,
    pub max_calculations: u32,
    pub retry_attempts: u32,
    pub retry_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OkxSettings {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
    /// "0" = demo trading, "1" = live
    pub flag: String,
    pub base_url: String,
    pub requests_per_second: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            taapi: TaapiSettings::default(),
            okx: OkxSettings::default(),
            diary_path: "data/diary.jsonl".to_string(),
            assets: vec!["BTC".to_string(), "ETH".to_string()],
        }
    }
}

impl Default for TaapiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.taapi.io/".to_string(),
            bulk_url: "https://api.taapi.io/bulk".to_string(),
            exchange: "binance".to_string(),
            enable_cache: true,
            cache_ttl_secs: 60,
            horizon_delay_secs: 30,
            max_calculations: 20,
            retry_attempts: 10,
            retry_backoff_secs: 5,
        }
    }
}

impl Default for OkxSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            passphrase: String::new(),
            flag: "0".to_string(),
            base_url: "https://www.okx.com".to_string(),
            requests_per_second: 10,
        }
    }
}

impl TaapiSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn horizon_delay(&self) -> Duration {
        Duration::from_secs(self.horizon_delay_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

impl OkxSettings {
    pub fn is_demo(&self) -> bool {
        self.flag != "1"
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and the process environment.
    ///
    /// Without an explicit path, `perpbot.toml` in the working directory is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::build(path, None)
    }

    /// Same as [`Settings::load`] but reads variables from `vars` instead of the process
    /// environment.
    pub fn load_from_vars(path: Option<&Path>, vars: HashMap<String, String>) -> Result<Self> {
        Self::build(path, Some(vars))
    }

    fn build(path: Option<&Path>, vars: Option<HashMap<String, String>>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p).format(FileFormat::Toml).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE)
                .format(FileFormat::Toml)
                .required(false),
        };

        let environment = Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("assets")
            .try_parsing(true)
            .source(vars.clone());

        let mut builder = Config::builder().add_source(file).add_source(environment);

        for (var, key) in CREDENTIAL_VARS {
            let value = match &vars {
                Some(map) => map.get(*var).cloned(),
                None => std::env::var(var).ok(),
            };
            builder = builder
                .set_override_option(*key, value.filter(|v| !v.is_empty()))
                .map_err(config_error)?;
        }

        let settings: Settings = builder
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;

        tracing::debug!(
            assets = ?settings.assets,
            demo = settings.okx.is_demo(),
            "Loaded settings"
        );

        Ok(settings)
    }
}

fn config_error(e: config::ConfigError) -> Error {
    Error::Configuration(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_sources() {
        let settings = Settings::load_from_vars(None, HashMap::new()).unwrap();

        assert_eq!(settings.taapi.cache_ttl(), Duration::from_secs(60));
        assert_eq!(settings.taapi.horizon_delay(), Duration::from_secs(30));
        assert_eq!(settings.taapi.retry_attempts, 10);
        assert_eq!(settings.taapi.max_calculations, 20);
        assert_eq!(settings.okx.flag, "0");
        assert!(settings.okx.is_demo());
        assert_eq!(settings.diary_path, "data/diary.jsonl");
        assert!(settings.taapi.api_key.is_empty());
    }

    #[test]
    fn test_credential_vars_override() {
        let vars = HashMap::from([
            ("TAAPI_API_KEY".to_string(), "taapi-secret".to_string()),
            ("OKX_API_KEY".to_string(), "okx-key".to_string()),
            ("OKX_SECRET_KEY".to_string(), "okx-secret".to_string()),
            ("OKX_PASSPHRASE".to_string(), "pass".to_string()),
            ("OKX_FLAG".to_string(), "1".to_string()),
        ]);

        let settings = Settings::load_from_vars(None, vars).unwrap();

        assert_eq!(settings.taapi.api_key, "taapi-secret");
        assert_eq!(settings.okx.api_key, "okx-key");
        assert_eq!(settings.okx.secret_key, "okx-secret");
        assert_eq!(settings.okx.passphrase, "pass");
        assert!(!settings.okx.is_demo());
    }

    #[test]
    fn test_prefixed_env_and_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "diary_path = \"/tmp/diary.jsonl\"\n\n[taapi]\ncache_ttl_secs = 90\nhorizon_delay_secs = 20"
        )
        .unwrap();

        let vars = HashMap::from([
            ("PERPBOT__TAAPI__HORIZON_DELAY_SECS".to_string(), "45".to_string()),
            ("PERPBOT__ASSETS".to_string(), "SOL,DOGE".to_string()),
        ]);

        let settings = Settings::load_from_vars(Some(file.path()), vars).unwrap();

        assert_eq!(settings.diary_path, "/tmp/diary.jsonl");
        assert_eq!(settings.taapi.cache_ttl_secs, 90);
        // environment wins over the file
        assert_eq!(settings.taapi.horizon_delay_secs, 45);
        assert_eq!(settings.assets, vec!["SOL".to_string(), "DOGE".to_string()]);
    }

    #[test]
    fn test_env_assets_list_and_string_fields() {
        let vars = HashMap::from([
            ("PERPBOT__ASSETS".to_string(), "SOL,DOGE".to_string()),
            ("PERPBOT__OKX__FLAG".to_string(), "1".to_string()),
            ("PERPBOT__OKX__REQUESTS_PER_SECOND".to_string(), "5".to_string()),
            ("PERPBOT__TAAPI__ENABLE_CACHE".to_string(), "false".to_string()),
        ]);

        let settings = Settings::load_from_vars(None, vars).unwrap();

        assert_eq!(settings.assets, vec!["SOL".to_string(), "DOGE".to_string()]);
        assert_eq!(settings.okx.flag, "1");
        assert!(!settings.okx.is_demo());
        assert_eq!(settings.okx.requests_per_second, 5);
        assert!(!settings.taapi.enable_cache);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let result = Settings::load_from_vars(
            Some(Path::new("/nonexistent/perpbot.toml")),
            HashMap::new(),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
