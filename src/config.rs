//! Configuration of the PKI store and the issuance engine.

use std::{fmt, io};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use log::{LevelFilter, info};
use serde::{de, Deserialize, Deserializer};
use url::Url;
use crate::ca::{PkiEngine, PkiStore};
use crate::commons::storage::{Ident, StorageSystem};
use crate::constants::{
    DEFAULT_EC_BITS, DEFAULT_GENERATION_TIMEOUT_SECONDS,
    DEFAULT_MAX_TTL_SECONDS, DEFAULT_RSA_BITS, DEFAULT_STORAGE_URI,
    DEFAULT_TTL_SECONDS, PKI_NS,
};


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn storage_uri() -> Url {
        // The constant is a valid URL.
        Url::parse(DEFAULT_STORAGE_URI).unwrap()
    }

    fn namespace() -> Box<Ident> {
        PKI_NS.into()
    }

    fn log_level() -> LevelFilter {
        LevelFilter::Info
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn default_ttl_seconds() -> u64 {
        DEFAULT_TTL_SECONDS
    }

    fn max_ttl_seconds() -> u64 {
        DEFAULT_MAX_TTL_SECONDS
    }

    fn default_rsa_bits() -> u32 {
        DEFAULT_RSA_BITS
    }

    fn default_ec_bits() -> u32 {
        DEFAULT_EC_BITS
    }

    fn generation_timeout_seconds() -> u64 {
        DEFAULT_GENERATION_TIMEOUT_SECONDS
    }
}


//------------ Config --------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::storage_uri")]
    pub storage_uri: Url,

    /// The storage namespace holding all records.
    #[serde(
        default = "ConfigDefaults::namespace",
        deserialize_with = "de_namespace"
    )]
    pub namespace: Box<Ident>,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    pub log_file: Option<PathBuf>,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default)]
    pub issuance: IssuanceConfig,
}

impl Config {
    /// Reads the config file and initialises logging.
    pub fn parse(file_path: &str) -> Result<Self, ConfigError> {
        let mut v = String::new();

        let mut file = File::open(file_path).map_err(|e| {
            ConfigError::Other(format!(
                "Could not read config file '{file_path}': {e}"
            ))
        })?;

        file.read_to_string(&mut v).map_err(|e| {
            ConfigError::Other(format!(
                "Could not read config file '{file_path}': {e}"
            ))
        })?;

        let config = Self::parse_str(&v)?;

        // ignore init errors
        // they are normally due to double initialising logging
        let _ = config.init_logging();

        Ok(config)
    }

    pub fn parse_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s).map_err(|err| {
            ConfigError::Other(format!("Error parsing config file: {err}"))
        })?;
        config.verify()?;
        Ok(config)
    }

    fn verify(&self) -> Result<(), ConfigError> {
        let issuance = &self.issuance;
        if issuance.default_ttl_seconds == 0 {
            return Err(ConfigError::other(
                "issuance.default_ttl_seconds must be greater than zero"
            ))
        }
        if issuance.default_ttl_seconds > issuance.max_ttl_seconds {
            return Err(ConfigError::other(
                "issuance.default_ttl_seconds exceeds \
                 issuance.max_ttl_seconds"
            ))
        }
        if issuance.generation_timeout_seconds == 0 {
            return Err(ConfigError::other(
                "issuance.generation_timeout_seconds must be greater than zero"
            ))
        }
        Ok(())
    }

    /// Opens the configured storage and creates an engine on top of it.
    pub fn engine(&self) -> Result<PkiEngine, ConfigError> {
        let storage = StorageSystem::new(self.storage_uri.clone()).map_err(|e| {
            ConfigError::Other(format!(
                "Cannot use storage '{}': {}", self.storage_uri, e
            ))
        })?;
        let kv = storage.open(&self.namespace).map_err(|e| {
            ConfigError::Other(format!(
                "Cannot open namespace '{}': {}", self.namespace, e
            ))
        })?;
        info!(
            "Using PKI storage at '{}', namespace '{}'",
            self.storage_uri, self.namespace
        );
        Ok(PkiEngine::new(PkiStore::new(kv), self.issuance.clone()))
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(),
            LogType::Stderr => self.stderr_logger(),
        }
    }

    fn file_logger(&self) -> Result<(), ConfigError> {
        let path = self.log_file.as_ref().ok_or(ConfigError::Other(
            "log_file not configured with log_type = \"file\"".to_owned(),
        ))?;
        let log_file = fern::log_file(path).map_err(|e| {
            ConfigError::Other(format!(
                "Failed to open log file '{}': {}",
                path.display(),
                e
            ))
        })?;

        self.fern_logger().chain(log_file).apply().map_err(|e| {
            ConfigError::Other(format!("Failed to init file logging: {e}"))
        })
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger().chain(io::stderr()).apply().map_err(|e| {
            ConfigError::Other(format!(
                "Failed to init stderr logging: {e}"
            ))
        })
    }

    /// Creates and returns a fern logger with log level tweaks
    fn fern_logger(&self) -> fern::Dispatch {
        // the storage layer traces every single read
        let storage_level = self.log_level.min(LevelFilter::Debug);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;

        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("tokio", self.log_level.min(LevelFilter::Warn))
            .level_for("pkistore::commons::storage", storage_level)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s)
    }
}


//------------ IssuanceConfig ------------------------------------------------

/// Engine-wide limits and defaults for issuing certificates.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct IssuanceConfig {
    #[serde(default = "ConfigDefaults::default_ttl_seconds")]
    pub default_ttl_seconds: u64,

    #[serde(default = "ConfigDefaults::max_ttl_seconds")]
    pub max_ttl_seconds: u64,

    #[serde(default = "ConfigDefaults::default_rsa_bits")]
    pub default_rsa_bits: u32,

    #[serde(default = "ConfigDefaults::default_ec_bits")]
    pub default_ec_bits: u32,

    #[serde(default = "ConfigDefaults::generation_timeout_seconds")]
    pub generation_timeout_seconds: u64,
}

impl IssuanceConfig {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_seconds)
    }
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        IssuanceConfig {
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            max_ttl_seconds: DEFAULT_MAX_TTL_SECONDS,
            default_rsa_bits: DEFAULT_RSA_BITS,
            default_ec_bits: DEFAULT_EC_BITS,
            generation_timeout_seconds: DEFAULT_GENERATION_TIMEOUT_SECONDS,
        }
    }
}


//------------ LogType -------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Stderr,
    File,
}


//------------ Deserialization helpers ---------------------------------------

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

fn de_namespace<'de, D>(d: D) -> Result<Box<Ident>, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    Ident::boxed_from_string(string).map_err(de::Error::custom)
}


//------------ ConfigError ---------------------------------------------------

#[derive(Clone, Debug)]
pub enum ConfigError {
    Other(String),
}

impl ConfigError {
    fn other(msg: impl fmt::Display) -> Self {
        Self::Other(msg.to_string())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Other(msg) => {
                write!(f, "{msg}")
            }
        }
    }
}

impl std::error::Error for ConfigError { }


//------------ Tests ---------------------------------------------------------
