use std::path::PathBuf;

use thiserror::Error;

/// Engine configuration from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    /// Replay history into projections before going live.
    pub catch_up: bool,
}

impl Config {
    /// Load configuration from environment variables.
    /// LEDGERFOLD_DB_PATH defaults to "./ledgerfold.redb",
    /// LEDGERFOLD_CATCH_UP defaults to true.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_path = lookup("LEDGERFOLD_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./ledgerfold.redb"));

        let catch_up = match lookup("LEDGERFOLD_CATCH_UP").as_deref() {
            None | Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "LEDGERFOLD_CATCH_UP",
                    "must be true, false, 1 or 0",
                ))
            }
        };

        Ok(Config { db_path, catch_up })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: PathBuf::from("./ledgerfold.redb"),
            catch_up: true,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
