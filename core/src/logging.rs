use serde_derive::{Deserialize, Serialize};
use sloggers::Config;
use slog::Logger;

/// TOML-shaped logging configuration, handed straight to `sloggers` - the
/// server binary reads this as a fragment of `ServerConfig`, mirroring how
/// `flux::logging::init` builds a `sloggers::LoggerConfig` from a literal
/// TOML string.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: String,
    pub destination: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            kind: "terminal".to_string(),
            level: "info".to_string(),
            destination: "stderr".to_string(),
        }
    }
}

/// Build a root `slog::Logger` from `config`. Components derive a child
/// logger carrying their own name via `logger.new(slog::o!(...))` - the
/// NodeStore only logs at debug level since its hot path must stay
/// allocation-free.
pub fn init(config: &LoggingConfig) -> Logger {
    let toml = serdeconv::to_toml_string(config).expect("logging config always serializes");
    let sloggers_config: sloggers::LoggerConfig =
        serdeconv::from_toml_str(&toml).expect("logging config matches sloggers::LoggerConfig shape");
    sloggers_config
        .build_logger()
        .expect("logger construction cannot fail for the configurations this crate emits")
}
