//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.

use std::{
    fs, io,
    num::NonZeroU32,
    path::{Path, PathBuf},
};

use rustc_hash::FxHashMap;
use serde::Deserialize;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// No target address was supplied by any configuration source
    #[error(
        "No target address supplied; set --target-addr, STAMPEDE_TARGET_ADDR or target_addr in the config file"
    )]
    MissingTargetAddr,
    /// The aggregate rate is not a positive, finite number
    #[error("Total rate must be a positive, finite number, got {0}")]
    InvalidTotalRate(f64),
}

fn default_warmup_seconds() -> u32 {
    5
}

fn default_window_size() -> u32 {
    10_000
}

fn default_worker_command() -> PathBuf {
    PathBuf::from("client/mutated_memcache")
}

fn default_capture_directory() -> PathBuf {
    PathBuf::from(".")
}

/// Main configuration struct for this program
///
/// Immutable once resolved. The target address is never a process-wide
/// constant: it must arrive through one of the configuration sources.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Number of worker processes to launch.
    pub worker_count: NonZeroU32,
    /// Aggregate request rate across all workers, requests per second.
    pub total_rate: f64,
    /// Address of the cache server under load, `host:port`.
    pub target_addr: String,
    /// Path to the workload binary.
    pub worker_command: PathBuf,
    /// Seconds each worker ramps before steady-state measurement.
    pub warmup_seconds: u32,
    /// Worker-side measurement window parameter.
    pub window_size: u32,
    /// Whether each worker's stdout report is captured to disk.
    pub capture: bool,
    /// Directory where capture files are written and cleaned.
    pub capture_directory: PathBuf,
    /// Maximum seconds to wait for the fleet to drain, unbounded when unset.
    pub wait_timeout_seconds: Option<u64>,
    /// Additional environment variables set for every worker.
    pub worker_environment_variables: FxHashMap<String, String>,
}

/// Partial configuration as read from an on-disk YAML file
///
/// All fields are optional so a file may specify only the deployment knobs
/// it cares about. The run shape -- worker count, rate, capture toggle --
/// always comes from the command line.
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    /// Address of the cache server under load, `host:port`.
    pub target_addr: Option<String>,
    /// Path to the workload binary.
    pub worker_command: Option<PathBuf>,
    /// Seconds each worker ramps before steady-state measurement.
    pub warmup_seconds: Option<u32>,
    /// Worker-side measurement window parameter.
    pub window_size: Option<u32>,
    /// Directory where capture files are written and cleaned.
    pub capture_directory: Option<PathBuf>,
    /// Maximum seconds to wait for the fleet to drain.
    pub wait_timeout_seconds: Option<u64>,
    /// Additional environment variables set for every worker.
    #[serde(default)]
    pub worker_environment_variables: FxHashMap<String, String>,
}

/// Command-line overrides applied on top of a [`PartialConfig`]
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    /// Address of the cache server under load, `host:port`.
    pub target_addr: Option<String>,
    /// Path to the workload binary.
    pub worker_command: Option<PathBuf>,
    /// Seconds each worker ramps before steady-state measurement.
    pub warmup_seconds: Option<u32>,
    /// Worker-side measurement window parameter.
    pub window_size: Option<u32>,
    /// Directory where capture files are written and cleaned.
    pub capture_directory: Option<PathBuf>,
    /// Maximum seconds to wait for the fleet to drain.
    pub wait_timeout_seconds: Option<u64>,
    /// Additional environment variables set for every worker.
    pub worker_environment_variables: FxHashMap<String, String>,
}

impl Config {
    /// Resolve a `Config` from the run shape, CLI overrides and an optional
    /// file layer
    ///
    /// Overrides win over file values, file values over built-in defaults.
    /// Worker environment variables compose, CLI keys winning on collision.
    ///
    /// # Errors
    ///
    /// Returns an error if `total_rate` is not a positive, finite number or
    /// if no source supplied a target address.
    pub fn from_parts(
        worker_count: NonZeroU32,
        total_rate: f64,
        capture: bool,
        overrides: Overrides,
        partial: PartialConfig,
    ) -> Result<Self, Error> {
        if !total_rate.is_finite() || total_rate <= 0.0 {
            return Err(Error::InvalidTotalRate(total_rate));
        }

        let target_addr = overrides
            .target_addr
            .or(partial.target_addr)
            .ok_or(Error::MissingTargetAddr)?;

        let mut worker_environment_variables = partial.worker_environment_variables;
        worker_environment_variables.extend(overrides.worker_environment_variables);

        Ok(Self {
            worker_count,
            total_rate,
            target_addr,
            worker_command: overrides
                .worker_command
                .or(partial.worker_command)
                .unwrap_or_else(default_worker_command),
            warmup_seconds: overrides
                .warmup_seconds
                .or(partial.warmup_seconds)
                .unwrap_or_else(default_warmup_seconds),
            window_size: overrides
                .window_size
                .or(partial.window_size)
                .unwrap_or_else(default_window_size),
            capture,
            capture_directory: overrides
                .capture_directory
                .or(partial.capture_directory)
                .unwrap_or_else(default_capture_directory),
            wait_timeout_seconds: overrides
                .wait_timeout_seconds
                .or(partial.wait_timeout_seconds),
            worker_environment_variables,
        })
    }
}

/// Parse a [`PartialConfig`] from YAML contents
///
/// # Errors
///
/// Returns an error if the contents are not valid YAML for the schema.
pub fn parse_partial(contents: &str) -> Result<PartialConfig, Error> {
    serde_yaml::from_str(contents).map_err(Error::from)
}

/// Load a [`PartialConfig`] from a YAML file on disk
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains invalid YAML.
pub fn load_partial_from_path(path: &Path) -> Result<PartialConfig, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    parse_partial(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn non_zero(value: u32) -> NonZeroU32 {
        NonZeroU32::new(value).expect("value must be non-zero")
    }

    #[test]
    fn partial_config_deserializes() -> Result<(), Error> {
        let contents = r#"
target_addr: "192.168.1.11:11211"
worker_command: "/opt/bench/mutated_memcache"
warmup_seconds: 10
worker_environment_variables:
  MALLOC_ARENA_MAX: "2"
"#;
        let partial = parse_partial(contents)?;
        assert_eq!(
            partial.target_addr,
            Some(String::from("192.168.1.11:11211"))
        );
        assert_eq!(
            partial.worker_command,
            Some(PathBuf::from("/opt/bench/mutated_memcache"))
        );
        assert_eq!(partial.warmup_seconds, Some(10));
        assert_eq!(partial.window_size, None);
        assert_eq!(
            partial.worker_environment_variables.get("MALLOC_ARENA_MAX"),
            Some(&String::from("2"))
        );
        Ok(())
    }

    #[test]
    fn partial_config_rejects_unknown_fields() {
        let contents = r#"
target_addr: "192.168.1.11:11211"
server: "oops"
"#;
        let result = parse_partial(contents);
        assert!(matches!(result, Err(Error::SerdeYaml(_))));
    }

    #[test]
    fn defaults_apply_when_sources_are_silent() -> Result<(), Error> {
        let overrides = Overrides {
            target_addr: Some(String::from("10.0.0.1:11211")),
            ..Overrides::default()
        };
        let config = Config::from_parts(
            non_zero(5),
            190_000.0,
            false,
            overrides,
            PartialConfig::default(),
        )?;

        assert_eq!(config.warmup_seconds, 5);
        assert_eq!(config.window_size, 10_000);
        assert_eq!(
            config.worker_command,
            PathBuf::from("client/mutated_memcache")
        );
        assert_eq!(config.capture_directory, PathBuf::from("."));
        assert_eq!(config.wait_timeout_seconds, None);
        Ok(())
    }

    #[test]
    fn overrides_win_over_file_layer() -> Result<(), Error> {
        let partial = PartialConfig {
            target_addr: Some(String::from("file:11211")),
            warmup_seconds: Some(30),
            ..PartialConfig::default()
        };
        let overrides = Overrides {
            target_addr: Some(String::from("cli:11211")),
            ..Overrides::default()
        };
        let config = Config::from_parts(non_zero(1), 100.0, true, overrides, partial)?;

        assert_eq!(config.target_addr, "cli:11211");
        // File value survives where the CLI is silent.
        assert_eq!(config.warmup_seconds, 30);
        assert!(config.capture);
        Ok(())
    }

    #[test]
    fn worker_environment_variables_compose() -> Result<(), Error> {
        let mut file_env = FxHashMap::default();
        file_env.insert(String::from("A"), String::from("file"));
        file_env.insert(String::from("B"), String::from("file"));
        let partial = PartialConfig {
            target_addr: Some(String::from("10.0.0.1:11211")),
            worker_environment_variables: file_env,
            ..PartialConfig::default()
        };

        let mut cli_env = FxHashMap::default();
        cli_env.insert(String::from("B"), String::from("cli"));
        let overrides = Overrides {
            worker_environment_variables: cli_env,
            ..Overrides::default()
        };

        let config = Config::from_parts(non_zero(2), 50.0, false, overrides, partial)?;
        assert_eq!(
            config.worker_environment_variables.get("A"),
            Some(&String::from("file"))
        );
        assert_eq!(
            config.worker_environment_variables.get("B"),
            Some(&String::from("cli"))
        );
        Ok(())
    }

    #[test]
    fn missing_target_addr_is_fatal() {
        let result = Config::from_parts(
            non_zero(1),
            100.0,
            false,
            Overrides::default(),
            PartialConfig::default(),
        );
        assert!(matches!(result, Err(Error::MissingTargetAddr)));
    }

    #[test]
    fn non_positive_or_non_finite_rates_are_rejected() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let result = Config::from_parts(
                non_zero(1),
                rate,
                false,
                Overrides::default(),
                PartialConfig::default(),
            );
            assert!(
                matches!(result, Err(Error::InvalidTotalRate(_))),
                "rate {rate} should be rejected"
            );
        }
    }
}
