use std::{
    env,
    fmt::{self, Display},
    num::NonZeroU32,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use stampede::{
    cleaner,
    config::{self, Config, Overrides, PartialConfig},
    fleet::{self, Fleet},
    planner,
};
use tokio::runtime::Builder;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("Workspace cleanup failed: {0}")]
    Cleaner(#[from] cleaner::Error),
    #[error("Fleet error: {0}")]
    Fleet(#[from] fleet::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{failed} of {total} workers exited non-zero")]
    WorkerFailures { failed: usize, total: usize },
}

#[derive(Default, Clone)]
struct CliKeyValues {
    inner: FxHashMap<String, String>,
}

impl CliKeyValues {
    #[cfg(test)]
    fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }
}

impl Display for CliKeyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        for (k, v) in &self.inner {
            write!(f, "{k}={v},")?;
        }
        Ok(())
    }
}

impl FromStr for CliKeyValues {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        // A key always matches `[[:alpha:]_]+` and is always followed by a
        // '=' and then a value. Pairs are delimited by ',' but ',' is also a
        // valid character in a value, so the key notion is used as the
        // delimiter and values are tidied up afterward.
        static RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"([[:alpha:]_]+)=").expect("Invalid regex pattern provided"));

        let mut variables = FxHashMap::default();

        for cap in RE.captures_iter(input) {
            let key = cap[1].to_string();
            let start = cap.get(0).expect("value 0 not found in Captures").end();

            // Find the next key or run into the end of the input.
            let end = RE.find_at(input, start).map_or(input.len(), |m| m.start());

            let value = input[start..end].trim_end_matches(',').to_string();

            variables.insert(key, value);
        }

        Ok(Self { inner: variables })
    }
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// number of worker processes to launch
    workers: NonZeroU32,
    /// aggregate request rate across all workers, requests per second
    total_rate: f64,
    /// presence of any third token enables capture mode; its value is
    /// ignored
    capture_token: Option<String>,
    /// address of the cache server under load, HOST:PORT; falls back to the
    /// STAMPEDE_TARGET_ADDR environment variable
    #[clap(long)]
    target_addr: Option<String>,
    /// path to the workload binary
    #[clap(long)]
    worker_path: Option<PathBuf>,
    /// seconds each worker ramps before steady-state measurement
    #[clap(long)]
    warmup_seconds: Option<u32>,
    /// worker-side measurement window parameter
    #[clap(long)]
    window_size: Option<u32>,
    /// directory where capture files are written and cleaned
    #[clap(long)]
    capture_dir: Option<PathBuf>,
    /// maximum time, in seconds, to wait for the fleet to drain; unbounded
    /// when unset
    #[clap(long)]
    wait_timeout_seconds: Option<u64>,
    /// additional environment variables for every worker, format
    /// KEY=VAL,KEY2=VAL
    #[clap(long)]
    worker_env: Option<CliKeyValues>,
    /// path on disk to an optional configuration file
    #[clap(long)]
    config_path: Option<PathBuf>,
}

fn load_partial(config_path: Option<&Path>) -> Result<PartialConfig, Error> {
    if let Ok(env_var_value) = env::var("STAMPEDE_CONFIG") {
        debug!("Using config from env var 'STAMPEDE_CONFIG'");
        return Ok(config::parse_partial(&env_var_value)?);
    }
    match config_path {
        Some(path) => {
            debug!(
                "Attempting to open configuration file at: {}",
                path.display()
            );
            Ok(config::load_partial_from_path(path)?)
        }
        None => Ok(PartialConfig::default()),
    }
}

fn get_config(cli: &Cli) -> Result<Config, Error> {
    let partial = load_partial(cli.config_path.as_deref())?;

    let target_addr = cli
        .target_addr
        .clone()
        .or_else(|| env::var("STAMPEDE_TARGET_ADDR").ok());

    let overrides = Overrides {
        target_addr,
        worker_command: cli.worker_path.clone(),
        warmup_seconds: cli.warmup_seconds,
        window_size: cli.window_size,
        capture_directory: cli.capture_dir.clone(),
        wait_timeout_seconds: cli.wait_timeout_seconds,
        worker_environment_variables: cli.worker_env.clone().unwrap_or_default().inner,
    };

    Ok(Config::from_parts(
        cli.workers,
        cli.total_rate,
        cli.capture_token.is_some(),
        overrides,
        partial,
    )?)
}

async fn inner_main(config: Config) -> Result<(), Error> {
    // Stale captures from a prior run must not survive into this one,
    // whether or not capture is enabled now.
    let removed = cleaner::clean(&config.capture_directory)?;
    if removed > 0 {
        info!("removed {removed} stale capture files");
    }

    let specs = planner::plan(&config);
    info!(
        "starting {count} workers at {total} req/s aggregate against {addr}",
        count = config.worker_count,
        total = config.total_rate,
        addr = config.target_addr,
    );

    let mut fleet = Fleet::new(config.worker_command, specs)
        .environment_variables(config.worker_environment_variables);
    if let Some(seconds) = config.wait_timeout_seconds {
        fleet = fleet.wait_timeout(Duration::from_secs(seconds));
    }
    let summary = fleet.run().await?;

    let total = summary.outcomes().len();
    let failed = summary.failed().count();
    for outcome in summary.failed() {
        error!(
            "worker {index} exited with {status}",
            index = outcome.index,
            status = outcome.status,
        );
    }
    if failed > 0 {
        return Err(Error::WorkerFailures { failed, total });
    }
    info!("all {total} workers exited successfully");
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting stampede {version} run.");

    let cli = Cli::parse();
    let config = get_config(&cli)?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(inner_main(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_positional_token_enables_capture() {
        let cli = Cli::try_parse_from(["stampede", "5", "190000", "anything"])
            .expect("arguments did not parse");
        assert_eq!(cli.workers.get(), 5);
        assert!((cli.total_rate - 190_000.0).abs() < f64::EPSILON);
        assert!(cli.capture_token.is_some());

        let cli =
            Cli::try_parse_from(["stampede", "5", "190000"]).expect("arguments did not parse");
        assert!(cli.capture_token.is_none());
    }

    #[test]
    fn config_resolves_from_cli_flags() {
        let cli = Cli::try_parse_from([
            "stampede",
            "5",
            "190000",
            "--target-addr",
            "192.168.1.11:11211",
            "--worker-path",
            "/opt/bench/mutated_memcache",
        ])
        .expect("arguments did not parse");

        let config = get_config(&cli).expect("config did not resolve");
        assert_eq!(config.worker_count.get(), 5);
        assert_eq!(config.target_addr, "192.168.1.11:11211");
        assert_eq!(
            config.worker_command,
            PathBuf::from("/opt/bench/mutated_memcache")
        );
        assert!(!config.capture);
    }

    #[test]
    fn missing_worker_count_is_a_parse_error() {
        let result = Cli::try_parse_from(["stampede"]);
        assert!(result.is_err());
    }

    #[test]
    fn non_numeric_arguments_are_parse_errors() {
        assert!(Cli::try_parse_from(["stampede", "five", "190000"]).is_err());
        assert!(Cli::try_parse_from(["stampede", "5", "fast"]).is_err());
        assert!(Cli::try_parse_from(["stampede", "0", "190000"]).is_err());
    }

    #[test]
    fn cli_key_values_deserializes_empty_string_to_empty_set() {
        let val = "";
        let deser = CliKeyValues::from_str(val);
        let deser = deser
            .expect("String could not be converted into valid CliKeyValues")
            .to_string();
        assert_eq!("", deser);
    }

    #[test]
    fn cli_key_values_deserializes_kv_list() {
        let val = "first=one,second=two";
        let deser =
            CliKeyValues::from_str(val).expect("String cannot be converted into CliKeyValues");

        assert_eq!(
            deser.get("first").expect("Deser does not have key first"),
            "one"
        );
        assert_eq!(
            deser.get("second").expect("Deser does not have key second"),
            "two"
        );
    }

    #[test]
    fn cli_key_values_deserializes_separated_value_kv_comma() {
        let val = "MEMCACHE_FLAGS=a:1,b:2,WORKER_NICE=5";
        let deser =
            CliKeyValues::from_str(val).expect("String cannot be converted into CliKeyValues");

        assert_eq!(
            deser
                .get("MEMCACHE_FLAGS")
                .expect("MEMCACHE_FLAGS is not a valid key for the map"),
            "a:1,b:2"
        );
        assert_eq!(
            deser
                .get("WORKER_NICE")
                .expect("WORKER_NICE is not a valid key for the map"),
            "5"
        );
    }
}
