use clap::Parser;
use regex::Regex;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error_handling::types::HostError;

/// Host configuration, parsed from the command line with environment
/// variable fallbacks.
///
/// # Fields Overview
///
/// - `sim`: regular expression selecting the simulators to run
/// - `client`: comma-separated allow-list of client types to build
/// - `sim_parallelism`: client-container cap per simulator, exported as
///   `HIVE_PARALLELISM`
/// - `results_root`: where suite reports and log files are written
/// - `docker_nocache`: image name fragments forced to rebuild
/// - `loglevel`: 0-6, mapped onto the `log` crate's level filter
#[derive(Parser, Debug, Clone)]
#[command(name = "hive")]
#[command(about = "Ethereum end-to-end test harness host")]
pub struct Config {
    /// Regular expression selecting the simulators to run.
    #[arg(long = "sim", env = "HIVE_SIM")]
    pub sim: Option<String>,

    /// Comma-separated list of client types to build and offer to
    /// simulators. All discovered clients are built when unset.
    #[arg(long = "client", env = "HIVE_CLIENTS")]
    pub client: Option<String>,

    /// Maximum number of client containers a simulator should run in
    /// parallel. Exported to simulators; the host does not enforce it.
    #[arg(long = "sim.parallelism", default_value_t = 1, env = "HIVE_PARALLELISM")]
    pub sim_parallelism: usize,

    /// Test name pattern forwarded to simulators as HIVE_TEST_PATTERN.
    #[arg(long = "sim.testpattern", env = "HIVE_TEST_PATTERN")]
    pub sim_test_pattern: Option<String>,

    /// Wall-clock deadline for a single simulator run, in seconds.
    #[arg(long = "sim.timeout", default_value_t = 3600, env = "HIVE_SIM_TIMEOUT")]
    pub sim_timeout_secs: u64,

    /// Directory receiving suite reports and log files.
    #[arg(long = "results-root", default_value = "./workspace/logs", env = "HIVE_RESULTS_ROOT")]
    pub results_root: PathBuf,

    /// Directory tree holding client definitions.
    #[arg(long = "clients-root", default_value = "./clients", env = "HIVE_CLIENTS_ROOT")]
    pub clients_root: PathBuf,

    /// Directory tree holding simulator definitions.
    #[arg(long = "sims-root", default_value = "./simulators", env = "HIVE_SIMS_ROOT")]
    pub sims_root: PathBuf,

    /// Comma-separated image name fragments whose images are rebuilt
    /// without the layer cache.
    #[arg(long = "docker-nocache", env = "HIVE_DOCKER_NOCACHE")]
    pub docker_nocache: Option<String>,

    /// Container runtime binary.
    #[arg(long = "docker-bin", default_value = "docker", env = "HIVE_DOCKER_BIN")]
    pub docker_bin: String,

    /// Log verbosity, 0 (off) to 6 (trace).
    #[arg(long = "loglevel", default_value_t = 3, env = "HIVE_LOGLEVEL")]
    pub loglevel: u8,

    /// Address the control plane binds on. When unset, the backend's
    /// bridge gateway is used so containers can reach the API.
    #[arg(long = "api-host", env = "HIVE_API_HOST")]
    pub api_host: Option<IpAddr>,
}

impl Config {
    pub fn client_list(&self) -> Option<Vec<String>> {
        self.client.as_deref().map(split_list)
    }

    pub fn nocache_list(&self) -> Vec<String> {
        self.docker_nocache.as_deref().map(split_list).unwrap_or_default()
    }

    pub fn sim_pattern(&self) -> Result<Option<Regex>, HostError> {
        match self.sim.as_deref() {
            None => Ok(None),
            Some(raw) => Regex::new(raw)
                .map(Some)
                .map_err(|e| HostError::Config(format!("bad --sim pattern {:?}: {}", raw, e))),
        }
    }

    pub fn suite_timeout(&self) -> Duration {
        Duration::from_secs(self.sim_timeout_secs)
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        match self.loglevel {
            0 => log::LevelFilter::Off,
            1 => log::LevelFilter::Error,
            2 => log::LevelFilter::Warn,
            3 => log::LevelFilter::Info,
            4 | 5 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["hive"]).unwrap();
        assert_eq!(config.sim_parallelism, 1);
        assert_eq!(config.loglevel, 3);
        assert_eq!(config.results_root, PathBuf::from("./workspace/logs"));
        assert_eq!(config.docker_bin, "docker");
        assert!(config.client_list().is_none());
        assert!(config.nocache_list().is_empty());
        assert!(config.sim_pattern().unwrap().is_none());
    }

    #[test]
    fn test_flag_parsing() {
        let config = Config::try_parse_from([
            "hive",
            "--sim",
            "devp2p/.*",
            "--client",
            "go-ethereum_latest, parity_latest",
            "--sim.parallelism",
            "4",
            "--docker-nocache",
            "go-ethereum",
            "--loglevel",
            "5",
        ])
        .unwrap();

        assert_eq!(
            config.client_list().unwrap(),
            vec!["go-ethereum_latest".to_string(), "parity_latest".to_string()]
        );
        assert_eq!(config.nocache_list(), vec!["go-ethereum".to_string()]);
        assert_eq!(config.sim_parallelism, 4);
        assert_eq!(config.level_filter(), log::LevelFilter::Debug);

        let pattern = config.sim_pattern().unwrap().unwrap();
        assert!(pattern.is_match("devp2p/discovery"));
        assert!(!pattern.is_match("smoke"));
    }

    #[test]
    fn test_bad_sim_pattern() {
        let config = Config::try_parse_from(["hive", "--sim", "["]).unwrap();
        assert!(config.sim_pattern().is_err());
    }

    #[test]
    fn test_level_filter_range() {
        let mut config = Config::try_parse_from(["hive"]).unwrap();
        config.loglevel = 0;
        assert_eq!(config.level_filter(), log::LevelFilter::Off);
        config.loglevel = 6;
        assert_eq!(config.level_filter(), log::LevelFilter::Trace);
    }
}
