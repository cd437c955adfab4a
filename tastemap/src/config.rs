use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(default = "tastemap.sqlite")]
    pub database_path: PathBuf,

    /// Age of the storage file beyond which an incremental refresh runs.
    #[envconfig(default = "14")]
    pub update_interval: EnvDaysDuration,

    #[envconfig(nested = true)]
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct UpstreamConfig {
    #[envconfig(default = "https://data.cityofnewyork.us")]
    pub base_url: String,

    pub app_token: Option<String>,

    #[envconfig(default = "200000")]
    pub row_limit: u32,

    /// Years since the last inspection beyond which rows are expired.
    #[envconfig(default = "2")]
    pub cutoff_years: u32,

    #[envconfig(default = "15")]
    pub request_timeout: EnvSecsDuration,

    /// Total attempts for a single acquisition, timeouts only.
    #[envconfig(default = "2")]
    pub retries: u32,

    #[envconfig(default = "10")]
    pub retry_delay: EnvSecsDuration,

    /// Pause between two acquisitions against the shared upstream service.
    #[envconfig(default = "10")]
    pub sleep_between_calls: EnvSecsDuration,

    /// Cache of fast-food names; skips the second upstream call when present.
    #[envconfig(default = "fastfood.csv")]
    pub fastfood_cache: PathBuf,

    /// Cleaned census data, one `borough,population` row per borough.
    #[envconfig(default = "census_population.csv")]
    pub population_csv: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvSecsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecsDurationError;

impl FromStr for EnvSecsDuration {
    type Err = ParseEnvSecsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<u64>().map_err(|_| ParseEnvSecsDurationError)?;

        Ok(EnvSecsDuration(time::Duration::from_secs(secs)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvDaysDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvDaysDurationError;

impl FromStr for EnvDaysDuration {
    type Err = ParseEnvDaysDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let days = s.parse::<u64>().map_err(|_| ParseEnvDaysDurationError)?;

        Ok(EnvDaysDuration(time::Duration::from_secs(days * 24 * 60 * 60)))
    }
}
