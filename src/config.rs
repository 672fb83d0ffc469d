use std::str::FromStr;
use std::time::Duration;

use crate::calibration::pipeline::DEFAULT_ADVISOR_TIMEOUT;
use crate::error::RiskError;
use crate::risk::{DEFAULT_FORECAST_DAYS, DEFAULT_LOOKBACK_DAYS};

pub const DEFAULT_ADVISOR_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = RiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(RiskError::Config(format!("LOG_FORMAT '{other}' is not text or json"))),
        }
    }
}

/// Runtime settings read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: Option<String>,
    /// Chat-completions endpoint; calibration runs offline without it.
    pub advisor_url: Option<String>,
    pub advisor_api_key: Option<String>,
    pub advisor_model: String,
    pub advisor_timeout: Duration,
    pub lookback_days: i64,
    pub forecast_days: usize,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            advisor_url: None,
            advisor_api_key: None,
            advisor_model: DEFAULT_ADVISOR_MODEL.to_string(),
            advisor_timeout: DEFAULT_ADVISOR_TIMEOUT,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            forecast_days: DEFAULT_FORECAST_DAYS,
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up
    /// a local `.env`.
    pub fn from_env() -> Result<Self, RiskError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RiskError> {
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Config::default();

        let advisor_timeout = match value("ADVISOR_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_number::<u64>("ADVISOR_TIMEOUT_SECS", &raw)?),
            None => defaults.advisor_timeout,
        };
        let lookback_days = match value("RISK_LOOKBACK_DAYS") {
            Some(raw) => parse_number::<i64>("RISK_LOOKBACK_DAYS", &raw)?,
            None => defaults.lookback_days,
        };
        if lookback_days < 0 {
            return Err(RiskError::Config("RISK_LOOKBACK_DAYS must not be negative".to_string()));
        }
        let forecast_days = match value("RISK_FORECAST_DAYS") {
            Some(raw) => parse_number::<usize>("RISK_FORECAST_DAYS", &raw)?,
            None => defaults.forecast_days,
        };
        let log_format = match value("LOG_FORMAT") {
            Some(raw) => raw.parse()?,
            None => defaults.log_format,
        };

        Ok(Self {
            database_url: value("DATABASE_URL"),
            advisor_url: value("ADVISOR_URL"),
            advisor_api_key: value("ADVISOR_API_KEY"),
            advisor_model: value("ADVISOR_MODEL").unwrap_or(defaults.advisor_model),
            advisor_timeout,
            lookback_days,
            forecast_days,
            log_format,
        })
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T, RiskError> {
    raw.trim()
        .parse()
        .map_err(|_| RiskError::Config(format!("{key} has invalid value '{raw}'")))
}
