//! Process configuration read from environment variables.

use kube_controller::{ControllerError, DEFAULT_RECONCILIATION_INTERVAL};
use std::env;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Widget controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Namespace the widgets are watched in (`WATCH_NAMESPACE`)
    pub namespace: String,
    /// Time between reconciliation passes (`RECONCILIATION_INTERVAL_SECONDS`)
    pub reconciliation_interval: Duration,
    /// How long in-flight handlers may take to finish after a shutdown signal
    /// (`SHUTDOWN_TIMEOUT_SECONDS`)
    pub shutdown_timeout: Duration,
    /// Cap on concurrently running event handlers (`MAX_IN_FLIGHT_HANDLERS`)
    pub max_in_flight: Option<NonZeroUsize>,
}

impl Config {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let namespace = lookup("WATCH_NAMESPACE")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let reconciliation_interval = parse::<u64>(&lookup, "RECONCILIATION_INTERVAL_SECONDS")?
            .map_or(DEFAULT_RECONCILIATION_INTERVAL, Duration::from_secs);
        if reconciliation_interval.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "RECONCILIATION_INTERVAL_SECONDS must be greater than zero".to_string(),
            ));
        }

        let shutdown_timeout = parse::<u64>(&lookup, "SHUTDOWN_TIMEOUT_SECONDS")?
            .map_or(DEFAULT_SHUTDOWN_TIMEOUT, Duration::from_secs);

        let max_in_flight = parse::<usize>(&lookup, "MAX_IN_FLIGHT_HANDLERS")?
            .map(|cap| {
                NonZeroUsize::new(cap).ok_or_else(|| {
                    ControllerError::InvalidConfig("MAX_IN_FLIGHT_HANDLERS must be greater than zero".to_string())
                })
            })
            .transpose()?;

        Ok(Self {
            namespace,
            reconciliation_interval,
            shutdown_timeout,
            max_in_flight,
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ControllerError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| {
            ControllerError::InvalidConfig(format!("{key} must be a non-negative integer, got {value:?}"))
        }),
    }
}
