//! Run environment and typed plan configuration.

use crate::error::PlanError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// What process bootstrap hands a node at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEnv {
    /// Name of the test case to execute
    pub test_case: String,

    /// Total number of nodes in the run
    pub instance_count: u64,

    /// Number of nodes in this node's group
    pub group_instance_count: u64,

    /// Whether simulated-network control is available
    pub sidecar: bool,

    /// Host name, used to address network-control topics
    pub hostname: String,

    /// Raw test parameters
    pub params: BTreeMap<String, String>,
}

impl RunEnv {
    /// Creates an environment with a single group and no network control.
    pub fn new(test_case: impl Into<String>, instance_count: u64) -> Self {
        Self {
            test_case: test_case.into(),
            instance_count,
            group_instance_count: instance_count,
            sidecar: false,
            hostname: String::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn with_sidecar(mut self, hostname: impl Into<String>) -> Self {
        self.sidecar = true;
        self.hostname = hostname.into();
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Parses an integer parameter; `None` when absent.
    pub fn int_param(&self, name: &str) -> Result<Option<i64>, PlanError> {
        match self.param(name) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<i64>().map(Some).map_err(|_| PlanError::InvalidParam {
                name: name.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    /// First present integer parameter among `names`.
    fn first_int_param(&self, names: &[&str]) -> Result<Option<i64>, PlanError> {
        for name in names {
            if let Some(value) = self.int_param(name)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

/// Parameter names carrying the role ratio, by scenario.
const RATIO_PARAMS: &[&str] = &["pushersPerReceiver", "pullersPerRemote", "connectorsRatio", "ratio"];
const SCENARIO_TIMEOUT_PARAMS: &[&str] = &["profile_timeout_sec", "scenario_timeout_secs"];

/// Longest accepted run or scenario timeout (one week).
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Longest accepted link latency (one hour).
pub const MAX_LATENCY_MS: u64 = 60 * 60 * 1000;

/// Rejects non-negative `value` above `max`.
fn bounded(name: &str, value: i64, max: u64) -> Result<u64, PlanError> {
    let value = value as u64;
    if value > max {
        return Err(PlanError::InvalidParam {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Typed plan configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Deadline for the whole run
    pub timeout: Duration,

    /// Latency applied to every link during network setup
    pub latency: Duration,

    /// Bandwidth applied to every link, bytes per second
    pub bandwidth: u64,

    /// Initiators per responder
    pub ratio: u64,

    /// Rows in the generated dataset
    pub dataset_size: usize,

    /// Sub-timeout for scenario-local waits (watchers, attempted barriers)
    pub scenario_timeout: Duration,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            latency: Duration::ZERO,
            bandwidth: 10 << 20, // 10MiB
            ratio: 1,
            dataset_size: 1000,
            scenario_timeout: Duration::from_secs(60),
        }
    }
}

impl PlanConfig {
    /// Reads the configuration from run parameters, falling back to defaults.
    ///
    /// Ratios and dataset sizes below 1 fall back to their defaults.
    pub fn from_env(env: &RunEnv) -> Result<Self, PlanError> {
        let mut config = Self::default();

        if let Some(secs) = env.int_param("timeout_secs")? {
            if secs > 0 {
                config.timeout = Duration::from_secs(bounded("timeout_secs", secs, MAX_TIMEOUT_SECS)?);
            }
        }
        if let Some(ms) = env.int_param("latency")? {
            config.latency = Duration::from_millis(bounded("latency", ms.max(0), MAX_LATENCY_MS)?);
        }
        if let Some(ratio) = env.first_int_param(RATIO_PARAMS)? {
            config.ratio = if ratio < 1 { 1 } else { ratio as u64 };
        }
        if let Some(size) = env.int_param("datasetSize")? {
            if size >= 1 {
                config.dataset_size = size as usize;
            }
        }
        if let Some(secs) = env.first_int_param(SCENARIO_TIMEOUT_PARAMS)? {
            if secs > 0 {
                config.scenario_timeout =
                    Duration::from_secs(bounded("scenario_timeout_secs", secs, MAX_TIMEOUT_SECS)?);
            }
        }

        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_ratio(mut self, ratio: u64) -> Self {
        self.ratio = ratio.max(1);
        self
    }

    pub fn with_dataset_size(mut self, rows: usize) -> Self {
        self.dataset_size = rows.max(1);
        self
    }

    pub fn with_scenario_timeout(mut self, timeout: Duration) -> Self {
        self.scenario_timeout = timeout;
        self
    }
}

/// Per-node context, fixed once the node has joined the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// 0-based sequence number assigned by the sync service
    pub seq: u64,
    pub env: RunEnv,
    pub config: PlanConfig,
}

impl RunContext {
    pub fn instance_count(&self) -> u64 {
        self.env.instance_count
    }

    pub fn group_instance_count(&self) -> u64 {
        self.env.group_instance_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PlanConfig::from_env(&RunEnv::new("push", 4)).unwrap();
        assert_eq!(config, PlanConfig::default());
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.dataset_size, 1000);
        assert_eq!(config.bandwidth, 10 * 1024 * 1024);
    }

    #[test]
    fn test_reads_scenario_params() {
        let env = RunEnv::new("push", 4)
            .with_param("pushersPerReceiver", 3)
            .with_param("datasetSize", 50)
            .with_param("latency", 20)
            .with_param("timeout_secs", 30)
            .with_param("profile_timeout_sec", 5);
        let config = PlanConfig::from_env(&env).unwrap();

        assert_eq!(config.ratio, 3);
        assert_eq!(config.dataset_size, 50);
        assert_eq!(config.latency, Duration::from_millis(20));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.scenario_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_out_of_range_timeouts_are_rejected() {
        let env = RunEnv::new("push", 2).with_param("timeout_secs", i64::MAX);
        assert!(matches!(
            PlanConfig::from_env(&env),
            Err(PlanError::InvalidParam { ref name, .. }) if name == "timeout_secs"
        ));

        let env = RunEnv::new("push", 2).with_param("profile_timeout_sec", MAX_TIMEOUT_SECS + 1);
        assert!(matches!(PlanConfig::from_env(&env), Err(PlanError::InvalidParam { .. })));

        let env = RunEnv::new("push", 2).with_param("latency", i64::MAX);
        assert!(matches!(PlanConfig::from_env(&env), Err(PlanError::InvalidParam { .. })));

        let env = RunEnv::new("push", 2).with_param("timeout_secs", MAX_TIMEOUT_SECS);
        assert_eq!(
            PlanConfig::from_env(&env).unwrap().timeout,
            Duration::from_secs(MAX_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_ratio_below_one_falls_back() {
        let env = RunEnv::new("pull", 4).with_param("pullersPerRemote", 0);
        assert_eq!(PlanConfig::from_env(&env).unwrap().ratio, 1);

        let env = RunEnv::new("pull", 4).with_param("pullersPerRemote", -3);
        assert_eq!(PlanConfig::from_env(&env).unwrap().ratio, 1);
    }

    #[test]
    fn test_non_numeric_param_is_rejected() {
        let env = RunEnv::new("push", 4).with_param("datasetSize", "lots");
        let err = PlanConfig::from_env(&env).unwrap_err();
        assert!(matches!(err, PlanError::InvalidParam { ref name, .. } if name == "datasetSize"));
    }
}
