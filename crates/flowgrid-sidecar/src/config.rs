//! Sidecar configuration, read once from the environment at startup.

use std::time::Duration;

use thiserror::Error;

use flowgrid_state::{
    ENV_NAMESPACE, ENV_PIPELINE_NAME, ENV_REPLICA, ENV_STEP, ENV_UPDATE_INTERVAL, Step, StepKey,
    parse_duration,
};

/// Startup configuration errors. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid replica index {0:?}")]
    InvalidReplica(String),

    #[error("invalid update interval {0:?}")]
    InvalidInterval(String),

    #[error("invalid step snapshot: {0}")]
    InvalidStep(String),
}

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub namespace: String,
    pub pipeline_name: String,
    /// Snapshot of the step taken when the pod was built.
    pub step: Step,
    pub replica: u32,
    /// Base period of the status merge loop.
    pub update_interval: Duration,
}

impl SidecarConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));

        let namespace = get(ENV_NAMESPACE)?;
        let pipeline_name = lookup(ENV_PIPELINE_NAME).unwrap_or_default();

        let raw_step = get(ENV_STEP)?;
        let step: Step =
            serde_json::from_str(&raw_step).map_err(|e| ConfigError::InvalidStep(e.to_string()))?;

        let raw_replica = get(ENV_REPLICA)?;
        let replica = raw_replica
            .trim()
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidReplica(raw_replica.clone()))?;

        let raw_interval = get(ENV_UPDATE_INTERVAL)?;
        let update_interval = parse_duration(&raw_interval)
            .filter(|d| !d.is_zero())
            .ok_or_else(|| ConfigError::InvalidInterval(raw_interval.clone()))?;

        Ok(Self {
            namespace,
            pipeline_name,
            step,
            replica,
            update_interval,
        })
    }

    /// The step resource this replica reports into.
    pub fn step_key(&self) -> StepKey {
        StepKey::new(&self.namespace, &self.step.metadata.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn valid() -> HashMap<String, String> {
        env(&[
            (ENV_NAMESPACE, "default"),
            (ENV_PIPELINE_NAME, "demo"),
            (
                ENV_STEP,
                r#"{"metadata":{"name":"demo-main","namespace":"default"},"spec":{"name":"main"}}"#,
            ),
            (ENV_REPLICA, "2"),
            (ENV_UPDATE_INTERVAL, "15s"),
        ])
    }

    fn load(vars: &HashMap<String, String>) -> Result<SidecarConfig, ConfigError> {
        SidecarConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn parses_complete_environment() {
        let config = load(&valid()).unwrap();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.pipeline_name, "demo");
        assert_eq!(config.replica, 2);
        assert_eq!(config.update_interval, Duration::from_secs(15));
        assert_eq!(config.step_key(), StepKey::new("default", "demo-main"));
    }

    #[test]
    fn bad_replica_is_fatal() {
        let mut vars = valid();
        vars.insert(ENV_REPLICA.to_string(), "-1".to_string());
        assert!(matches!(load(&vars), Err(ConfigError::InvalidReplica(_))));
    }

    #[test]
    fn bad_interval_is_fatal() {
        let mut vars = valid();
        vars.insert(ENV_UPDATE_INTERVAL.to_string(), "soon".to_string());
        assert!(matches!(load(&vars), Err(ConfigError::InvalidInterval(_))));
        vars.insert(ENV_UPDATE_INTERVAL.to_string(), "0s".to_string());
        assert!(matches!(load(&vars), Err(ConfigError::InvalidInterval(_))));
    }

    #[test]
    fn missing_step_is_fatal() {
        let mut vars = valid();
        vars.remove(ENV_STEP);
        assert!(matches!(load(&vars), Err(ConfigError::Missing(ENV_STEP))));
    }

    #[test]
    fn malformed_step_is_fatal() {
        let mut vars = valid();
        vars.insert(ENV_STEP.to_string(), "{".to_string());
        assert!(matches!(load(&vars), Err(ConfigError::InvalidStep(_))));
    }
}
