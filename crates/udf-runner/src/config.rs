use anyhow::Context;
use scalar_udf::OperatorConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Framing of calls and results exchanged with a worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Frames carry only their payload, and the worker answers calls in order.
    #[default]
    Ordered,
    /// Frames carry a sequence number which the worker echoes with each result.
    /// Results may be returned in any order.
    Sequenced,
}

/// WorkerConfig describes the function worker process and how to talk to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkerConfig {
    /// Program and arguments of the worker.
    pub command: Vec<String>,
    /// Additional environment variables of the worker.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub framing: Framing,
    /// Maximum number of calls written to the worker as one bundle.
    #[serde(default = "WorkerConfig::default_max_bundle_size")]
    pub max_bundle_size: usize,
    /// Maximum time a call may wait in a partial bundle.
    #[serde(
        default = "WorkerConfig::default_max_bundle_time",
        with = "humantime_serde"
    )]
    pub max_bundle_time: Duration,
    /// Deadline for the result of each call, measured from its submission.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub call_timeout: Option<Duration>,
    /// Time allowed for the worker to finish once its input is closed.
    #[serde(
        default = "WorkerConfig::default_close_timeout",
        with = "humantime_serde"
    )]
    pub close_timeout: Duration,
}

impl WorkerConfig {
    pub fn new<S: Into<String>>(command: impl IntoIterator<Item = S>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            framing: Framing::default(),
            max_bundle_size: Self::default_max_bundle_size(),
            max_bundle_time: Self::default_max_bundle_time(),
            call_timeout: None,
            close_timeout: Self::default_close_timeout(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.command.is_empty(), "worker command is empty");
        anyhow::ensure!(
            self.max_bundle_size != 0,
            "maxBundleSize must be at least one"
        );
        Ok(())
    }

    fn default_max_bundle_size() -> usize {
        1000
    }
    fn default_max_bundle_time() -> Duration {
        Duration::from_secs(1)
    }
    fn default_close_timeout() -> Duration {
        Duration::from_secs(15)
    }
}

/// PipeConfig is the configuration file of `udf-pipe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipeConfig {
    pub operator: OperatorConfig,
    pub worker: WorkerConfig,
}

impl PipeConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let config: Self = serde_json::from_slice(&content)
            .with_context(|| format!("parsing configuration {}", path.display()))?;

        config.worker.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config: WorkerConfig =
            serde_json::from_value(json!({"command": ["python3", "worker.py"]})).unwrap();

        insta::assert_debug_snapshot!(config, @r###"
        WorkerConfig {
            command: [
                "python3",
                "worker.py",
            ],
            env: {},
            framing: Ordered,
            max_bundle_size: 1000,
            max_bundle_time: 1s,
            call_timeout: None,
            close_timeout: 15s,
        }
        "###);
        assert_eq!(config, WorkerConfig::new(["python3", "worker.py"]));
    }

    #[test]
    fn test_durations_and_framing() {
        let config: WorkerConfig = serde_json::from_value(json!({
            "command": ["worker"],
            "env": {"PYTHONUNBUFFERED": "1"},
            "framing": "sequenced",
            "maxBundleSize": 50,
            "maxBundleTime": "250ms",
            "callTimeout": "30s",
            "closeTimeout": "1m",
        }))
        .unwrap();

        assert_eq!(config.framing, Framing::Sequenced);
        assert_eq!(config.max_bundle_size, 50);
        assert_eq!(config.max_bundle_time, Duration::from_millis(250));
        assert_eq!(config.call_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.close_timeout, Duration::from_secs(60));
        assert_eq!(config.env["PYTHONUNBUFFERED"], "1");

        // Round-trips through its serialized form.
        let round: WorkerConfig =
            serde_json::from_value(serde_json::to_value(&config).unwrap()).unwrap();
        assert_eq!(round, config);
    }

    #[test]
    fn test_validation() {
        let err = serde_json::from_value::<WorkerConfig>(json!({"command": ["w"], "bundle": 1}))
            .unwrap_err();
        assert!(err.to_string().contains("unknown field `bundle`"));

        let mut config = WorkerConfig::new(Vec::<String>::new());
        insta::assert_snapshot!(config.validate().unwrap_err(), @"worker command is empty");

        config.command = vec!["w".to_string()];
        config.max_bundle_size = 0;
        insta::assert_snapshot!(config.validate().unwrap_err(), @"maxBundleSize must be at least one");
    }
}
