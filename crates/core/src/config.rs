use crate::error::{SchedulerError, SchedulerResult};
use crate::step::{StepDescriptor, StepTable, default_step_table};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which sync groups rendezvous. Every group does unless told otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "policy", content = "groups")]
pub enum SyncPolicy {
    #[default]
    AllGroups,
    Groups(Vec<usize>),
}

impl SyncPolicy {
    /// Per-group flags for `group_count` groups.
    pub fn resolve(&self, group_count: usize) -> SchedulerResult<Vec<bool>> {
        match self {
            SyncPolicy::AllGroups => Ok(vec![true; group_count]),
            SyncPolicy::Groups(groups) => {
                let mut flags = vec![false; group_count];
                for &group in groups {
                    let flag = flags.get_mut(group).ok_or(SchedulerError::UnknownSyncGroup {
                        group,
                        group_count,
                    })?;
                    *flag = true;
                }
                Ok(flags)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub cycle_length: usize,
    pub stream_count: usize,
    pub step_period_ms: u64,
    pub history_capacity: usize,
    pub failure_warn_threshold: u32,
    pub stop_grace_ms: u64,
    pub sync: SyncPolicy,
    pub steps: Vec<StepDescriptor>,
    pub logging: LoggingConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_length: 12,
            stream_count: 3,
            step_period_ms: 1000,
            history_capacity: 64,
            failure_warn_threshold: 3,
            stop_grace_ms: 2000,
            sync: SyncPolicy::default(),
            steps: default_step_table(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.stream_count == 0 {
            return Err(SchedulerError::InvalidStreamCount);
        }
        if self.cycle_length == 0 {
            return Err(SchedulerError::ZeroCycleLength);
        }
        if self.cycle_length % self.stream_count != 0 {
            return Err(SchedulerError::IndivisibleCycle {
                cycle_length: self.cycle_length,
                stream_count: self.stream_count,
            });
        }
        if self.step_period_ms == 0 {
            return Err(SchedulerError::ZeroPeriod);
        }
        if self.history_capacity == 0 {
            return Err(SchedulerError::ZeroHistoryCapacity);
        }
        self.sync.resolve(self.group_count())?;
        StepTable::new(self.cycle_length, self.steps.clone())?;
        Ok(())
    }

    /// Number of sync groups, `N / S`. Only meaningful on a validated config.
    pub fn group_count(&self) -> usize {
        if self.stream_count == 0 {
            return 0;
        }
        self.cycle_length / self.stream_count
    }

    pub fn step_period(&self) -> Duration {
        Duration::from_millis(self.step_period_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read scheduler config {:?}", path))?;
        let mut config: SchedulerConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse scheduler config {:?}", path))?;
        config.apply_env_overrides();
        config
            .validate()
            .with_context(|| format!("invalid scheduler config {:?}", path))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create config directory {:?}", parent))?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write scheduler config {:?}", path))?;
        Ok(())
    }

    /// `ECHOBEATS_STEP_PERIOD_MS`, `ECHOBEATS_STOP_GRACE_MS` and
    /// `ECHOBEATS_LOG_JSON` take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Some(period) = env_u64("ECHOBEATS_STEP_PERIOD_MS") {
            self.step_period_ms = period;
        }
        if let Some(grace) = env_u64("ECHOBEATS_STOP_GRACE_MS") {
            self.stop_grace_ms = grace;
        }
        if let Some(json) = env_bool("ECHOBEATS_LOG_JSON") {
            self.logging.json = json;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_level(),
            log_path: None,
            json: false,
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Mode;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_the_twelve_step_triad_loop() {
        let config = SchedulerConfig::default();
        config.validate().expect("default config");
        assert_eq!(config.group_count(), 4);
        assert_eq!(config.steps.len(), 12);
        assert_eq!(config.step_period(), Duration::from_secs(1));
    }

    #[test]
    fn indivisible_cycle_is_rejected() {
        let raw = r#"{ "cycle_length": 10, "stream_count": 3 }"#;
        let config: SchedulerConfig = serde_json::from_str(raw).expect("config");
        assert_eq!(
            config.validate().unwrap_err(),
            SchedulerError::IndivisibleCycle {
                cycle_length: 10,
                stream_count: 3
            }
        );
    }

    #[test]
    fn step_table_must_match_cycle_length() {
        let raw = r#"{ "cycle_length": 6, "stream_count": 3 }"#;
        let config: SchedulerConfig = serde_json::from_str(raw).expect("config");
        assert_eq!(
            config.validate().unwrap_err(),
            SchedulerError::StepTableLength {
                expected: 6,
                actual: 12
            }
        );
    }

    #[test]
    fn zero_values_are_rejected() {
        let mut config = SchedulerConfig::default();
        config.stream_count = 0;
        assert_eq!(config.validate().unwrap_err(), SchedulerError::InvalidStreamCount);

        let mut config = SchedulerConfig::default();
        config.step_period_ms = 0;
        assert_eq!(config.validate().unwrap_err(), SchedulerError::ZeroPeriod);

        let mut config = SchedulerConfig::default();
        config.history_capacity = 0;
        assert_eq!(config.validate().unwrap_err(), SchedulerError::ZeroHistoryCapacity);
    }

    #[test]
    fn sync_policy_parses_and_resolves() {
        let raw = r#"{ "sync": { "policy": "groups", "groups": [0, 2] } }"#;
        let config: SchedulerConfig = serde_json::from_str(raw).expect("config");
        assert_eq!(config.sync, SyncPolicy::Groups(vec![0, 2]));
        assert_eq!(
            config.sync.resolve(4).expect("flags"),
            vec![true, false, true, false]
        );
        assert_eq!(
            SyncPolicy::Groups(vec![7]).resolve(4).unwrap_err(),
            SchedulerError::UnknownSyncGroup {
                group: 7,
                group_count: 4
            }
        );
    }

    #[test]
    fn custom_steps_parse() {
        let raw = r#"{
            "cycle_length": 3,
            "stream_count": 3,
            "steps": [
                { "index": 0, "term": "sense", "mode": "expressive" },
                { "index": 1, "term": "weigh", "mode": "relevance_realization" },
                { "index": 2, "term": "review", "mode": "meta_cognitive", "label": "Review" }
            ]
        }"#;
        let config: SchedulerConfig = serde_json::from_str(raw).expect("config");
        config.validate().expect("valid");
        assert_eq!(config.steps[1].mode, Mode::RelevanceRealization);
        assert_eq!(config.steps[2].label.as_deref(), Some("Review"));
        assert_eq!(config.group_count(), 1);
    }

    #[test]
    fn save_then_load_from_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("scheduler.json");
        let mut config = SchedulerConfig::default();
        config.step_period_ms = 250;
        config.sync = SyncPolicy::Groups(vec![1]);
        config.save(&path).expect("save");
        let loaded = SchedulerConfig::load(&path).expect("load");
        assert_eq!(loaded.sync, SyncPolicy::Groups(vec![1]));
        assert_eq!(loaded.steps, config.steps);
    }

    #[test]
    fn load_reports_invalid_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{ "stream_count": 5 }"#).expect("write");
        let err = SchedulerConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("not divisible"));
    }
}
