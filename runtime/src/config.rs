use std::fs;
use std::path::{Path, PathBuf};

use queue::QueueConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config {path:?}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("invalid yaml config: {0}")]
	Yaml(#[from] serde_yaml::Error),
	#[error("invalid json config: {0}")]
	Json(#[from] serde_json::Error),
	#[error("unsupported config file format: {0:?}")]
	UnsupportedFormat(PathBuf),
	#[error("invalid config value {key}: {reason}")]
	Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
	/// 同时处理的事件数上限。
	pub concurrency: usize,
	pub poll_interval_ms: u64,
	/// 单次后端调用超时，超时结果按 `Unknown` 处理。
	pub submit_timeout_ms: u64,
	/// 关闭时等待在途提交的时长，超过后中止。
	pub shutdown_grace_ms: u64,
}

impl Default for CoordinatorConfig {
	fn default() -> Self {
		Self {
			concurrency: 16,
			poll_interval_ms: 250,
			submit_timeout_ms: 10_000,
			shutdown_grace_ms: 5_000,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
	pub network: String,
	pub contract_address: Option<String>,
	pub account: Option<String>,
}

impl Default for LedgerConfig {
	fn default() -> Self {
		Self {
			network: "local".to_string(),
			contract_address: None,
			account: None,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
	/// 文件系统归档目录；为空时使用 `<queue.dir>/archive`。
	pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
	pub level: String,
}

impl Default for LogConfig {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
	/// ID 生成器的节点号。
	pub worker_id: u64,
	pub queue: QueueConfig,
	pub retry: RetryPolicy,
	pub coordinator: CoordinatorConfig,
	pub ledger: LedgerConfig,
	pub archive: ArchiveConfig,
	pub log: LogConfig,
}

impl Default for TrackerConfig {
	fn default() -> Self {
		Self {
			worker_id: 1,
			queue: QueueConfig::default(),
			retry: RetryPolicy::default(),
			coordinator: CoordinatorConfig::default(),
			ledger: LedgerConfig::default(),
			archive: ArchiveConfig::default(),
			log: LogConfig::default(),
		}
	}
}

impl TrackerConfig {
	/// 按扩展名读取 YAML / JSON 配置，缺省字段取默认值。
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;

		let config: Self = match path.extension().and_then(|x| x.to_str()) {
			Some("json") => serde_json::from_str(&text)?,
			Some("yaml") | Some("yml") => Self::from_yaml_str(&text)?,
			_ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
		};
		config.validate()?;
		Ok(config)
	}

	pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
		// 空文档按全默认处理
		if yaml.trim().is_empty() {
			return Ok(Self::default());
		}
		serde_yaml::from_str(yaml)
	}

	/// 读取配置文件（若给出）并叠加 `CHAINTRACK_*` 环境变量。
	pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
		let mut config = match path {
			Some(path) => Self::load(path)?,
			None => Self::default(),
		};
		config.apply_env_overrides();
		config.validate()?;
		Ok(config)
	}

	pub fn apply_env_overrides(&mut self) {
		self.apply_overrides(|key| std::env::var(key).ok());
	}

	/// 以任意键值来源覆盖配置，无法解析的值被忽略。
	pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
		if let Some(dir) = lookup("CHAINTRACK_DATA_DIR").filter(|x| !x.trim().is_empty()) {
			self.queue.dir = PathBuf::from(dir.trim());
		}
		if let Some(value) = parse_positive(&lookup, "CHAINTRACK_CONCURRENCY") {
			self.coordinator.concurrency = value as usize;
		}
		if let Some(value) = parse_positive(&lookup, "CHAINTRACK_MAX_ATTEMPTS") {
			self.retry.max_attempts = value.min(u32::MAX as u64) as u32;
		}
		if let Some(value) = parse_positive(&lookup, "CHAINTRACK_BASE_DELAY_MS") {
			self.retry.base_delay_ms = value;
		}
		if let Some(value) = lookup("CHAINTRACK_WORKER_ID").and_then(|x| x.trim().parse::<u64>().ok()) {
			self.worker_id = value;
		}
		if let Some(level) = lookup("CHAINTRACK_LOG_LEVEL").filter(|x| chaintrack::parse_level(x).is_some()) {
			self.log.level = level.trim().to_ascii_lowercase();
		}
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.coordinator.concurrency == 0 {
			return Err(ConfigError::Invalid {
				key: "coordinator.concurrency",
				reason: "must be at least 1".to_string(),
			});
		}
		if self.retry.max_attempts == 0 {
			return Err(ConfigError::Invalid {
				key: "retry.max_attempts",
				reason: "must be at least 1".to_string(),
			});
		}
		if self.retry.max_unknown_attempts == 0 {
			return Err(ConfigError::Invalid {
				key: "retry.max_unknown_attempts",
				reason: "must be at least 1".to_string(),
			});
		}
		if self.coordinator.submit_timeout_ms == 0 {
			return Err(ConfigError::Invalid {
				key: "coordinator.submit_timeout_ms",
				reason: "must be positive".to_string(),
			});
		}
		if chaintrack::parse_level(&self.log.level).is_none() {
			return Err(ConfigError::Invalid {
				key: "log.level",
				reason: format!("unknown level {}", self.log.level),
			});
		}
		Ok(())
	}

	pub fn archive_dir(&self) -> PathBuf {
		self.archive
			.dir
			.clone()
			.unwrap_or_else(|| self.queue.dir.join("archive"))
	}
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
	lookup(key)
		.and_then(|value| value.trim().parse::<u64>().ok())
		.filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::path::PathBuf;

	use super::{ConfigError, TrackerConfig};

	#[test]
	fn partial_yaml_keeps_defaults_elsewhere() {
		let config = TrackerConfig::from_yaml_str(
			"queue:\n  dir: /var/lib/tracker\nretry:\n  max_attempts: 5\nledger:\n  network: sepolia\n  contract_address: \"0xabc\"\n",
		)
		.expect("yaml");

		assert_eq!(config.queue.dir, PathBuf::from("/var/lib/tracker"));
		assert!(config.queue.fsync);
		assert_eq!(config.retry.max_attempts, 5);
		assert_eq!(config.retry.max_unknown_attempts, 3);
		assert_eq!(config.ledger.network, "sepolia");
		assert_eq!(config.ledger.contract_address.as_deref(), Some("0xabc"));
		assert_eq!(config.coordinator.concurrency, 16);
		assert_eq!(config.archive_dir(), PathBuf::from("/var/lib/tracker/archive"));
	}

	#[test]
	fn load_dispatches_on_extension() {
		let dir = tempfile::tempdir().expect("tempdir");
		let json = dir.path().join("tracker.json");
		std::fs::write(&json, r#"{"coordinator":{"concurrency":4},"log":{"level":"debug"}}"#).expect("write");
		let config = TrackerConfig::load(&json).expect("json config");
		assert_eq!(config.coordinator.concurrency, 4);
		assert_eq!(config.log.level, "debug");

		let toml = dir.path().join("tracker.toml");
		std::fs::write(&toml, "").expect("write");
		assert!(matches!(TrackerConfig::load(&toml), Err(ConfigError::UnsupportedFormat(_))));
	}

	#[test]
	fn invalid_values_are_reported() {
		let dir = tempfile::tempdir().expect("tempdir");
		let yaml = dir.path().join("tracker.yaml");
		std::fs::write(&yaml, "coordinator:\n  concurrency: 0\n").expect("write");
		let error = TrackerConfig::load(&yaml).expect_err("zero concurrency");
		assert!(matches!(error, ConfigError::Invalid { key: "coordinator.concurrency", .. }));
	}

	#[test]
	fn env_style_overrides_win_and_ignore_garbage() {
		let vars = HashMap::from([
			("CHAINTRACK_DATA_DIR", "/tmp/ct"),
			("CHAINTRACK_CONCURRENCY", "3"),
			("CHAINTRACK_MAX_ATTEMPTS", "zero"),
			("CHAINTRACK_BASE_DELAY_MS", "25"),
			("CHAINTRACK_LOG_LEVEL", "WARN"),
		]);
		let mut config = TrackerConfig::default();
		config.apply_overrides(|key| vars.get(key).map(|x| x.to_string()));

		assert_eq!(config.queue.dir, PathBuf::from("/tmp/ct"));
		assert_eq!(config.coordinator.concurrency, 3);
		assert_eq!(config.retry.max_attempts, 8);
		assert_eq!(config.retry.base_delay_ms, 25);
		assert_eq!(config.log.level, "warn");
	}
}
