//! 监督器配置
//!
//! TOML 格式，所有字段都有默认值，缺省的段落/字段使用默认配置。时间一律以毫秒表示。
//!
//! ```toml
//! [tasks]
//! workers = 4
//!
//! [deadlock]
//! interval_ms = 1000
//!
//! [[resources]]
//! id = "robot_1"
//! kind = "robot"
//!
//! [[resources]]
//! id = "camera_1"
//! kind = "camera"
//! max_shared = 4
//! ```

use crate::error::ConfigError;
use crate::fault::{DEFAULT_FAULT_HISTORY, DEFAULT_RECOVERY_TIMEOUT};
use crate::health::ResourceThresholds;
use crate::recovery::{BackoffPolicy, DEFAULT_EXCEPTION_HISTORY, RecoveryConfig};
use crate::resource::{DEFAULT_ACCESS_HISTORY, ResourceKind};
use crate::task::CoordinatorConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// 任务协调器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub workers: usize,
    /// 终态任务记录保留数量
    pub history: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        let defaults = CoordinatorConfig::default();
        Self {
            workers: defaults.workers,
            history: defaults.history,
        }
    }
}

/// 锁管理器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    /// 调用方未指定时使用的获取超时（毫秒）
    pub default_timeout_ms: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
        }
    }
}

/// 死锁检测器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlockConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 2_000,
        }
    }
}

/// 健康监控
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// 是否注册内置检查
    pub builtin_checks: bool,
    pub cpu_degraded: f64,
    pub cpu_failed: f64,
    pub memory_degraded: f64,
    pub memory_failed: f64,
    /// 待执行任务超过该值时协调器检查为 DEGRADED
    pub backlog_threshold: usize,
    /// 被持有资源占比达到该值时仲裁器检查为 DEGRADED
    pub utilization_degraded: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        let thresholds = ResourceThresholds::default();
        Self {
            enabled: true,
            interval_ms: 5_000,
            builtin_checks: true,
            cpu_degraded: thresholds.cpu_degraded,
            cpu_failed: thresholds.cpu_failed,
            memory_degraded: thresholds.memory_degraded,
            memory_failed: thresholds.memory_failed,
            backlog_threshold: 100,
            utilization_degraded: 0.8,
        }
    }
}

impl HealthConfig {
    pub fn thresholds(&self) -> ResourceThresholds {
        ResourceThresholds {
            cpu_degraded: self.cpu_degraded,
            cpu_failed: self.cpu_failed,
            memory_degraded: self.memory_degraded,
            memory_failed: self.memory_failed,
        }
    }
}

/// 故障注册表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultsConfig {
    pub history: usize,
    /// 单个自动恢复动作的默认超时（毫秒）
    pub recovery_timeout_ms: u64,
}

impl Default for FaultsConfig {
    fn default() -> Self {
        Self {
            history: DEFAULT_FAULT_HISTORY,
            recovery_timeout_ms: DEFAULT_RECOVERY_TIMEOUT.as_millis() as u64,
        }
    }
}

/// 资源仲裁器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// 每个资源保留的访问记录条数
    pub access_history: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            access_history: DEFAULT_ACCESS_HISTORY,
        }
    }
}

/// 异常恢复引擎
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub history: usize,
    pub network_first_ms: u64,
    pub network_max_ms: u64,
    pub network_factor: f64,
    pub network_attempts: u32,
}

impl Default for RecoverySection {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            history: DEFAULT_EXCEPTION_HISTORY,
            network_first_ms: backoff.first.as_millis() as u64,
            network_max_ms: backoff.max.as_millis() as u64,
            network_factor: backoff.factor,
            network_attempts: backoff.max_attempts,
        }
    }
}

/// 启动时注册的资源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub id: String,
    pub kind: ResourceKind,
    /// 同时持有 SHARED 访问的上限
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_shared: Option<usize>,
}

/// 监督器配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub resources: Vec<ResourceEntry>,
    pub tasks: TasksConfig,
    pub locks: LocksConfig,
    pub deadlock: DeadlockConfig,
    pub health: HealthConfig,
    pub faults: FaultsConfig,
    pub arbiter: ArbiterConfig,
    pub recovery: RecoverySection,
}

impl SupervisorConfig {
    /// 解析并校验
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 序列化为 TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.into()))
        }

        if self.tasks.workers == 0 {
            return invalid("tasks.workers must be at least 1");
        }
        if self.locks.default_timeout_ms == 0 {
            return invalid("locks.default_timeout_ms must be positive");
        }
        if self.deadlock.interval_ms == 0 {
            return invalid("deadlock.interval_ms must be positive");
        }
        if self.health.interval_ms == 0 {
            return invalid("health.interval_ms must be positive");
        }

        if self.faults.recovery_timeout_ms == 0 {
            return invalid("faults.recovery_timeout_ms must be positive");
        }
        if self.arbiter.access_history == 0 {
            return invalid("arbiter.access_history must be at least 1");
        }

        let h = &self.health;
        for (name, degraded, failed) in [
            ("cpu", h.cpu_degraded, h.cpu_failed),
            ("memory", h.memory_degraded, h.memory_failed),
        ] {
            if !(0.0..=100.0).contains(&degraded) || !(0.0..=100.0).contains(&failed) {
                return invalid(format!("health.{name} thresholds must be within 0..=100"));
            }
            if degraded > failed {
                return invalid(format!(
                    "health.{name}_degraded ({degraded}) exceeds health.{name}_failed ({failed})"
                ));
            }
        }
        if !(0.0..=1.0).contains(&h.utilization_degraded) {
            return invalid("health.utilization_degraded must be within 0..=1");
        }

        let r = &self.recovery;
        if r.network_first_ms > r.network_max_ms {
            return invalid("recovery.network_first_ms exceeds recovery.network_max_ms");
        }
        if !r.network_factor.is_finite() || r.network_factor < 1.0 {
            return invalid("recovery.network_factor must be a finite value >= 1.0");
        }

        let mut kinds: HashMap<&str, ResourceKind> = HashMap::new();
        for entry in &self.resources {
            if entry.id.trim().is_empty() {
                return invalid("resource id must not be empty");
            }
            if entry.max_shared == Some(0) {
                return invalid(format!("resource '{}' max_shared must be at least 1", entry.id));
            }
            if let Some(previous) = kinds.insert(entry.id.as_str(), entry.kind) {
                if previous != entry.kind {
                    return invalid(format!(
                        "resource '{}' listed as both {:?} and {:?}",
                        entry.id, previous, entry.kind
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            workers: self.tasks.workers,
            history: self.tasks.history,
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        let r = &self.recovery;
        RecoveryConfig {
            history: r.history,
            network_backoff: BackoffPolicy {
                first: Duration::from_millis(r.network_first_ms),
                max: Duration::from_millis(r.network_max_ms),
                factor: r.network_factor,
                max_attempts: r.network_attempts,
            },
        }
    }

    pub fn default_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.locks.default_timeout_ms)
    }

    pub fn deadlock_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock.interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health.interval_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.faults.recovery_timeout_ms)
    }
}
