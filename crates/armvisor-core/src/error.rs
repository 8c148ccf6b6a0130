//! 错误类型定义
//!
//! 每个组件一个错误枚举，`CoreError` 汇总全部错误，便于组合根和调用方统一处理。
//!
//! | 名称 | 对应变体 | 可重试 |
//! |------|----------|--------|
//! | TimeoutError | [`LockError::Timeout`] | 是 |
//! | DeadlockError | [`LockError::Deadlock`] | 是（退避后） |
//! | ResourceFaultedError | [`ArbiterError::ResourceFaulted`] | 否（故障解除前） |

use crate::fault::FaultId;
use crate::lock::LockId;
use crate::recovery::RecordId;
use crate::resource::{HandleId, ResourceKind};
use crate::task::TaskId;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 锁管理器错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// 在超时时间内未获得锁
    #[error("Timed out after {waited:?} waiting for lock on '{resource}'")]
    Timeout { resource: String, waited: Duration },

    /// 等待被死锁检测器强制中止，或请求与自身持有的锁冲突
    #[error("Deadlock on '{resource}': wait aborted")]
    Deadlock { resource: String },

    /// 锁未被持有（重复释放或未知锁）
    #[error("Lock {0} is not held")]
    NotHeld(LockId),
}

impl LockError {
    /// 调用方是否可以退避后重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Timeout { .. } | LockError::Deadlock { .. })
    }
}

/// 资源仲裁器错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArbiterError {
    /// 资源未注册
    #[error("Resource '{0}' is not registered")]
    UnknownResource(String),

    /// 以不同类型重复注册
    #[error("Resource '{resource}' is registered as {registered:?}, not {requested:?}")]
    KindMismatch {
        resource: String,
        registered: ResourceKind,
        requested: ResourceKind,
    },

    /// 存在未解决的 CRITICAL/FATAL 故障，拒绝独占访问
    #[error("Resource '{resource}' is blocked by unresolved fault {fault}")]
    ResourceFaulted { resource: String, fault: FaultId },

    /// 资源仍被持有，无法注销
    #[error("Resource '{resource}' is still held by {holders} holder(s)")]
    ResourceBusy { resource: String, holders: usize },

    /// SHARED 持有者已达上限，超时前没有空出名额
    #[error("Timed out after {waited:?} waiting for one of {limit} shared slot(s) on '{resource}'")]
    SharedLimit {
        resource: String,
        limit: usize,
        waited: Duration,
    },

    /// 句柄已经释放过
    #[error("Handle {handle} on '{resource}' was already released")]
    AlreadyReleased { resource: String, handle: HandleId },

    /// 底层锁错误（超时 / 死锁）
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl ArbiterError {
    /// 调用方是否可以退避后重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ArbiterError::Lock(e) => e.is_retryable(),
            ArbiterError::SharedLimit { .. } => true,
            _ => false,
        }
    }
}

/// 任务协调器错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// 任务体返回错误
    #[error("Task failed: {0}")]
    Failed(String),

    /// 任务体 panic
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// 任务在开始执行前被取消
    #[error("Task was cancelled")]
    Cancelled,

    /// 等待结果超时（任务仍在进行中）
    #[error("Task {id} did not finish within {waited:?}")]
    Timeout { id: TaskId, waited: Duration },

    /// 未知任务 ID（或记录已被淘汰）
    #[error("Task {0} not found")]
    NotFound(TaskId),

    /// 协调器已关闭，不再接受任务
    #[error("Task coordinator is shut down")]
    ShutDown,

    /// 关闭时在超时时间内仍有任务未结束
    #[error("Shutdown timed out with {remaining} task(s) unfinished")]
    ShutdownTimeout { remaining: usize },
}

/// 故障注册表错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FaultError {
    #[error("Fault {0} not found")]
    NotFound(FaultId),
}

/// 异常恢复引擎错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("Exception record {0} not found")]
    NotFound(RecordId),
}

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    /// 读取配置文件失败
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML 解析失败
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// 配置值非法
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 汇总错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Arbiter(#[from] ArbiterError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Fault(#[from] FaultError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 后台线程已在运行
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// 后台线程创建失败
    #[error("Failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// 后台线程未能在超时时间内退出
    #[error("Thread '{name}' did not stop within {timeout:?}")]
    JoinTimeout { name: String, timeout: Duration },
}
