//! 机械臂监督层
//!
//! 进程内的并发与容错基座，供机器人控制应用在其上协调多个协作方：
//! - 事件总线：类型化主题的同步发布/订阅
//! - 锁管理器：每个资源一个 FIFO 队列的 SHARED/EXCLUSIVE 锁，附带等待图
//! - 死锁检测器：周期性/超时触发的环检测，每个环中止一个等待者
//! - 任务协调器：按优先级调度的固定工作线程池
//! - 资源仲裁器：在锁管理器之上按资源类型登记、统计，并拒绝有故障的资源
//! - 故障注册表：故障记录、自动恢复动作和急停通知
//! - 健康监控：周期性健康检查与综合状态
//! - 异常恢复引擎：失败分类与按策略重试
//!
//! 所有组件由 [`SupervisorBuilder`] 一次性构造并接线。
//!
//! # Example
//!
//! ```no_run
//! use armvisor_core::{LockMode, ResourceKind, SupervisorBuilder, Task, TaskPriority};
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let supervisor = SupervisorBuilder::new().log_events(true).build()?;
//! supervisor.start()?;
//! supervisor.arbiter().register("robot_1", ResourceKind::Robot)?;
//!
//! let arbiter = supervisor.arbiter().clone();
//! let id = supervisor.coordinator().submit(
//!     Task::new(TaskPriority::High, move || {
//!         let _guard = arbiter.guard("robot_1", LockMode::Exclusive, Duration::from_secs(1))?;
//!         // 运动指令 ...
//!         Ok(())
//!     })
//!     .named("home"),
//! )?;
//! supervisor.coordinator().result(id, Duration::from_secs(10))?;
//!
//! supervisor.shutdown(true, Duration::from_secs(5))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod deadlock;
mod error;
pub mod event;
pub mod fault;
pub mod health;
mod id;
pub mod lock;
pub mod owner;
pub mod recovery;
pub mod resource;
mod supervisor;
pub mod task;
mod thread_util;

pub use config::{ResourceEntry, SupervisorConfig};
pub use deadlock::DeadlockDetector;
pub use error::{
    ArbiterError, ConfigError, CoreError, FaultError, LockError, RecoveryError, TaskError,
};
pub use event::{Event, EventBus, HandlerResult, Subscription, SubscriptionToken, Topic};
pub use fault::{
    Fault, FaultCategory, FaultId, FaultKind, FaultLevel, FaultRegistry, RecoveryActionKind,
    RecoveryId, RecoveryStatus,
};
pub use health::{CheckOutcome, HealthCheck, HealthMonitor, HealthReport, HealthStatus};
pub use lock::{Cycle, Lock, LockGuard, LockId, LockManager, LockMode};
pub use owner::OwnerId;
pub use recovery::{
    BackoffPolicy, ExceptionKind, ExceptionRecord, ExceptionRecoveryEngine, RecordId,
    RecoveryContext, RecoveryDecision, RecoveryStrategy, StrategyMatch,
};
pub use resource::{
    AccessMode, AccessRecord, HandleId, ResourceArbiter, ResourceGuard, ResourceHandle,
    ResourceInfo, ResourceKind, UsageStats,
};
pub use supervisor::{Supervisor, SupervisorBuilder};
pub use task::{Task, TaskCoordinator, TaskId, TaskPriority, TaskState, TaskValue};
