//! 组合入口
//!
//! [`Supervisor`] 持有每个组件的唯一实例，并把它们接好线：
//! 总线与故障注册表互相关联、仲裁器查询故障、死锁检测器读取锁表、健康检查读取各组件状态。
//! 组件之间只通过构造时传入的 `Arc` 协作，没有全局状态。
//!
//! # Example
//!
//! ```no_run
//! use armvisor_core::{LockMode, ResourceKind, SupervisorBuilder, SupervisorConfig};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), armvisor_core::CoreError> {
//! let supervisor = SupervisorBuilder::new()
//!     .config(SupervisorConfig::default())
//!     .build()?;
//! supervisor.start()?;
//!
//! supervisor.arbiter().register("robot_1", ResourceKind::Robot)?;
//! let handle = supervisor.acquire("robot_1", LockMode::Exclusive)?;
//! supervisor.arbiter().release(&handle)?;
//!
//! supervisor.shutdown(true, Duration::from_secs(5))?;
//! # Ok(())
//! # }
//! ```

use crate::config::SupervisorConfig;
use crate::deadlock::DeadlockDetector;
use crate::error::{ArbiterError, CoreError};
use crate::event::{EventBus, SubscriptionToken, log_events};
use crate::fault::FaultRegistry;
use crate::health::{
    ArbiterCheck, CoordinatorCheck, FaultCheck, HealthMonitor, SystemResourceCheck,
};
use crate::lock::{LockManager, LockMode};
use crate::recovery::ExceptionRecoveryEngine;
use crate::resource::{ResourceArbiter, ResourceHandle};
use crate::task::TaskCoordinator;
use crate::thread_util::deadline_after;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Drop 时等待后台线程退出的时间
const DROP_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// [`Supervisor`] 构造器
#[derive(Debug, Default)]
pub struct SupervisorBuilder {
    config: Option<SupervisorConfig>,
    log_events: bool,
}

impl SupervisorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// 把总线上的所有事件同步输出到 `tracing`
    pub fn log_events(mut self, enabled: bool) -> Self {
        self.log_events = enabled;
        self
    }

    /// 校验配置并构造全部组件（不启动后台线程）
    pub fn build(self) -> Result<Supervisor, CoreError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let bus = EventBus::new();
        let faults = Arc::new(
            FaultRegistry::new(bus.clone(), config.faults.history)
                .with_recovery_timeout(config.recovery_timeout()),
        );
        bus.attach_fault_registry(&faults);

        let event_logger = self.log_events.then(|| log_events(&bus));

        let locks = Arc::new(LockManager::new());
        let arbiter = Arc::new(
            ResourceArbiter::new(locks.clone(), faults.clone(), bus.clone())
                .with_access_history(config.arbiter.access_history),
        );
        let coordinator = Arc::new(TaskCoordinator::new(
            config.coordinator(),
            bus.clone(),
            faults.clone(),
        )?);
        let detector = Arc::new(DeadlockDetector::new(locks.clone(), faults.clone()));
        let health = Arc::new(HealthMonitor::new(bus.clone()));
        let recovery = Arc::new(ExceptionRecoveryEngine::new(
            config.recovery_config(),
            bus.clone(),
            faults.clone(),
        ));

        for entry in &config.resources {
            match entry.max_shared {
                Some(limit) => arbiter.register_with_shared_limit(&entry.id, entry.kind, limit)?,
                None => arbiter.register(&entry.id, entry.kind)?,
            }
        }

        if config.health.builtin_checks {
            health.register_check(Arc::new(SystemResourceCheck::new(config.health.thresholds())));
            health.register_check(Arc::new(ArbiterCheck::new(
                arbiter.clone(),
                config.health.utilization_degraded,
            )));
            health.register_check(Arc::new(CoordinatorCheck::new(
                coordinator.clone(),
                config.health.backlog_threshold,
            )));
            health.register_check(Arc::new(FaultCheck::new(faults.clone())));
        }

        info!(
            "Supervisor built: {} worker(s), {} resource(s)",
            config.tasks.workers,
            config.resources.len()
        );

        Ok(Supervisor {
            config,
            bus,
            locks,
            faults,
            arbiter,
            coordinator,
            detector,
            health,
            recovery,
            event_logger,
        })
    }
}

/// 监督器
pub struct Supervisor {
    config: SupervisorConfig,
    bus: EventBus,
    locks: Arc<LockManager>,
    faults: Arc<FaultRegistry>,
    arbiter: Arc<ResourceArbiter>,
    coordinator: Arc<TaskCoordinator>,
    detector: Arc<DeadlockDetector>,
    health: Arc<HealthMonitor>,
    recovery: Arc<ExceptionRecoveryEngine>,
    event_logger: Option<SubscriptionToken>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("faults", &self.faults)
            .field("detector_running", &self.detector.is_running())
            .field("health_running", &self.health.is_running())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// 按配置启动死锁检测与健康监控线程
    pub fn start(&self) -> Result<(), CoreError> {
        if self.config.deadlock.enabled {
            self.detector.start(self.config.deadlock_interval())?;
        }
        if self.config.health.enabled {
            self.health.run_once();
            if let Err(e) = self.health.start(self.config.health_interval()) {
                // 已启动的检测线程一并停掉，保持 start 要么全部成功要么全部不生效
                let _ = self.detector.stop(DROP_STOP_TIMEOUT);
                return Err(e);
            }
        }
        info!("Supervisor started");
        Ok(())
    }

    /// 停止后台线程并关闭任务协调器
    ///
    /// `drain` 为 `true` 时等待已提交的任务执行完；所有步骤共享同一个 `timeout`。
    /// 某一步失败时其余步骤仍会执行，返回第一个错误。
    pub fn shutdown(&self, drain: bool, timeout: Duration) -> Result<(), CoreError> {
        let deadline = deadline_after(timeout);
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let mut first_error: Option<CoreError> = None;
        let mut keep = |result: Result<(), CoreError>| {
            if let Err(e) = result {
                warn!("Supervisor shutdown step failed: {}", e);
                first_error.get_or_insert(e);
            }
        };

        keep(self.detector.stop(remaining()));
        keep(self.health.stop(remaining()));
        keep(self.coordinator.shutdown(drain, remaining()).map_err(CoreError::from));

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Supervisor shut down");
                Ok(())
            },
        }
    }

    /// 以配置的默认超时获取资源
    pub fn acquire(&self, resource: &str, mode: LockMode) -> Result<ResourceHandle, ArbiterError> {
        self.arbiter
            .acquire(resource, mode, self.config.default_lock_timeout())
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn faults(&self) -> &Arc<FaultRegistry> {
        &self.faults
    }

    pub fn arbiter(&self) -> &Arc<ResourceArbiter> {
        &self.arbiter
    }

    pub fn coordinator(&self) -> &Arc<TaskCoordinator> {
        &self.coordinator
    }

    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn recovery(&self) -> &Arc<ExceptionRecoveryEngine> {
        &self.recovery
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // 后台线程各自持有组件的 Arc，不显式停止就不会退出
        if let Err(e) = self.detector.stop(DROP_STOP_TIMEOUT) {
            warn!("Deadlock detector did not stop on drop: {}", e);
        }
        if let Err(e) = self.health.stop(DROP_STOP_TIMEOUT) {
            warn!("Health monitor did not stop on drop: {}", e);
        }
        if let Some(token) = self.event_logger.take() {
            self.bus.unsubscribe(token);
        }
    }
}
