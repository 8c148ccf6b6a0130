//! 内置健康检查
//!
//! - [`SystemResourceCheck`]: CPU / 内存占用（`sysinfo`）
//! - [`ArbiterCheck`]: 已注册资源的占用比例
//! - [`CoordinatorCheck`]: 任务积压与工作线程数
//! - [`FaultCheck`]: 未解决故障

use super::{CheckOutcome, HealthCheck, HealthStatus};
use crate::fault::{FaultLevel, FaultRegistry};
use crate::resource::ResourceArbiter;
use crate::task::TaskCoordinator;
use parking_lot::Mutex;
use std::sync::Arc;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// 按阈值分级（`value >= failed` 为 FAILED，`value >= degraded` 为 DEGRADED）
fn classify(value: f64, degraded: f64, failed: f64) -> HealthStatus {
    if value >= failed {
        HealthStatus::Failed
    } else if value >= degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

/// 系统资源阈值（百分比）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub cpu_degraded: f64,
    pub cpu_failed: f64,
    pub memory_degraded: f64,
    pub memory_failed: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_degraded: 70.0,
            cpu_failed: 90.0,
            memory_degraded: 70.0,
            memory_failed: 90.0,
        }
    }
}

/// CPU / 内存检查
///
/// 首次采样的 CPU 占用为 0（`sysinfo` 需要两次采样计算差值）。
pub struct SystemResourceCheck {
    system: Mutex<System>,
    thresholds: ResourceThresholds,
}

impl SystemResourceCheck {
    pub const NAME: &'static str = "system_resources";

    pub fn new(thresholds: ResourceThresholds) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            system: Mutex::new(system),
            thresholds,
        }
    }

    fn evaluate(&self, cpu: f64, memory: f64) -> CheckOutcome {
        let t = &self.thresholds;
        let status = classify(cpu, t.cpu_degraded, t.cpu_failed)
            .max(classify(memory, t.memory_degraded, t.memory_failed));
        CheckOutcome::new(status, format!("cpu {cpu:.1}%, memory {memory:.1}%"))
            .with_metric("cpu_percent", cpu)
            .with_metric("memory_percent", memory)
    }
}

impl HealthCheck for SystemResourceCheck {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn check(&self) -> anyhow::Result<CheckOutcome> {
        let (cpu, used, total) = {
            let mut sys = self.system.lock();
            sys.refresh_cpu_all();
            sys.refresh_memory();
            (f64::from(sys.global_cpu_usage()), sys.used_memory(), sys.total_memory())
        };
        if total == 0 {
            anyhow::bail!("total memory reported as zero");
        }
        let memory = used as f64 / total as f64 * 100.0;
        Ok(self.evaluate(cpu, memory))
    }
}

/// 资源占用检查
///
/// 被持有的资源占已注册资源的比例达到 `degraded_ratio` 时为 DEGRADED。
pub struct ArbiterCheck {
    arbiter: Arc<ResourceArbiter>,
    degraded_ratio: f64,
}

impl ArbiterCheck {
    pub const NAME: &'static str = "resource_arbiter";

    pub fn new(arbiter: Arc<ResourceArbiter>, degraded_ratio: f64) -> Self {
        Self {
            arbiter,
            degraded_ratio,
        }
    }
}

impl HealthCheck for ArbiterCheck {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn check(&self) -> anyhow::Result<CheckOutcome> {
        let (held, total) = self.arbiter.utilization();
        if total == 0 {
            return Ok(CheckOutcome::ok("no resources registered"));
        }
        let ratio = held as f64 / total as f64;
        let status = if ratio >= self.degraded_ratio {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };
        Ok(
            CheckOutcome::new(status, format!("{held}/{total} resource(s) held"))
                .with_metric("utilization", ratio)
                .with_metric("registered", total as f64),
        )
    }
}

/// 任务协调器检查
///
/// 丢失工作线程为 FAILED；积压超过阈值或已停止接收任务为 DEGRADED。
pub struct CoordinatorCheck {
    coordinator: Arc<TaskCoordinator>,
    backlog_threshold: usize,
}

impl CoordinatorCheck {
    pub const NAME: &'static str = "task_coordinator";

    pub fn new(coordinator: Arc<TaskCoordinator>, backlog_threshold: usize) -> Self {
        Self {
            coordinator,
            backlog_threshold,
        }
    }
}

impl HealthCheck for CoordinatorCheck {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn check(&self) -> anyhow::Result<CheckOutcome> {
        let stats = self.coordinator.stats();
        let (status, message) = if stats.lost_workers > 0 {
            (
                HealthStatus::Failed,
                format!("{} of {} worker(s) lost", stats.lost_workers, stats.workers),
            )
        } else if !self.coordinator.is_accepting() {
            (HealthStatus::Degraded, "not accepting tasks".to_string())
        } else if stats.pending > self.backlog_threshold {
            (
                HealthStatus::Degraded,
                format!("{} task(s) pending", stats.pending),
            )
        } else {
            (
                HealthStatus::Ok,
                format!("{} pending, {} running", stats.pending, stats.running),
            )
        };
        Ok(CheckOutcome::new(status, message)
            .with_metric("pending", stats.pending as f64)
            .with_metric("running", stats.running as f64)
            .with_metric("failed", stats.failed as f64))
    }
}

/// 未解决故障检查
///
/// 存在未解决的 CRITICAL/FATAL 故障为 FAILED，存在未解决的 ERROR 故障为 DEGRADED。
pub struct FaultCheck {
    faults: Arc<FaultRegistry>,
}

impl FaultCheck {
    pub const NAME: &'static str = "faults";

    pub fn new(faults: Arc<FaultRegistry>) -> Self {
        Self { faults }
    }
}

impl HealthCheck for FaultCheck {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn check(&self) -> anyhow::Result<CheckOutcome> {
        let counts = self.faults.counts();
        let blocking = counts.unresolved_at_least(FaultLevel::Critical);
        let errors = counts.unresolved_at_least(FaultLevel::Error) - blocking;
        let status = if blocking > 0 {
            HealthStatus::Failed
        } else if errors > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };
        Ok(CheckOutcome::new(
            status,
            format!("{} unresolved fault(s), {} critical", counts.unresolved, blocking),
        )
        .with_metric("unresolved", counts.unresolved as f64)
        .with_metric("critical", blocking as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::fault::FaultCategory;
    use crate::lock::{LockManager, LockMode};
    use crate::resource::ResourceKind;
    use crate::task::CoordinatorConfig;
    use std::time::Duration;

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(classify(10.0, 70.0, 90.0), HealthStatus::Ok);
        assert_eq!(classify(70.0, 70.0, 90.0), HealthStatus::Degraded);
        assert_eq!(classify(95.0, 70.0, 90.0), HealthStatus::Failed);
    }

    #[test]
    fn test_system_check_takes_worst_metric() {
        let check = SystemResourceCheck::new(ResourceThresholds::default());
        assert_eq!(check.evaluate(20.0, 30.0).status, HealthStatus::Ok);
        assert_eq!(check.evaluate(75.0, 30.0).status, HealthStatus::Degraded);
        let outcome = check.evaluate(20.0, 92.0);
        assert_eq!(outcome.status, HealthStatus::Failed);
        assert_eq!(outcome.metrics["memory_percent"], 92.0);
    }

    #[test]
    fn test_system_check_samples_host() {
        let check = SystemResourceCheck::new(ResourceThresholds::default());
        let outcome = check.check().unwrap();
        assert!(outcome.metrics.contains_key("cpu_percent"));
        assert!(outcome.metrics["memory_percent"] > 0.0);
    }

    #[test]
    fn test_fault_check_levels() {
        let faults = Arc::new(FaultRegistry::new(EventBus::new(), 16));
        let check = FaultCheck::new(faults.clone());
        assert_eq!(check.check().unwrap().status, HealthStatus::Ok);

        faults.report(FaultLevel::Warning, FaultCategory::Hardware, "a", "minor");
        assert_eq!(check.check().unwrap().status, HealthStatus::Ok);

        faults.report(FaultLevel::Error, FaultCategory::Hardware, "a", "error");
        assert_eq!(check.check().unwrap().status, HealthStatus::Degraded);

        let id = faults.report(FaultLevel::Critical, FaultCategory::Hardware, "a", "estop");
        assert_eq!(check.check().unwrap().status, HealthStatus::Failed);
        faults.resolve(id).unwrap();
        assert_eq!(check.check().unwrap().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_arbiter_check_utilization() {
        let bus = EventBus::new();
        let faults = Arc::new(FaultRegistry::new(bus.clone(), 16));
        let arbiter = Arc::new(ResourceArbiter::new(
            Arc::new(LockManager::new()),
            faults,
            bus,
        ));
        let check = ArbiterCheck::new(arbiter.clone(), 0.8);
        assert_eq!(check.check().unwrap().status, HealthStatus::Ok);

        arbiter.register("robot_1", ResourceKind::Robot).unwrap();
        let handle = arbiter
            .acquire("robot_1", LockMode::Exclusive, Duration::from_secs(1))
            .unwrap();
        assert_eq!(check.check().unwrap().status, HealthStatus::Degraded);
        arbiter.release(&handle).unwrap();
        assert_eq!(check.check().unwrap().status, HealthStatus::Ok);
    }

    #[test]
    fn test_coordinator_check_after_shutdown() {
        let bus = EventBus::new();
        let faults = Arc::new(FaultRegistry::new(bus.clone(), 16));
        let coordinator = Arc::new(
            TaskCoordinator::new(CoordinatorConfig::default(), bus, faults).unwrap(),
        );
        let check = CoordinatorCheck::new(coordinator.clone(), 10);
        assert_eq!(check.check().unwrap().status, HealthStatus::Ok);
        coordinator.shutdown(true, Duration::from_secs(5)).unwrap();
        assert_eq!(check.check().unwrap().status, HealthStatus::Degraded);
    }
}
