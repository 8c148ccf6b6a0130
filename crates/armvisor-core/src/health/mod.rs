//! 健康监控（Health Monitor）
//!
//! 周期性执行已注册的 [`HealthCheck`]，汇总出综合健康状态。
//!
//! # 汇总规则
//!
//! - 综合状态取所有检查中最严重的一项：`OK < DEGRADED < FAILED`
//! - `UNKNOWN`（检查结果未知，或已注册但尚未执行过）按 `FAILED` 计入综合状态
//! - 没有注册任何检查时综合状态为 `OK`
//!
//! # 事件
//!
//! 只在状态变化时发布：单项检查变化发布 `HealthCheckChanged`，
//! 综合状态变化发布 `HealthChanged`。连续相同的轮次不重复发布。
//!
//! 检查返回错误或 panic 都视为该轮 `FAILED`，不会中断监控线程。

pub mod checks;

use crate::error::CoreError;
use crate::event::{Event, EventBus};
use crate::thread_util::{JoinFailure, JoinTimeout, panic_message, spawn_named};
use arc_swap::ArcSwap;
use crossbeam_channel::{Sender, select};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

pub use checks::{
    ArbiterCheck, CoordinatorCheck, FaultCheck, ResourceThresholds, SystemResourceCheck,
};

/// 默认监控周期
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// 健康状态
///
/// 声明顺序即严重程度顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum HealthStatus {
    Ok,
    Degraded,
    Failed,
    Unknown,
}

impl HealthStatus {
    /// 参与汇总时的等效状态
    pub fn effective(self) -> HealthStatus {
        match self {
            HealthStatus::Unknown => HealthStatus::Failed,
            other => other,
        }
    }

    /// 汇总多个状态；空集合为 `Ok`
    pub fn aggregate<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> HealthStatus {
        statuses
            .into_iter()
            .map(HealthStatus::effective)
            .max()
            .unwrap_or(HealthStatus::Ok)
    }
}

/// 单次检查的输出
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CheckOutcome {
    pub status: HealthStatus,
    pub message: String,
    /// 结构化指标（如 `cpu_percent`）
    pub metrics: BTreeMap<String, f64>,
}

impl CheckOutcome {
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Ok, message)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Failed, message)
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }
}

/// 健康检查
pub trait HealthCheck: Send + Sync {
    /// 唯一名称
    fn name(&self) -> &str;

    /// 执行周期；`None` 表示每轮都执行
    fn interval(&self) -> Option<Duration> {
        None
    }

    fn check(&self) -> anyhow::Result<CheckOutcome>;
}

/// 单项检查的最新结果
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub metrics: BTreeMap<String, f64>,
    pub interval: Option<Duration>,
    /// 从未执行为 `None`
    pub last_run_at: Option<SystemTime>,
    pub duration: Duration,
}

/// 健康报告
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HealthReport {
    /// 综合状态
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
    pub generated_at: SystemTime,
    /// 评估轮次（从 1 开始，0 表示尚未评估）
    pub round: u64,
}

impl HealthReport {
    fn empty() -> Self {
        Self {
            status: HealthStatus::Ok,
            checks: Vec::new(),
            generated_at: SystemTime::now(),
            round: 0,
        }
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

struct Registered {
    check: Arc<dyn HealthCheck>,
    last: Option<CheckResult>,
    last_run: Option<Instant>,
}

impl Registered {
    fn is_due(&self, now: Instant) -> bool {
        match (self.last_run, self.check.interval()) {
            (None, _) | (_, None) => true,
            (Some(at), Some(interval)) => now.duration_since(at) >= interval,
        }
    }

    fn result(&self) -> CheckResult {
        self.last.clone().unwrap_or_else(|| CheckResult {
            name: self.check.name().to_string(),
            status: HealthStatus::Unknown,
            message: "not yet run".to_string(),
            metrics: BTreeMap::new(),
            interval: self.check.interval(),
            last_run_at: None,
            duration: Duration::ZERO,
        })
    }
}

struct Running {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// 健康监控
pub struct HealthMonitor {
    bus: EventBus,
    checks: Mutex<Vec<Registered>>,
    latest: ArcSwap<HealthReport>,
    /// 串行化评估轮次
    round_lock: Mutex<()>,
    rounds: AtomicU64,
    running: Mutex<Option<Running>>,
}

impl HealthMonitor {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            checks: Mutex::new(Vec::new()),
            latest: ArcSwap::from_pointee(HealthReport::empty()),
            round_lock: Mutex::new(()),
            rounds: AtomicU64::new(0),
            running: Mutex::new(None),
        }
    }

    /// 注册检查
    ///
    /// 同名检查会被替换。
    pub fn register_check(&self, check: Arc<dyn HealthCheck>) {
        let mut checks = self.checks.lock();
        let name = check.name().to_string();
        let entry = Registered {
            check,
            last: None,
            last_run: None,
        };
        match checks.iter_mut().find(|r| r.check.name() == name) {
            Some(existing) => {
                warn!("Replacing health check '{}'", name);
                *existing = entry;
            },
            None => {
                debug!("Registered health check '{}'", name);
                checks.push(entry);
            },
        }
    }

    pub fn unregister_check(&self, name: &str) -> bool {
        let mut checks = self.checks.lock();
        let before = checks.len();
        checks.retain(|r| r.check.name() != name);
        checks.len() != before
    }

    pub fn check_names(&self) -> Vec<String> {
        self.checks.lock().iter().map(|r| r.check.name().to_string()).collect()
    }

    /// 执行全部检查并返回报告
    pub fn run_once(&self) -> HealthReport {
        self.evaluate(true)
    }

    /// 最近一次报告（无锁读取）
    pub fn latest(&self) -> Arc<HealthReport> {
        self.latest.load_full()
    }

    /// 最近一次的综合状态
    pub fn status(&self) -> HealthStatus {
        self.latest.load().status
    }

    fn evaluate(&self, force: bool) -> HealthReport {
        let round = self.round_lock.lock();
        let now = Instant::now();

        let due: Vec<Arc<dyn HealthCheck>> = self
            .checks
            .lock()
            .iter()
            .filter(|r| force || r.is_due(now))
            .map(|r| r.check.clone())
            .collect();

        // 检查在锁外执行
        let fresh: Vec<(CheckResult, Instant)> = due
            .iter()
            .map(|c| (run_check(c.as_ref()), Instant::now()))
            .collect();

        let mut changes = Vec::new();
        let report = {
            let mut checks = self.checks.lock();
            for (result, ran_at) in fresh {
                let Some(entry) = checks.iter_mut().find(|r| r.check.name() == result.name)
                else {
                    continue;
                };
                let previous = entry
                    .last
                    .as_ref()
                    .map_or(HealthStatus::Unknown, |l| l.status);
                if previous != result.status {
                    changes.push(Event::HealthCheckChanged {
                        check: result.name.clone(),
                        previous,
                        current: result.status,
                        message: result.message.clone(),
                    });
                }
                entry.last = Some(result);
                entry.last_run = Some(ran_at);
            }

            let results: Vec<CheckResult> = checks.iter().map(Registered::result).collect();
            HealthReport {
                status: HealthStatus::aggregate(results.iter().map(|r| r.status)),
                checks: results,
                generated_at: SystemTime::now(),
                round: self.rounds.fetch_add(1, Ordering::Relaxed) + 1,
            }
        };

        let previous = self.latest.swap(Arc::new(report.clone())).status;
        if previous != report.status {
            info!("System health {:?} -> {:?}", previous, report.status);
            changes.push(Event::HealthChanged {
                previous,
                current: report.status,
            });
        }

        // 处理器可能再次触发评估
        drop(round);
        for event in changes {
            self.bus.publish(event);
        }
        report
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// 启动监控线程
    ///
    /// 启动后立即执行一轮，之后每个 `interval` 执行到期的检查。
    pub fn start(self: &Arc<Self>, interval: Duration) -> Result<(), CoreError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(CoreError::AlreadyRunning("health monitor"));
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let monitor = Arc::clone(self);
        let handle = spawn_named("health-monitor", move || {
            info!("Health monitor started (interval {:?})", interval);
            let ticker = crossbeam_channel::tick(interval);
            monitor.evaluate(true);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        monitor.evaluate(false);
                    },
                    recv(stop_rx) -> _ => break,
                }
            }
            info!("Health monitor stopped");
        })?;

        *running = Some(Running { stop_tx, handle });
        Ok(())
    }

    /// 停止监控线程
    pub fn stop(&self, timeout: Duration) -> Result<(), CoreError> {
        let Some(Running { stop_tx, handle }) = self.running.lock().take() else {
            return Ok(());
        };
        let _ = stop_tx.send(());
        match handle.join_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(JoinFailure::TimedOut) => Err(CoreError::JoinTimeout {
                name: "health-monitor".into(),
                timeout,
            }),
            Err(JoinFailure::Panicked(msg)) => {
                warn!("Health monitor thread panicked: {}", msg);
                Ok(())
            },
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("checks", &self.check_names())
            .field("status", &self.status())
            .field("running", &self.is_running())
            .finish()
    }
}

fn run_check(check: &dyn HealthCheck) -> CheckResult {
    let started = Instant::now();
    let outcome = match catch_unwind(AssertUnwindSafe(|| check.check())) {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!("Health check '{}' failed: {:#}", check.name(), e);
            CheckOutcome::failed(format!("check error: {e:#}"))
        },
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            warn!("Health check '{}' panicked: {}", check.name(), msg);
            CheckOutcome::failed(format!("check panicked: {msg}"))
        },
    };
    CheckResult {
        name: check.name().to_string(),
        status: outcome.status,
        message: outcome.message,
        metrics: outcome.metrics,
        interval: check.interval(),
        last_run_at: Some(SystemTime::now()),
        duration: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Topic;
    use std::sync::atomic::AtomicUsize;

    /// 返回预设状态序列的检查
    struct Scripted {
        name: &'static str,
        statuses: Mutex<Vec<HealthStatus>>,
        interval: Option<Duration>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, statuses: &[HealthStatus]) -> Arc<Self> {
            Arc::new(Self {
                name,
                statuses: Mutex::new(statuses.iter().rev().copied().collect()),
                interval: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl HealthCheck for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn interval(&self) -> Option<Duration> {
            self.interval
        }

        fn check(&self) -> anyhow::Result<CheckOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut statuses = self.statuses.lock();
            let status = if statuses.len() > 1 {
                statuses.pop().unwrap_or(HealthStatus::Ok)
            } else {
                statuses.last().copied().unwrap_or(HealthStatus::Ok)
            };
            Ok(CheckOutcome::new(status, format!("{status:?}")))
        }
    }

    struct Erroring;

    impl HealthCheck for Erroring {
        fn name(&self) -> &str {
            "erroring"
        }

        fn check(&self) -> anyhow::Result<CheckOutcome> {
            anyhow::bail!("sensor unreachable")
        }
    }

    struct Panicking;

    impl HealthCheck for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn check(&self) -> anyhow::Result<CheckOutcome> {
            panic!("check bug")
        }
    }

    fn counter(bus: &EventBus, topic: Topic) -> (Arc<AtomicUsize>, crate::event::Subscription) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = bus.subscribe(topic, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (hits, sub)
    }

    #[test]
    fn test_aggregate_worst_status() {
        use HealthStatus::*;
        assert_eq!(HealthStatus::aggregate([]), Ok);
        assert_eq!(HealthStatus::aggregate([Ok, Degraded]), Degraded);
        assert_eq!(HealthStatus::aggregate([Ok, Failed, Degraded]), Failed);
        assert_eq!(HealthStatus::aggregate([Ok, Unknown]), Failed);
    }

    #[test]
    fn test_empty_monitor_is_ok() {
        let monitor = HealthMonitor::new(EventBus::new());
        let report = monitor.run_once();
        assert_eq!(report.status, HealthStatus::Ok);
        assert!(report.checks.is_empty());
    }

    #[test]
    fn test_error_and_panic_count_as_failed() {
        let monitor = HealthMonitor::new(EventBus::new());
        monitor.register_check(Arc::new(Erroring));
        monitor.register_check(Arc::new(Panicking));
        let report = monitor.run_once();
        assert_eq!(report.status, HealthStatus::Failed);
        assert_eq!(report.check("erroring").unwrap().status, HealthStatus::Failed);
        assert!(report.check("panicking").unwrap().message.contains("check bug"));
    }

    #[test]
    fn test_publishes_only_on_transition() {
        let bus = EventBus::new();
        let (overall, _s1) = counter(&bus, Topic::HealthChanged);
        let (per_check, _s2) = counter(&bus, Topic::HealthCheckChanged);

        let monitor = HealthMonitor::new(bus.clone());
        monitor.register_check(Scripted::new(
            "cpu",
            &[HealthStatus::Ok, HealthStatus::Ok, HealthStatus::Failed, HealthStatus::Failed],
        ));

        // UNKNOWN -> OK（单项）；综合 OK -> OK 不发布
        monitor.run_once();
        assert_eq!(per_check.load(Ordering::SeqCst), 1);
        assert_eq!(overall.load(Ordering::SeqCst), 0);

        monitor.run_once();
        assert_eq!(per_check.load(Ordering::SeqCst), 1);

        monitor.run_once();
        assert_eq!(per_check.load(Ordering::SeqCst), 2);
        assert_eq!(overall.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.status(), HealthStatus::Failed);

        monitor.run_once();
        assert_eq!(per_check.load(Ordering::SeqCst), 2);
        assert_eq!(overall.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unrun_check_reports_unknown() {
        let monitor = HealthMonitor::new(EventBus::new());
        let slow = Arc::new(Scripted {
            name: "slow",
            statuses: Mutex::new(vec![HealthStatus::Ok]),
            interval: Some(Duration::from_secs(3600)),
            calls: AtomicUsize::new(0),
        });
        monitor.register_check(slow.clone());

        // 首轮总会执行，之后周期未到不再执行
        monitor.evaluate(false);
        monitor.evaluate(false);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);

        monitor.register_check(Scripted::new("late", &[HealthStatus::Ok]));
        let snapshot = {
            let checks = monitor.checks.lock();
            checks.iter().map(Registered::result).collect::<Vec<_>>()
        };
        let late = snapshot.iter().find(|c| c.name == "late").unwrap();
        assert_eq!(late.status, HealthStatus::Unknown);
        assert_eq!(
            HealthStatus::aggregate(snapshot.iter().map(|c| c.status)),
            HealthStatus::Failed
        );
    }

    #[test]
    fn test_start_stop_updates_latest() {
        let monitor = Arc::new(HealthMonitor::new(EventBus::new()));
        monitor.register_check(Scripted::new("ok", &[HealthStatus::Ok]));
        monitor.start(Duration::from_millis(10)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.latest().round < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        monitor.stop(Duration::from_secs(1)).unwrap();
        assert!(monitor.latest().round >= 2);
        assert_eq!(monitor.status(), HealthStatus::Ok);
        assert!(!monitor.is_running());
    }
}
