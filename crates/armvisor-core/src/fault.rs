//! 故障注册表与处理器（Fault Registry & Handler）
//!
//! 任何协作方（SDK 回调、UI 校验、后台检查）都可以直接 `report()` 一条故障，无需预先注册。
//! 注册表负责：
//!
//! - 记录故障并保存在有界历史中（未解决故障永不因容量被淘汰）
//! - 按注册顺序尝试匹配的自动恢复动作，第一个成功的动作解决该故障
//! - 自动恢复耗尽后，向第一个匹配的人工动作发出 `UserActionRequired` 请求
//! - 在事件总线上发布 `FaultRaised` / `FaultResolved` / `EmergencyStop` / `RecoveryProgress`
//! - 为资源仲裁器提供 [`FaultRegistry::blocking_fault`] 查询
//!
//! # 恢复动作
//!
//! 自动动作在独立的命名线程上执行，上报线程最多等待动作的时限
//! （默认 [`DEFAULT_RECOVERY_TIMEOUT`]）。超时视为失败，动作线程自行结束。
//! 人工动作（[`RecoveryActionKind::Manual`] / [`RecoveryActionKind::Interactive`]）不执行代码，
//! 只记录在故障上，等待操作员调用 [`FaultRegistry::complete_user_action`]。
//!
//! # 发布规则
//!
//! | 级别 | 恢复前 | 恢复成功 | 恢复耗尽 |
//! |------|--------|----------|----------|
//! | INFO..ERROR | - | `FaultResolved` | `FaultRaised` |
//! | CRITICAL | `FaultRaised` | `FaultResolved` | - |
//! | FATAL | `FaultRaised` + `EmergencyStop` | 不尝试恢复 | - |

use crate::error::FaultError;
use crate::event::{Event, EventBus};
use crate::id::{IdGenerator, id_type};
use crate::thread_util::{panic_message, spawn_named};
use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

id_type!(
    /// 故障 ID
    FaultId,
    "fault"
);

id_type!(
    /// 恢复动作 ID
    RecoveryId,
    "recovery"
);

/// 默认历史容量
pub const DEFAULT_FAULT_HISTORY: usize = 1000;

/// 单个自动恢复动作的默认时限
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// 故障级别（有序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FaultLevel {
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

impl FaultLevel {
    /// 全部级别（从低到高）
    pub const ALL: [FaultLevel; 5] = [
        FaultLevel::Info,
        FaultLevel::Warning,
        FaultLevel::Error,
        FaultLevel::Critical,
        FaultLevel::Fatal,
    ];

    /// 是否阻止独占访问
    pub fn blocks_exclusive(self) -> bool {
        self >= FaultLevel::Critical
    }
}

/// 故障类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FaultCategory {
    Hardware,
    Software,
    Network,
    Config,
    Safety,
}

/// 标准故障目录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FaultKind {
    RobotConnectionLost,
    JointLimitExceeded,
    EmergencyStopActivated,
    CollisionDetected,
    MotorOverheat,
    SensorFailure,
    ConfigurationError,
    SystemResourceExhausted,
}

impl FaultKind {
    /// 故障码（1001 起）
    pub fn code(self) -> u16 {
        match self {
            FaultKind::RobotConnectionLost => 1001,
            FaultKind::JointLimitExceeded => 1002,
            FaultKind::EmergencyStopActivated => 1003,
            FaultKind::CollisionDetected => 1004,
            FaultKind::MotorOverheat => 1005,
            FaultKind::SensorFailure => 1006,
            FaultKind::ConfigurationError => 1007,
            FaultKind::SystemResourceExhausted => 1008,
        }
    }

    pub fn level(self) -> FaultLevel {
        match self {
            FaultKind::JointLimitExceeded | FaultKind::MotorOverheat => FaultLevel::Warning,
            FaultKind::RobotConnectionLost
            | FaultKind::SensorFailure
            | FaultKind::ConfigurationError => FaultLevel::Error,
            FaultKind::EmergencyStopActivated
            | FaultKind::CollisionDetected
            | FaultKind::SystemResourceExhausted => FaultLevel::Critical,
        }
    }

    pub fn category(self) -> FaultCategory {
        match self {
            FaultKind::RobotConnectionLost => FaultCategory::Network,
            FaultKind::JointLimitExceeded
            | FaultKind::MotorOverheat
            | FaultKind::SensorFailure => FaultCategory::Hardware,
            FaultKind::EmergencyStopActivated | FaultKind::CollisionDetected => {
                FaultCategory::Safety
            },
            FaultKind::ConfigurationError => FaultCategory::Config,
            FaultKind::SystemResourceExhausted => FaultCategory::Software,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            FaultKind::RobotConnectionLost => "Robot connection lost",
            FaultKind::JointLimitExceeded => "Joint position exceeds safety limit",
            FaultKind::EmergencyStopActivated => "Emergency stop activated",
            FaultKind::CollisionDetected => "Collision detected",
            FaultKind::MotorOverheat => "Motor temperature too high",
            FaultKind::SensorFailure => "Sensor reading failed",
            FaultKind::ConfigurationError => "Invalid configuration",
            FaultKind::SystemResourceExhausted => "System resources exhausted",
        }
    }
}

/// 故障记录
///
/// 不变量：`resolved_at.is_some() == resolved`。
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Fault {
    pub id: FaultId,
    pub level: FaultLevel,
    pub category: FaultCategory,
    /// 来源组件（资源相关故障使用资源 ID）
    pub source: String,
    pub message: String,
    /// 来自标准目录时的故障类型
    pub kind: Option<FaultKind>,
    pub raised_at: SystemTime,
    pub resolved: bool,
    pub resolved_at: Option<SystemTime>,
    /// 解决该故障的恢复动作
    pub recovery_action: Option<RecoveryId>,
    /// 尝试过的恢复动作（按尝试顺序）
    pub recovery_attempts: Vec<RecoveryId>,
    /// 等待操作员完成的人工动作
    pub pending_user_action: Option<RecoveryId>,
}

impl Fault {
    fn mark_resolved(&mut self) {
        self.resolved = true;
        self.resolved_at = Some(SystemTime::now());
    }
}

/// 恢复动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RecoveryActionKind {
    /// 由注册表自动执行
    Automatic,
    /// 需要操作员处理（重启服务、更换硬件……）
    Manual,
    /// 需要操作员确认（确认现场安全后继续）
    Interactive,
}

/// 单次恢复尝试的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RecoveryStatus {
    /// 已请求人工动作，等待操作员
    Pending,
    InProgress,
    Succeeded,
    Failed,
    /// 超过动作时限
    TimedOut,
    /// 人工动作完成前故障已被直接解决
    Cancelled,
}

/// 已注册恢复动作的描述
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RecoveryActionInfo {
    pub id: RecoveryId,
    pub name: String,
    pub category: FaultCategory,
    pub kind: RecoveryActionKind,
    /// 自动动作的时限
    pub timeout: Option<Duration>,
}

type Predicate = Box<dyn Fn(&Fault) -> bool + Send + Sync>;
type Action = Arc<dyn Fn(&Fault) -> bool + Send + Sync>;

enum Handler {
    Automatic { action: Action, timeout: Duration },
    User {
        kind: RecoveryActionKind,
        instructions: String,
    },
}

struct RecoveryEntry {
    id: RecoveryId,
    name: String,
    category: FaultCategory,
    predicate: Predicate,
    handler: Handler,
}

impl RecoveryEntry {
    fn info(&self) -> RecoveryActionInfo {
        let (kind, timeout) = match &self.handler {
            Handler::Automatic { timeout, .. } => (RecoveryActionKind::Automatic, Some(*timeout)),
            Handler::User { kind, .. } => (*kind, None),
        };
        RecoveryActionInfo {
            id: self.id,
            name: self.name.clone(),
            category: self.category,
            kind,
            timeout,
        }
    }

    fn matches(&self, fault: &Fault) -> bool {
        if self.category != fault.category {
            return false;
        }
        match catch_unwind(AssertUnwindSafe(|| (self.predicate)(fault))) {
            Ok(matched) => matched,
            Err(payload) => {
                warn!(
                    "Recovery predicate '{}' panicked on {}: {}",
                    self.name,
                    fault.id,
                    panic_message(payload.as_ref())
                );
                false
            },
        }
    }
}

/// 各级别计数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FaultCounts {
    /// 历史中的记录总数
    pub total: usize,
    pub unresolved: usize,
    /// 按级别统计（包含已解决）
    pub by_level: BTreeMap<FaultLevel, usize>,
    /// 按级别统计（仅未解决）
    pub unresolved_by_level: BTreeMap<FaultLevel, usize>,
}

impl FaultCounts {
    /// 未解决且不低于 `level` 的故障数
    pub fn unresolved_at_least(&self, level: FaultLevel) -> usize {
        self.unresolved_by_level.range(level..).map(|(_, n)| n).sum()
    }
}

/// 故障注册表
pub struct FaultRegistry {
    bus: EventBus,
    ids: IdGenerator,
    recovery_ids: IdGenerator,
    capacity: usize,
    recovery_timeout: Duration,
    faults: Mutex<BTreeMap<FaultId, Fault>>,
    recoveries: Mutex<Vec<Arc<RecoveryEntry>>>,
}

impl std::fmt::Debug for FaultRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultRegistry")
            .field("capacity", &self.capacity)
            .field("records", &self.faults.lock().len())
            .field("recoveries", &self.recoveries.lock().len())
            .finish()
    }
}

impl FaultRegistry {
    /// 创建注册表
    ///
    /// `capacity` 为历史容量（最小为 1）。
    pub fn new(bus: EventBus, capacity: usize) -> Self {
        Self {
            bus,
            ids: IdGenerator::new(),
            recovery_ids: IdGenerator::new(),
            capacity: capacity.max(1),
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            faults: Mutex::new(BTreeMap::new()),
            recoveries: Mutex::new(Vec::new()),
        }
    }

    /// 设置 [`register_recovery`](Self::register_recovery) 使用的默认动作时限
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// 注册自动恢复动作（使用默认时限）
    ///
    /// 动作只对 `category` 类别且 `predicate` 返回 true 的故障尝试；
    /// 返回 true 表示恢复成功。动作 panic 或超时视为失败。
    pub fn register_recovery<P, A>(
        &self,
        name: impl Into<String>,
        category: FaultCategory,
        predicate: P,
        action: A,
    ) -> RecoveryId
    where
        P: Fn(&Fault) -> bool + Send + Sync + 'static,
        A: Fn(&Fault) -> bool + Send + Sync + 'static,
    {
        self.register_recovery_with_timeout(name, category, self.recovery_timeout, predicate, action)
    }

    /// 注册自动恢复动作，并指定该动作的时限
    pub fn register_recovery_with_timeout<P, A>(
        &self,
        name: impl Into<String>,
        category: FaultCategory,
        timeout: Duration,
        predicate: P,
        action: A,
    ) -> RecoveryId
    where
        P: Fn(&Fault) -> bool + Send + Sync + 'static,
        A: Fn(&Fault) -> bool + Send + Sync + 'static,
    {
        self.push_entry(
            name.into(),
            category,
            Box::new(predicate),
            Handler::Automatic {
                action: Arc::new(action),
                timeout,
            },
        )
    }

    /// 注册需要操作员处理的人工动作
    ///
    /// 自动动作全部失败后，第一个匹配的人工动作会被记录到
    /// [`Fault::pending_user_action`]，并发布带 `instructions` 的 `UserActionRequired` 事件。
    pub fn register_manual_recovery<P>(
        &self,
        name: impl Into<String>,
        category: FaultCategory,
        predicate: P,
        instructions: impl Into<String>,
    ) -> RecoveryId
    where
        P: Fn(&Fault) -> bool + Send + Sync + 'static,
    {
        self.push_entry(
            name.into(),
            category,
            Box::new(predicate),
            Handler::User {
                kind: RecoveryActionKind::Manual,
                instructions: instructions.into(),
            },
        )
    }

    /// 注册需要操作员确认的人工动作
    pub fn register_interactive_recovery<P>(
        &self,
        name: impl Into<String>,
        category: FaultCategory,
        predicate: P,
        prompt: impl Into<String>,
    ) -> RecoveryId
    where
        P: Fn(&Fault) -> bool + Send + Sync + 'static,
    {
        self.push_entry(
            name.into(),
            category,
            Box::new(predicate),
            Handler::User {
                kind: RecoveryActionKind::Interactive,
                instructions: prompt.into(),
            },
        )
    }

    fn push_entry(
        &self,
        name: String,
        category: FaultCategory,
        predicate: Predicate,
        handler: Handler,
    ) -> RecoveryId {
        let id = RecoveryId::from_raw(self.recovery_ids.next());
        let entry = RecoveryEntry {
            id,
            name,
            category,
            predicate,
            handler,
        };
        debug!(
            "Registered {:?} recovery action {} '{}' for {:?}",
            entry.info().kind,
            id,
            entry.name,
            category
        );
        self.recoveries.lock().push(Arc::new(entry));
        id
    }

    /// 已注册的恢复动作（按注册顺序）
    pub fn recovery_actions(&self) -> Vec<RecoveryActionInfo> {
        self.recoveries.lock().iter().map(|e| e.info()).collect()
    }

    /// 上报一条标准目录中的故障
    pub fn report_kind(&self, kind: FaultKind, source: &str, detail: Option<&str>) -> FaultId {
        let message = match detail {
            Some(detail) => format!("[{}] {}: {}", kind.code(), kind.description(), detail),
            None => format!("[{}] {}", kind.code(), kind.description()),
        };
        self.report_inner(kind.level(), kind.category(), source, message, Some(kind))
    }

    /// 上报故障
    pub fn report(
        &self,
        level: FaultLevel,
        category: FaultCategory,
        source: &str,
        message: impl Into<String>,
    ) -> FaultId {
        self.report_inner(level, category, source, message.into(), None)
    }

    fn report_inner(
        &self,
        level: FaultLevel,
        category: FaultCategory,
        source: &str,
        message: String,
        kind: Option<FaultKind>,
    ) -> FaultId {
        let fault = Fault {
            id: FaultId::from_raw(self.ids.next()),
            level,
            category,
            source: source.to_string(),
            message,
            kind,
            raised_at: SystemTime::now(),
            resolved: false,
            resolved_at: None,
            recovery_action: None,
            recovery_attempts: Vec::new(),
            pending_user_action: None,
        };
        let id = fault.id;

        match level {
            FaultLevel::Info => debug!(fault = %id, "Fault from {}: {}", source, fault.message),
            FaultLevel::Warning | FaultLevel::Error => {
                warn!(fault = %id, "{:?} fault from {}: {}", level, source, fault.message)
            },
            FaultLevel::Critical | FaultLevel::Fatal => {
                error!(fault = %id, "{:?} fault from {}: {}", level, source, fault.message)
            },
        }

        self.insert(fault.clone());

        if level >= FaultLevel::Critical {
            self.bus.publish(Event::FaultRaised(fault.clone()));
        }

        if level == FaultLevel::Fatal {
            error!(fault = %id, "FATAL fault, requesting emergency stop");
            self.bus.publish(Event::EmergencyStop {
                fault: id,
                source: fault.source,
                message: fault.message,
            });
            return id;
        }

        match self.run_recoveries(&fault) {
            Some(resolved) => self.bus.publish(Event::FaultResolved(resolved)),
            None => {
                let request = self.request_user_action(&fault);
                if level < FaultLevel::Critical {
                    if let Some(current) = self.get(id) {
                        self.bus.publish(Event::FaultRaised(current));
                    }
                }
                if let Some(request) = request {
                    self.bus.publish(request);
                }
            },
        }

        id
    }

    /// 依次尝试匹配的自动恢复动作，成功时返回已解决的记录
    fn run_recoveries(&self, fault: &Fault) -> Option<Fault> {
        let candidates: Vec<Arc<RecoveryEntry>> = self
            .recoveries
            .lock()
            .iter()
            .filter(|r| matches!(r.handler, Handler::Automatic { .. }))
            .cloned()
            .collect();

        for entry in candidates {
            let Handler::Automatic { action, timeout } = &entry.handler else {
                continue;
            };
            if !entry.matches(fault) {
                continue;
            }

            self.note_attempt(fault.id, entry.id);
            self.publish_progress(fault.id, &entry, RecoveryStatus::InProgress);
            let status = self.execute(&entry, action, *timeout, fault);
            self.publish_progress(fault.id, &entry, status);

            if status == RecoveryStatus::Succeeded {
                let mut faults = self.faults.lock();
                let record = faults.get_mut(&fault.id)?;
                // 恢复期间可能已被手动解决
                if record.resolved {
                    return None;
                }
                record.mark_resolved();
                record.recovery_action = Some(entry.id);
                info!(fault = %fault.id, "Fault auto-resolved by '{}'", entry.name);
                return Some(record.clone());
            }
        }
        None
    }

    /// 在命名线程上执行自动动作，最多等待 `timeout`
    fn execute(
        &self,
        entry: &RecoveryEntry,
        action: &Action,
        timeout: Duration,
        fault: &Fault,
    ) -> RecoveryStatus {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let action = Arc::clone(action);
        let snapshot = fault.clone();
        let spawned = spawn_named(entry.id.to_string(), move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| action(&snapshot)));
            let _ = tx.send(outcome.map_err(|p| panic_message(p.as_ref())));
        });
        if let Err(e) = spawned {
            warn!("Recovery action '{}' could not start: {}", entry.name, e);
            return RecoveryStatus::Failed;
        }

        match rx.recv_timeout(timeout) {
            Ok(Ok(true)) => RecoveryStatus::Succeeded,
            Ok(Ok(false)) => {
                debug!("Recovery action '{}' failed on {}", entry.name, fault.id);
                RecoveryStatus::Failed
            },
            Ok(Err(msg)) => {
                warn!("Recovery action '{}' panicked on {}: {}", entry.name, fault.id, msg);
                RecoveryStatus::Failed
            },
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Recovery action '{}' did not finish within {:?} on {}",
                    entry.name, timeout, fault.id
                );
                RecoveryStatus::TimedOut
            },
            Err(RecvTimeoutError::Disconnected) => RecoveryStatus::Failed,
        }
    }

    /// 记录第一个匹配的人工动作，返回待发布的请求事件
    fn request_user_action(&self, fault: &Fault) -> Option<Event> {
        let candidates: Vec<Arc<RecoveryEntry>> = self
            .recoveries
            .lock()
            .iter()
            .filter(|r| matches!(r.handler, Handler::User { .. }))
            .cloned()
            .collect();

        let entry = candidates.into_iter().find(|e| e.matches(fault))?;
        let Handler::User { kind, instructions } = &entry.handler else {
            return None;
        };

        {
            let mut faults = self.faults.lock();
            let record = faults.get_mut(&fault.id)?;
            if record.resolved {
                return None;
            }
            record.recovery_attempts.push(entry.id);
            record.pending_user_action = Some(entry.id);
        }
        warn!(
            fault = %fault.id,
            "User action '{}' required for {}: {}",
            entry.name, fault.source, instructions
        );
        self.publish_progress(fault.id, &entry, RecoveryStatus::Pending);
        Some(Event::UserActionRequired {
            fault: fault.id,
            action: entry.id,
            kind: *kind,
            name: entry.name.clone(),
            source: fault.source.clone(),
            instructions: instructions.clone(),
        })
    }

    fn publish_progress(&self, fault: FaultId, entry: &RecoveryEntry, status: RecoveryStatus) {
        self.bus.publish(Event::RecoveryProgress {
            fault,
            action: entry.id,
            name: entry.name.clone(),
            status,
        });
    }

    fn action_name(&self, id: RecoveryId) -> String {
        self.recoveries
            .lock()
            .iter()
            .find(|e| e.id == id)
            .map_or_else(|| id.to_string(), |e| e.name.clone())
    }

    fn note_attempt(&self, id: FaultId, recovery: RecoveryId) {
        if let Some(record) = self.faults.lock().get_mut(&id) {
            record.recovery_attempts.push(recovery);
        }
    }

    fn insert(&self, fault: Fault) {
        let mut faults = self.faults.lock();
        faults.insert(fault.id, fault);

        if faults.len() > self.capacity {
            let excess = faults.len() - self.capacity;
            let evict: Vec<FaultId> = faults
                .values()
                .filter(|f| f.resolved)
                .take(excess)
                .map(|f| f.id)
                .collect();
            for id in evict {
                faults.remove(&id);
            }
        }
    }

    /// 手动解决故障
    ///
    /// 首次解决返回 `Ok(true)` 并发布 `FaultResolved`；已解决的故障返回 `Ok(false)`，不发布事件。
    /// 等待中的人工动作以 [`RecoveryStatus::Cancelled`] 结束。
    pub fn resolve(&self, id: FaultId) -> Result<bool, FaultError> {
        self.finish(id, RecoveryStatus::Cancelled)
    }

    /// 操作员完成了请求的人工动作
    ///
    /// 故障以该动作解决（记录在 `recovery_action`）；没有等待中的人工动作时等同于 [`resolve`](Self::resolve)。
    pub fn complete_user_action(&self, id: FaultId) -> Result<bool, FaultError> {
        self.finish(id, RecoveryStatus::Succeeded)
    }

    fn finish(&self, id: FaultId, pending_outcome: RecoveryStatus) -> Result<bool, FaultError> {
        let (resolved, pending) = {
            let mut faults = self.faults.lock();
            let record = faults.get_mut(&id).ok_or(FaultError::NotFound(id))?;
            if record.resolved {
                return Ok(false);
            }
            record.mark_resolved();
            let pending = record.pending_user_action.take();
            if pending_outcome == RecoveryStatus::Succeeded {
                record.recovery_action = pending;
            }
            (record.clone(), pending)
        };

        info!(fault = %id, "Fault resolved: {}", resolved.message);
        if let Some(action) = pending {
            self.bus.publish(Event::RecoveryProgress {
                fault: id,
                action,
                name: self.action_name(action),
                status: pending_outcome,
            });
        }
        self.bus.publish(Event::FaultResolved(resolved));
        Ok(true)
    }

    /// `source` 上最早的未解决 CRITICAL/FATAL 故障
    pub fn blocking_fault(&self, source: &str) -> Option<FaultId> {
        self.faults
            .lock()
            .values()
            .find(|f| !f.resolved && f.level.blocks_exclusive() && f.source == source)
            .map(|f| f.id)
    }

    /// 未解决故障（从旧到新）
    pub fn unresolved(&self) -> Vec<Fault> {
        self.faults.lock().values().filter(|f| !f.resolved).cloned().collect()
    }

    /// 最近的 `limit` 条记录（从旧到新）
    pub fn history(&self, limit: usize) -> Vec<Fault> {
        let faults = self.faults.lock();
        let skip = faults.len().saturating_sub(limit);
        faults.values().skip(skip).cloned().collect()
    }

    pub fn get(&self, id: FaultId) -> Option<Fault> {
        self.faults.lock().get(&id).cloned()
    }

    pub fn counts(&self) -> FaultCounts {
        let faults = self.faults.lock();
        let mut counts = FaultCounts {
            total: faults.len(),
            ..Default::default()
        };
        for fault in faults.values() {
            *counts.by_level.entry(fault.level).or_default() += 1;
            if !fault.resolved {
                counts.unresolved += 1;
                *counts.unresolved_by_level.entry(fault.level).or_default() += 1;
            }
        }
        counts
    }

    /// 历史容量
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 自动动作的默认时限
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Topic;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn registry() -> (EventBus, FaultRegistry) {
        let bus = EventBus::new();
        let registry = FaultRegistry::new(bus.clone(), 16);
        (bus, registry)
    }

    fn count_topic(bus: &EventBus, topic: Topic) -> (Arc<AtomicUsize>, crate::event::Subscription) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = bus.subscribe(topic, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (hits, sub)
    }

    #[test]
    fn test_level_ordering() {
        assert!(FaultLevel::Info < FaultLevel::Warning);
        assert!(FaultLevel::Critical < FaultLevel::Fatal);
        assert!(FaultLevel::Critical.blocks_exclusive());
        assert!(!FaultLevel::Error.blocks_exclusive());
    }

    #[test]
    fn test_catalog_codes_unique() {
        let kinds = [
            FaultKind::RobotConnectionLost,
            FaultKind::JointLimitExceeded,
            FaultKind::EmergencyStopActivated,
            FaultKind::CollisionDetected,
            FaultKind::MotorOverheat,
            FaultKind::SensorFailure,
            FaultKind::ConfigurationError,
            FaultKind::SystemResourceExhausted,
        ];
        let mut codes: Vec<u16> = kinds.iter().map(|k| k.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert_eq!(FaultKind::CollisionDetected.level(), FaultLevel::Critical);
        assert_eq!(FaultKind::CollisionDetected.category(), FaultCategory::Safety);
    }

    #[test]
    fn test_report_without_recovery_publishes_raised() {
        let (bus, reg) = registry();
        let (raised, _s) = count_topic(&bus, Topic::FaultRaised);

        let id = reg.report(FaultLevel::Warning, FaultCategory::Hardware, "gripper", "slip");
        assert_eq!(raised.load(Ordering::SeqCst), 1);
        let fault = reg.get(id).unwrap();
        assert!(!fault.resolved);
        assert!(fault.resolved_at.is_none());
        assert_eq!(reg.unresolved().len(), 1);
    }

    #[test]
    fn test_recovery_resolves_and_references_action() {
        let (bus, reg) = registry();
        let (raised, _s1) = count_topic(&bus, Topic::FaultRaised);
        let (resolved, _s2) = count_topic(&bus, Topic::FaultResolved);

        let skip = reg.register_recovery("never", FaultCategory::Network, |_| false, |_| true);
        let fail = reg.register_recovery("fails", FaultCategory::Network, |_| true, |_| false);
        let ok = reg.register_recovery("reconnect", FaultCategory::Network, |_| true, |_| true);
        let _later = reg.register_recovery("unused", FaultCategory::Network, |_| true, |_| true);

        let id = reg.report(FaultLevel::Error, FaultCategory::Network, "robot_1", "link down");
        let fault = reg.get(id).unwrap();
        assert!(fault.resolved);
        assert!(fault.resolved_at.is_some());
        assert_eq!(fault.recovery_action, Some(ok));
        assert_eq!(fault.recovery_attempts, vec![fail, ok]);
        assert!(!fault.recovery_attempts.contains(&skip));
        assert_eq!(raised.load(Ordering::SeqCst), 0);
        assert_eq!(resolved.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recovery_category_must_match() {
        let (_bus, reg) = registry();
        reg.register_recovery("net", FaultCategory::Network, |_| true, |_| true);
        let id = reg.report(FaultLevel::Error, FaultCategory::Hardware, "cam", "no frames");
        assert!(!reg.get(id).unwrap().resolved);
    }

    #[test]
    fn test_panicking_recovery_counts_as_failure() {
        let (_bus, reg) = registry();
        reg.register_recovery("boom", FaultCategory::Software, |_| true, |_| panic!("oops"));
        let ok = reg.register_recovery("ok", FaultCategory::Software, |_| true, |_| true);
        let id = reg.report(FaultLevel::Error, FaultCategory::Software, "ui", "bad state");
        assert_eq!(reg.get(id).unwrap().recovery_action, Some(ok));
    }

    fn record_progress(bus: &EventBus) -> (Arc<Mutex<Vec<(RecoveryId, RecoveryStatus)>>>, crate::event::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = bus.subscribe(Topic::RecoveryProgress, move |event| {
            if let Event::RecoveryProgress { action, status, .. } = event {
                s.lock().push((*action, *status));
            }
            Ok(())
        });
        (seen, sub)
    }

    #[test]
    fn test_slow_recovery_times_out_and_next_runs() {
        let (bus, reg) = registry();
        let (progress, _s) = record_progress(&bus);
        let slow = reg.register_recovery_with_timeout(
            "reconnect",
            FaultCategory::Network,
            Duration::from_millis(50),
            |_| true,
            |_| {
                std::thread::sleep(Duration::from_millis(500));
                true
            },
        );
        let fallback = reg.register_recovery("reset_link", FaultCategory::Network, |_| true, |_| true);

        let start = Instant::now();
        let id = reg.report(FaultLevel::Error, FaultCategory::Network, "robot_1", "link down");
        assert!(start.elapsed() < Duration::from_millis(400));

        let fault = reg.get(id).unwrap();
        assert_eq!(fault.recovery_action, Some(fallback));
        assert_eq!(fault.recovery_attempts, vec![slow, fallback]);
        assert_eq!(
            *progress.lock(),
            vec![
                (slow, RecoveryStatus::InProgress),
                (slow, RecoveryStatus::TimedOut),
                (fallback, RecoveryStatus::InProgress),
                (fallback, RecoveryStatus::Succeeded),
            ]
        );
    }

    #[test]
    fn test_default_recovery_timeout_is_configurable() {
        let reg = FaultRegistry::new(EventBus::new(), 4).with_recovery_timeout(Duration::from_millis(40));
        assert_eq!(reg.recovery_timeout(), Duration::from_millis(40));
        let id = reg.register_recovery("hang", FaultCategory::Software, |_| true, |_| {
            std::thread::sleep(Duration::from_millis(400));
            true
        });
        assert_eq!(reg.recovery_actions()[0].timeout, Some(Duration::from_millis(40)));

        let start = Instant::now();
        let fault = reg.report(FaultLevel::Error, FaultCategory::Software, "ui", "stuck");
        assert!(start.elapsed() < Duration::from_millis(300));
        let fault = reg.get(fault).unwrap();
        assert!(!fault.resolved);
        assert_eq!(fault.recovery_attempts, vec![id]);
    }

    #[test]
    fn test_manual_recovery_requests_user_action() {
        let (bus, reg) = registry();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let r = requests.clone();
        let _sub = bus.subscribe(Topic::UserActionRequired, move |event| {
            if let Event::UserActionRequired {
                fault,
                kind,
                instructions,
                ..
            } = event
            {
                r.lock().push((*fault, *kind, instructions.clone()));
            }
            Ok(())
        });
        let (progress, _s) = record_progress(&bus);

        // 人工动作先注册，自动动作仍然先执行
        let manual = reg.register_manual_recovery(
            "restart_service",
            FaultCategory::Hardware,
            |_| true,
            "Power-cycle the gripper controller",
        );
        let auto = reg.register_recovery("retry", FaultCategory::Hardware, |_| true, |_| false);

        let id = reg.report(FaultLevel::Error, FaultCategory::Hardware, "gripper", "no response");
        let fault = reg.get(id).unwrap();
        assert!(!fault.resolved);
        assert_eq!(fault.pending_user_action, Some(manual));
        assert_eq!(fault.recovery_attempts, vec![auto, manual]);
        assert_eq!(
            *requests.lock(),
            vec![(id, RecoveryActionKind::Manual, "Power-cycle the gripper controller".to_string())]
        );
        assert_eq!(progress.lock().last(), Some(&(manual, RecoveryStatus::Pending)));

        assert_eq!(reg.complete_user_action(id), Ok(true));
        let fault = reg.get(id).unwrap();
        assert!(fault.resolved);
        assert_eq!(fault.recovery_action, Some(manual));
        assert_eq!(fault.pending_user_action, None);
        assert_eq!(progress.lock().last(), Some(&(manual, RecoveryStatus::Succeeded)));
        assert_eq!(reg.complete_user_action(id), Ok(false));
    }

    #[test]
    fn test_resolving_cancels_pending_user_action() {
        let (bus, reg) = registry();
        let (progress, _s) = record_progress(&bus);
        let confirm = reg.register_interactive_recovery(
            "confirm_area_clear",
            FaultCategory::Safety,
            |f| f.source == "robot_1",
            "Confirm the work cell is clear",
        );
        assert_eq!(reg.recovery_actions()[0].kind, RecoveryActionKind::Interactive);
        assert_eq!(reg.recovery_actions()[0].timeout, None);

        let other = reg.report(FaultLevel::Warning, FaultCategory::Safety, "robot_2", "light curtain");
        assert_eq!(reg.get(other).unwrap().pending_user_action, None);

        let id = reg.report(FaultLevel::Critical, FaultCategory::Safety, "robot_1", "collision");
        assert_eq!(reg.get(id).unwrap().pending_user_action, Some(confirm));
        assert_eq!(reg.blocking_fault("robot_1"), Some(id));

        assert_eq!(reg.resolve(id), Ok(true));
        let fault = reg.get(id).unwrap();
        assert_eq!(fault.recovery_action, None);
        assert_eq!(fault.pending_user_action, None);
        assert_eq!(progress.lock().last(), Some(&(confirm, RecoveryStatus::Cancelled)));
    }

    #[test]
    fn test_fatal_never_auto_resolved() {
        let (bus, reg) = registry();
        let (estop, _s1) = count_topic(&bus, Topic::EmergencyStop);
        let (raised, _s2) = count_topic(&bus, Topic::FaultRaised);
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        reg.register_recovery("reset", FaultCategory::Safety, |_| true, move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            true
        });
        reg.register_manual_recovery("inspect", FaultCategory::Safety, |_| true, "Inspect the cell");

        let id = reg.report(FaultLevel::Fatal, FaultCategory::Safety, "robot_1", "lockout");
        assert!(!reg.get(id).unwrap().resolved);
        assert_eq!(reg.get(id).unwrap().pending_user_action, None);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(estop.load(Ordering::SeqCst), 1);
        assert_eq!(raised.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_critical_published_even_when_recovered() {
        let (bus, reg) = registry();
        let (raised, _s1) = count_topic(&bus, Topic::FaultRaised);
        let (resolved, _s2) = count_topic(&bus, Topic::FaultResolved);
        reg.register_recovery("clear", FaultCategory::Hardware, |_| true, |_| true);

        reg.report(FaultLevel::Critical, FaultCategory::Hardware, "robot_1", "overcurrent");
        assert_eq!(raised.load(Ordering::SeqCst), 1);
        assert_eq!(resolved.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolve_idempotent() {
        let (bus, reg) = registry();
        let (resolved, _s) = count_topic(&bus, Topic::FaultResolved);
        let id = reg.report(FaultLevel::Critical, FaultCategory::Hardware, "robot_1", "estop");

        assert_eq!(reg.resolve(id), Ok(true));
        assert_eq!(reg.resolve(id), Ok(false));
        assert_eq!(resolved.load(Ordering::SeqCst), 1);
        assert_eq!(
            reg.resolve(FaultId::from_raw(999)),
            Err(FaultError::NotFound(FaultId::from_raw(999)))
        );
    }

    #[test]
    fn test_blocking_fault_lookup() {
        let (_bus, reg) = registry();
        reg.report(FaultLevel::Error, FaultCategory::Hardware, "robot_1", "minor");
        assert_eq!(reg.blocking_fault("robot_1"), None);

        let id = reg.report(FaultLevel::Critical, FaultCategory::Hardware, "robot_1", "estop");
        assert_eq!(reg.blocking_fault("robot_1"), Some(id));
        assert_eq!(reg.blocking_fault("gripper"), None);

        reg.resolve(id).unwrap();
        assert_eq!(reg.blocking_fault("robot_1"), None);
    }

    #[test]
    fn test_capacity_never_evicts_unresolved() {
        let bus = EventBus::new();
        let reg = FaultRegistry::new(bus, 3);

        let first = reg.report(FaultLevel::Warning, FaultCategory::Config, "cfg", "a");
        for _ in 0..4 {
            let id = reg.report(FaultLevel::Info, FaultCategory::Config, "cfg", "noise");
            reg.resolve(id).unwrap();
        }
        let history = reg.history(usize::MAX);
        assert!(history.len() <= 3);
        assert!(reg.get(first).is_some());

        // 全部未解决时容量可以被突破
        let reg = FaultRegistry::new(EventBus::new(), 2);
        for _ in 0..5 {
            reg.report(FaultLevel::Warning, FaultCategory::Config, "cfg", "pending");
        }
        assert_eq!(reg.unresolved().len(), 5);
    }

    #[test]
    fn test_counts_by_level() {
        let (_bus, reg) = registry();
        reg.report(FaultLevel::Warning, FaultCategory::Hardware, "a", "1");
        let id = reg.report(FaultLevel::Critical, FaultCategory::Hardware, "a", "2");
        reg.report(FaultLevel::Critical, FaultCategory::Hardware, "b", "3");
        reg.resolve(id).unwrap();

        let counts = reg.counts();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.unresolved, 2);
        assert_eq!(counts.by_level[&FaultLevel::Critical], 2);
        assert_eq!(counts.unresolved_at_least(FaultLevel::Critical), 1);
        assert_eq!(counts.unresolved_at_least(FaultLevel::Warning), 2);
    }

    #[test]
    fn test_report_kind_uses_catalog() {
        let (_bus, reg) = registry();
        let id = reg.report_kind(FaultKind::MotorOverheat, "joint_3", Some("82C"));
        let fault = reg.get(id).unwrap();
        assert_eq!(fault.level, FaultLevel::Warning);
        assert_eq!(fault.category, FaultCategory::Hardware);
        assert_eq!(fault.kind, Some(FaultKind::MotorOverheat));
        assert!(fault.message.contains("1005") && fault.message.contains("82C"));
    }
}
