//! 异常恢复引擎（Exception Recovery Engine）
//!
//! 记录操作失败、按错误类型/种类匹配恢复策略，并在 [`ExceptionRecoveryEngine::run_scoped`]
//! 中按策略重试。
//!
//! # 分类
//!
//! 沿错误的 `source()` 链查找：`std::io::Error` 的 `ErrorKind`、本 crate 的
//! [`LockError`] / [`ArbiterError`] / [`TaskError`]，都不匹配时再询问用户注册的分类器。
//!
//! | 种类 | 严重度 | 默认策略 |
//! |------|--------|----------|
//! | `Network` | WARNING | 指数退避重试 |
//! | `Timeout` | WARNING | 重试一次 |
//! | `Deadlock` | WARNING | 重试一次 |
//! | `Io` / `Other` | ERROR | - |
//! | `ResourceFaulted` / `ResourceExhausted` | CRITICAL | - |
//!
//! CRITICAL 记录不会被吞掉也不会重试：策略只被调用一次（用于副作用），
//! 随后以 CRITICAL 故障上报到 [`FaultRegistry`]（来源为上下文中的组件名）。

mod backoff;

pub use backoff::BackoffPolicy;

use crate::error::{ArbiterError, LockError, RecoveryError, TaskError};
use crate::event::{Event, EventBus};
use crate::fault::{FaultCategory, FaultLevel, FaultRegistry};
use crate::id::{IdGenerator, id_type};
use crate::thread_util::panic_message;
use parking_lot::Mutex;
use std::any::type_name;
use std::collections::BTreeMap;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

id_type!(
    /// 异常记录 ID
    RecordId,
    "exception"
);

/// 默认历史容量
pub const DEFAULT_EXCEPTION_HISTORY: usize = 1000;

/// `run_scoped` 中单次调用的总尝试上限（防止策略无限返回 `Recovered`）
pub const MAX_SCOPED_ATTEMPTS: u32 = 32;

/// 异常种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ExceptionKind {
    Network,
    Timeout,
    Deadlock,
    ResourceExhausted,
    ResourceFaulted,
    Io,
    Other,
}

impl ExceptionKind {
    pub fn severity(self) -> FaultLevel {
        match self {
            ExceptionKind::Network | ExceptionKind::Timeout | ExceptionKind::Deadlock => {
                FaultLevel::Warning
            },
            ExceptionKind::Io | ExceptionKind::Other => FaultLevel::Error,
            ExceptionKind::ResourceFaulted | ExceptionKind::ResourceExhausted => {
                FaultLevel::Critical
            },
        }
    }

    /// 上报为故障时使用的类别
    pub fn fault_category(self) -> FaultCategory {
        match self {
            ExceptionKind::Network => FaultCategory::Network,
            ExceptionKind::ResourceFaulted => FaultCategory::Hardware,
            _ => FaultCategory::Software,
        }
    }

    /// 内置分类（不含用户分类器）
    pub fn classify(error: &anyhow::Error) -> Self {
        for cause in error.chain() {
            if let Some(kind) = classify_cause(cause) {
                return kind;
            }
        }
        ExceptionKind::Other
    }
}

fn classify_io(kind: io::ErrorKind) -> ExceptionKind {
    use io::ErrorKind as K;
    match kind {
        K::ConnectionRefused
        | K::ConnectionReset
        | K::ConnectionAborted
        | K::NotConnected
        | K::AddrInUse
        | K::AddrNotAvailable
        | K::BrokenPipe => ExceptionKind::Network,
        K::TimedOut | K::WouldBlock => ExceptionKind::Timeout,
        K::OutOfMemory => ExceptionKind::ResourceExhausted,
        _ => ExceptionKind::Io,
    }
}

fn classify_lock(error: &LockError) -> ExceptionKind {
    match error {
        LockError::Timeout { .. } => ExceptionKind::Timeout,
        LockError::Deadlock { .. } => ExceptionKind::Deadlock,
        LockError::NotHeld(_) => ExceptionKind::Other,
    }
}

fn classify_cause(cause: &(dyn std::error::Error + 'static)) -> Option<ExceptionKind> {
    if let Some(e) = cause.downcast_ref::<io::Error>() {
        return Some(classify_io(e.kind()));
    }
    if let Some(e) = cause.downcast_ref::<LockError>() {
        return Some(classify_lock(e));
    }
    if let Some(e) = cause.downcast_ref::<ArbiterError>() {
        return match e {
            ArbiterError::ResourceFaulted { .. } => Some(ExceptionKind::ResourceFaulted),
            ArbiterError::Lock(lock) => Some(classify_lock(lock)),
            ArbiterError::SharedLimit { .. } => Some(ExceptionKind::Timeout),
            _ => None,
        };
    }
    if let Some(TaskError::Timeout { .. }) = cause.downcast_ref::<TaskError>() {
        return Some(ExceptionKind::Timeout);
    }
    None
}

/// 为 `anyhow::Error` 找出更具体的类型名
fn refine_type_name(error: &anyhow::Error) -> &'static str {
    if error.downcast_ref::<io::Error>().is_some() {
        type_name::<io::Error>()
    } else if error.downcast_ref::<LockError>().is_some() {
        type_name::<LockError>()
    } else if error.downcast_ref::<ArbiterError>().is_some() {
        type_name::<ArbiterError>()
    } else if error.downcast_ref::<TaskError>().is_some() {
        type_name::<TaskError>()
    } else {
        type_name::<anyhow::Error>()
    }
}

/// 异常发生的位置
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RecoveryContext {
    /// 组件名（CRITICAL 上报时作为故障来源）
    pub component: String,
    pub operation: String,
}

impl RecoveryContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
        }
    }
}

/// 异常记录
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ExceptionRecord {
    pub id: RecordId,
    /// 错误类型名（`std::any::type_name`）
    pub exception_type: String,
    pub kind: ExceptionKind,
    pub severity: FaultLevel,
    pub context: RecoveryContext,
    pub message: String,
    pub raised_at: SystemTime,
    /// 记录时匹配到的策略
    pub matched_strategy: Option<String>,
    /// 最终使记录解决的策略
    pub recovery_strategy_applied: Option<String>,
    /// 策略被询问的次数
    pub attempts: u32,
    pub resolved: bool,
    pub resolved_at: Option<SystemTime>,
}

impl ExceptionRecord {
    fn mark_resolved(&mut self, strategy: Option<&str>) {
        self.resolved = true;
        self.resolved_at = Some(SystemTime::now());
        if let Some(name) = strategy {
            self.recovery_strategy_applied = Some(name.to_string());
        }
    }
}

/// 策略的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// 故障条件已消除，可以立即重试
    Recovered,
    /// 等待后重试
    RetryAfter(Duration),
    GiveUp,
}

/// 恢复策略
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// `attempt` 从 0 开始
    fn decide(&self, record: &ExceptionRecord, attempt: u32) -> RecoveryDecision;
}

/// 闭包策略
pub struct FnStrategy<F> {
    name: String,
    f: F,
}

impl<F> FnStrategy<F>
where
    F: Fn(&ExceptionRecord, u32) -> RecoveryDecision + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> RecoveryStrategy for FnStrategy<F>
where
    F: Fn(&ExceptionRecord, u32) -> RecoveryDecision + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn decide(&self, record: &ExceptionRecord, attempt: u32) -> RecoveryDecision {
        (self.f)(record, attempt)
    }
}

/// 按退避策略重试
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    name: String,
    policy: BackoffPolicy,
}

impl RetryStrategy {
    pub fn new(name: impl Into<String>, policy: BackoffPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

impl RecoveryStrategy for RetryStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn decide(&self, _record: &ExceptionRecord, attempt: u32) -> RecoveryDecision {
        self.policy
            .next(attempt)
            .map_or(RecoveryDecision::GiveUp, RecoveryDecision::RetryAfter)
    }
}

type Predicate = Arc<dyn Fn(&ExceptionRecord) -> bool + Send + Sync>;
type Classifier = Arc<dyn Fn(&anyhow::Error) -> Option<ExceptionKind> + Send + Sync>;

/// 策略匹配条件
///
/// 查找顺序：`Type` → `Kind` → `Predicate`（按注册顺序）→ `Any`。
/// 同一 `Type` / `Kind` / `Any` 注册多次时，后注册的生效。
#[derive(Clone)]
pub enum StrategyMatch {
    /// 精确的错误类型名（见 [`StrategyMatch::error_type`]）
    Type(&'static str),
    Kind(ExceptionKind),
    Predicate(Predicate),
    Any,
}

impl StrategyMatch {
    pub fn error_type<E: ?Sized + 'static>() -> Self {
        StrategyMatch::Type(type_name::<E>())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&ExceptionRecord) -> bool + Send + Sync + 'static,
    {
        StrategyMatch::Predicate(Arc::new(f))
    }
}

impl std::fmt::Debug for StrategyMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyMatch::Type(name) => f.debug_tuple("Type").field(name).finish(),
            StrategyMatch::Kind(kind) => f.debug_tuple("Kind").field(kind).finish(),
            StrategyMatch::Predicate(_) => f.write_str("Predicate(..)"),
            StrategyMatch::Any => f.write_str("Any"),
        }
    }
}

#[derive(Clone)]
struct StrategyEntry {
    matcher: StrategyMatch,
    strategy: Arc<dyn RecoveryStrategy>,
}

/// 引擎配置
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
    pub history: usize,
    /// 网络异常的默认退避
    pub network_backoff: BackoffPolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            history: DEFAULT_EXCEPTION_HISTORY,
            network_backoff: BackoffPolicy::default(),
        }
    }
}

/// 异常恢复引擎
pub struct ExceptionRecoveryEngine {
    bus: EventBus,
    faults: Arc<FaultRegistry>,
    ids: IdGenerator,
    capacity: usize,
    records: Mutex<BTreeMap<RecordId, ExceptionRecord>>,
    strategies: Mutex<Vec<StrategyEntry>>,
    classifiers: Mutex<Vec<Classifier>>,
}

impl std::fmt::Debug for ExceptionRecoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionRecoveryEngine")
            .field("capacity", &self.capacity)
            .field("records", &self.records.lock().len())
            .field("strategies", &self.strategies.lock().len())
            .finish()
    }
}

impl ExceptionRecoveryEngine {
    /// 创建引擎并注册默认策略
    pub fn new(config: RecoveryConfig, bus: EventBus, faults: Arc<FaultRegistry>) -> Self {
        let engine = Self {
            bus,
            faults,
            ids: IdGenerator::new(),
            capacity: config.history.max(1),
            records: Mutex::new(BTreeMap::new()),
            strategies: Mutex::new(Vec::new()),
            classifiers: Mutex::new(Vec::new()),
        };
        engine.register_strategy(
            StrategyMatch::Kind(ExceptionKind::Network),
            Arc::new(RetryStrategy::new("network_retry", config.network_backoff)),
        );
        engine.register_strategy(
            StrategyMatch::Kind(ExceptionKind::Timeout),
            Arc::new(RetryStrategy::new("timeout_retry", BackoffPolicy::single_retry())),
        );
        engine.register_strategy(
            StrategyMatch::Kind(ExceptionKind::Deadlock),
            Arc::new(RetryStrategy::new("deadlock_retry", BackoffPolicy::single_retry())),
        );
        engine
    }

    pub fn register_strategy(&self, matcher: StrategyMatch, strategy: Arc<dyn RecoveryStrategy>) {
        info!("Registered recovery strategy '{}' for {:?}", strategy.name(), matcher);
        self.strategies.lock().push(StrategyEntry { matcher, strategy });
    }

    /// 注册分类器；内置分类结果为 `Other` 时按注册顺序询问
    pub fn register_classifier<F>(&self, classifier: F)
    where
        F: Fn(&anyhow::Error) -> Option<ExceptionKind> + Send + Sync + 'static,
    {
        self.classifiers.lock().push(Arc::new(classifier));
    }

    /// 分类（内置规则 + 用户分类器）
    pub fn classify(&self, error: &anyhow::Error) -> ExceptionKind {
        let kind = ExceptionKind::classify(error);
        if kind != ExceptionKind::Other {
            return kind;
        }
        let classifiers = self.classifiers.lock().clone();
        for classifier in classifiers {
            match catch_unwind(AssertUnwindSafe(|| classifier(error))) {
                Ok(Some(kind)) => return kind,
                Ok(None) => {},
                Err(payload) => {
                    warn!("Exception classifier panicked: {}", panic_message(&*payload))
                },
            }
        }
        ExceptionKind::Other
    }

    fn lookup(&self, record: &ExceptionRecord) -> Option<Arc<dyn RecoveryStrategy>> {
        // 谓词可能回调引擎，先复制出来再匹配
        let entries = self.strategies.lock().clone();

        let last = |want: &dyn Fn(&StrategyMatch) -> bool| {
            entries
                .iter()
                .rev()
                .find(|e| want(&e.matcher))
                .map(|e| e.strategy.clone())
        };

        last(&|m| matches!(m, StrategyMatch::Type(name) if *name == record.exception_type))
            .or_else(|| last(&|m| matches!(m, StrategyMatch::Kind(k) if *k == record.kind)))
            .or_else(|| {
                entries.iter().find_map(|e| match &e.matcher {
                    StrategyMatch::Predicate(p) => {
                        match catch_unwind(AssertUnwindSafe(|| p(record))) {
                            Ok(true) => Some(e.strategy.clone()),
                            Ok(false) => None,
                            Err(payload) => {
                                warn!(
                                    "Predicate for strategy '{}' panicked: {}",
                                    e.strategy.name(),
                                    panic_message(&*payload)
                                );
                                None
                            },
                        }
                    },
                    _ => None,
                })
            })
            .or_else(|| last(&|m| matches!(m, StrategyMatch::Any)))
    }

    /// 记录一次失败
    ///
    /// `exception_type` 取自 `E` 的类型名；传入 `anyhow::Error` 时尽量还原为内部的具体类型。
    pub fn record<E>(&self, error: E, context: RecoveryContext) -> RecordId
    where
        E: Into<anyhow::Error>,
    {
        let type_name = type_name::<E>();
        let error = error.into();
        self.capture(&error, type_name, context).id
    }

    fn capture(
        &self,
        error: &anyhow::Error,
        type_name: &'static str,
        context: RecoveryContext,
    ) -> ExceptionRecord {
        let exception_type = if type_name == std::any::type_name::<anyhow::Error>() {
            refine_type_name(error)
        } else {
            type_name
        };
        let kind = self.classify(error);
        let mut record = ExceptionRecord {
            id: RecordId::from_raw(self.ids.next()),
            exception_type: exception_type.to_string(),
            kind,
            severity: kind.severity(),
            context,
            message: format!("{error:#}"),
            raised_at: SystemTime::now(),
            matched_strategy: None,
            recovery_strategy_applied: None,
            attempts: 0,
            resolved: false,
            resolved_at: None,
        };
        record.matched_strategy = self.lookup(&record).map(|s| s.name().to_string());

        match record.severity {
            FaultLevel::Info | FaultLevel::Warning => warn!(
                exception = %record.id,
                "{} in {}/{}: {}",
                record.exception_type, record.context.component, record.context.operation, record.message
            ),
            _ => error!(
                exception = %record.id,
                "{} in {}/{}: {}",
                record.exception_type, record.context.component, record.context.operation, record.message
            ),
        }

        self.insert(record.clone());
        self.bus.publish(Event::ExceptionRecorded {
            id: record.id,
            exception_type: record.exception_type.clone(),
            kind: record.kind,
            severity: record.severity,
            component: record.context.component.clone(),
        });
        record
    }

    fn insert(&self, record: ExceptionRecord) {
        let mut records = self.records.lock();
        records.insert(record.id, record);

        if records.len() > self.capacity {
            let excess = records.len() - self.capacity;
            let evict: Vec<RecordId> = records
                .values()
                .filter(|r| r.resolved)
                .take(excess)
                .map(|r| r.id)
                .collect();
            for id in evict {
                records.remove(&id);
            }
        }
    }

    /// 询问策略前累加尝试次数，返回更新后的记录快照
    fn begin_attempt(&self, id: RecordId) -> Option<(ExceptionRecord, u32)> {
        let mut records = self.records.lock();
        let record = records.get_mut(&id)?;
        let attempt = record.attempts;
        record.attempts += 1;
        Some((record.clone(), attempt))
    }

    fn finish(&self, id: RecordId, strategy: Option<&str>) -> Result<bool, RecoveryError> {
        let strategy_name = {
            let mut records = self.records.lock();
            let record = records.get_mut(&id).ok_or(RecoveryError::NotFound(id))?;
            if record.resolved {
                return Ok(false);
            }
            record.mark_resolved(strategy);
            record
                .recovery_strategy_applied
                .clone()
                .unwrap_or_else(|| "manual".to_string())
        };
        info!(exception = %id, "Exception resolved by '{}'", strategy_name);
        self.bus.publish(Event::ExceptionRecovered {
            id,
            strategy: strategy_name,
        });
        Ok(true)
    }

    fn decide(
        strategy: &dyn RecoveryStrategy,
        record: &ExceptionRecord,
        attempt: u32,
    ) -> RecoveryDecision {
        match catch_unwind(AssertUnwindSafe(|| strategy.decide(record, attempt))) {
            Ok(decision) => decision,
            Err(payload) => {
                warn!(
                    exception = %record.id,
                    "Recovery strategy '{}' panicked: {}",
                    strategy.name(),
                    panic_message(&*payload)
                );
                RecoveryDecision::GiveUp
            },
        }
    }

    fn escalate(&self, record: &ExceptionRecord) {
        self.faults.report(
            FaultLevel::Critical,
            record.kind.fault_category(),
            &record.context.component,
            format!(
                "{} during {}: {}",
                record.exception_type, record.context.operation, record.message
            ),
        );
    }

    /// 对已有记录询问一次策略
    ///
    /// 只有策略返回 `Recovered` 时记录才被解决并返回 `Ok(true)`；
    /// 需要重试的决定在这里无法执行，返回 `Ok(false)`。
    pub fn attempt_recovery(&self, id: RecordId) -> Result<bool, RecoveryError> {
        let (record, attempt) = self.begin_attempt(id).ok_or(RecoveryError::NotFound(id))?;
        if record.resolved {
            return Ok(false);
        }
        let Some(strategy) = self.lookup(&record) else {
            debug!(exception = %id, "No recovery strategy for {}", record.exception_type);
            return Ok(false);
        };
        match Self::decide(strategy.as_ref(), &record, attempt) {
            RecoveryDecision::Recovered => self.finish(id, Some(strategy.name())),
            decision => {
                debug!(exception = %id, "Strategy '{}' decided {:?}", strategy.name(), decision);
                Ok(false)
            },
        }
    }

    /// 手动标记为已解决；重复调用返回 `Ok(false)`
    pub fn resolve(&self, id: RecordId) -> Result<bool, RecoveryError> {
        self.finish(id, None)
    }

    /// 在恢复作用域内执行 `op`
    ///
    /// 失败时只创建一条记录；按策略决定重试，之后成功则把记录标为已解决并返回 `Ok`。
    /// 没有策略、策略放弃或尝试次数达到 [`MAX_SCOPED_ATTEMPTS`] 时返回最后一次的错误。
    pub fn run_scoped<T, E, F>(&self, context: RecoveryContext, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Result<T, E>,
        E: Into<anyhow::Error>,
    {
        let type_name = type_name::<E>();
        let mut record_id: Option<RecordId> = None;
        let mut applied: Option<String> = None;

        loop {
            let error = match op() {
                Ok(value) => {
                    if let Some(id) = record_id {
                        // 记录可能已被淘汰或手动解决
                        let _ = self.finish(id, applied.as_deref());
                    }
                    return Ok(value);
                },
                Err(e) => e.into(),
            };

            let id = match record_id {
                Some(id) => id,
                None => {
                    let record = self.capture(&error, type_name, context.clone());
                    record_id = Some(record.id);
                    record.id
                },
            };
            let Some((record, attempt)) = self.begin_attempt(id) else {
                return Err(error);
            };

            let Some(strategy) = self.lookup(&record) else {
                if record.severity >= FaultLevel::Critical {
                    self.escalate(&record);
                }
                return Err(error);
            };
            let decision = Self::decide(strategy.as_ref(), &record, attempt);

            if record.severity >= FaultLevel::Critical {
                debug!(exception = %id, "Strategy '{}' consulted for critical exception: {:?}", strategy.name(), decision);
                self.escalate(&record);
                return Err(error);
            }
            if record.attempts >= MAX_SCOPED_ATTEMPTS {
                warn!(exception = %id, "Giving up after {} attempt(s)", record.attempts);
                return Err(error);
            }

            match decision {
                RecoveryDecision::Recovered => {
                    debug!(exception = %id, "Strategy '{}' recovered, retrying", strategy.name());
                },
                RecoveryDecision::RetryAfter(delay) => {
                    debug!(exception = %id, "Strategy '{}' retrying in {:?}", strategy.name(), delay);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                },
                RecoveryDecision::GiveUp => {
                    debug!(exception = %id, "Strategy '{}' gave up", strategy.name());
                    return Err(error);
                },
            }
            applied = Some(strategy.name().to_string());
        }
    }

    pub fn get(&self, id: RecordId) -> Option<ExceptionRecord> {
        self.records.lock().get(&id).cloned()
    }

    pub fn unresolved(&self) -> Vec<ExceptionRecord> {
        self.records.lock().values().filter(|r| !r.resolved).cloned().collect()
    }

    /// 最近的 `limit` 条记录（从旧到新）
    pub fn history(&self, limit: usize) -> Vec<ExceptionRecord> {
        let records = self.records.lock();
        let skip = records.len().saturating_sub(limit);
        records.values().skip(skip).cloned().collect()
    }

    /// 删除所有已解决记录，返回删除数量
    pub fn clear_resolved(&self) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !r.resolved);
        before - records.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Topic;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> (EventBus, Arc<FaultRegistry>, ExceptionRecoveryEngine) {
        let bus = EventBus::new();
        let faults = Arc::new(FaultRegistry::new(bus.clone(), 64));
        let config = RecoveryConfig {
            history: 8,
            network_backoff: BackoffPolicy {
                first: Duration::from_millis(1),
                max: Duration::from_millis(5),
                factor: 2.0,
                max_attempts: 3,
            },
        };
        let engine = ExceptionRecoveryEngine::new(config, bus.clone(), faults.clone());
        (bus, faults, engine)
    }

    fn ctx() -> RecoveryContext {
        RecoveryContext::new("gripper_driver", "open")
    }

    #[derive(Debug, thiserror::Error)]
    #[error("calibration drift")]
    struct CalibrationError;

    #[test]
    fn test_classify_io_kinds() {
        let err = |kind| anyhow::Error::from(io::Error::new(kind, "x"));
        assert_eq!(ExceptionKind::classify(&err(io::ErrorKind::ConnectionRefused)), ExceptionKind::Network);
        assert_eq!(ExceptionKind::classify(&err(io::ErrorKind::TimedOut)), ExceptionKind::Timeout);
        assert_eq!(ExceptionKind::classify(&err(io::ErrorKind::OutOfMemory)), ExceptionKind::ResourceExhausted);
        assert_eq!(ExceptionKind::classify(&err(io::ErrorKind::NotFound)), ExceptionKind::Io);
        assert_eq!(ExceptionKind::classify(&anyhow::anyhow!("plain")), ExceptionKind::Other);
    }

    #[test]
    fn test_classify_walks_context_chain() {
        let err = anyhow::Error::from(LockError::Deadlock {
            resource: "robot_1".into(),
        })
        .context("moving arm");
        assert_eq!(ExceptionKind::classify(&err), ExceptionKind::Deadlock);

        let err = anyhow::Error::from(ArbiterError::Lock(LockError::Timeout {
            resource: "robot_1".into(),
            waited: Duration::from_millis(200),
        }));
        assert_eq!(ExceptionKind::classify(&err), ExceptionKind::Timeout);

        let err = anyhow::Error::from(ArbiterError::SharedLimit {
            resource: "camera_1".into(),
            limit: 1,
            waited: Duration::from_millis(50),
        });
        assert_eq!(ExceptionKind::classify(&err), ExceptionKind::Timeout);
    }

    #[test]
    fn test_severity_table() {
        assert_eq!(ExceptionKind::Network.severity(), FaultLevel::Warning);
        assert_eq!(ExceptionKind::Io.severity(), FaultLevel::Error);
        assert_eq!(ExceptionKind::ResourceFaulted.severity(), FaultLevel::Critical);
    }

    #[test]
    fn test_user_classifier_for_other() {
        let (_bus, _faults, engine) = engine();
        engine.register_classifier(|e| {
            e.downcast_ref::<CalibrationError>().map(|_| ExceptionKind::ResourceFaulted)
        });
        assert_eq!(
            engine.classify(&anyhow::Error::from(CalibrationError)),
            ExceptionKind::ResourceFaulted
        );
        assert_eq!(engine.classify(&anyhow::anyhow!("x")), ExceptionKind::Other);
    }

    #[test]
    fn test_record_publishes_and_keeps_type() {
        let (bus, _faults, engine) = engine();
        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        let _sub = bus.subscribe(Topic::ExceptionRecorded, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let id = engine.record(CalibrationError, ctx());
        let record = engine.get(id).unwrap();
        assert_eq!(record.exception_type, type_name::<CalibrationError>());
        assert_eq!(record.kind, ExceptionKind::Other);
        assert_eq!(record.severity, FaultLevel::Error);
        assert_eq!(record.context.component, "gripper_driver");
        assert!(record.matched_strategy.is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let id = engine.record(anyhow::Error::from(io::Error::from(io::ErrorKind::BrokenPipe)), ctx());
        let record = engine.get(id).unwrap();
        assert_eq!(record.exception_type, type_name::<io::Error>());
        assert_eq!(record.matched_strategy.as_deref(), Some("network_retry"));
    }

    #[test]
    fn test_run_scoped_retries_network_then_resolves() {
        let (bus, _faults, engine) = engine();
        let recovered = Arc::new(AtomicU32::new(0));
        let r = recovered.clone();
        let _sub = bus.subscribe(Topic::ExceptionRecovered, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let calls = AtomicU32::new(0);
        let value = engine
            .run_scoped(ctx(), || {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(io::Error::from(io::ErrorKind::ConnectionReset))
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let history = engine.history(10);
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved);
        assert_eq!(history[0].attempts, 2);
        assert_eq!(history[0].recovery_strategy_applied.as_deref(), Some("network_retry"));
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_scoped_exhaustion_returns_last_error() {
        let (_bus, _faults, engine) = engine();
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = engine.run_scoped(ctx(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from(io::ErrorKind::TimedOut))
        });
        let err = result.unwrap_err();
        assert_eq!(err.downcast_ref::<io::Error>().unwrap().kind(), io::ErrorKind::TimedOut);
        // 首次 + 一次重试
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.unresolved().len(), 1);
    }

    #[test]
    fn test_run_scoped_without_strategy_fails_once() {
        let (_bus, _faults, engine) = engine();
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = engine.run_scoped(ctx(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CalibrationError)
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_critical_is_escalated_not_retried() {
        let (_bus, faults, engine) = engine();
        let consulted = Arc::new(AtomicU32::new(0));
        let c = consulted.clone();
        engine.register_strategy(
            StrategyMatch::Kind(ExceptionKind::ResourceExhausted),
            Arc::new(FnStrategy::new("free_buffers", move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
                RecoveryDecision::Recovered
            })),
        );

        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = engine.run_scoped(ctx(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from(io::ErrorKind::OutOfMemory))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(consulted.load(Ordering::SeqCst), 1);

        let unresolved = faults.unresolved();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].level, FaultLevel::Critical);
        assert_eq!(unresolved[0].source, "gripper_driver");
        assert!(faults.blocking_fault("gripper_driver").is_some());
    }

    #[test]
    fn test_matching_order() {
        let (_bus, _faults, engine) = engine();
        let named = |name: &'static str| -> Arc<dyn RecoveryStrategy> {
            Arc::new(FnStrategy::new(name, |_, _| RecoveryDecision::GiveUp))
        };
        engine.register_strategy(StrategyMatch::Any, named("catch_all"));
        engine.register_strategy(
            StrategyMatch::predicate(|r| r.message.contains("drift")),
            named("drift"),
        );
        engine.register_strategy(StrategyMatch::error_type::<CalibrationError>(), named("calibration"));

        let id = engine.record(CalibrationError, ctx());
        assert_eq!(engine.get(id).unwrap().matched_strategy.as_deref(), Some("calibration"));

        let id = engine.record(anyhow::anyhow!("sensor drift"), ctx());
        assert_eq!(engine.get(id).unwrap().matched_strategy.as_deref(), Some("drift"));

        let id = engine.record(anyhow::anyhow!("unknown"), ctx());
        assert_eq!(engine.get(id).unwrap().matched_strategy.as_deref(), Some("catch_all"));

        // 后注册的 Kind 策略覆盖默认策略
        engine.register_strategy(StrategyMatch::Kind(ExceptionKind::Network), named("custom_net"));
        let id = engine.record(io::Error::from(io::ErrorKind::ConnectionRefused), ctx());
        assert_eq!(engine.get(id).unwrap().matched_strategy.as_deref(), Some("custom_net"));
    }

    #[test]
    fn test_attempt_recovery_and_resolve() {
        let (_bus, _faults, engine) = engine();
        engine.register_strategy(
            StrategyMatch::error_type::<CalibrationError>(),
            Arc::new(FnStrategy::new("recalibrate", |_, attempt| {
                if attempt == 0 {
                    RecoveryDecision::GiveUp
                } else {
                    RecoveryDecision::Recovered
                }
            })),
        );
        let id = engine.record(CalibrationError, ctx());
        assert!(!engine.attempt_recovery(id).unwrap());
        assert!(engine.attempt_recovery(id).unwrap());
        let record = engine.get(id).unwrap();
        assert!(record.resolved);
        assert_eq!(record.recovery_strategy_applied.as_deref(), Some("recalibrate"));

        assert!(!engine.resolve(id).unwrap());
        let missing = RecordId::from_raw(999);
        assert!(matches!(engine.resolve(missing), Err(RecoveryError::NotFound(_))));
        assert!(matches!(engine.attempt_recovery(missing), Err(RecoveryError::NotFound(_))));
    }

    #[test]
    fn test_history_is_bounded_and_keeps_unresolved() {
        let (_bus, _faults, engine) = engine();
        let first = engine.record(CalibrationError, ctx());
        for _ in 0..20 {
            let id = engine.record(CalibrationError, ctx());
            engine.resolve(id).unwrap();
        }
        assert!(engine.history(usize::MAX).len() <= engine.capacity());
        assert!(engine.get(first).is_some());

        let removed = engine.clear_resolved();
        assert!(removed > 0);
        assert_eq!(engine.history(usize::MAX).len(), 1);
    }
}
