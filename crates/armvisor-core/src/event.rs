//! 事件总线（Event Bus）
//!
//! 进程内发布/订阅分发器，把状态变化的产生者（故障注册表、健康监控、任务协调器……）
//! 与消费者（UI、日志、恢复触发器）解耦。
//!
//! # 分发语义
//!
//! - **同步**: `publish()` 在发布线程上依次调用该主题的全部处理器（按注册顺序）
//! - **锁外执行**: 订阅列表由总线级互斥锁保护，但处理器在锁外执行，
//!   处理器内部可以再次 `subscribe()` / `publish()` 而不会重入死锁
//! - **故障隔离**: 处理器返回错误或 panic 时记录为 `SOFTWARE` 故障，其余处理器照常执行
//! - **处理器不得无界阻塞**: 总线不强制超时，阻塞会直接拖慢发布线程
//!
//! # 订阅生命周期
//!
//! ```rust
//! use armvisor_core::event::{Event, EventBus, Topic};
//!
//! let bus = EventBus::new();
//! let sub = bus.subscribe(Topic::custom("robot_connected"), |event| {
//!     println!("got {:?}", event.topic());
//!     Ok(())
//! });
//! bus.publish(Event::custom("robot_connected", serde_json::json!({ "id": "robot_1" })));
//!
//! // Drop 即退订
//! drop(sub);
//! assert_eq!(bus.subscriber_count(&Topic::custom("robot_connected")), 0);
//! ```
//!
//! 订阅者由其他对象拥有时，使用 [`EventBus::subscribe_weak`]：
//! 总线只保存 `Weak` 引用，拥有者销毁后下一次发布时自动清理。

use crate::fault::{
    Fault, FaultCategory, FaultId, FaultLevel, FaultRegistry, RecoveryActionKind, RecoveryId,
    RecoveryStatus,
};
use crate::health::HealthStatus;
use crate::recovery::{ExceptionKind, RecordId};
use crate::task::{TaskId, TaskState};
use crate::thread_util::panic_message;
use parking_lot::Mutex;
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, error, info, warn};

/// 处理器返回值
pub type HandlerResult = anyhow::Result<()>;

/// 事件主题
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    FaultRaised,
    FaultResolved,
    /// FATAL 故障触发的急停通知
    EmergencyStop,
    /// 故障恢复动作的状态变化
    RecoveryProgress,
    /// 自动恢复失败，需要操作员介入
    UserActionRequired,
    /// 资源因未解决故障拒绝独占访问
    ResourceFaulted,
    /// 综合健康状态变化
    HealthChanged,
    /// 单项检查状态变化
    HealthCheckChanged,
    /// 任务进入终态
    TaskFinished,
    ExceptionRecorded,
    ExceptionRecovered,
    /// 协作方自定义主题（机器人连接、运动完成等）
    Custom(Arc<str>),
}

impl Topic {
    /// 自定义主题
    pub fn custom(name: &str) -> Self {
        Topic::Custom(Arc::from(name))
    }
}

/// 事件负载
#[derive(Debug, Clone)]
pub enum Event {
    FaultRaised(Fault),
    FaultResolved(Fault),
    EmergencyStop {
        fault: FaultId,
        source: String,
        message: String,
    },
    RecoveryProgress {
        fault: FaultId,
        action: RecoveryId,
        name: String,
        status: RecoveryStatus,
    },
    UserActionRequired {
        fault: FaultId,
        action: RecoveryId,
        kind: RecoveryActionKind,
        name: String,
        /// 故障来源
        source: String,
        instructions: String,
    },
    ResourceFaulted {
        resource: String,
        fault: FaultId,
    },
    HealthChanged {
        previous: HealthStatus,
        current: HealthStatus,
    },
    HealthCheckChanged {
        check: String,
        previous: HealthStatus,
        current: HealthStatus,
        message: String,
    },
    TaskFinished {
        id: TaskId,
        name: Option<String>,
        state: TaskState,
    },
    ExceptionRecorded {
        id: RecordId,
        exception_type: String,
        kind: ExceptionKind,
        severity: FaultLevel,
        component: String,
    },
    ExceptionRecovered {
        id: RecordId,
        strategy: String,
    },
    Custom {
        topic: Arc<str>,
        payload: serde_json::Value,
    },
}

impl Event {
    /// 自定义事件
    pub fn custom(topic: &str, payload: serde_json::Value) -> Self {
        Event::Custom {
            topic: Arc::from(topic),
            payload,
        }
    }

    /// 事件所属主题
    pub fn topic(&self) -> Topic {
        match self {
            Event::FaultRaised(_) => Topic::FaultRaised,
            Event::FaultResolved(_) => Topic::FaultResolved,
            Event::EmergencyStop { .. } => Topic::EmergencyStop,
            Event::ResourceFaulted { .. } => Topic::ResourceFaulted,
            Event::HealthChanged { .. } => Topic::HealthChanged,
            Event::RecoveryProgress { .. } => Topic::RecoveryProgress,
            Event::UserActionRequired { .. } => Topic::UserActionRequired,
            Event::HealthCheckChanged { .. } => Topic::HealthCheckChanged,
            Event::TaskFinished { .. } => Topic::TaskFinished,
            Event::ExceptionRecorded { .. } => Topic::ExceptionRecorded,
            Event::ExceptionRecovered { .. } => Topic::ExceptionRecovered,
            Event::Custom { topic, .. } => Topic::Custom(topic.clone()),
        }
    }
}

/// 订阅令牌
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// 返回 `None` 表示订阅者已销毁
type Dispatch = Arc<dyn Fn(&Event) -> Option<HandlerResult> + Send + Sync>;

struct Entry {
    token: SubscriptionToken,
    /// `None` 表示订阅全部主题
    topic: Option<Topic>,
    dispatch: Dispatch,
}

impl Entry {
    fn matches(&self, topic: &Topic) -> bool {
        self.topic.as_ref().is_none_or(|t| t == topic)
    }
}

struct BusInner {
    entries: Mutex<Vec<Entry>>,
    next_token: AtomicU64,
    published: AtomicU64,
    handler_failures: AtomicU64,
    faults: OnceLock<Weak<FaultRegistry>>,
}

impl BusInner {
    fn remove(&self, token: SubscriptionToken) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.token != token);
        entries.len() != before
    }
}

thread_local! {
    /// 正在上报处理器故障（防止故障事件的处理器失败后递归上报）
    static REPORTING_FAILURE: Cell<bool> = const { Cell::new(false) };
}

/// 在作用域内置位 [`REPORTING_FAILURE`]，离开作用域（包括 unwind）时清除
struct ReportingFailure;

impl ReportingFailure {
    fn enter() -> Self {
        REPORTING_FAILURE.with(|flag| flag.set(true));
        ReportingFailure
    }
}

impl Drop for ReportingFailure {
    fn drop(&mut self) {
        REPORTING_FAILURE.with(|flag| flag.set(false));
    }
}

/// 事件总线
///
/// 内部持有 `Arc`，克隆开销很小，所有克隆共享同一份订阅列表。
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.inner.entries.lock().len())
            .field("published", &self.published_count())
            .finish()
    }
}

impl EventBus {
    /// 创建空总线
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                entries: Mutex::new(Vec::new()),
                next_token: AtomicU64::new(1),
                published: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
                faults: OnceLock::new(),
            }),
        }
    }

    /// 关联故障注册表，用于上报处理器故障
    ///
    /// 只保存弱引用（注册表本身持有总线）。只能关联一次，重复调用返回 false。
    pub fn attach_fault_registry(&self, registry: &Arc<FaultRegistry>) -> bool {
        self.inner.faults.set(Arc::downgrade(registry)).is_ok()
    }

    /// 订阅单个主题
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(Some(topic), Arc::new(move |event| Some(handler(event))))
    }

    /// 订阅全部主题
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(move |event| Some(handler(event))))
    }

    /// 以弱引用方式订阅
    ///
    /// 总线只保存 `owner` 的 `Weak`；`owner` 被销毁后，该订阅在下一次发布时被静默移除。
    /// 返回的令牌可用于提前 [`unsubscribe`](Self::unsubscribe)。
    pub fn subscribe_weak<T>(
        &self,
        topic: Topic,
        owner: &Arc<T>,
        handler: fn(&T, &Event) -> HandlerResult,
    ) -> SubscriptionToken
    where
        T: Send + Sync + 'static,
    {
        let weak = Arc::downgrade(owner);
        self.insert(
            Some(topic),
            Arc::new(move |event| weak.upgrade().map(|owner| handler(&owner, event))),
        )
        .detach()
    }

    /// 退订
    ///
    /// 返回 false 表示令牌不存在（已退订或订阅者已销毁）。
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.inner.remove(token)
    }

    /// 发布事件
    ///
    /// 在当前线程上同步调用全部匹配的处理器。
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        // 快照处理器列表后立即释放锁
        let targets: Vec<(SubscriptionToken, Dispatch)> = {
            let entries = self.inner.entries.lock();
            entries
                .iter()
                .filter(|e| e.matches(&topic))
                .map(|e| (e.token, e.dispatch.clone()))
                .collect()
        };

        let mut gone = Vec::new();
        for (token, dispatch) in targets {
            match catch_unwind(AssertUnwindSafe(|| dispatch(&event))) {
                Ok(Some(Ok(()))) => {},
                Ok(Some(Err(e))) => self.handler_failed(&topic, format!("{e:#}")),
                Ok(None) => gone.push(token),
                Err(payload) => self.handler_failed(
                    &topic,
                    format!("handler panicked: {}", panic_message(payload.as_ref())),
                ),
            }
        }

        if !gone.is_empty() {
            debug!("Pruning {} dropped subscriber(s) from {:?}", gone.len(), topic);
            self.inner.entries.lock().retain(|e| !gone.contains(&e.token));
        }
    }

    /// 主题当前的订阅数（包含全主题订阅）
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner.entries.lock().iter().filter(|e| e.matches(topic)).count()
    }

    /// 累计发布的事件数
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// 累计处理器失败次数
    pub fn handler_failure_count(&self) -> u64 {
        self.inner.handler_failures.load(Ordering::Relaxed)
    }

    fn insert(&self, topic: Option<Topic>, dispatch: Dispatch) -> Subscription {
        let token = SubscriptionToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        self.inner.entries.lock().push(Entry {
            token,
            topic,
            dispatch,
        });
        Subscription {
            token,
            bus: Arc::downgrade(&self.inner),
        }
    }

    fn handler_failed(&self, topic: &Topic, message: String) {
        self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
        warn!("Event handler for {:?} failed: {}", topic, message);

        if REPORTING_FAILURE.with(Cell::get) {
            error!(
                "Event handler failed while reporting a handler failure, not re-reporting: {}",
                message
            );
            return;
        }

        let Some(registry) = self.inner.faults.get().and_then(Weak::upgrade) else {
            return;
        };

        let _reporting = ReportingFailure::enter();
        registry.report(
            FaultLevel::Error,
            FaultCategory::Software,
            "event_bus",
            format!("handler for {topic:?} failed: {message}"),
        );
    }
}

/// 订阅守卫
///
/// Drop 时自动退订。需要永久订阅时调用 [`detach`](Self::detach)。
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    token: SubscriptionToken,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// 订阅令牌
    pub fn token(&self) -> SubscriptionToken {
        self.token
    }

    /// 解除守卫，订阅保留到显式 `unsubscribe()`
    pub fn detach(mut self) -> SubscriptionToken {
        self.bus = Weak::new();
        self.token
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(self.token);
        }
    }
}

/// 把所有事件镜像到 `tracing` 日志
///
/// 日志级别随事件严重程度变化：急停和 CRITICAL 以上故障用 `error`，
/// 健康恶化用 `warn`，其余用 `info` / `debug`。
pub fn log_events(bus: &EventBus) -> SubscriptionToken {
    bus.subscribe_all(|event| {
        match event {
            Event::FaultRaised(fault) if fault.level >= FaultLevel::Critical => error!(
                fault = %fault.id,
                source = %fault.source,
                "Fault raised [{:?}/{:?}]: {}",
                fault.level,
                fault.category,
                fault.message
            ),
            Event::FaultRaised(fault) => warn!(
                fault = %fault.id,
                source = %fault.source,
                "Fault raised [{:?}/{:?}]: {}",
                fault.level,
                fault.category,
                fault.message
            ),
            Event::FaultResolved(fault) => {
                info!(fault = %fault.id, "Fault resolved: {}", fault.message)
            },
            Event::EmergencyStop { fault, source, message } => {
                error!(fault = %fault, "EMERGENCY STOP from {}: {}", source, message)
            },
            Event::RecoveryProgress {
                fault,
                name,
                status,
                ..
            } => debug!(fault = %fault, "Recovery action '{}': {:?}", name, status),
            Event::UserActionRequired {
                fault,
                kind,
                name,
                source,
                instructions,
                ..
            } => warn!(
                fault = %fault,
                "{:?} action '{}' required for {}: {}",
                kind, name, source, instructions
            ),
            Event::ResourceFaulted { resource, fault } => {
                warn!("Exclusive access to '{}' refused, blocked by {}", resource, fault)
            },
            Event::HealthChanged { previous, current } if current > previous => {
                warn!("System health degraded: {:?} -> {:?}", previous, current)
            },
            Event::HealthChanged { previous, current } => {
                info!("System health changed: {:?} -> {:?}", previous, current)
            },
            Event::HealthCheckChanged {
                check,
                previous,
                current,
                message,
            } => info!(
                "Health check '{}' changed: {:?} -> {:?} ({})",
                check, previous, current, message
            ),
            Event::TaskFinished { id, name, state } => debug!(
                "Task {} ({}) finished: {:?}",
                id,
                name.as_deref().unwrap_or("-"),
                state
            ),
            Event::ExceptionRecorded {
                id,
                exception_type,
                severity,
                component,
                ..
            } => warn!(
                "Exception {} recorded in {}: {} ({:?})",
                id, component, exception_type, severity
            ),
            Event::ExceptionRecovered { id, strategy } => {
                info!("Exception {} recovered by '{}'", id, strategy)
            },
            Event::Custom { topic, payload } => debug!("Event '{}': {}", topic, payload),
        }
        Ok(())
    })
    .detach()
}
