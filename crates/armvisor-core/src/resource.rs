//! 资源仲裁器（Resource Arbiter）
//!
//! 命名共享资源（机器人、夹爪、相机、传感器……）的注册表。
//! 每个接触硬件状态的管理器在修改设备状态前，都必须通过这里获取句柄。
//!
//! 互斥本身委托给 [`LockManager`]，仲裁器在其上增加：
//!
//! - 资源类型校验（同一 ID 不能以不同类型重复注册）
//! - 故障闸门：资源存在未解决的 CRITICAL/FATAL 故障时，立即拒绝 EXCLUSIVE 访问
//!   （排队前检查一次，授予后再检查一次）
//! - SHARED 名额：可选地限制同时持有 SHARED 访问的句柄数
//! - 使用统计：获取次数、竞争次数、累计与平均持有时间、超时次数
//! - 有界访问记录：每个资源最近的获取 / 释放
//! - 重复释放保护：第二次释放同一句柄上报 SOFTWARE 故障，不破坏资源状态
//!
//! ```rust,no_run
//! use armvisor_core::SupervisorBuilder;
//! use armvisor_core::lock::LockMode;
//! use armvisor_core::resource::ResourceKind;
//! use std::time::Duration;
//!
//! let supervisor = SupervisorBuilder::new().build()?;
//! let arbiter = supervisor.arbiter();
//! arbiter.register("robot_1", ResourceKind::Robot)?;
//!
//! let guard = arbiter.guard("robot_1", LockMode::Exclusive, Duration::from_secs(1))?;
//! // ... 向机器人发送指令 ...
//! drop(guard);
//! # Ok::<(), armvisor_core::CoreError>(())
//! ```

use crate::error::{ArbiterError, LockError};
use crate::event::{Event, EventBus};
use crate::fault::{FaultCategory, FaultId, FaultLevel, FaultRegistry};
use crate::id::{IdGenerator, id_type};
use crate::lock::{Lock, LockManager, LockMode};
use crate::owner::{OwnerId, current_name};
use crate::thread_util::deadline_after;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

id_type!(
    /// 资源句柄 ID
    HandleId,
    "handle"
);

/// 故障来源名（重复释放等调用方错误）
pub const ARBITER_SOURCE: &str = "resource_arbiter";

/// 每个资源默认保留的访问记录条数
pub const DEFAULT_ACCESS_HISTORY: usize = 100;

/// 资源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Robot,
    Gripper,
    Camera,
    Sensor,
    Generic,
}

/// 当前授予的访问模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum AccessMode {
    None,
    Shared,
    Exclusive,
}

impl From<Option<LockMode>> for AccessMode {
    fn from(mode: Option<LockMode>) -> Self {
        match mode {
            None => AccessMode::None,
            Some(LockMode::Shared) => AccessMode::Shared,
            Some(LockMode::Exclusive) => AccessMode::Exclusive,
        }
    }
}

/// 资源使用统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct UsageStats {
    pub acquire_count: u64,
    /// 需要排队才获得的次数
    pub contention_count: u64,
    /// 已释放的句柄数
    pub release_count: u64,
    /// 已释放句柄的累计持有时间
    pub total_held: Duration,
    pub timeouts: u64,
    /// 等待被死锁检测器中止的次数
    pub deadlocks: u64,
    /// 因故障拒绝的次数
    pub fault_refusals: u64,
}

impl UsageStats {
    /// 已释放句柄的平均持有时间（尚无释放时为零）
    pub fn average_held(&self) -> Duration {
        match u32::try_from(self.release_count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total_held / n,
            Err(_) => Duration::from_secs_f64(self.total_held.as_secs_f64() / self.release_count as f64),
        }
    }
}

/// 单次访问记录
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AccessRecord {
    pub handle: HandleId,
    pub owner: OwnerId,
    /// 获取时的线程名
    pub owner_name: String,
    pub mode: LockMode,
    /// 请求时给出的超时
    pub timeout: Duration,
    /// 排队等待的时间（含等待 SHARED 名额）
    pub waited: Duration,
    pub acquired_at: SystemTime,
    pub released_at: Option<SystemTime>,
    /// 释放时记录的持有时长
    pub held: Option<Duration>,
}

/// 资源快照
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ResourceInfo {
    pub id: String,
    pub kind: ResourceKind,
    pub access_mode: AccessMode,
    pub holders: Vec<OwnerId>,
    /// SHARED 持有者上限（`None` 为不限）
    pub shared_limit: Option<usize>,
    pub stats: UsageStats,
    pub registered_at: SystemTime,
}

/// 资源句柄
///
/// 可克隆，但同一句柄只能释放一次。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    id: HandleId,
    lock: Lock,
}

impl ResourceHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn resource(&self) -> &str {
        &self.lock.resource
    }

    pub fn mode(&self) -> LockMode {
        self.lock.mode
    }

    pub fn owner(&self) -> OwnerId {
        self.lock.owner
    }
}

struct Entry {
    kind: ResourceKind,
    stats: UsageStats,
    registered_at: SystemTime,
    shared_limit: Option<usize>,
    /// 已占用的 SHARED 名额（包括已预留、尚在锁管理器排队的请求）
    shared_active: usize,
    records: VecDeque<AccessRecord>,
}

impl Entry {
    fn new(kind: ResourceKind, shared_limit: Option<usize>) -> Self {
        Self {
            kind,
            stats: UsageStats::default(),
            registered_at: SystemTime::now(),
            shared_limit,
            shared_active: 0,
            records: VecDeque::new(),
        }
    }
}

/// 资源仲裁器
pub struct ResourceArbiter {
    locks: Arc<LockManager>,
    faults: Arc<FaultRegistry>,
    bus: EventBus,
    resources: Mutex<HashMap<String, Entry>>,
    /// SHARED 名额释放或上限变化
    slot_freed: Condvar,
    handles: Mutex<HashMap<HandleId, Lock>>,
    ids: IdGenerator,
    access_history: usize,
}

impl ResourceArbiter {
    pub fn new(locks: Arc<LockManager>, faults: Arc<FaultRegistry>, bus: EventBus) -> Self {
        Self {
            locks,
            faults,
            bus,
            resources: Mutex::new(HashMap::new()),
            slot_freed: Condvar::new(),
            handles: Mutex::new(HashMap::new()),
            ids: IdGenerator::new(),
            access_history: DEFAULT_ACCESS_HISTORY,
        }
    }

    /// 每个资源保留的访问记录条数（最小为 1）
    pub fn with_access_history(mut self, records: usize) -> Self {
        self.access_history = records.max(1);
        self
    }

    /// 注册资源（SHARED 持有者不限）
    ///
    /// 相同类型重复注册是空操作；不同类型返回 [`ArbiterError::KindMismatch`]。
    pub fn register(&self, id: &str, kind: ResourceKind) -> Result<(), ArbiterError> {
        self.register_entry(id, kind, None)
    }

    /// 注册资源，并限制同时持有 SHARED 访问的句柄数
    ///
    /// 达到上限后的 SHARED 请求在超时内等待名额，超时返回 [`ArbiterError::SharedLimit`]。
    /// 同一线程的重入 SHARED 获取同样占用名额。已注册的相同类型资源会更新上限。
    pub fn register_with_shared_limit(
        &self,
        id: &str,
        kind: ResourceKind,
        limit: usize,
    ) -> Result<(), ArbiterError> {
        self.register_entry(id, kind, Some(limit.max(1)))
    }

    fn register_entry(
        &self,
        id: &str,
        kind: ResourceKind,
        shared_limit: Option<usize>,
    ) -> Result<(), ArbiterError> {
        let mut resources = self.resources.lock();
        if let Some(existing) = resources.get_mut(id) {
            if existing.kind != kind {
                return Err(ArbiterError::KindMismatch {
                    resource: id.to_string(),
                    registered: existing.kind,
                    requested: kind,
                });
            }
            if shared_limit.is_some() && existing.shared_limit != shared_limit {
                info!("Shared limit of '{}' changed to {:?}", id, shared_limit);
                existing.shared_limit = shared_limit;
                self.slot_freed.notify_all();
            }
            return Ok(());
        }
        resources.insert(id.to_string(), Entry::new(kind, shared_limit));
        match shared_limit {
            Some(limit) => info!("Registered resource '{}' as {:?} (max {} shared)", id, kind, limit),
            None => info!("Registered resource '{}' as {:?}", id, kind),
        }
        Ok(())
    }

    /// 注销资源
    ///
    /// 资源仍被持有时返回 [`ArbiterError::ResourceBusy`]；排队中的等待者随后以超时结束。
    pub fn unregister(&self, id: &str) -> Result<(), ArbiterError> {
        let mut resources = self.resources.lock();
        if !resources.contains_key(id) {
            return Err(ArbiterError::UnknownResource(id.to_string()));
        }
        let holders = self.locks.holders(id).len();
        if holders > 0 {
            return Err(ArbiterError::ResourceBusy {
                resource: id.to_string(),
                holders,
            });
        }
        resources.remove(id);
        self.slot_freed.notify_all();
        info!("Unregistered resource '{}'", id);
        Ok(())
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.resources.lock().contains_key(id)
    }

    /// 资源此刻能否立即以 EXCLUSIVE 授予
    ///
    /// 已注册、无持有者且没有阻断故障。结果只是瞬时快照。
    pub fn is_available(&self, id: &str) -> bool {
        self.is_registered(id)
            && self.locks.mode(id).is_none()
            && self.faults.blocking_fault(id).is_none()
    }

    /// SHARED 持有者上限
    pub fn shared_limit(&self, id: &str) -> Option<usize> {
        self.resources.lock().get(id).and_then(|e| e.shared_limit)
    }

    /// 获取资源
    ///
    /// 失败情况：
    /// - 未注册：[`ArbiterError::UnknownResource`]
    /// - EXCLUSIVE 且存在阻断故障：立即返回 [`ArbiterError::ResourceFaulted`]，不等待
    /// - SHARED 名额已满且超时：[`ArbiterError::SharedLimit`]
    /// - 超时 / 死锁：[`ArbiterError::Lock`]
    pub fn acquire(
        &self,
        id: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<ResourceHandle, ArbiterError> {
        if !self.is_registered(id) {
            return Err(ArbiterError::UnknownResource(id.to_string()));
        }
        if mode == LockMode::Exclusive {
            if let Some(fault) = self.faults.blocking_fault(id) {
                return Err(self.refuse(id, fault));
            }
        }

        let started = Instant::now();
        let deadline = deadline_after(timeout);
        let slot_wait = match mode {
            LockMode::Shared => self.reserve_shared(id, timeout, deadline)?,
            LockMode::Exclusive => Duration::ZERO,
        };

        let lock_timeout = match mode {
            LockMode::Shared => deadline.saturating_duration_since(Instant::now()),
            LockMode::Exclusive => timeout,
        };
        let lock = match self.locks.acquire(id, mode, lock_timeout) {
            Ok(lock) => lock,
            Err(e) => {
                if mode == LockMode::Shared {
                    self.free_shared(id);
                }
                self.with_entry(id, |entry| match &e {
                    LockError::Timeout { .. } => entry.stats.timeouts += 1,
                    LockError::Deadlock { .. } => entry.stats.deadlocks += 1,
                    LockError::NotHeld(_) => {},
                });
                return Err(e.into());
            },
        };

        // 排队期间可能被注销或出现新故障
        if !self.is_registered(id) {
            self.undo(&lock);
            if mode == LockMode::Shared {
                self.free_shared(id);
            }
            return Err(ArbiterError::UnknownResource(id.to_string()));
        }
        if mode == LockMode::Exclusive {
            if let Some(fault) = self.faults.blocking_fault(id) {
                self.undo(&lock);
                return Err(self.refuse(id, fault));
            }
        }

        let handle = ResourceHandle {
            id: HandleId::from_raw(self.ids.next()),
            lock,
        };
        let contended = slot_wait > Duration::ZERO || handle.lock.waited > Duration::ZERO;
        let record = AccessRecord {
            handle: handle.id,
            owner: handle.lock.owner,
            owner_name: current_name(),
            mode,
            timeout,
            waited: started.elapsed().min(slot_wait + handle.lock.waited),
            acquired_at: SystemTime::now(),
            released_at: None,
            held: None,
        };
        let history = self.access_history;
        self.with_entry(id, |entry| {
            entry.stats.acquire_count += 1;
            if contended {
                entry.stats.contention_count += 1;
            }
            entry.records.push_back(record);
            while entry.records.len() > history {
                entry.records.pop_front();
            }
        });

        self.handles.lock().insert(handle.id, handle.lock.clone());
        debug!(
            "{} acquired '{}' as {:?} ({})",
            handle.lock.owner, id, mode, handle.id
        );
        Ok(handle)
    }

    /// 占用一个 SHARED 名额，返回等待名额的时间
    fn reserve_shared(
        &self,
        id: &str,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<Duration, ArbiterError> {
        let started = Instant::now();
        let mut resources = self.resources.lock();
        loop {
            let entry = resources
                .get_mut(id)
                .ok_or_else(|| ArbiterError::UnknownResource(id.to_string()))?;
            match entry.shared_limit {
                Some(limit) if entry.shared_active >= limit => {
                    if Instant::now() >= deadline {
                        entry.stats.timeouts += 1;
                        warn!("No shared slot on '{}' within {:?} (limit {})", id, timeout, limit);
                        return Err(ArbiterError::SharedLimit {
                            resource: id.to_string(),
                            limit,
                            waited: timeout,
                        });
                    }
                },
                _ => {
                    entry.shared_active += 1;
                    return Ok(started.elapsed());
                },
            }
            self.slot_freed.wait_until(&mut resources, deadline);
        }
    }

    fn free_shared(&self, id: &str) {
        if let Some(entry) = self.resources.lock().get_mut(id) {
            entry.shared_active = entry.shared_active.saturating_sub(1);
        }
        self.slot_freed.notify_all();
    }

    /// 获取资源并返回 RAII 守卫
    pub fn guard(
        &self,
        id: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<ResourceGuard<'_>, ArbiterError> {
        let handle = self.acquire(id, mode, timeout)?;
        Ok(ResourceGuard {
            arbiter: self,
            handle: Some(handle),
        })
    }

    /// 释放句柄，返回持有时长
    ///
    /// 重复释放上报 WARNING / SOFTWARE 故障并返回 [`ArbiterError::AlreadyReleased`]。
    pub fn release(&self, handle: &ResourceHandle) -> Result<Duration, ArbiterError> {
        let Some(lock) = self.handles.lock().remove(&handle.id) else {
            warn!("Double release of {} on '{}'", handle.id, handle.resource());
            self.faults.report(
                FaultLevel::Warning,
                FaultCategory::Software,
                ARBITER_SOURCE,
                format!(
                    "{} on '{}' released more than once",
                    handle.id,
                    handle.resource()
                ),
            );
            return Err(ArbiterError::AlreadyReleased {
                resource: handle.resource().to_string(),
                handle: handle.id,
            });
        };

        let released = self.locks.release(&lock);
        if lock.mode == LockMode::Shared {
            self.free_shared(&lock.resource);
        }
        let held = released?;
        self.with_entry(&lock.resource, |entry| {
            entry.stats.release_count += 1;
            entry.stats.total_held += held;
            if let Some(record) = entry.records.iter_mut().rev().find(|r| r.handle == handle.id) {
                record.released_at = Some(SystemTime::now());
                record.held = Some(held);
            }
        });
        debug!("Released '{}' ({}) after {:?}", lock.resource, handle.id, held);
        Ok(held)
    }

    /// 使用统计
    pub fn stats(&self, id: &str) -> Result<UsageStats, ArbiterError> {
        self.resources
            .lock()
            .get(id)
            .map(|e| e.stats)
            .ok_or_else(|| ArbiterError::UnknownResource(id.to_string()))
    }

    /// 最近的 `limit` 条访问记录（从旧到新）
    pub fn access_records(&self, id: &str, limit: usize) -> Result<Vec<AccessRecord>, ArbiterError> {
        let resources = self.resources.lock();
        let entry = resources
            .get(id)
            .ok_or_else(|| ArbiterError::UnknownResource(id.to_string()))?;
        let skip = entry.records.len().saturating_sub(limit);
        Ok(entry.records.iter().skip(skip).cloned().collect())
    }

    /// 当前访问模式
    pub fn access_mode(&self, id: &str) -> AccessMode {
        self.locks.mode(id).into()
    }

    pub fn info(&self, id: &str) -> Result<ResourceInfo, ArbiterError> {
        let (kind, stats, registered_at, shared_limit) = {
            let resources = self.resources.lock();
            let entry = resources
                .get(id)
                .ok_or_else(|| ArbiterError::UnknownResource(id.to_string()))?;
            (entry.kind, entry.stats, entry.registered_at, entry.shared_limit)
        };
        let holders = self.locks.holders(id);
        Ok(ResourceInfo {
            id: id.to_string(),
            kind,
            access_mode: holders.first().map(|h| h.mode).into(),
            holders: holders.iter().map(|h| h.owner).collect(),
            shared_limit,
            stats,
            registered_at,
        })
    }

    /// 全部已注册资源（按 ID 排序）
    pub fn list(&self) -> Vec<ResourceInfo> {
        let ids: Vec<String> = {
            let resources = self.resources.lock();
            let sorted: BTreeMap<&String, &Entry> = resources.iter().collect();
            sorted.into_keys().cloned().collect()
        };
        ids.iter().filter_map(|id| self.info(id).ok()).collect()
    }

    /// (被持有的资源数, 已注册资源数)
    pub fn utilization(&self) -> (usize, usize) {
        let ids: Vec<String> = self.resources.lock().keys().cloned().collect();
        let held = ids
            .iter()
            .filter(|id| self.locks.mode(id).is_some())
            .count();
        (held, ids.len())
    }

    /// 未释放的句柄数
    pub fn outstanding_handles(&self) -> usize {
        self.handles.lock().len()
    }

    fn refuse(&self, id: &str, fault: FaultId) -> ArbiterError {
        warn!("Refusing exclusive access to '{}': blocked by {}", id, fault);
        self.with_stats(id, |s| s.fault_refusals += 1);
        self.bus.publish(Event::ResourceFaulted {
            resource: id.to_string(),
            fault,
        });
        ArbiterError::ResourceFaulted {
            resource: id.to_string(),
            fault,
        }
    }

    fn undo(&self, lock: &Lock) {
        if let Err(e) = self.locks.release(lock) {
            warn!("Failed to roll back grant on '{}': {}", lock.resource, e);
        }
    }

    fn with_stats(&self, id: &str, f: impl FnOnce(&mut UsageStats)) {
        self.with_entry(id, |entry| f(&mut entry.stats));
    }

    fn with_entry(&self, id: &str, f: impl FnOnce(&mut Entry)) {
        if let Some(entry) = self.resources.lock().get_mut(id) {
            f(entry);
        }
    }
}

impl std::fmt::Debug for ResourceArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceArbiter")
            .field("resources", &self.resources.lock().len())
            .field("outstanding_handles", &self.outstanding_handles())
            .finish()
    }
}

/// 资源守卫，Drop 时释放
pub struct ResourceGuard<'a> {
    arbiter: &'a ResourceArbiter,
    handle: Option<ResourceHandle>,
}

impl ResourceGuard<'_> {
    pub fn handle(&self) -> Option<&ResourceHandle> {
        self.handle.as_ref()
    }

    /// 提前释放，返回持有时长
    pub fn release(mut self) -> Result<Duration, ArbiterError> {
        match self.handle.take() {
            Some(handle) => self.arbiter.release(&handle),
            None => Ok(Duration::ZERO),
        }
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.arbiter.release(&handle) {
                warn!("Failed to release {} on drop: {}", handle.id, e);
            }
        }
    }
}
