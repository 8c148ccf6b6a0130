//! 锁管理器（Lock Manager）
//!
//! 带超时的读写锁，按资源名索引，并维护等待图供死锁检测器使用。
//!
//! # 语义
//!
//! - **SHARED / EXCLUSIVE**: 多读单写。任意数量的 SHARED 持有者可以共存；
//!   EXCLUSIVE 请求等待全部持有者释放；SHARED 请求只在有 EXCLUSIVE 持有者时等待
//! - **严格 FIFO**: 每个资源一个等待队列，只有队首请求且与当前持有者兼容时才授予。
//!   已排队的 EXCLUSIVE 请求会挡住后来的 SHARED 请求，避免写者饥饿；
//!   连续的 SHARED 队首会依次批量授予
//! - **超时必填**: 没有无限等待。超时后请求出队，其等待边随之消失，
//!   并向死锁检测器发送一次非阻塞通知
//! - **重入**: 已持有 SHARED 的线程再次请求 SHARED 立即授予；
//!   与自身持有冲突的请求立即以 [`LockError::Deadlock`] 失败
//!
//! # 内部锁
//!
//! 所有簿记都在一把内部互斥锁（锁表）下完成，等待使用每个资源各自的条件变量。
//! 内部锁只在簿记期间持有，等待期间由条件变量释放。

mod graph;

pub use graph::{Cycle, CycleParticipant, WaitEdge};

use crate::error::LockError;
use crate::id::{IdGenerator, id_type};
use crate::owner::{OwnerId, current_name};
use crate::thread_util::MAX_WAIT;
use crossbeam_channel::{Receiver, Sender};
use graph::WaitForGraph;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

id_type!(
    /// 锁 ID（每次授予唯一）
    LockId,
    "lock"
);

/// 锁模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    /// 两个模式能否同时持有
    pub fn compatible_with(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// 已授予的锁
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub id: LockId,
    pub resource: String,
    pub mode: LockMode,
    pub owner: OwnerId,
    pub acquired_at: Instant,
    /// 排队等待的时间（未排队直接授予时为零）
    pub waited: Duration,
}

/// 持有者诊断信息
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HolderInfo {
    pub lock: LockId,
    pub owner: OwnerId,
    pub owner_name: String,
    pub mode: LockMode,
    pub held_for: Duration,
}

/// 等待者诊断信息
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WaiterInfo {
    pub owner: OwnerId,
    pub owner_name: String,
    pub mode: LockMode,
    pub waiting_for: Duration,
}

/// 单个资源的锁状态快照
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ResourceLockState {
    pub resource: String,
    pub holders: Vec<HolderInfo>,
    pub waiters: Vec<WaiterInfo>,
}

/// 锁管理器计数器快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LockStats {
    pub grants: u64,
    /// 需要排队的授予
    pub contended: u64,
    pub timeouts: u64,
    /// 被死锁检测器中止的等待
    pub deadlock_aborts: u64,
    pub releases: u64,
}

struct Holder {
    lock: LockId,
    owner: OwnerId,
    owner_name: String,
    mode: LockMode,
    since: Instant,
}

struct Waiter {
    ticket: u64,
    owner: OwnerId,
    owner_name: String,
    mode: LockMode,
    since: Instant,
    /// 被死锁检测器选为牺牲者
    victim: bool,
}

#[derive(Default)]
struct ResourceState {
    holders: Vec<Holder>,
    queue: VecDeque<Waiter>,
    cond: Arc<Condvar>,
}

impl ResourceState {
    fn compatible(&self, mode: LockMode) -> bool {
        self.holders.iter().all(|h| mode.compatible_with(h.mode))
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }

    fn position(&self, ticket: u64) -> Option<usize> {
        self.queue.iter().position(|w| w.ticket == ticket)
    }

    /// 当前持有模式
    fn mode(&self) -> Option<LockMode> {
        self.holders.first().map(|h| h.mode)
    }
}

#[derive(Default)]
struct LockTable {
    resources: HashMap<String, ResourceState>,
    next_ticket: u64,
}

impl LockTable {
    /// 从当前排队状态构建等待图（跳过已选中的牺牲者）
    fn wait_for_graph(&self) -> WaitForGraph {
        let mut graph = WaitForGraph::new();
        for (resource, state) in &self.resources {
            for (idx, waiter) in state.queue.iter().enumerate() {
                if waiter.victim {
                    continue;
                }
                let blockers = state
                    .holders
                    .iter()
                    .filter(|h| !waiter.mode.compatible_with(h.mode))
                    .map(|h| h.owner)
                    .chain(
                        state
                            .queue
                            .iter()
                            .take(idx)
                            .filter(|w| !w.victim)
                            .map(|w| w.owner),
                    );
                for holder in blockers {
                    graph.add_edge(WaitEdge {
                        waiter: waiter.owner,
                        holder,
                        resource: resource.clone(),
                        ticket: waiter.ticket,
                    });
                }
            }
        }
        graph
    }

    fn owner_name(&self, owner: OwnerId) -> String {
        self.resources
            .values()
            .flat_map(|s| {
                s.holders
                    .iter()
                    .filter(move |h| h.owner == owner)
                    .map(|h| &h.owner_name)
                    .chain(s.queue.iter().filter(move |w| w.owner == owner).map(|w| &w.owner_name))
            })
            .next()
            .cloned()
            .unwrap_or_else(|| owner.to_string())
    }

    fn held_by(&self, owner: OwnerId) -> Vec<String> {
        let mut held: Vec<String> = self
            .resources
            .iter()
            .filter(|(_, s)| s.holders.iter().any(|h| h.owner == owner))
            .map(|(r, _)| r.clone())
            .collect();
        held.sort();
        held
    }

    /// 将 `owner` 在等待中的请求标记为牺牲者并唤醒它
    fn mark_victim(&mut self, owner: OwnerId) {
        for state in self.resources.values_mut() {
            if let Some(w) = state.queue.iter_mut().find(|w| w.owner == owner) {
                w.victim = true;
                state.cond.notify_all();
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    grants: AtomicU64,
    contended: AtomicU64,
    timeouts: AtomicU64,
    deadlock_aborts: AtomicU64,
    releases: AtomicU64,
}

/// 锁管理器
pub struct LockManager {
    table: Mutex<LockTable>,
    ids: IdGenerator,
    counters: Counters,
    kick_tx: Sender<()>,
    kick_rx: Receiver<()>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("LockManager")
            .field("resources", &table.resources.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl LockManager {
    pub fn new() -> Self {
        let (kick_tx, kick_rx) = crossbeam_channel::bounded(1);
        Self {
            table: Mutex::new(LockTable::default()),
            ids: IdGenerator::new(),
            counters: Counters::default(),
            kick_tx,
            kick_rx,
        }
    }

    /// 获取锁
    ///
    /// 阻塞当前线程直到获得锁、超时（[`LockError::Timeout`]）
    /// 或被死锁检测器中止（[`LockError::Deadlock`]）。
    pub fn acquire(
        &self,
        resource: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Lock, LockError> {
        let owner = OwnerId::current();
        let start = Instant::now();
        let deadline = start + timeout.min(MAX_WAIT);

        let mut table = self.table.lock();
        let ticket = table.next_ticket;
        table.next_ticket += 1;

        let state = table.resources.entry(resource.to_string()).or_default();

        // 重入检查
        let own: Vec<LockMode> = state
            .holders
            .iter()
            .filter(|h| h.owner == owner)
            .map(|h| h.mode)
            .collect();
        if !own.is_empty() {
            if mode == LockMode::Shared && own.iter().all(|m| *m == LockMode::Shared) {
                return Ok(self.grant(state, resource, owner, mode, None));
            }
            warn!(
                "{} requested {:?} on '{}' while holding it as {:?}",
                owner, mode, resource, own
            );
            self.counters.deadlock_aborts.fetch_add(1, Ordering::Relaxed);
            return Err(LockError::Deadlock {
                resource: resource.to_string(),
            });
        }

        if state.queue.is_empty() && state.compatible(mode) {
            return Ok(self.grant(state, resource, owner, mode, None));
        }

        state.queue.push_back(Waiter {
            ticket,
            owner,
            owner_name: current_name(),
            mode,
            since: start,
            victim: false,
        });
        let cond = state.cond.clone();
        trace!("{} queued for {:?} on '{}' (ticket {})", owner, mode, resource, ticket);

        loop {
            let outcome = {
                let Some(state) = table.resources.get_mut(resource) else {
                    // 排队期间资源状态不会被回收
                    return Err(LockError::Deadlock {
                        resource: resource.to_string(),
                    });
                };
                let Some(pos) = state.position(ticket) else {
                    return Err(LockError::Deadlock {
                        resource: resource.to_string(),
                    });
                };

                if state.queue[pos].victim {
                    state.queue.remove(pos);
                    state.cond.notify_all();
                    self.counters.deadlock_aborts.fetch_add(1, Ordering::Relaxed);
                    Some(Err(LockError::Deadlock {
                        resource: resource.to_string(),
                    }))
                } else if pos == 0 && state.compatible(mode) {
                    state.queue.pop_front();
                    self.counters.contended.fetch_add(1, Ordering::Relaxed);
                    let lock = self.grant(state, resource, owner, mode, Some(start));
                    // 后续 SHARED 等待者可能随之可授予
                    state.cond.notify_all();
                    Some(Ok(lock))
                } else if Instant::now() >= deadline {
                    state.queue.remove(pos);
                    state.cond.notify_all();
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    Some(Err(LockError::Timeout {
                        resource: resource.to_string(),
                        waited: start.elapsed(),
                    }))
                } else {
                    None
                }
            };

            match outcome {
                Some(Ok(lock)) => return Ok(lock),
                Some(Err(e)) => {
                    Self::collect_idle(&mut table, resource);
                    drop(table);
                    if matches!(e, LockError::Timeout { .. }) {
                        debug!("{} timed out waiting for '{}'", owner, resource);
                        // 检测器忙或已有待处理通知时丢弃
                        let _ = self.kick_tx.try_send(());
                    } else {
                        warn!("{} wait on '{}' aborted: deadlock", owner, resource);
                    }
                    return Err(e);
                },
                None => {
                    cond.wait_until(&mut table, deadline);
                },
            }
        }
    }

    /// 获取锁并返回 RAII 守卫
    pub fn acquire_guard(
        &self,
        resource: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockGuard<'_>, LockError> {
        let lock = self.acquire(resource, mode, timeout)?;
        Ok(LockGuard {
            manager: self,
            lock: Some(lock),
        })
    }

    fn grant(
        &self,
        state: &mut ResourceState,
        resource: &str,
        owner: OwnerId,
        mode: LockMode,
        queued_since: Option<Instant>,
    ) -> Lock {
        let now = Instant::now();
        let lock = Lock {
            id: LockId::from_raw(self.ids.next()),
            resource: resource.to_string(),
            mode,
            owner,
            acquired_at: now,
            waited: queued_since.map_or(Duration::ZERO, |t| now.duration_since(t)),
        };
        state.holders.push(Holder {
            lock: lock.id,
            owner,
            owner_name: current_name(),
            mode,
            since: now,
        });
        self.counters.grants.fetch_add(1, Ordering::Relaxed);
        lock
    }

    fn collect_idle(table: &mut LockTable, resource: &str) {
        if table.resources.get(resource).is_some_and(ResourceState::is_idle) {
            table.resources.remove(resource);
        }
    }

    /// 释放锁，返回持有时长
    ///
    /// 可以在任意线程上释放。重复释放返回 [`LockError::NotHeld`]。
    pub fn release(&self, lock: &Lock) -> Result<Duration, LockError> {
        let mut table = self.table.lock();
        let state = table
            .resources
            .get_mut(&lock.resource)
            .ok_or(LockError::NotHeld(lock.id))?;
        let pos = state
            .holders
            .iter()
            .position(|h| h.lock == lock.id)
            .ok_or(LockError::NotHeld(lock.id))?;

        let holder = state.holders.remove(pos);
        state.cond.notify_all();
        Self::collect_idle(&mut table, &lock.resource);
        drop(table);

        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        trace!("{} released {} on '{}'", holder.owner, holder.lock, lock.resource);
        Ok(holder.since.elapsed())
    }

    /// 检测等待图中的环，并为每个环中止一个等待者
    ///
    /// 牺牲者是环中排队序号最新的参与者。已被选中但尚未醒来的等待者不参与检测，
    /// 同一个环不会产生第二个牺牲者。
    pub fn detect_and_break(&self) -> Vec<Cycle> {
        let mut table = self.table.lock();
        let mut graph = table.wait_for_graph();
        let mut cycles = Vec::new();

        while let Some(edges) = graph.find_cycle() {
            let Some(victim_edge) = edges.iter().max_by_key(|e| e.ticket) else {
                break;
            };
            let victim = victim_edge.waiter;

            let participants = edges
                .iter()
                .map(|e| CycleParticipant {
                    owner: e.waiter,
                    owner_name: table.owner_name(e.waiter),
                    waiting_for: e.resource.clone(),
                    holding: table.held_by(e.waiter),
                })
                .collect();

            table.mark_victim(victim);
            graph.remove_node(victim);
            cycles.push(Cycle {
                participants,
                victim,
            });
        }

        cycles
    }

    /// 通知接收端（死锁检测器使用）
    pub(crate) fn kick_receiver(&self) -> Receiver<()> {
        self.kick_rx.clone()
    }

    /// 当前等待边
    pub fn wait_for_edges(&self) -> Vec<WaitEdge> {
        self.table.lock().wait_for_graph().edges().cloned().collect()
    }

    /// 资源当前持有者
    pub fn holders(&self, resource: &str) -> Vec<HolderInfo> {
        let table = self.table.lock();
        table
            .resources
            .get(resource)
            .map(|s| s.holders.iter().map(holder_info).collect())
            .unwrap_or_default()
    }

    /// 资源当前持有模式（无持有者为 `None`）
    pub fn mode(&self, resource: &str) -> Option<LockMode> {
        self.table.lock().resources.get(resource).and_then(ResourceState::mode)
    }

    /// 全部资源上的等待者总数
    pub fn waiting_count(&self) -> usize {
        self.table.lock().resources.values().map(|s| s.queue.len()).sum()
    }

    /// 全部非空资源的锁状态（按资源名排序）
    pub fn snapshot(&self) -> Vec<ResourceLockState> {
        let table = self.table.lock();
        let now = Instant::now();
        let sorted: BTreeMap<&String, &ResourceState> = table.resources.iter().collect();
        sorted
            .into_iter()
            .map(|(resource, state)| ResourceLockState {
                resource: resource.clone(),
                holders: state.holders.iter().map(holder_info).collect(),
                waiters: state
                    .queue
                    .iter()
                    .map(|w| WaiterInfo {
                        owner: w.owner,
                        owner_name: w.owner_name.clone(),
                        mode: w.mode,
                        waiting_for: now.duration_since(w.since),
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            grants: self.counters.grants.load(Ordering::Relaxed),
            contended: self.counters.contended.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            deadlock_aborts: self.counters.deadlock_aborts.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
        }
    }
}

fn holder_info(h: &Holder) -> HolderInfo {
    HolderInfo {
        lock: h.lock,
        owner: h.owner,
        owner_name: h.owner_name.clone(),
        mode: h.mode,
        held_for: h.since.elapsed(),
    }
}

/// 锁守卫，Drop 时释放
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    lock: Option<Lock>,
}

impl LockGuard<'_> {
    pub fn lock(&self) -> Option<&Lock> {
        self.lock.as_ref()
    }

    /// 提前释放，返回持有时长
    pub fn release(mut self) -> Result<Duration, LockError> {
        match self.lock.take() {
            Some(lock) => self.manager.release(&lock),
            None => Ok(Duration::ZERO),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(e) = self.manager.release(&lock) {
                warn!("Failed to release {} on drop: {}", lock.id, e);
            }
        }
    }
}
