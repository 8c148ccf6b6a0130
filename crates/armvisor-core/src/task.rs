//! 任务协调器（Task Coordinator）
//!
//! 固定大小的工作线程池 + 优先级队列。UI 回调、机器人连接、运动原语等任何
//! 可能阻塞的操作都以 [`Task`] 的形式提交，在池线程上执行。
//!
//! # 调度
//!
//! - 先按 [`TaskPriority`] 从高到低，同一优先级内 FIFO
//! - `cancel()` 只对 PENDING 任务生效；RUNNING 任务不可抢占（硬件操作无法安全中断）
//! - `result()` 在调用线程上等待（带超时），不占用池线程
//!
//! # 生命周期
//!
//! ```text
//! PENDING ──> RUNNING ──> COMPLETED
//!    │           └──────> FAILED
//!    └──────────────────> CANCELLED
//! ```
//!
//! 状态只沿箭头单向前进，终态不再变化。
//!
//! # Panic 处理
//!
//! 任务体 panic 时：任务标记为 FAILED，上报 ERROR / SOFTWARE 故障，
//! 当前工作线程退出并在同一个槽位上创建替代线程，保持池容量。

use crate::error::{CoreError, TaskError};
use crate::event::{Event, EventBus};
use crate::fault::{FaultCategory, FaultLevel, FaultRegistry};
use crate::id::{IdGenerator, id_type};
use crate::thread_util::{JoinFailure, JoinTimeout, deadline_after, panic_message, spawn_named};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, trace, warn};

id_type!(
    /// 任务 ID
    TaskId,
    "task"
);

/// 故障来源名
pub const COORDINATOR_SOURCE: &str = "task_coordinator";

/// 任务优先级（有序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// 状态转换是否合法
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Cancelled)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
        )
    }
}

/// 任务返回值（类型擦除，可多次读取）
#[derive(Clone)]
pub struct TaskValue(Arc<dyn Any + Send + Sync>);

impl TaskValue {
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn downcast<T: Send + Sync + 'static>(self) -> Option<Arc<T>> {
        self.0.downcast::<T>().ok()
    }
}

impl std::fmt::Debug for TaskValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskValue(..)")
    }
}

type Body = Box<dyn FnOnce() -> anyhow::Result<TaskValue> + Send>;

/// 待提交的任务
pub struct Task {
    priority: TaskPriority,
    name: Option<String>,
    body: Body,
}

impl Task {
    pub fn new<F, T>(priority: TaskPriority, body: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + Sync + 'static,
    {
        Self {
            priority,
            name: None,
            body: Box::new(move || body().map(|v| TaskValue(Arc::new(v)))),
        }
    }

    /// 设置任务名（日志和事件中使用）
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("priority", &self.priority)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// 任务快照
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: Option<String>,
    pub priority: TaskPriority,
    pub state: TaskState,
    pub submitted_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    /// 失败或取消原因
    pub error: Option<String>,
}

/// 协调器统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TaskStats {
    pub submitted: u64,
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// 配置的工作线程数
    pub workers: usize,
    /// 替换失败而丢失的工作线程
    pub lost_workers: usize,
}

/// 协调器配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub workers: usize,
    /// 终态任务记录保留数量
    pub history: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            history: 1000,
        }
    }
}

struct Queued {
    priority: TaskPriority,
    seq: u64,
    id: TaskId,
    body: Body,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    /// 大顶堆：优先级高者在前，同优先级序号小者在前
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Record {
    info: TaskInfo,
    outcome: Option<Result<TaskValue, TaskError>>,
}

impl Record {
    fn transition(&mut self, next: TaskState) -> bool {
        if !self.info.state.can_transition_to(next) {
            return false;
        }
        self.info.state = next;
        match next {
            TaskState::Running => self.info.started_at = Some(SystemTime::now()),
            _ => self.info.completed_at = Some(SystemTime::now()),
        }
        true
    }
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<Queued>,
    records: HashMap<TaskId, Record>,
    /// 终态任务（按进入终态的顺序，用于淘汰）
    finished: VecDeque<TaskId>,
    pending: usize,
    running: usize,
    accepting: bool,
    stopping: bool,
}

struct Inner {
    state: Mutex<State>,
    /// 有新任务或需要退出
    work: Condvar,
    /// 有任务进入终态
    done: Condvar,
    slots: Mutex<Vec<Option<JoinHandle<()>>>>,
    ids: IdGenerator,
    seq: AtomicU64,
    history: usize,
    bus: EventBus,
    faults: Arc<FaultRegistry>,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    lost_workers: AtomicUsize,
}

impl Inner {
    fn spawn_worker(self: &Arc<Self>, slot: usize) -> Result<(), CoreError> {
        let inner = Arc::clone(self);
        let handle = spawn_named(format!("task-worker-{slot}"), move || {
            worker_loop(inner, slot)
        })?;
        if let Some(entry) = self.slots.lock().get_mut(slot) {
            // 旧句柄对应的线程即将退出，直接分离
            *entry = Some(handle);
        }
        Ok(())
    }

    /// 取下一个可执行任务；返回 `None` 表示应退出
    fn next_task(&self) -> Option<(TaskId, Option<String>, Body)> {
        let mut state = self.state.lock();
        loop {
            while let Some(queued) = state.queue.pop() {
                let Some(record) = state.records.get_mut(&queued.id) else {
                    continue;
                };
                // 已取消的任务直接丢弃
                if !record.transition(TaskState::Running) {
                    continue;
                }
                let name = record.info.name.clone();
                state.pending -= 1;
                state.running += 1;
                return Some((queued.id, name, queued.body));
            }
            if state.stopping {
                return None;
            }
            self.work.wait(&mut state);
        }
    }

    fn finish(&self, id: TaskId, outcome: Result<TaskValue, TaskError>) {
        let (next, counter) = match &outcome {
            Ok(_) => (TaskState::Completed, &self.completed),
            Err(_) => (TaskState::Failed, &self.failed),
        };

        let name = {
            let mut state = self.state.lock();
            state.running -= 1;
            let Some(record) = state.records.get_mut(&id) else {
                return;
            };
            if !record.transition(next) {
                return;
            }
            if let Err(e) = &outcome {
                record.info.error = Some(e.to_string());
            }
            record.outcome = Some(outcome);
            let name = record.info.name.clone();
            self.retire(&mut state, id);
            name
        };

        counter.fetch_add(1, Ordering::Relaxed);
        self.done.notify_all();
        self.bus.publish(Event::TaskFinished {
            id,
            name,
            state: next,
        });
    }

    /// 记录终态并按容量淘汰最旧的终态记录
    fn retire(&self, state: &mut State, id: TaskId) {
        state.finished.push_back(id);
        while state.finished.len() > self.history {
            if let Some(old) = state.finished.pop_front() {
                state.records.remove(&old);
            }
        }
    }

    /// 取消 PENDING 任务（调用方持有状态锁），返回是否成功
    fn cancel_locked(&self, state: &mut State, id: TaskId) -> Option<Option<String>> {
        let record = state.records.get_mut(&id)?;
        if !record.transition(TaskState::Cancelled) {
            return None;
        }
        record.info.error = Some(TaskError::Cancelled.to_string());
        record.outcome = Some(Err(TaskError::Cancelled));
        let name = record.info.name.clone();
        state.pending -= 1;
        self.retire(state, id);
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        Some(name)
    }
}

fn worker_loop(inner: Arc<Inner>, slot: usize) {
    trace!("Worker {} started", slot);
    while let Some((id, name, body)) = inner.next_task() {
        debug!("Running {} ({})", id, name.as_deref().unwrap_or("-"));

        let (outcome, panicked) = match catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(value)) => (Ok(value), None),
            Ok(Err(e)) => (Err(TaskError::Failed(format!("{e:#}"))), None),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                (Err(TaskError::Panicked(msg.clone())), Some(msg))
            },
        };
        inner.finish(id, outcome);

        if let Some(msg) = panicked {
            error!("{} panicked on worker {}: {}", id, slot, msg);
            inner.faults.report(
                FaultLevel::Error,
                FaultCategory::Software,
                COORDINATOR_SOURCE,
                format!("{id} panicked on worker {slot}: {msg}"),
            );
            if let Err(e) = inner.spawn_worker(slot) {
                inner.lost_workers.fetch_add(1, Ordering::Relaxed);
                error!("Failed to replace worker {}: {}", slot, e);
                inner.faults.report(
                    FaultLevel::Critical,
                    FaultCategory::Software,
                    COORDINATOR_SOURCE,
                    format!("worker {slot} lost: {e}"),
                );
            }
            return;
        }
    }
    trace!("Worker {} exiting", slot);
}

/// 任务协调器
pub struct TaskCoordinator {
    inner: Arc<Inner>,
    workers: usize,
}

impl TaskCoordinator {
    /// 创建协调器并启动工作线程
    pub fn new(
        config: CoordinatorConfig,
        bus: EventBus,
        faults: Arc<FaultRegistry>,
    ) -> Result<Self, CoreError> {
        let workers = config.workers.max(1);
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                accepting: true,
                ..Default::default()
            }),
            work: Condvar::new(),
            done: Condvar::new(),
            slots: Mutex::new((0..workers).map(|_| None).collect()),
            ids: IdGenerator::new(),
            seq: AtomicU64::new(0),
            history: config.history.max(1),
            bus,
            faults,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            lost_workers: AtomicUsize::new(0),
        });

        for slot in 0..workers {
            if let Err(e) = inner.spawn_worker(slot) {
                // 已启动的工作线程随之退出
                inner.state.lock().stopping = true;
                inner.work.notify_all();
                return Err(e);
            }
        }
        info!("Task coordinator started with {} worker(s)", workers);

        Ok(Self { inner, workers })
    }

    /// 提交任务
    pub fn submit(&self, task: Task) -> Result<TaskId, TaskError> {
        let id = TaskId::from_raw(self.inner.ids.next());
        let Task {
            priority,
            name,
            body,
        } = task;

        {
            let mut state = self.inner.state.lock();
            if !state.accepting {
                return Err(TaskError::ShutDown);
            }
            state.records.insert(
                id,
                Record {
                    info: TaskInfo {
                        id,
                        name,
                        priority,
                        state: TaskState::Pending,
                        submitted_at: SystemTime::now(),
                        started_at: None,
                        completed_at: None,
                        error: None,
                    },
                    outcome: None,
                },
            );
            state.queue.push(Queued {
                priority,
                seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
                id,
                body,
            });
            state.pending += 1;
        }

        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.work.notify_one();
        trace!("Submitted {} at {:?}", id, priority);
        Ok(id)
    }

    /// 等待任务结果
    ///
    /// 超时返回 [`TaskError::Timeout`]（任务继续执行，可再次等待）。
    pub fn result(&self, id: TaskId, timeout: Duration) -> Result<TaskValue, TaskError> {
        let deadline = deadline_after(timeout);
        let mut state = self.inner.state.lock();
        loop {
            let record = state.records.get(&id).ok_or(TaskError::NotFound(id))?;
            if let Some(outcome) = &record.outcome {
                return outcome.clone();
            }
            if Instant::now() >= deadline {
                return Err(TaskError::Timeout {
                    id,
                    waited: timeout,
                });
            }
            self.inner.done.wait_until(&mut state, deadline);
        }
    }

    /// 取消 PENDING 任务
    ///
    /// RUNNING、已结束或未知任务返回 false。
    pub fn cancel(&self, id: TaskId) -> bool {
        let cancelled = {
            let mut state = self.inner.state.lock();
            self.inner.cancel_locked(&mut state, id)
        };
        match cancelled {
            Some(name) => {
                debug!("Cancelled {}", id);
                self.inner.done.notify_all();
                self.inner.bus.publish(Event::TaskFinished {
                    id,
                    name,
                    state: TaskState::Cancelled,
                });
                true
            },
            None => false,
        }
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.inner.state.lock().records.get(&id).map(|r| r.info.state)
    }

    pub fn info(&self, id: TaskId) -> Option<TaskInfo> {
        self.inner.state.lock().records.get(&id).map(|r| r.info.clone())
    }

    pub fn stats(&self) -> TaskStats {
        let (pending, running) = {
            let state = self.inner.state.lock();
            (state.pending, state.running)
        };
        TaskStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            pending,
            running,
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
            workers: self.workers,
            lost_workers: self.inner.lost_workers.load(Ordering::Relaxed),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.state.lock().accepting
    }

    /// 关闭协调器
    ///
    /// - `drain = true`: 等待全部 PENDING 和 RUNNING 任务结束
    /// - `drain = false`: 立即取消全部 PENDING 任务，只等待 RUNNING 任务
    ///
    /// 之后不再接受新任务。超时返回 [`TaskError::ShutdownTimeout`]，工作线程在剩余任务结束后自行退出。
    pub fn shutdown(&self, drain: bool, timeout: Duration) -> Result<(), TaskError> {
        let deadline = deadline_after(timeout);
        let mut cancelled = Vec::new();
        {
            let mut state = self.inner.state.lock();
            state.accepting = false;
            if !drain {
                let pending: Vec<TaskId> = state
                    .records
                    .iter()
                    .filter(|(_, r)| r.info.state == TaskState::Pending)
                    .map(|(id, _)| *id)
                    .collect();
                for id in pending {
                    if let Some(name) = self.inner.cancel_locked(&mut state, id) {
                        cancelled.push((id, name));
                    }
                }
            }
            state.stopping = true;
        }
        self.inner.work.notify_all();
        self.inner.done.notify_all();

        info!(
            "Shutting down task coordinator (drain={}, cancelled {} pending)",
            drain,
            cancelled.len()
        );
        for (id, name) in cancelled {
            self.inner.bus.publish(Event::TaskFinished {
                id,
                name,
                state: TaskState::Cancelled,
            });
        }

        {
            let mut state = self.inner.state.lock();
            while state.pending + state.running > 0 {
                if self.inner.done.wait_until(&mut state, deadline).timed_out()
                    && state.pending + state.running > 0
                {
                    let remaining = state.pending + state.running;
                    warn!("Shutdown timed out with {} task(s) unfinished", remaining);
                    return Err(TaskError::ShutdownTimeout { remaining });
                }
            }
        }

        let handles: Vec<JoinHandle<()>> =
            self.inner.slots.lock().iter_mut().filter_map(Option::take).collect();
        for handle in handles {
            let left = deadline.saturating_duration_since(Instant::now());
            match handle.join_timeout(left) {
                Ok(()) => {},
                Err(JoinFailure::TimedOut) => {
                    return Err(TaskError::ShutdownTimeout { remaining: 0 });
                },
                Err(JoinFailure::Panicked(msg)) => warn!("Worker exited with panic: {}", msg),
            }
        }

        info!("Task coordinator stopped");
        Ok(())
    }
}

impl std::fmt::Debug for TaskCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCoordinator").field("stats", &self.stats()).finish()
    }
}

impl Drop for TaskCoordinator {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.stopping {
            return;
        }
        state.accepting = false;
        state.stopping = true;
        let pending: Vec<TaskId> = state
            .records
            .iter()
            .filter(|(_, r)| r.info.state == TaskState::Pending)
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            self.inner.cancel_locked(&mut state, id);
        }
        drop(state);
        self.inner.work.notify_all();
        self.inner.done.notify_all();
    }
}
