//! 死锁检测器（Deadlock Detector）
//!
//! 周期性（以及锁超时后按需）检查锁管理器的等待图：
//!
//! - 每发现一个环，强制环中最新排队的等待者以 [`LockError::Deadlock`](crate::error::LockError::Deadlock) 失败
//! - 每个环上报一条 CRITICAL / SOFTWARE 故障，列出参与的线程和资源
//!
//! 检测线程在三种情况下醒来：定时器、锁超时通知、停止信号。

use crate::error::CoreError;
use crate::fault::{FaultCategory, FaultLevel, FaultRegistry};
use crate::lock::{Cycle, LockManager};
use crate::thread_util::{JoinFailure, JoinTimeout, spawn_named};
use crossbeam_channel::{Sender, select};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 故障来源名
pub const DEADLOCK_SOURCE: &str = "deadlock_detector";

/// 默认检测周期
pub const DEFAULT_DETECT_INTERVAL: Duration = Duration::from_secs(2);

struct Running {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// 死锁检测器
pub struct DeadlockDetector {
    locks: Arc<LockManager>,
    faults: Arc<FaultRegistry>,
    cycles_detected: AtomicU64,
    checks: AtomicU64,
    running: Mutex<Option<Running>>,
}

impl DeadlockDetector {
    pub fn new(locks: Arc<LockManager>, faults: Arc<FaultRegistry>) -> Self {
        Self {
            locks,
            faults,
            cycles_detected: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            running: Mutex::new(None),
        }
    }

    /// 立即检测一次
    ///
    /// 返回本次发现（并已打破）的环。
    pub fn check(&self) -> Vec<Cycle> {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let cycles = self.locks.detect_and_break();

        // 故障在锁表释放后上报
        for cycle in &cycles {
            self.cycles_detected.fetch_add(1, Ordering::Relaxed);
            let description = cycle.describe();
            error!(victim = %cycle.victim, "Deadlock detected: {}", description);
            self.faults.report(
                FaultLevel::Critical,
                FaultCategory::Software,
                DEADLOCK_SOURCE,
                format!(
                    "Deadlock among {} thread(s) on resources [{}]: {}; aborted wait of {}",
                    cycle.participants.len(),
                    cycle.resources().join(", "),
                    description,
                    cycle.victim
                ),
            );
        }
        cycles
    }

    /// 累计发现的环数
    pub fn cycles_detected(&self) -> u64 {
        self.cycles_detected.load(Ordering::Relaxed)
    }

    /// 累计检测次数
    pub fn checks_run(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// 启动检测线程
    pub fn start(self: &Arc<Self>, interval: Duration) -> Result<(), CoreError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(CoreError::AlreadyRunning("deadlock detector"));
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let kick_rx = self.locks.kick_receiver();
        let detector = Arc::clone(self);

        let handle = spawn_named("deadlock-detector", move || {
            let ticker = crossbeam_channel::tick(interval);
            info!("Deadlock detector started (interval {:?})", interval);
            loop {
                select! {
                    recv(ticker) -> _ => {},
                    recv(kick_rx) -> msg => {
                        if msg.is_err() {
                            break;
                        }
                        debug!("Deadlock check requested after lock timeout");
                    },
                    recv(stop_rx) -> _ => break,
                }
                detector.check();
            }
            info!("Deadlock detector stopped");
        })?;

        *running = Some(Running { stop_tx, handle });
        Ok(())
    }

    /// 停止检测线程
    ///
    /// 未运行时直接返回 `Ok`。
    pub fn stop(&self, timeout: Duration) -> Result<(), CoreError> {
        let Some(Running { stop_tx, handle }) = self.running.lock().take() else {
            return Ok(());
        };
        let _ = stop_tx.send(());
        match handle.join_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(JoinFailure::TimedOut) => Err(CoreError::JoinTimeout {
                name: "deadlock-detector".into(),
                timeout,
            }),
            Err(JoinFailure::Panicked(msg)) => {
                warn!("Deadlock detector thread panicked: {}", msg);
                Ok(())
            },
        }
    }
}

impl std::fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("running", &self.is_running())
            .field("cycles_detected", &self.cycles_detected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::lock::LockMode;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    fn detector() -> (Arc<LockManager>, Arc<FaultRegistry>, Arc<DeadlockDetector>) {
        let locks = Arc::new(LockManager::new());
        let faults = Arc::new(FaultRegistry::new(EventBus::new(), 64));
        let detector = Arc::new(DeadlockDetector::new(locks.clone(), faults.clone()));
        (locks, faults, detector)
    }

    #[test]
    fn test_check_without_waiters_is_empty() {
        let (_locks, faults, detector) = detector();
        assert!(detector.check().is_empty());
        assert_eq!(detector.cycles_detected(), 0);
        assert!(faults.unresolved().is_empty());
    }

    #[test]
    fn test_three_party_cycle_reported_once() {
        let (locks, faults, detector) = detector();
        let resources = ["R0", "R1", "R2"];
        let barrier = Arc::new(Barrier::new(3));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                let own = resources[i];
                let next = resources[(i + 1) % 3];
                thread::spawn(move || {
                    let held = locks
                        .acquire(own, LockMode::Exclusive, Duration::from_secs(5))
                        .unwrap();
                    barrier.wait();
                    let result = locks.acquire(next, LockMode::Exclusive, Duration::from_secs(5));
                    if let Ok(lock) = &result {
                        locks.release(lock).unwrap();
                    }
                    locks.release(&held).unwrap();
                    result.is_ok()
                })
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs(5);
        while locks.waiting_count() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let cycles = detector.check();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].participants.len(), 3);

        let succeeded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(succeeded, 2);

        let unresolved = faults.unresolved();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].level, FaultLevel::Critical);
        assert_eq!(unresolved[0].source, DEADLOCK_SOURCE);
        for r in resources {
            assert!(unresolved[0].message.contains(r));
        }
    }

    #[test]
    fn test_start_stop() {
        let (_locks, _faults, detector) = detector();
        detector.start(Duration::from_millis(10)).unwrap();
        assert!(matches!(
            detector.start(Duration::from_millis(10)),
            Err(CoreError::AlreadyRunning(_))
        ));
        thread::sleep(Duration::from_millis(50));
        detector.stop(Duration::from_secs(1)).unwrap();
        assert!(!detector.is_running());
        assert!(detector.checks_run() > 0);
    }
}
