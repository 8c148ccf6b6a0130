//! 锁管理器并发风暴的属性测试
//!
//! 随机线程数、资源数、模式和持有时间下：
//! - 每次获取都在超时内返回（授予、超时或死锁中止）
//! - EXCLUSIVE 持有者独占，SHARED 与 EXCLUSIVE 从不共存
//! - 结束后锁表为空

use armvisor_core::{
    DeadlockDetector, EventBus, FaultRegistry, Lock, LockError, LockManager, LockMode,
};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(150);

/// 每个资源的持有计数
#[derive(Default)]
struct Occupancy {
    exclusive: AtomicI64,
    shared: AtomicI64,
}

impl Occupancy {
    fn enter(&self, mode: LockMode) -> Result<(), String> {
        match mode {
            LockMode::Exclusive => {
                let before = self.exclusive.fetch_add(1, Ordering::SeqCst);
                let shared = self.shared.load(Ordering::SeqCst);
                if before != 0 || shared != 0 {
                    return Err(format!("exclusive granted with {before} exclusive / {shared} shared"));
                }
            },
            LockMode::Shared => {
                self.shared.fetch_add(1, Ordering::SeqCst);
                let exclusive = self.exclusive.load(Ordering::SeqCst);
                if exclusive != 0 {
                    return Err(format!("shared granted alongside {exclusive} exclusive"));
                }
            },
        }
        Ok(())
    }

    fn leave(&self, mode: LockMode) {
        match mode {
            LockMode::Exclusive => self.exclusive.fetch_sub(1, Ordering::SeqCst),
            LockMode::Shared => self.shared.fetch_sub(1, Ordering::SeqCst),
        };
    }
}

fn random_mode(rng: &mut StdRng) -> LockMode {
    if rng.gen_bool(0.5) {
        LockMode::Exclusive
    } else {
        LockMode::Shared
    }
}

fn acquire_checked(
    locks: &LockManager,
    occupancy: &[Occupancy],
    resources: &[String],
    index: usize,
    mode: LockMode,
) -> Result<Option<Lock>, String> {
    let start = Instant::now();
    match locks.acquire(&resources[index], mode, ACQUIRE_TIMEOUT) {
        Ok(lock) => {
            occupancy[index].enter(mode)?;
            Ok(Some(lock))
        },
        Err(LockError::Timeout { .. }) | Err(LockError::Deadlock { .. }) => {
            // 超时有少量调度误差
            if start.elapsed() > ACQUIRE_TIMEOUT + Duration::from_secs(2) {
                return Err(format!("acquire blocked for {:?}", start.elapsed()));
            }
            Ok(None)
        },
        Err(e) => Err(format!("unexpected error: {e}")),
    }
}

fn release_checked(locks: &LockManager, occupancy: &[Occupancy], index: usize, lock: &Lock) -> Result<(), String> {
    occupancy[index].leave(lock.mode);
    locks.release(lock).map(|_| ()).map_err(|e| e.to_string())
}

fn run_storm(threads: usize, resource_count: usize, ops: usize, seed: u64) -> Result<(), String> {
    let locks = Arc::new(LockManager::new());
    let faults = Arc::new(FaultRegistry::new(EventBus::new(), 256));
    let detector = Arc::new(DeadlockDetector::new(locks.clone(), faults));
    detector
        .start(Duration::from_millis(20))
        .map_err(|e| e.to_string())?;

    let resources: Arc<Vec<String>> =
        Arc::new((0..resource_count).map(|i| format!("res-{i}")).collect());
    let occupancy: Arc<Vec<Occupancy>> =
        Arc::new((0..resource_count).map(|_| Occupancy::default()).collect());

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let locks = locks.clone();
            let resources = resources.clone();
            let occupancy = occupancy.clone();
            thread::spawn(move || -> Result<(), String> {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
                for _ in 0..ops {
                    let first = rng.gen_range(0..resources.len());
                    let mode = random_mode(&mut rng);
                    let Some(outer) = acquire_checked(&locks, &occupancy, &resources, first, mode)? else {
                        continue;
                    };

                    // 一半概率再嵌套获取一个资源，制造 AB-BA 等待
                    let mut inner = None;
                    if rng.gen_bool(0.5) {
                        let second = rng.gen_range(0..resources.len());
                        let mode = random_mode(&mut rng);
                        if let Some(lock) = acquire_checked(&locks, &occupancy, &resources, second, mode)? {
                            inner = Some((second, lock));
                        }
                    }

                    thread::sleep(Duration::from_micros(rng.gen_range(0..2_000)));

                    if let Some((second, lock)) = inner {
                        release_checked(&locks, &occupancy, second, &lock)?;
                    }
                    release_checked(&locks, &occupancy, first, &outer)?;
                }
                Ok(())
            })
        })
        .collect();

    let mut outcome = Ok(());
    for handle in handles {
        let result = handle
            .join()
            .map_err(|_| "storm thread panicked".to_string())
            .and_then(|r| r);
        if outcome.is_ok() {
            outcome = result;
        }
    }
    detector
        .stop(Duration::from_secs(2))
        .map_err(|e| e.to_string())?;
    outcome?;

    if locks.waiting_count() != 0 {
        return Err(format!("{} waiter(s) left behind", locks.waiting_count()));
    }
    for resource in resources.iter() {
        if !locks.holders(resource).is_empty() {
            return Err(format!("'{resource}' still held"));
        }
    }
    let stats = locks.stats();
    if stats.grants != stats.releases {
        return Err(format!("{} grants but {} releases", stats.grants, stats.releases));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn test_lock_storm_terminates_and_keeps_exclusivity(
        threads in 2usize..6,
        resources in 1usize..4,
        ops in 5usize..25,
        seed in any::<u64>(),
    ) {
        let start = Instant::now();
        let result = run_storm(threads, resources, ops, seed);
        prop_assert!(result.is_ok(), "{:?}", result);
        prop_assert!(start.elapsed() < Duration::from_secs(60));
    }
}

#[test]
fn test_shared_holders_coexist() {
    let locks = LockManager::new();
    let a = locks.acquire("camera_1", LockMode::Shared, ACQUIRE_TIMEOUT).unwrap();
    let b = thread::scope(|s| {
        s.spawn(|| locks.acquire("camera_1", LockMode::Shared, ACQUIRE_TIMEOUT))
            .join()
            .unwrap()
    })
    .unwrap();
    assert_eq!(locks.holders("camera_1").len(), 2);
    assert_eq!(locks.mode("camera_1"), Some(LockMode::Shared));
    locks.release(&a).unwrap();
    locks.release(&b).unwrap();
    assert_eq!(locks.mode("camera_1"), None);
}
