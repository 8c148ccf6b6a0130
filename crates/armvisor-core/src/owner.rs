//! 持有者身份（Owner Identity）
//!
//! 锁的持有者和等待者都以 OS 线程为单位标识。`ThreadId` 没有稳定的数值表示，
//! 不便于日志和故障消息输出，因此这里为每个线程惰性分配一个进程内唯一的 `u64`，
//! 并缓存线程名用于诊断。
//!
//! 工作线程 panic 后会被替换，新线程拿到新的 `OwnerId`，
//! 不会继承旧线程遗留的锁记录。

use std::cell::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: OnceCell<OwnerId> = const { OnceCell::new() };
    static CURRENT_NAME: OnceCell<String> = const { OnceCell::new() };
}

/// 线程身份标识（进程内唯一，从 1 开始递增）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct OwnerId(u64);

impl OwnerId {
    /// 当前线程的身份
    ///
    /// 首次调用时分配，之后在同一线程上返回相同的值。
    pub fn current() -> Self {
        CURRENT.with(|cell| *cell.get_or_init(|| OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))))
    }

    /// 数值形式
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw_for_test(raw: u64) -> Self {
        OwnerId(raw)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// 当前线程的可读名称
///
/// 未命名线程使用 `OwnerId` 作为名称。
pub fn current_name() -> String {
    CURRENT_NAME.with(|cell| {
        cell.get_or_init(|| match std::thread::current().name() {
            Some(name) => name.to_string(),
            None => OwnerId::current().to_string(),
        })
        .clone()
    })
}
