//! 线程工具
//!
//! 所有专用线程（工作线程、健康监控、死锁检测）都通过这里创建和回收：
//! - 线程必须命名（日志和故障消息里以线程名标识持有者）
//! - join 必须有超时（核心内不存在无界等待）

use crate::error::CoreError;
use std::any::Any;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 单次等待的上限（防止 `Instant` 溢出）
pub(crate) const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// `timeout` 之后的截止时间，等待时长截断到 [`MAX_WAIT`]
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(MAX_WAIT)
}

/// 带超时的线程 join
pub(crate) trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> Result<(), JoinFailure>;
}

/// join 失败原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JoinFailure {
    /// 超时，线程仍在运行（由进程退出时回收）
    TimedOut,
    /// 线程 panic 退出
    Panicked(String),
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> Result<(), JoinFailure> {
        if self.is_finished() {
            return self
                .join()
                .map(|_| ())
                .map_err(|p| JoinFailure::Panicked(panic_message(p.as_ref())));
        }

        let (tx, rx) = crossbeam_channel::bounded(1);

        // 看门狗线程负责真正的 join，超时后自行结束
        thread::spawn(move || {
            let result = self.join();
            let _ = tx.send(result.map(|_| ()).map_err(|p| panic_message(p.as_ref())));
        });

        match rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(JoinFailure::Panicked(msg)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(JoinFailure::TimedOut),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(JoinFailure::Panicked("watchdog disconnected".into()))
            },
        }
    }
}

/// 创建命名线程
pub(crate) fn spawn_named<F, T>(name: impl Into<String>, f: F) -> Result<JoinHandle<T>, CoreError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| CoreError::Spawn { name, source })
}

/// 从 panic 负载中提取消息
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_timeout_finished_thread() {
        let handle = spawn_named("quick", || 1 + 1).unwrap();
        assert_eq!(handle.join_timeout(Duration::from_secs(1)), Ok(()));
    }

    #[test]
    fn test_join_timeout_expires() {
        let handle = spawn_named("slow", || thread::sleep(Duration::from_millis(300))).unwrap();
        let start = Instant::now();
        assert_eq!(
            handle.join_timeout(Duration::from_millis(50)),
            Err(JoinFailure::TimedOut)
        );
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn test_join_timeout_reports_panic() {
        let handle = spawn_named("boom", || panic!("worker exploded")).unwrap();
        match handle.join_timeout(Duration::from_secs(1)) {
            Err(JoinFailure::Panicked(msg)) => assert!(msg.contains("worker exploded")),
            other => panic!("Expected panic failure, got {:?}", other),
        }
    }

    #[test]
    fn test_deadline_after_caps_huge_timeouts() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline >= before + MAX_WAIT);
        assert!(deadline <= Instant::now() + MAX_WAIT);
        assert!(deadline_after(Duration::ZERO) <= Instant::now());
    }

    #[test]
    fn test_panic_message_variants() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(17u32);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
