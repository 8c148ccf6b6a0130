//! ID 类型生成
//!
//! 所有记录 ID 都是进程内单调递增的 `u64`，以带前缀的字符串形式显示（如 `task-12`）。

use std::sync::atomic::{AtomicU64, Ordering};

/// 定义一个 ID 新类型
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize))]
        pub struct $name(u64);

        impl $name {
            /// 从原始数值构造（主要用于测试和诊断）
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// 原始数值
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

pub(crate) use id_type;

/// 单调递增 ID 生成器（从 1 开始）
#[derive(Debug)]
pub(crate) struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub(crate) const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
