//! 等待图（Wait-for Graph）
//!
//! 节点是线程（[`OwnerId`]），边 `waiter -> holder` 表示 `waiter` 正在等待 `holder`
//! 释放某个资源（或等待排在它前面的 `holder` 先被授予）。
//!
//! 图由锁表在持锁状态下构建，只存在于一次检测期间；
//! 一条边的生命周期与对应的排队请求完全一致。

use crate::owner::OwnerId;
use std::collections::BTreeMap;

/// 等待边
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WaitEdge {
    pub waiter: OwnerId,
    pub holder: OwnerId,
    /// 等待者请求的资源
    pub resource: String,
    /// 等待者的排队序号（越大越新）
    pub ticket: u64,
}

/// 环中的一个参与者
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CycleParticipant {
    pub owner: OwnerId,
    pub owner_name: String,
    /// 正在等待的资源
    pub waiting_for: String,
    /// 当前持有的资源
    pub holding: Vec<String>,
}

/// 一个死锁环
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Cycle {
    /// 参与者（沿等待方向排列）
    pub participants: Vec<CycleParticipant>,
    /// 被强制失败的等待者
    pub victim: OwnerId,
}

impl Cycle {
    /// 环涉及的全部资源（去重，按出现顺序）
    pub fn resources(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for p in &self.participants {
            for r in std::iter::once(&p.waiting_for).chain(p.holding.iter()) {
                if !out.contains(&r.as_str()) {
                    out.push(r);
                }
            }
        }
        out
    }

    /// 人类可读描述，例如 `worker-1 waits 'B' (holds 'A') -> worker-2 waits 'A' (holds 'B')`
    pub fn describe(&self) -> String {
        self.participants
            .iter()
            .map(|p| {
                format!(
                    "{} waits '{}' (holds {})",
                    p.owner_name,
                    p.waiting_for,
                    if p.holding.is_empty() {
                        "nothing".to_string()
                    } else {
                        p.holding
                            .iter()
                            .map(|r| format!("'{r}'"))
                            .collect::<Vec<_>>()
                            .join(", ")
                    }
                )
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

/// 等待图
#[derive(Debug, Default)]
pub(crate) struct WaitForGraph {
    adj: BTreeMap<OwnerId, Vec<WaitEdge>>,
}

impl WaitForGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_edge(&mut self, edge: WaitEdge) {
        let out = self.adj.entry(edge.waiter).or_default();
        if !out.iter().any(|e| e.holder == edge.holder) {
            out.push(edge);
        }
    }

    /// 删除节点及其全部入边和出边
    pub(crate) fn remove_node(&mut self, owner: OwnerId) {
        self.adj.remove(&owner);
        for out in self.adj.values_mut() {
            out.retain(|e| e.holder != owner);
        }
    }

    pub(crate) fn edges(&self) -> impl Iterator<Item = &WaitEdge> {
        self.adj.values().flatten()
    }

    /// 深度优先搜索一个环，返回沿环的边
    pub(crate) fn find_cycle(&self) -> Option<Vec<WaitEdge>> {
        let mut color = BTreeMap::new();
        let mut path = Vec::new();
        for &start in self.adj.keys() {
            if color.contains_key(&start) {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut color, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: OwnerId,
        color: &mut BTreeMap<OwnerId, Color>,
        path: &mut Vec<&'a WaitEdge>,
    ) -> Option<Vec<WaitEdge>> {
        color.insert(node, Color::Gray);
        for edge in self.adj.get(&node).into_iter().flatten() {
            match color.get(&edge.holder) {
                Some(Color::Gray) => {
                    let start = path
                        .iter()
                        .position(|e| e.waiter == edge.holder)
                        .unwrap_or(path.len());
                    let mut cycle: Vec<WaitEdge> =
                        path[start..].iter().map(|e| (*e).clone()).collect();
                    cycle.push(edge.clone());
                    return Some(cycle);
                },
                Some(Color::Black) => {},
                None => {
                    path.push(edge);
                    if let Some(cycle) = self.visit(edge.holder, color, path) {
                        return Some(cycle);
                    }
                    path.pop();
                },
            }
        }
        color.insert(node, Color::Black);
        None
    }
}
