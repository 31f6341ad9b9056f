//! 单例存储
//!
//! 进程内唯一的共享可变状态：单例描述符缓存、每个名字的持有者集合、
//! 以及正在进行中的关闭 future。所有读改写都在同一把锁内完成，锁不会跨越 `.await`。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::{BoxFuture, Shared};
use parking_lot::{Mutex, MutexGuard};

use super::provider::ServiceDescriptor;
use super::silo::SiloId;
use crate::errors::DiError;

pub(crate) type DescriptorFuture =
    Shared<BoxFuture<'static, Result<Arc<ServiceDescriptor>, DiError>>>;
pub(crate) type ShutdownFuture = Shared<BoxFuture<'static, Result<(), DiError>>>;

pub(crate) struct SingletonEntry {
    pub(crate) descriptor: DescriptorFuture,
    pub(crate) generation: u64,
}

/// 释放单例持有权的结果
pub(crate) enum Release {
    /// 该名字不是存活的单例
    NotSingleton,
    /// 其他筒仓仍在使用，或本筒仓并未持有
    StillShared,
    /// 最后一个持有者释放，描述符已从存储中移除
    Evicted(DescriptorFuture),
}

#[derive(Default)]
pub(crate) struct StoreState {
    descriptors: HashMap<String, SingletonEntry>,
    handles: HashMap<String, HashSet<SiloId>>,
    shutdowns: HashMap<String, ShutdownFuture>,
    next_generation: u64,
}

impl StoreState {
    /// 已缓存则登记持有者并复用，否则用 `make` 创建新一代实例
    ///
    /// 返回描述符 future 以及是否新建。
    pub(crate) fn get_or_create(
        &mut self,
        name: &str,
        silo: SiloId,
        make: impl FnOnce(u64) -> DescriptorFuture,
    ) -> (DescriptorFuture, bool) {
        if let Some(descriptor) = self.acquire(name, silo) {
            return (descriptor, false);
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let descriptor = make(generation);
        self.descriptors.insert(
            name.to_string(),
            SingletonEntry {
                descriptor: descriptor.clone(),
                generation,
            },
        );
        self.handles
            .insert(name.to_string(), HashSet::from([silo]));
        (descriptor, true)
    }

    pub(crate) fn acquire(&mut self, name: &str, silo: SiloId) -> Option<DescriptorFuture> {
        let entry = self.descriptors.get(name)?;
        self.handles.entry(name.to_string()).or_default().insert(silo);
        Some(entry.descriptor.clone())
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    /// 移除某一代失败的实例，让后续请求可以重试
    pub(crate) fn evict_failed(&mut self, name: &str, generation: u64) {
        let matches = self
            .descriptors
            .get(name)
            .is_some_and(|entry| entry.generation == generation);
        if matches {
            self.descriptors.remove(name);
            self.handles.remove(name);
        }
    }

    pub(crate) fn release(&mut self, name: &str, silo: SiloId) -> Release {
        if !self.descriptors.contains_key(name) {
            return Release::NotSingleton;
        }
        let handles = self.handles.entry(name.to_string()).or_default();
        let held = handles.remove(&silo);
        if !held || !handles.is_empty() {
            return Release::StillShared;
        }

        self.handles.remove(name);
        match self.descriptors.remove(name) {
            Some(entry) => Release::Evicted(entry.descriptor),
            None => Release::NotSingleton,
        }
    }

    pub(crate) fn shutdown_future(&self, name: &str) -> Option<ShutdownFuture> {
        self.shutdowns.get(name).cloned()
    }

    pub(crate) fn set_shutdown(&mut self, name: &str, future: ShutdownFuture) {
        self.shutdowns.insert(name.to_string(), future);
    }

    pub(crate) fn clear_shutdown(&mut self, name: &str) {
        self.shutdowns.remove(name);
    }

    pub(crate) fn holders(&self, name: &str) -> Vec<SiloId> {
        let mut holders: Vec<SiloId> = self
            .handles
            .get(name)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        holders.sort();
        holders
    }

    pub(crate) fn live_count(&self) -> usize {
        self.descriptors.len()
    }
}

#[derive(Default)]
pub(crate) struct SingletonStore {
    state: Mutex<StoreState>,
}

impl SingletonStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock()
    }
}
