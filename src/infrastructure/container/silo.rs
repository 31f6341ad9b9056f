//! 执行筒仓
//!
//! 每次 `run` 都会创建一个新的筒仓，它拥有：
//! - 本地描述符缓存（非单例实例只属于一个筒仓）
//! - 按解析顺序追加的批次日志，关闭时倒序处理
//! - 本地关闭 future 缓存
//! - 独立的致命错误通道

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::declaration::DependencyDeclaration;
use super::provider::{ServiceDescriptor, ServiceValue};
use super::resolver;
use super::runtime::{InnerStats, RuntimeInner};
use super::services::Services;
use super::shutdown;
use super::singletons::{DescriptorFuture, ShutdownFuture};
use crate::errors::DiError;

/// 筒仓标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiloId(pub u64);

impl fmt::Display for SiloId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct SiloBook {
    descriptors: HashMap<String, DescriptorFuture>,
    batches: Vec<Vec<String>>,
    shutdowns: HashMap<String, ShutdownFuture>,
    error_signals: Vec<BoxFuture<'static, anyhow::Error>>,
}

pub(crate) struct SiloState {
    pub(crate) id: SiloId,
    pub(crate) name: String,
    book: Mutex<SiloBook>,
    outcome: Arc<Mutex<Option<ShutdownFuture>>>,
    fatal: watch::Sender<Option<DiError>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SiloState {
    pub(crate) fn new(id: SiloId, name: String) -> Self {
        let (fatal, _) = watch::channel(None);
        Self {
            id,
            name,
            book: Mutex::new(SiloBook::default()),
            outcome: Arc::new(Mutex::new(None)),
            fatal,
            watcher: Mutex::new(None),
        }
    }

    /// 写入预置服务（保留名字），它们不进入批次日志
    pub(crate) fn seed(&self, name: &str, value: ServiceValue) {
        let descriptor: DescriptorFuture =
            future::ready(Ok(Arc::new(ServiceDescriptor::from_value(value))))
                .boxed()
                .shared();
        self.book
            .lock()
            .descriptors
            .insert(name.to_string(), descriptor);
    }

    pub(crate) fn descriptor(&self, name: &str) -> Option<DescriptorFuture> {
        self.book.lock().descriptors.get(name).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.book.lock().descriptors.contains_key(name)
    }

    /// 本地已有则复用，否则用 `make` 创建并登记
    pub(crate) fn get_or_insert_with(
        &self,
        name: &str,
        make: impl FnOnce() -> DescriptorFuture,
    ) -> (DescriptorFuture, bool) {
        let mut book = self.book.lock();
        if let Some(existing) = book.descriptors.get(name) {
            return (existing.clone(), false);
        }
        let descriptor = make();
        book.descriptors.insert(name.to_string(), descriptor.clone());
        (descriptor, true)
    }

    /// 追加一个批次，空批次直接忽略
    pub(crate) fn push_batch(&self, batch: Vec<String>) {
        if batch.is_empty() {
            return;
        }
        debug!(silo = %self.name, ?batch, "Recorded a resolution batch");
        self.book.lock().batches.push(batch);
    }

    pub(crate) fn batches(&self) -> Vec<Vec<String>> {
        self.book.lock().batches.clone()
    }

    /// 弹出最后一个批次，同时返回剩余批次的快照
    pub(crate) fn pop_batch(&self) -> Option<(Vec<String>, Vec<Vec<String>>)> {
        let mut book = self.book.lock();
        let batch = book.batches.pop()?;
        Some((batch, book.batches.clone()))
    }

    pub(crate) fn shutdown_future(&self, name: &str) -> Option<ShutdownFuture> {
        self.book.lock().shutdowns.get(name).cloned()
    }

    pub(crate) fn set_shutdown(&self, name: &str, future: ShutdownFuture) {
        self.book.lock().shutdowns.insert(name.to_string(), future);
    }

    pub(crate) fn clear_shutdown(&self, name: &str) {
        self.book.lock().shutdowns.remove(name);
    }

    pub(crate) fn push_error_signal(&self, signal: BoxFuture<'static, anyhow::Error>) {
        self.book.lock().error_signals.push(signal);
    }

    pub(crate) fn outcome(&self) -> &Arc<Mutex<Option<ShutdownFuture>>> {
        &self.outcome
    }

    /// 只记录第一个致命错误
    pub(crate) fn trigger_fatal(&self, err: DiError) -> bool {
        self.fatal.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(err);
            true
        })
    }

    pub(crate) fn fatal_watch(&self) -> FatalErrorWatch {
        FatalErrorWatch {
            rx: self.fatal.subscribe(),
        }
    }

    /// 启动致命错误监视任务：等待第一个错误信号
    pub(crate) fn spawn_error_watcher(self: &Arc<Self>, stats: Arc<InnerStats>) {
        let signals = std::mem::take(&mut self.book.lock().error_signals);
        if signals.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(silo = %self.name, "No tokio runtime, fatal error signals are not watched");
            return;
        };

        debug!(silo = %self.name, count = signals.len(), "Handling fatal errors");
        let silo = Arc::downgrade(self);
        let task = handle.spawn(async move {
            let (err, _, _) = future::select_all(signals).await;
            if let Some(silo) = silo.upgrade() {
                error!(silo = %silo.name, error = %err, "Handled a fatal error");
                stats.fatal_errors.fetch_add(1, Ordering::Relaxed);
                silo.trigger_fatal(DiError::fatal(silo.name.clone(), err));
            }
        });
        *self.watcher.lock() = Some(task);
    }

    pub(crate) fn stop_error_watcher(&self) {
        if let Some(task) = self.watcher.lock().take() {
            task.abort();
        }
    }
}

/// `$siloContext` 注入的值
#[derive(Clone)]
pub struct SiloContext {
    id: SiloId,
    name: String,
    pub(crate) silo: Weak<SiloState>,
    pub(crate) runtime: Weak<RuntimeInner>,
}

impl SiloContext {
    pub(crate) fn new(silo: &Arc<SiloState>, runtime: &Arc<RuntimeInner>) -> Self {
        Self {
            id: silo.id,
            name: silo.name.clone(),
            silo: Arc::downgrade(silo),
            runtime: Arc::downgrade(runtime),
        }
    }

    pub fn id(&self) -> SiloId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前记录的批次（筒仓关闭后为空）
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.silo
            .upgrade()
            .map(|silo| silo.batches())
            .unwrap_or_default()
    }
}

impl fmt::Debug for SiloContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiloContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// `$shutdown` 注入的值：关闭所属筒仓，多次调用返回同一个结果
#[derive(Clone)]
pub struct ShutdownHandle {
    silo: Weak<SiloState>,
    runtime: Weak<RuntimeInner>,
    outcome: Arc<Mutex<Option<ShutdownFuture>>>,
}

impl ShutdownHandle {
    pub(crate) fn new(silo: &Arc<SiloState>, runtime: &Arc<RuntimeInner>) -> Self {
        Self {
            silo: Arc::downgrade(silo),
            runtime: Arc::downgrade(runtime),
            outcome: silo.outcome().clone(),
        }
    }

    pub async fn shutdown(&self) -> Result<(), DiError> {
        self.future().await
    }

    fn future(&self) -> ShutdownFuture {
        if let Some(cached) = self.outcome.lock().clone() {
            return cached;
        }
        match (self.runtime.upgrade(), self.silo.upgrade()) {
            (Some(runtime), Some(silo)) => shutdown::shutdown_silo(&runtime, &silo),
            _ => future::ready(Ok(())).boxed().shared(),
        }
    }
}

/// `$shutdownAll` 注入的值：关闭运行时中所有筒仓
#[derive(Clone)]
pub struct ShutdownAllHandle {
    pub(crate) runtime: Weak<RuntimeInner>,
}

impl ShutdownAllHandle {
    pub async fn shutdown_all(&self) -> Result<(), DiError> {
        match self.runtime.upgrade() {
            Some(runtime) => shutdown::shutdown_all(&runtime).await,
            None => Ok(()),
        }
    }
}

/// `$fatalError` 注入的值
#[derive(Clone)]
pub struct FatalErrorWatch {
    rx: watch::Receiver<Option<DiError>>,
}

impl FatalErrorWatch {
    /// 等待第一个致命错误；没有错误时永远不会完成
    pub async fn wait(&self) -> DiError {
        let mut rx = self.rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(err) = current {
                return err;
            }
            if rx.changed().await.is_err() {
                future::pending::<()>().await;
            }
        }
    }

    pub fn current(&self) -> Option<DiError> {
        self.rx.borrow().clone()
    }
}

/// `$inject` 注入的值：只注入筒仓内已经存活的服务
#[derive(Clone)]
pub struct Injector {
    context: SiloContext,
}

impl Injector {
    pub(crate) fn new(context: SiloContext) -> Self {
        Self { context }
    }

    pub async fn inject<I, S>(&self, declarations: I) -> Result<Services, DiError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let declarations = DependencyDeclaration::parse_all(declarations)?;
        let (Some(runtime), Some(silo)) =
            (self.context.runtime.upgrade(), self.context.silo.upgrade())
        else {
            return Err(DiError::InstanceShutdown);
        };
        resolver::inject_existing(&runtime, &silo, &declarations).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_batches_are_append_only_and_pop_from_end() {
        let silo = SiloState::new(SiloId(0), "silo-0".to_string());
        silo.push_batch(vec!["a".into(), "b".into()]);
        silo.push_batch(Vec::new());
        silo.push_batch(vec!["c".into()]);

        assert_eq!(silo.batches(), vec![vec!["a", "b"], vec!["c"]]);
        let (last, remaining) = silo.pop_batch().unwrap();
        assert_eq!(last, vec!["c"]);
        assert_eq!(remaining, vec![vec!["a", "b"]]);
    }

    #[test]
    fn test_seeded_values_are_local() {
        let silo = SiloState::new(SiloId(3), "silo-3".to_string());
        silo.seed("$value", Arc::new(7u8));
        assert!(silo.contains("$value"));
        assert!(silo.descriptor("$value").is_some());
        assert!(silo.batches().is_empty());
    }

    #[tokio::test]
    async fn test_only_first_fatal_error_is_kept() {
        let silo = SiloState::new(SiloId(1), "silo-1".to_string());
        let watch = silo.fatal_watch();
        assert!(watch.current().is_none());

        assert!(silo.trigger_fatal(DiError::fatal("silo-1", anyhow::anyhow!("first"))));
        assert!(!silo.trigger_fatal(DiError::fatal("silo-1", anyhow::anyhow!("second"))));

        let err = tokio::time::timeout(Duration::from_secs(1), watch.wait())
            .await
            .unwrap();
        assert!(err.to_string().contains("first"));
    }

    #[tokio::test]
    async fn test_error_watcher_forwards_first_signal() {
        let silo = Arc::new(SiloState::new(SiloId(2), "silo-2".to_string()));
        let stats = Arc::new(InnerStats::default());
        silo.push_error_signal(future::pending().boxed());
        silo.push_error_signal(async { anyhow::anyhow!("connection lost") }.boxed());
        silo.spawn_error_watcher(stats.clone());

        let err = tokio::time::timeout(Duration::from_secs(1), silo.fatal_watch().wait())
            .await
            .unwrap();
        assert!(matches!(err, DiError::Fatal { ref silo, .. } if silo == "silo-2"));
        assert_eq!(stats.fatal_errors.load(Ordering::Relaxed), 1);
        silo.stop_error_watcher();
    }
}
