//! 依赖注入运行时
//!
//! `Runtime` 是可克隆的句柄，内部共享注册表、单例存储和存活筒仓列表。
//! 每次 `run` 创建一个新的执行筒仓。

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::declaration::DependencyDeclaration;
use super::provider::{ProviderOptions, ServiceDeclaration, ServiceDescriptor};
use super::registry::ProviderRegistry;
use super::resolver;
use super::services::Services;
use super::shutdown;
use super::silo::{Injector, ShutdownAllHandle, ShutdownHandle, SiloContext, SiloId, SiloState};
use super::singletons::{ShutdownFuture, SingletonStore};
use super::{is_reserved_name, FATAL_ERROR, INJECT, SHUTDOWN, SHUTDOWN_ALL, SILO_CONTEXT};
use crate::config::RuntimeConfig;
use crate::errors::DiError;

/// 内部计数器
#[derive(Debug, Default)]
pub(crate) struct InnerStats {
    pub(crate) silos_created: AtomicU64,
    pub(crate) instances_created: AtomicU64,
    pub(crate) singleton_reuses: AtomicU64,
    pub(crate) shutdown_hooks: AtomicU64,
    pub(crate) fatal_errors: AtomicU64,
}

/// 运行时统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub silos_created: u64,
    pub instances_created: u64,
    pub singleton_reuses: u64,
    pub shutdown_hooks: u64,
    pub fatal_errors: u64,
    /// 尚未关闭的筒仓
    pub live_silos: usize,
    pub live_singletons: usize,
}

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) registry: ProviderRegistry,
    pub(crate) singletons: SingletonStore,
    pub(crate) silos: Mutex<HashMap<SiloId, Arc<SiloState>>>,
    pub(crate) shutdown_all: Mutex<Option<ShutdownFuture>>,
    pub(crate) stats: Arc<InnerStats>,
    silo_counter: AtomicU64,
}

impl RuntimeInner {
    /// 创建并登记新筒仓；运行时已整体关闭时返回 `InstanceShutdown`
    fn create_silo(self: &Arc<Self>) -> Result<Arc<SiloState>, DiError> {
        // 持有整体关闭锁，避免 shutdown_all 快照之后又登记新筒仓
        let closing = self.shutdown_all.lock();
        if closing.is_some() {
            return Err(DiError::InstanceShutdown);
        }

        let id = SiloId(self.silo_counter.fetch_add(1, Ordering::Relaxed));
        let silo = Arc::new(SiloState::new(
            id,
            format!("{}-{}", self.config.silo_prefix, id),
        ));
        silo.seed(SHUTDOWN, Arc::new(ShutdownHandle::new(&silo, self)));
        silo.seed(SILO_CONTEXT, Arc::new(SiloContext::new(&silo, self)));
        silo.seed(FATAL_ERROR, Arc::new(silo.fatal_watch()));
        self.silos.lock().insert(id, silo.clone());
        drop(closing);

        self.stats.silos_created.fetch_add(1, Ordering::Relaxed);
        debug!(silo = %silo.name, "Created an execution silo");
        Ok(silo)
    }
}

fn internal_declarations(runtime: Weak<RuntimeInner>) -> Result<Vec<ServiceDeclaration>, DiError> {
    let shutdown_all = ServiceDeclaration::provider(SHUTDOWN_ALL, Vec::<&str>::new(), move |_| {
        let runtime = runtime.clone();
        async move { Ok(ServiceDescriptor::new(ShutdownAllHandle { runtime })) }
    })?
    .singleton();

    let inject = ServiceDeclaration::provider(INJECT, [SILO_CONTEXT], |services| async move {
        let context = services.get::<SiloContext>(SILO_CONTEXT)?;
        Ok(ServiceDescriptor::new(Injector::new((*context).clone())))
    })?;

    Ok(vec![shutdown_all, inject])
}

/// 依赖注入运行时
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RuntimeInner>| {
            let registry = ProviderRegistry::new();
            let registered = internal_declarations(weak.clone()).and_then(|declarations| {
                declarations
                    .into_iter()
                    .try_for_each(|declaration| registry.register_internal(declaration))
            });
            if let Err(err) = registered {
                warn!(error = %err, "Failed to register internal services");
            }

            RuntimeInner {
                config,
                registry,
                singletons: SingletonStore::new(),
                silos: Mutex::new(HashMap::new()),
                shutdown_all: Mutex::new(None),
                stats: Arc::new(InnerStats::default()),
                silo_counter: AtomicU64::new(0),
            }
        });
        info!(silo_prefix = %inner.config.silo_prefix, "Created a dependency injection runtime");
        Self { inner }
    }

    /// 进程级共享运行时，首次访问时创建
    #[cfg(feature = "global")]
    pub fn global() -> &'static Runtime {
        lazy_static::lazy_static! {
            static ref GLOBAL: Runtime = Runtime::new();
        }
        &GLOBAL
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// 注册服务声明，同名声明会被覆盖
    pub fn register(&self, declaration: ServiceDeclaration) -> Result<(), DiError> {
        self.inner.registry.register(declaration)
    }

    pub fn constant<T: Any + Send + Sync>(
        &self,
        name: impl Into<String>,
        value: T,
    ) -> Result<(), DiError> {
        self.register(ServiceDeclaration::constant(name, value))
    }

    pub fn service<I, S, F, Fut, T>(
        &self,
        name: impl Into<String>,
        dependencies: I,
        factory: F,
    ) -> Result<(), DiError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(Services) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Any + Send + Sync,
    {
        self.register(ServiceDeclaration::service(name, dependencies, factory)?)
    }

    pub fn provider<I, S, F, Fut>(
        &self,
        name: impl Into<String>,
        dependencies: I,
        options: ProviderOptions,
        factory: F,
    ) -> Result<(), DiError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(Services) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ServiceDescriptor>> + Send + 'static,
    {
        let declaration = ServiceDeclaration::provider(name, dependencies, factory)?;
        self.register(declaration.with_options(options))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.registry.contains(name)
    }

    /// 用户注册的服务名（不含保留名字）
    pub fn registered_names(&self) -> Vec<String> {
        self.inner
            .registry
            .names()
            .into_iter()
            .filter(|name| !is_reserved_name(name))
            .collect()
    }

    /// 在新的执行筒仓中解析声明
    ///
    /// 返回值只包含调用者请求的别名。筒仓的 `$shutdown` 总会被解析，
    /// 调用者可以请求 `$shutdown` 拿到关闭句柄。
    ///
    /// 解析失败时，筒仓里已经创建的服务会先被关闭，再返回初始化错误。
    pub async fn run<I, S>(&self, declarations: I) -> Result<Services, DiError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let declarations = DependencyDeclaration::parse_all(declarations)?;
        let silo = self.inner.create_silo()?;
        info!(silo = %silo.name, count = declarations.len(), "Running a new execution silo");

        let mut requested = declarations.clone();
        if !requested.iter().any(|d| d.target == SHUTDOWN) {
            requested.push(DependencyDeclaration::required(SHUTDOWN));
        }

        let initialized = resolver::initialize(&self.inner, &silo, &silo.name, &requested).await;
        let resolved = match initialized {
            Ok(resolved) => resolved,
            Err(err) => {
                // 失败的筒仓不返回句柄，在这里关闭并释放单例
                debug!(silo = %silo.name, error = %err, "Execution silo failed to start");
                if let Err(shutdown_err) = shutdown::shutdown_silo(&self.inner, &silo).await {
                    warn!(
                        silo = %silo.name,
                        error = %shutdown_err,
                        "Failed to shut down a failed silo"
                    );
                }
                return Err(err);
            }
        };

        if self.inner.config.watch_fatal_errors {
            silo.spawn_error_watcher(self.inner.stats.clone());
        }

        let mut services = Services::new();
        for declaration in &declarations {
            services.insert(declaration.alias.clone(), resolved.raw(&declaration.alias).cloned());
        }
        debug!(silo = %silo.name, ?services, "Execution silo started");
        Ok(services)
    }

    /// 只看注册表计算分层，等价于全新筒仓会记录的批次
    pub fn plan<I, S>(&self, declarations: I) -> Result<Vec<Vec<String>>, DiError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let declarations = DependencyDeclaration::parse_all(declarations)?;
        resolver::plan_layers(&self.inner.registry, &declarations)
    }

    /// 关闭所有存活筒仓，之后 `run` 返回 `InstanceShutdown`
    pub async fn shutdown_all(&self) -> Result<(), DiError> {
        shutdown::shutdown_all(&self.inner).await
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown_all.lock().is_some()
    }

    pub fn stats(&self) -> RuntimeStats {
        let stats = &self.inner.stats;
        RuntimeStats {
            silos_created: stats.silos_created.load(Ordering::Relaxed),
            instances_created: stats.instances_created.load(Ordering::Relaxed),
            singleton_reuses: stats.singleton_reuses.load(Ordering::Relaxed),
            shutdown_hooks: stats.shutdown_hooks.load(Ordering::Relaxed),
            fatal_errors: stats.fatal_errors.load(Ordering::Relaxed),
            live_silos: self.inner.silos.lock().len(),
            live_singletons: self.inner.singletons.lock().live_count(),
        }
    }

    /// 当前持有某个单例的筒仓
    pub fn singleton_holders(&self, name: &str) -> Vec<SiloId> {
        self.inner.singletons.lock().holders(name)
    }
}
