//! 服务声明与服务描述符
//!
//! `ServiceDeclaration` 把工厂和它的元数据（依赖、选项、类型）放在同一个不可变记录里，
//! `ServiceDescriptor` 是工厂执行完成后的产物。

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;

use super::declaration::DependencyDeclaration;
use super::services::Services;
use crate::errors::DiError;

/// 类型擦除的服务值
pub type ServiceValue = Arc<dyn Any + Send + Sync>;

/// 关闭钩子
pub type ShutdownHook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// 普通服务工厂：依赖 -> 服务值
pub type ServiceFactory =
    Arc<dyn Fn(Services) -> BoxFuture<'static, anyhow::Result<ServiceValue>> + Send + Sync>;

/// 提供者工厂：依赖 -> 完整描述符
pub type ProviderFactory =
    Arc<dyn Fn(Services) -> BoxFuture<'static, anyhow::Result<ServiceDescriptor>> + Send + Sync>;

/// 服务种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// 常量，总是单例且没有依赖
    Constant,
    /// 异步创建的服务值
    Service,
    /// 带关闭钩子和错误信号的提供者
    Provider,
}

/// 提供者选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderOptions {
    /// 跨执行筒仓共享同一个实例
    pub singleton: bool,
}

impl ProviderOptions {
    pub fn singleton() -> Self {
        Self { singleton: true }
    }
}

#[derive(Clone)]
pub(crate) enum Factory {
    Constant(ServiceValue),
    Service(ServiceFactory),
    Provider(ProviderFactory),
}

/// 服务声明
#[derive(Clone)]
pub struct ServiceDeclaration {
    name: String,
    kind: ServiceKind,
    dependencies: Vec<DependencyDeclaration>,
    options: ProviderOptions,
    factory: Factory,
}

impl ServiceDeclaration {
    /// 常量声明
    pub fn constant<T: Any + Send + Sync>(name: impl Into<String>, value: T) -> Self {
        Self::constant_value(name, Arc::new(value))
    }

    /// 使用已经擦除类型的值创建常量
    pub fn constant_value(name: impl Into<String>, value: ServiceValue) -> Self {
        Self {
            name: name.into(),
            kind: ServiceKind::Constant,
            dependencies: Vec::new(),
            options: ProviderOptions::singleton(),
            factory: Factory::Constant(value),
        }
    }

    /// 普通服务声明，工厂返回服务值本身
    pub fn service<I, S, F, Fut, T>(
        name: impl Into<String>,
        dependencies: I,
        factory: F,
    ) -> Result<Self, DiError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(Services) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Any + Send + Sync,
    {
        let factory: ServiceFactory = Arc::new(move |services| {
            factory(services)
                .map(|result| result.map(|value| Arc::new(value) as ServiceValue))
                .boxed()
        });
        Ok(Self {
            name: name.into(),
            kind: ServiceKind::Service,
            dependencies: DependencyDeclaration::parse_all(dependencies)?,
            options: ProviderOptions::default(),
            factory: Factory::Service(factory),
        })
    }

    /// 提供者声明，工厂返回完整描述符
    pub fn provider<I, S, F, Fut>(
        name: impl Into<String>,
        dependencies: I,
        factory: F,
    ) -> Result<Self, DiError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(Services) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ServiceDescriptor>> + Send + 'static,
    {
        let factory: ProviderFactory = Arc::new(move |services| factory(services).boxed());
        Ok(Self {
            name: name.into(),
            kind: ServiceKind::Provider,
            dependencies: DependencyDeclaration::parse_all(dependencies)?,
            options: ProviderOptions::default(),
            factory: Factory::Provider(factory),
        })
    }

    /// 返回设置了选项的新声明
    pub fn with_options(mut self, options: ProviderOptions) -> Self {
        if self.kind != ServiceKind::Constant {
            self.options = options;
        }
        self
    }

    pub fn singleton(self) -> Self {
        self.with_options(ProviderOptions::singleton())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn dependencies(&self) -> &[DependencyDeclaration] {
        &self.dependencies
    }

    pub fn options(&self) -> ProviderOptions {
        self.options
    }

    pub fn is_singleton(&self) -> bool {
        self.options.singleton
    }

    pub(crate) fn factory(&self) -> &Factory {
        &self.factory
    }

    /// 常量的值（非常量返回 `None`）
    pub(crate) fn constant_payload(&self) -> Option<&ServiceValue> {
        match &self.factory {
            Factory::Constant(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Debug for ServiceDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDeclaration")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("dependencies", &self.dependencies)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// 服务描述符
pub struct ServiceDescriptor {
    value: ServiceValue,
    shutdown: Option<ShutdownHook>,
    error_signal: Mutex<Option<BoxFuture<'static, anyhow::Error>>>,
}

impl ServiceDescriptor {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_value(Arc::new(value))
    }

    pub fn from_value(value: ServiceValue) -> Self {
        Self {
            value,
            shutdown: None,
            error_signal: Mutex::new(None),
        }
    }

    /// 设置关闭钩子，每个实例最多调用一次
    pub fn with_shutdown<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shutdown = Some(Arc::new(move || hook().boxed()));
        self
    }

    /// 设置错误信号：启动完成后该 future 一旦完成，就视为致命错误
    pub fn with_error_signal<Fut>(self, signal: Fut) -> Self
    where
        Fut: Future<Output = anyhow::Error> + Send + 'static,
    {
        *self.error_signal.lock() = Some(signal.boxed());
        self
    }

    pub fn value(&self) -> &ServiceValue {
        &self.value
    }

    pub fn has_shutdown(&self) -> bool {
        self.shutdown.is_some()
    }

    pub(crate) fn take_error_signal(&self) -> Option<BoxFuture<'static, anyhow::Error>> {
        self.error_signal.lock().take()
    }

    /// 执行关闭钩子；没有钩子时立即完成
    pub(crate) fn shutdown(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        match &self.shutdown {
            Some(hook) => hook(),
            None => futures_util::future::ready(Ok(())).boxed(),
        }
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("has_shutdown", &self.shutdown.is_some())
            .field("has_error_signal", &self.error_signal.lock().is_some())
            .finish_non_exhaustive()
    }
}
