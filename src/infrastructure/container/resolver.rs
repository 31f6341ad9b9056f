//! 依赖解析与初始化
//!
//! 解析分两步：
//! 1. 规划：从请求的声明出发遍历注册表，计算拓扑分层；
//! 2. 执行：逐层并发获取或创建实例，整层完成后作为一个批次写入筒仓日志。
//!
//! 批次边界只在整层完成后记录，所以后面的批次只依赖前面的批次，关闭时倒序处理即可。

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use tracing::debug;

use super::declaration::DependencyDeclaration;
use super::provider::{Factory, ServiceDeclaration, ServiceDescriptor};
use super::registry::ProviderRegistry;
use super::runtime::RuntimeInner;
use super::services::Services;
use super::silo::SiloState;
use super::singletons::{DescriptorFuture, SingletonStore};
use crate::errors::DiError;

/// 解析计划
#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub(crate) layers: Vec<Vec<String>>,
    /// 失败会一路传到必需根声明的节点
    pub(crate) required: HashSet<String>,
    /// 规划阶段就确定缺失的可选根声明（按别名）
    pub(crate) absent_roots: HashSet<String>,
}

enum Visit {
    InProgress,
    Planned(Option<usize>),
    Failed(DiError),
}

pub(crate) struct Planner<'a> {
    registry: &'a ProviderRegistry,
    silo: Option<&'a SiloState>,
    singletons: Option<&'a SingletonStore>,
    visits: HashMap<String, Visit>,
    layers: Vec<Vec<String>>,
    required_edges: HashMap<String, Vec<String>>,
}

impl<'a> Planner<'a> {
    /// 为某个筒仓规划：筒仓里已有的实例不再规划，存活单例只向下走单例依赖
    pub(crate) fn for_silo(
        registry: &'a ProviderRegistry,
        singletons: &'a SingletonStore,
        silo: &'a SiloState,
    ) -> Self {
        Self {
            silo: Some(silo),
            singletons: Some(singletons),
            ..Self::detached(registry)
        }
    }

    /// 只看注册表的规划，等价于一个全新筒仓且没有任何存活单例
    pub(crate) fn detached(registry: &'a ProviderRegistry) -> Self {
        Self {
            registry,
            silo: None,
            singletons: None,
            visits: HashMap::new(),
            layers: Vec::new(),
            required_edges: HashMap::new(),
        }
    }

    pub(crate) fn plan(mut self, declarations: &[DependencyDeclaration]) -> Result<Plan, DiError> {
        let mut absent_roots = HashSet::new();
        let mut required_roots = Vec::new();

        for declaration in declarations {
            match self.visit(&declaration.target) {
                Ok(_) => {
                    if !declaration.optional {
                        required_roots.push(declaration.target.clone());
                    }
                }
                Err(err) if declaration.optional => {
                    debug!(
                        dependency = %declaration,
                        error = %err,
                        "Optional dependency is absent"
                    );
                    absent_roots.insert(declaration.alias.clone());
                }
                Err(err) => return Err(err),
            }
        }

        let required = self.required_closure(required_roots);
        Ok(Plan {
            layers: self.layers,
            required,
            absent_roots,
        })
    }

    fn visit(&mut self, name: &str) -> Result<Option<usize>, DiError> {
        match self.visits.get(name) {
            Some(Visit::Planned(layer)) => return Ok(*layer),
            Some(Visit::Failed(err)) => return Err(err.clone()),
            Some(Visit::InProgress) => {
                // 注册时已经拒绝了环，这里只作为兜底
                return Err(DiError::CircularDependency {
                    chain: vec![name.to_string(), name.to_string()],
                });
            }
            None => {}
        }

        if self.silo.is_some_and(|silo| silo.contains(name)) {
            self.visits.insert(name.to_string(), Visit::Planned(None));
            return Ok(None);
        }

        let Some(declaration) = self.registry.get(name) else {
            debug!(service = name, "No service provider");
            let err = DiError::UnmatchedDependency {
                name: name.to_string(),
                path: vec![name.to_string()],
            };
            self.visits
                .insert(name.to_string(), Visit::Failed(err.clone()));
            return Err(err);
        };

        let live_singleton = self
            .singletons
            .is_some_and(|store| store.lock().contains(name));

        self.visits.insert(name.to_string(), Visit::InProgress);
        let mut deepest: Option<usize> = None;
        let mut required = Vec::new();

        for dependency in declaration.dependencies() {
            if live_singleton && !self.is_singleton(&dependency.target) {
                continue;
            }
            match self.visit(&dependency.target) {
                Ok(Some(layer)) => {
                    deepest = Some(deepest.map_or(layer, |d| d.max(layer)));
                    if !dependency.optional {
                        required.push(dependency.target.clone());
                    }
                }
                Ok(None) => {}
                Err(err) if dependency.optional => {
                    debug!(
                        service = name,
                        dependency = %dependency,
                        error = %err,
                        "Optional dependency is absent"
                    );
                }
                Err(err) => {
                    let err = err.wrap_requester(name);
                    self.visits
                        .insert(name.to_string(), Visit::Failed(err.clone()));
                    return Err(err);
                }
            }
        }

        let layer = deepest.map_or(0, |d| d + 1);
        if self.layers.len() <= layer {
            self.layers.resize_with(layer + 1, Vec::new);
        }
        self.layers[layer].push(name.to_string());
        self.visits
            .insert(name.to_string(), Visit::Planned(Some(layer)));
        self.required_edges.insert(name.to_string(), required);
        Ok(Some(layer))
    }

    fn is_singleton(&self, name: &str) -> bool {
        self.registry
            .get(name)
            .is_some_and(|declaration| declaration.is_singleton())
    }

    fn required_closure(&self, roots: Vec<String>) -> HashSet<String> {
        let mut closure = HashSet::new();
        let mut queue: VecDeque<String> = roots.into();
        while let Some(name) = queue.pop_front() {
            if !closure.insert(name.clone()) {
                continue;
            }
            if let Some(children) = self.required_edges.get(&name) {
                queue.extend(children.iter().cloned());
            }
        }
        closure
    }
}

/// 解析一组声明，返回以别名为键的服务表
///
/// `requester` 为筒仓自身时不包装未匹配错误，否则把请求者加到错误路径前面。
pub(crate) fn initialize<'a>(
    runtime: &'a Arc<RuntimeInner>,
    silo: &'a Arc<SiloState>,
    requester: &'a str,
    declarations: &'a [DependencyDeclaration],
) -> BoxFuture<'a, Result<Services, DiError>> {
    async move {
        debug!(
            silo = %silo.name,
            requester,
            count = declarations.len(),
            "Initializing dependencies"
        );
        let wrap = |err: DiError| {
            if requester == silo.name {
                err
            } else {
                err.wrap_requester(requester)
            }
        };

        let plan = Planner::for_silo(&runtime.registry, &runtime.singletons, silo)
            .plan(declarations)
            .map_err(wrap)?;

        for layer in &plan.layers {
            let pending: Vec<DescriptorFuture> = layer
                .iter()
                .map(|name| acquire(runtime, silo, name))
                .collect();
            let settled = future::join_all(pending).await;
            silo.push_batch(layer.clone());

            let failure = layer
                .iter()
                .zip(settled)
                .find_map(|(name, result)| match result {
                    Err(err) if plan.required.contains(name) => Some(err),
                    _ => None,
                });
            if let Some(err) = failure {
                debug!(
                    silo = %silo.name,
                    requester,
                    error = %err,
                    "Dependency initialization failed"
                );
                return Err(wrap(err));
            }
        }

        collect(runtime, silo, declarations, &plan.absent_roots)
            .await
            .map_err(wrap)
    }
    .boxed()
}

/// 从已存活的描述符构建服务表
async fn collect(
    runtime: &Arc<RuntimeInner>,
    silo: &Arc<SiloState>,
    declarations: &[DependencyDeclaration],
    absent_roots: &HashSet<String>,
) -> Result<Services, DiError> {
    let mut services = Services::new();
    for declaration in declarations {
        if absent_roots.contains(&declaration.alias) {
            services.insert(declaration.alias.clone(), None);
            continue;
        }
        let result = match lookup_live(runtime, silo, &declaration.target) {
            Some(descriptor) => descriptor.await,
            None => Err(DiError::UnmatchedDependency {
                name: declaration.target.clone(),
                path: vec![declaration.target.clone()],
            }),
        };
        match result {
            Ok(descriptor) => {
                services.insert(declaration.alias.clone(), Some(descriptor.value().clone()));
            }
            Err(_) if declaration.optional => services.insert(declaration.alias.clone(), None),
            Err(err) => return Err(err),
        }
    }
    Ok(services)
}

/// 只注入已存活的服务，缺失时报 `BadInjection`
///
/// 找到的服务作为一个批次记录，即使其中某个声明失败。
pub(crate) async fn inject_existing(
    runtime: &Arc<RuntimeInner>,
    silo: &Arc<SiloState>,
    declarations: &[DependencyDeclaration],
) -> Result<Services, DiError> {
    let lookups: Vec<Option<DescriptorFuture>> = declarations
        .iter()
        .map(|declaration| lookup_live(runtime, silo, &declaration.target))
        .collect();
    let settled = future::join_all(lookups.into_iter().map(|lookup| async move {
        match lookup {
            Some(descriptor) => Some(descriptor.await),
            None => None,
        }
    }))
    .await;

    let mut services = Services::new();
    let mut batch = Vec::new();
    let mut failure = None;
    for (declaration, result) in declarations.iter().zip(settled) {
        let result = match result {
            Some(result) => {
                batch.push(declaration.target.clone());
                result
            }
            None => Err(DiError::BadInjection(declaration.target.clone())),
        };
        match result {
            Ok(descriptor) => {
                services.insert(declaration.alias.clone(), Some(descriptor.value().clone()))
            }
            Err(_) if declaration.optional => services.insert(declaration.alias.clone(), None),
            Err(err) => {
                failure.get_or_insert(err);
            }
        }
    }
    silo.push_batch(batch);

    match failure {
        Some(err) => Err(err),
        None => Ok(services),
    }
}

/// 单例存储优先，其次筒仓本地缓存；都没有时返回 `None`
///
/// 命中单例时登记本筒仓的持有权。
fn lookup_live(
    runtime: &Arc<RuntimeInner>,
    silo: &Arc<SiloState>,
    name: &str,
) -> Option<DescriptorFuture> {
    let singleton = runtime.singletons.lock().acquire(name, silo.id);
    singleton.or_else(|| silo.descriptor(name))
}

/// 获取描述符，不存在则创建
fn acquire(runtime: &Arc<RuntimeInner>, silo: &Arc<SiloState>, name: &str) -> DescriptorFuture {
    let declaration = runtime.registry.get(name);

    {
        let mut store = runtime.singletons.lock();
        if let Some(descriptor) = store.acquire(name, silo.id) {
            debug!(silo = %silo.name, service = name, "Reusing a singleton");
            runtime.stats.singleton_reuses.fetch_add(1, Ordering::Relaxed);
            return descriptor;
        }
        if let Some(declaration) = declaration.as_ref().filter(|d| d.is_singleton()) {
            let (descriptor, _) = store.get_or_create(name, silo.id, |generation| {
                instantiate(runtime.clone(), silo.clone(), declaration.clone(), Some(generation))
                    .boxed()
                    .shared()
            });
            return descriptor;
        }
    }

    match declaration {
        Some(declaration) => {
            let (descriptor, _) = silo.get_or_insert_with(name, || {
                instantiate(runtime.clone(), silo.clone(), declaration, None)
                    .boxed()
                    .shared()
            });
            descriptor
        }
        None => match silo.descriptor(name) {
            Some(descriptor) => descriptor,
            None => future::ready(Err(DiError::UnmatchedDependency {
                name: name.to_string(),
                path: vec![name.to_string()],
            }))
            .boxed()
            .shared(),
        },
    }
}

async fn instantiate(
    runtime: Arc<RuntimeInner>,
    silo: Arc<SiloState>,
    declaration: Arc<ServiceDeclaration>,
    generation: Option<u64>,
) -> Result<Arc<ServiceDescriptor>, DiError> {
    let name = declaration.name().to_string();
    debug!(silo = %silo.name, service = %name, "Initializing a service descriptor");

    // 单例可能占用独占资源（比如端口），必须等上一代完全关闭
    if declaration.is_singleton() {
        let previous = runtime.singletons.lock().shutdown_future(&name);
        if let Some(previous) = previous {
            debug!(service = %name, "Waiting for the previous instance to shut down");
            let _ = previous.await;
        }
        runtime.singletons.lock().clear_shutdown(&name);
    }
    silo.clear_shutdown(&name);

    match build_descriptor(&runtime, &silo, &declaration).await {
        Ok(descriptor) => {
            if let Some(signal) = descriptor.take_error_signal() {
                debug!(silo = %silo.name, service = %name, "Registering a service error signal");
                silo.push_error_signal(signal);
            }
            runtime.stats.instances_created.fetch_add(1, Ordering::Relaxed);
            debug!(
                silo = %silo.name,
                service = %name,
                "Successfully initialized a service descriptor"
            );
            Ok(Arc::new(descriptor))
        }
        Err(err) => {
            debug!(
                silo = %silo.name,
                service = %name,
                error = %err,
                "Error initializing a service descriptor"
            );
            if let Some(generation) = generation {
                runtime.singletons.lock().evict_failed(&name, generation);
            }
            Err(err)
        }
    }
}

async fn build_descriptor(
    runtime: &Arc<RuntimeInner>,
    silo: &Arc<SiloState>,
    declaration: &ServiceDeclaration,
) -> Result<ServiceDescriptor, DiError> {
    let name = declaration.name();
    let services = gather_dependencies(runtime, silo, declaration).await?;

    match declaration.factory() {
        Factory::Constant(value) => Ok(ServiceDescriptor::from_value(value.clone())),
        Factory::Service(factory) => {
            let pending = std::panic::catch_unwind(AssertUnwindSafe(|| factory(services)))
                .map_err(|_| DiError::BadServicePromise(name.to_string()))?;
            let value = AssertUnwindSafe(pending)
                .catch_unwind()
                .await
                .map_err(|_| DiError::BadServiceProvider(name.to_string()))?
                .map_err(|err| DiError::service_failed(name, err))?;
            Ok(ServiceDescriptor::from_value(value))
        }
        Factory::Provider(factory) => {
            let pending = std::panic::catch_unwind(AssertUnwindSafe(|| factory(services)))
                .map_err(|_| DiError::BadServiceProvider(name.to_string()))?;
            AssertUnwindSafe(pending)
                .catch_unwind()
                .await
                .map_err(|_| DiError::BadServiceProvider(name.to_string()))?
                .map_err(|err| DiError::service_failed(name, err))
        }
    }
}

/// 收集依赖值；规划之外缺失的依赖（例如单例在规划后被回收）走一次嵌套解析
async fn gather_dependencies(
    runtime: &Arc<RuntimeInner>,
    silo: &Arc<SiloState>,
    declaration: &ServiceDeclaration,
) -> Result<Services, DiError> {
    let mut live = Vec::new();
    let mut missing = Vec::new();
    for dependency in declaration.dependencies() {
        match lookup_live(runtime, silo, &dependency.target) {
            Some(descriptor) => live.push((dependency, descriptor)),
            None => missing.push(dependency.clone()),
        }
    }

    let mut services = if missing.is_empty() {
        Services::new()
    } else {
        initialize(runtime, silo, declaration.name(), &missing).await?
    };

    for (dependency, descriptor) in live {
        match descriptor.await {
            Ok(descriptor) => {
                services.insert(dependency.alias.clone(), Some(descriptor.value().clone()))
            }
            Err(_) if dependency.optional => services.insert(dependency.alias.clone(), None),
            Err(err) => return Err(err.wrap_requester(declaration.name())),
        }
    }
    debug!(
        silo = %silo.name,
        service = declaration.name(),
        "Successfully initialized service dependencies"
    );
    Ok(services)
}

/// 只看注册表计算分层
pub(crate) fn plan_layers(
    registry: &ProviderRegistry,
    declarations: &[DependencyDeclaration],
) -> Result<Vec<Vec<String>>, DiError> {
    Planner::detached(registry)
        .plan(declarations)
        .map(|plan| plan.layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 依赖用空格分隔
    fn registry_with(entries: &[(&str, &str)]) -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        for (name, deps) in entries {
            let declaration =
                ServiceDeclaration::service(*name, deps.split_whitespace(), |_| async { Ok(()) })
                    .unwrap();
            registry.register(declaration).unwrap();
        }
        registry
    }

    fn parse(tokens: &[&str]) -> Vec<DependencyDeclaration> {
        DependencyDeclaration::parse_all(tokens).unwrap()
    }

    #[test]
    fn test_layers_follow_depth() {
        let registry = registry_with(&[
            ("NODE_ENV", ""),
            ("dep1", ""),
            ("dep2", "dep1 NODE_ENV"),
            ("dep3", "dep2 dep1 ?depOpt"),
        ]);

        let layers = plan_layers(&registry, &parse(&["dep1", "finalMappedDep>dep3"])).unwrap();
        assert_eq!(layers, vec![vec!["dep1", "NODE_ENV"], vec!["dep2"], vec!["dep3"]]);
    }

    #[test]
    fn test_diamond_is_planned_once() {
        let registry = registry_with(&[
            ("d", ""),
            ("b", "d"),
            ("c", "d"),
            ("a", "b c"),
        ]);

        let layers = plan_layers(&registry, &parse(&["a", "d"])).unwrap();
        assert_eq!(layers, vec![vec!["d"], vec!["b", "c"], vec!["a"]]);
    }

    #[test]
    fn test_unmatched_path_is_wrapped() {
        let registry = registry_with(&[("repo", "db"), ("app", "repo")]);

        let err = plan_layers(&registry, &parse(&["app"])).unwrap_err();
        match err {
            DiError::UnmatchedDependency { name, path } => {
                assert_eq!(name, "db");
                assert_eq!(path, ["app", "repo", "db"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_optional_subtree_failure_is_absorbed() {
        let registry = registry_with(&[("metrics", "exporter"), ("app", "?metrics")]);

        let plan = Planner::detached(&registry)
            .plan(&parse(&["app", "?missing:other"]))
            .unwrap();
        assert_eq!(plan.layers, vec![vec!["app"]]);
        assert!(plan.absent_roots.contains("other"));
        assert!(plan.required.contains("app"));
    }

    #[test]
    fn test_required_closure_skips_optional_edges() {
        let registry = registry_with(&[
            ("cache", ""),
            ("db", ""),
            ("repo", "db ?cache"),
        ]);

        let plan = Planner::detached(&registry).plan(&parse(&["repo"])).unwrap();
        assert!(plan.required.contains("repo"));
        assert!(plan.required.contains("db"));
        assert!(!plan.required.contains("cache"));
    }
}
