//! 服务提供者注册表
//!
//! 注册时同步完成循环依赖检测，所以运行期依赖图一定是无环的。
//! 检测和写入在同一把注册锁内完成，并发注册按顺序生效。

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::declaration::DependencyDeclaration;
use super::provider::{ServiceDeclaration, ServiceKind};
use super::is_reserved_name;
use crate::errors::DiError;

/// 名字 -> 服务声明
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<ServiceDeclaration>>,
    /// 串行化“检测 + 写入”，读取不经过这把锁
    registration: Mutex<()>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册用户服务：保留名字会被拒绝
    pub fn register(&self, declaration: ServiceDeclaration) -> Result<(), DiError> {
        if is_reserved_name(declaration.name()) {
            return Err(DiError::ReservedName(declaration.name().to_string()));
        }
        self.register_internal(declaration)
    }

    /// 注册运行时内部服务，跳过保留名字检查
    pub(crate) fn register_internal(&self, declaration: ServiceDeclaration) -> Result<(), DiError> {
        if declaration.name().is_empty() {
            return Err(DiError::BadDeclaration(String::new()));
        }
        check_constant(&declaration)?;

        let _registering = self.registration.lock();
        self.check_circular(&declaration)?;

        debug!(
            service = declaration.name(),
            kind = ?declaration.kind(),
            singleton = declaration.is_singleton(),
            "Registered a new service provider"
        );
        self.providers
            .insert(declaration.name().to_string(), Arc::new(declaration));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceDeclaration>> {
        self.providers.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// 已注册的服务名（排序后返回）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn check_circular(&self, declaration: &ServiceDeclaration) -> Result<(), DiError> {
        let root = declaration.name();
        let mut visited = HashSet::new();

        for dependency in declaration.dependencies() {
            if dependency.target == root {
                return Err(DiError::CircularDependency {
                    chain: vec![root.to_string(), root.to_string()],
                });
            }
            let mut chain = vec![root.to_string()];
            self.lookup_circular(root, dependency, &mut chain, &mut visited)?;
        }
        Ok(())
    }

    fn lookup_circular(
        &self,
        root: &str,
        dependency: &DependencyDeclaration,
        chain: &mut Vec<String>,
        visited: &mut HashSet<String>,
    ) -> Result<(), DiError> {
        let Some(provider) = self.get(&dependency.target) else {
            return Ok(());
        };
        // 已经走过的子图不会回到根
        if !visited.insert(dependency.target.clone()) {
            return Ok(());
        }

        chain.push(dependency.target.clone());
        for child in provider.dependencies() {
            if child.target == root {
                let mut full_chain = chain.clone();
                full_chain.push(root.to_string());
                return Err(DiError::CircularDependency { chain: full_chain });
            }
            self.lookup_circular(root, child, chain, visited)?;
        }
        chain.pop();
        Ok(())
    }
}

/// 常量本身不能是带依赖的声明
fn check_constant(declaration: &ServiceDeclaration) -> Result<(), DiError> {
    if declaration.kind() != ServiceKind::Constant {
        return Ok(());
    }
    let Some(value) = declaration.constant_payload() else {
        return Ok(());
    };
    if let Some(inner) = value.downcast_ref::<ServiceDeclaration>() {
        if !inner.dependencies().is_empty() {
            return Err(DiError::ConstantInjection {
                name: declaration.name().to_string(),
                dependencies: inner.dependencies().iter().map(ToString::to_string).collect(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, deps: &[&str]) -> ServiceDeclaration {
        ServiceDeclaration::service(name, deps.iter().copied(), |_| async { Ok(()) }).unwrap()
    }

    #[test]
    fn test_register_and_overwrite() {
        let registry = ProviderRegistry::new();
        registry.register(service("db", &[])).unwrap();
        registry.register(service("db", &["ENV"])).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("db").unwrap().dependencies().len(), 1);
        assert_eq!(registry.names(), vec!["db".to_string()]);
    }

    #[test]
    fn test_direct_self_dependency() {
        let registry = ProviderRegistry::new();
        let err = registry.register(service("a", &["?a:other"])).unwrap_err();
        assert!(matches!(err, DiError::CircularDependency { ref chain } if chain == &["a", "a"]));
        assert!(!registry.contains("a"));
    }

    #[test]
    fn test_transitive_cycle_carries_chain() {
        let registry = ProviderRegistry::new();
        registry.register(service("b", &["c"])).unwrap();
        registry.register(service("c", &["a"])).unwrap();

        let err = registry.register(service("a", &["b"])).unwrap_err();
        match err {
            DiError::CircularDependency { chain } => assert_eq!(chain, ["a", "b", "c", "a"]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let registry = ProviderRegistry::new();
        registry.register(service("d", &[])).unwrap();
        registry.register(service("b", &["d"])).unwrap();
        registry.register(service("c", &["d"])).unwrap();
        assert!(registry.register(service("a", &["b", "c"])).is_ok());
    }

    #[test]
    fn test_concurrent_registrations_cannot_form_a_cycle() {
        for _ in 0..200 {
            let registry = ProviderRegistry::new();
            let results = std::thread::scope(|scope| {
                let forward = scope.spawn(|| registry.register(service("a", &["b"])));
                let backward = scope.spawn(|| registry.register(service("b", &["a"])));
                [forward.join().unwrap(), backward.join().unwrap()]
            });

            let failures: Vec<&DiError> =
                results.iter().filter_map(|r| r.as_ref().err()).collect();
            assert_eq!(failures.len(), 1);
            assert!(matches!(
                failures[0],
                DiError::CircularDependency { chain } if chain.len() == 3
            ));
            assert_eq!(registry.len(), 1);
        }
    }

    #[test]
    fn test_reserved_names_are_rejected() {
        let registry = ProviderRegistry::new();
        let err = registry.register(service("$shutdown", &[])).unwrap_err();
        assert!(matches!(err, DiError::ReservedName(_)));
    }

    #[test]
    fn test_constant_injection() {
        let registry = ProviderRegistry::new();
        let inner = service("inner", &["db"]);
        let err = registry
            .register(ServiceDeclaration::constant("wrapped", inner))
            .unwrap_err();
        assert!(matches!(err, DiError::ConstantInjection { ref name, .. } if name == "wrapped"));

        let plain = service("inner", &[]);
        assert!(registry.register(ServiceDeclaration::constant("ok", plain)).is_ok());
    }
}
