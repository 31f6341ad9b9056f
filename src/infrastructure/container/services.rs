use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::provider::ServiceValue;
use crate::errors::DiError;

/// 注入结果：键 -> 服务值，可选依赖缺失时对应值为 `None`
#[derive(Clone, Default)]
pub struct Services {
    values: HashMap<String, Option<ServiceValue>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, key: impl Into<String>, value: Option<ServiceValue>) {
        self.values.insert(key.into(), value);
    }

    /// 按键获取并向下转型
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, DiError> {
        let value = self
            .values
            .get(key)
            .and_then(Option::as_ref)
            .ok_or_else(|| DiError::MissingService(key.to_string()))?;

        value
            .clone()
            .downcast::<T>()
            .map_err(|_| DiError::TypeCastFailed {
                key: key.to_string(),
                expected_type: type_name::<T>(),
            })
    }

    /// 可选依赖：缺失或类型不符都返回 `None`
    pub fn optional<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get(key).ok()
    }

    pub fn raw(&self, key: &str) -> Option<&ServiceValue> {
        self.values.get(key).and_then(Option::as_ref)
    }

    /// 键存在（即使值为空）
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_absent(&self, key: &str) -> bool {
        matches!(self.values.get(key), Some(None))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.values.iter().map(|(k, v)| (k, v.is_some())).collect();
        keys.sort();
        f.debug_map().entries(keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let mut services = Services::new();
        services.insert("port", Some(Arc::new(8080u16) as ServiceValue));
        services.insert("cache", None);

        assert_eq!(*services.get::<u16>("port").unwrap(), 8080);
        assert!(services.optional::<u16>("cache").is_none());
        assert!(services.is_absent("cache"));
        assert!(services.contains_key("cache"));
        assert_eq!(services.len(), 2);
    }

    #[test]
    fn test_type_cast_failure() {
        let mut services = Services::new();
        services.insert("port", Some(Arc::new(8080u16) as ServiceValue));

        let err = services.get::<String>("port").unwrap_err();
        assert!(matches!(err, DiError::TypeCastFailed { ref key, .. } if key == "port"));
        assert!(matches!(
            services.get::<u16>("missing"),
            Err(DiError::MissingService(_))
        ));
    }
}
