use std::sync::Arc;

use thiserror::Error;

/// 可克隆的底层错误
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

fn share(err: anyhow::Error) -> SharedError {
    Arc::from(Box::<dyn std::error::Error + Send + Sync + 'static>::from(err))
}

/// 依赖注入运行时错误
///
/// 错误会作为共享 future 的输出被多个等待者克隆，所以底层错误统一放在 `Arc` 里。
#[derive(Debug, Clone, Error)]
pub enum DiError {
    /// 没有为必需依赖注册提供者，`path` 从请求者一直到缺失的名字
    #[error("Unmatched dependency '{name}' (path: {})", .path.join(" -> "))]
    UnmatchedDependency { name: String, path: Vec<String> },

    /// 依赖闭包回到自身，`chain` 以根服务开始并以根服务结束
    #[error("Circular dependency detected: {}", .chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    #[error("Service provider '{0}' did not yield a usable descriptor")]
    BadServiceProvider(String),

    #[error("Service '{0}' factory did not return a future")]
    BadServicePromise(String),

    /// 仅注入已存在实例时，请求的服务尚未实例化
    #[error("Cannot inject '{0}': no live instance in this silo")]
    BadInjection(String),

    #[error("Constant '{name}' carries dependency metadata: {}", .dependencies.join(", "))]
    ConstantInjection { name: String, dependencies: Vec<String> },

    #[error("'{0}' is a reserved service name")]
    ReservedName(String),

    #[error("Bad dependency declaration '{0}'")]
    BadDeclaration(String),

    #[error("Service '{name}' failed to initialize: {source}")]
    ServiceFailed {
        name: String,
        #[source]
        source: SharedError,
    },

    #[error("Service '{name}' failed to shut down: {source}")]
    ShutdownFailed {
        name: String,
        #[source]
        source: SharedError,
    },

    #[error("Type cast failed for '{key}': expected '{expected_type}'")]
    TypeCastFailed { key: String, expected_type: &'static str },

    #[error("No service injected under '{0}'")]
    MissingService(String),

    #[error("The runtime is shutting down, no new silo can be created")]
    InstanceShutdown,

    #[error("Fatal error in silo '{silo}': {source}")]
    Fatal {
        silo: String,
        #[source]
        source: SharedError,
    },
}

impl DiError {
    pub fn service_failed(name: impl Into<String>, err: anyhow::Error) -> Self {
        Self::ServiceFailed {
            name: name.into(),
            source: share(err),
        }
    }

    pub fn shutdown_failed(name: impl Into<String>, err: anyhow::Error) -> Self {
        Self::ShutdownFailed {
            name: name.into(),
            source: share(err),
        }
    }

    /// 把请求者的名字加在未匹配依赖路径的最前面
    ///
    /// 其他错误原样返回。
    pub fn wrap_requester(self, requester: &str) -> Self {
        match self {
            Self::UnmatchedDependency { name, mut path } => {
                path.insert(0, requester.to_string());
                Self::UnmatchedDependency { name, path }
            }
            other => other,
        }
    }

    pub fn fatal(silo: impl Into<String>, err: anyhow::Error) -> Self {
        Self::Fatal {
            silo: silo.into(),
            source: share(err),
        }
    }

    pub fn is_unmatched(&self) -> bool {
        matches!(self, Self::UnmatchedDependency { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file '{0}': {1}")]
    FileRead(String, #[source] std::io::Error),
    #[error("Failed to parse TOML from '{0}': {1}")]
    TomlParse(String, #[source] toml::de::Error),
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}
