//! 依赖注入容器
//!
//! 服务按名字注册，声明自己的依赖；`Runtime::run` 在一个新的执行筒仓里
//! 按拓扑分层初始化依赖，关闭时按相反顺序释放。

pub mod declaration;
pub mod provider;
pub mod registry;
pub mod runtime;
pub mod services;
pub mod silo;

mod resolver;
mod shutdown;
mod singletons;

pub use declaration::DependencyDeclaration;
pub use provider::{
    ProviderOptions, ServiceDeclaration, ServiceDescriptor, ServiceKind, ServiceValue,
};
pub use registry::ProviderRegistry;
pub use runtime::{Runtime, RuntimeStats};
pub use services::Services;
pub use silo::{FatalErrorWatch, Injector, ShutdownAllHandle, ShutdownHandle, SiloContext, SiloId};

/// 当前筒仓的关闭句柄
pub const SHUTDOWN: &str = "$shutdown";
/// 关闭运行时所有筒仓的句柄
pub const SHUTDOWN_ALL: &str = "$shutdownAll";
/// 只注入已存活服务的注入器
pub const INJECT: &str = "$inject";
/// 当前筒仓的名字和批次日志
pub const SILO_CONTEXT: &str = "$siloContext";
/// 致命错误通道
pub const FATAL_ERROR: &str = "$fatalError";

pub const RESERVED_NAMES: [&str; 5] = [SHUTDOWN, SHUTDOWN_ALL, INJECT, SILO_CONTEXT, FATAL_ERROR];

pub(crate) fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}
