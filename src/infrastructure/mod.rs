//! 基础设施层
//!
//! 目前只包含依赖注入容器。

pub mod container;

pub use container::{
    DependencyDeclaration, ProviderOptions, Runtime, RuntimeStats, ServiceDeclaration,
    ServiceDescriptor, Services,
};
