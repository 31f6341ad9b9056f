//! silo-di：带执行筒仓的异步依赖注入运行时
//!
//! ```no_run
//! use silo_di::{Runtime, ShutdownHandle, SHUTDOWN};
//!
//! # async fn demo() -> Result<(), silo_di::DiError> {
//! let runtime = Runtime::new();
//! runtime.constant("ENV", "development")?;
//! runtime.service("db", ["ENV"], |services| async move {
//!     let env = services.get::<&'static str>("ENV")?;
//!     Ok(format!("db for {}", env))
//! })?;
//!
//! let services = runtime.run(["db", SHUTDOWN]).await?;
//! let shutdown = services.get::<ShutdownHandle>(SHUTDOWN)?;
//! shutdown.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod infrastructure;
pub mod logging;

pub use config::RuntimeConfig;
pub use errors::{ConfigError, DiError};
pub use infrastructure::container::{
    DependencyDeclaration, FatalErrorWatch, Injector, ProviderOptions, ProviderRegistry, Runtime,
    RuntimeStats, ServiceDeclaration, ServiceDescriptor, ServiceKind, ServiceValue, Services,
    ShutdownAllHandle, ShutdownHandle, SiloContext, SiloId, FATAL_ERROR, INJECT, SHUTDOWN,
    SHUTDOWN_ALL, SILO_CONTEXT,
};
pub use logging::{init_logging, LogFormat, LoggingConfig, LoggingEnvironment};
