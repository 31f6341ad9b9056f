//! 关闭编排
//!
//! 按批次倒序关闭筒仓里的服务：同一批次并发，批次之间顺序执行。
//! 单例只有在最后一个持有它的筒仓关闭时才会执行关闭钩子。
//! 某个钩子失败时，同批次其余钩子照常跑完，之后不再处理更早的批次。

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::future::{self, FutureExt};
use tracing::{debug, info};

use super::runtime::RuntimeInner;
use super::silo::SiloState;
use super::singletons::{Release, ShutdownFuture};
use crate::errors::DiError;

fn done() -> ShutdownFuture {
    future::ready(Ok(())).boxed().shared()
}

/// 关闭筒仓，重复调用返回同一个结果
pub(crate) fn shutdown_silo(runtime: &Arc<RuntimeInner>, silo: &Arc<SiloState>) -> ShutdownFuture {
    let mut outcome = silo.outcome().lock();
    if let Some(existing) = outcome.as_ref() {
        return existing.clone();
    }
    let future = run_shutdown(runtime.clone(), silo.clone()).boxed().shared();
    *outcome = Some(future.clone());
    future
}

async fn run_shutdown(runtime: Arc<RuntimeInner>, silo: Arc<SiloState>) -> Result<(), DiError> {
    info!(silo = %silo.name, "Shutting down services");
    let result = shutdown_batches(&runtime, &silo).await;
    silo.stop_error_watcher();
    runtime.silos.lock().remove(&silo.id);

    match &result {
        Ok(()) => info!(silo = %silo.name, "Shut down services"),
        Err(err) => info!(silo = %silo.name, error = %err, "Shutdown failed"),
    }
    result
}

async fn shutdown_batches(
    runtime: &Arc<RuntimeInner>,
    silo: &Arc<SiloState>,
) -> Result<(), DiError> {
    while let Some((batch, remaining)) = silo.pop_batch() {
        debug!(silo = %silo.name, ?batch, "Shutting down a batch");
        let pending: Vec<ShutdownFuture> = batch
            .iter()
            .map(|name| shutdown_service(runtime, silo, name, &remaining))
            .collect();
        // 同批次的钩子全部结束后再看结果，失败不打断兄弟钩子
        let settled = future::join_all(pending).await;
        if let Some(err) = settled.into_iter().find_map(Result::err) {
            return Err(err);
        }
    }
    Ok(())
}

fn shutdown_service(
    runtime: &Arc<RuntimeInner>,
    silo: &Arc<SiloState>,
    name: &str,
    remaining: &[Vec<String>],
) -> ShutdownFuture {
    // 锁顺序：先单例存储，后筒仓
    let mut store = runtime.singletons.lock();

    if let Some(existing) = store
        .shutdown_future(name)
        .or_else(|| silo.shutdown_future(name))
    {
        debug!(silo = %silo.name, service = name, "Reusing a service shutdown future");
        return existing;
    }

    // 同一个服务还出现在更早的批次里，等轮到那个批次再关闭
    if remaining.iter().any(|batch| batch.iter().any(|n| n == name)) {
        debug!(silo = %silo.name, service = name, "Delaying service shutdown");
        return done();
    }

    let (descriptor, singleton) = match store.release(name, silo.id) {
        Release::StillShared => {
            debug!(silo = %silo.name, service = name, "Singleton is used elsewhere");
            return done();
        }
        Release::Evicted(descriptor) => (descriptor, true),
        Release::NotSingleton => match silo.descriptor(name) {
            Some(descriptor) => (descriptor, false),
            None => return done(),
        },
    };

    debug!(silo = %silo.name, service = name, singleton, "Shutting down a service");
    let stats = runtime.stats.clone();
    let service = name.to_string();
    let future = async move {
        match descriptor.await {
            Ok(descriptor) => {
                if descriptor.has_shutdown() {
                    stats.shutdown_hooks.fetch_add(1, Ordering::Relaxed);
                }
                descriptor
                    .shutdown()
                    .await
                    .map_err(|err| DiError::shutdown_failed(service, err))
            }
            // 初始化失败的服务没有可关闭的实例
            Err(_) => Ok(()),
        }
    }
    .boxed()
    .shared();

    if singleton {
        store.set_shutdown(name, future.clone());
    }
    drop(store);
    silo.set_shutdown(name, future.clone());
    future
}

/// 关闭运行时里所有存活的筒仓，之后 `run` 会返回 `InstanceShutdown`
pub(crate) fn shutdown_all_future(runtime: &Arc<RuntimeInner>) -> ShutdownFuture {
    let mut guard = runtime.shutdown_all.lock();
    if let Some(existing) = guard.as_ref() {
        return existing.clone();
    }

    let silos: Vec<Arc<SiloState>> = runtime.silos.lock().values().cloned().collect();
    info!(count = silos.len(), "Shutting down all silos");
    let pending: Vec<ShutdownFuture> = silos
        .iter()
        .map(|silo| shutdown_silo(runtime, silo))
        .collect();
    let future = async move {
        let settled = future::join_all(pending).await;
        settled.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }
    .boxed()
    .shared();
    *guard = Some(future.clone());
    future
}

pub(crate) async fn shutdown_all(runtime: &Arc<RuntimeInner>) -> Result<(), DiError> {
    shutdown_all_future(runtime).await
}
