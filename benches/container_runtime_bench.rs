#![allow(clippy::uninlined_format_args)]
//! 依赖注入运行时的性能基准测试

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use silo_di::{ProviderOptions, Runtime, ServiceDescriptor, ShutdownHandle, SHUTDOWN};

/// 链式依赖：n{i} 依赖 n{i-1}
fn chain_runtime(length: usize, singleton: bool) -> Runtime {
    let runtime = Runtime::new();
    let options = if singleton {
        ProviderOptions::singleton()
    } else {
        ProviderOptions::default()
    };
    for i in 0..length {
        let deps: Vec<String> = if i == 0 {
            Vec::new()
        } else {
            vec![format!("n{}", i - 1)]
        };
        runtime
            .provider(format!("n{}", i), deps, options, move |_| async move {
                Ok(ServiceDescriptor::new(i).with_shutdown(|| async { Ok(()) }))
            })
            .unwrap();
    }
    runtime
}

/// 宽依赖：root 依赖所有叶子
fn wide_runtime(width: usize) -> Runtime {
    let runtime = Runtime::new();
    let mut leaves = Vec::new();
    for i in 0..width {
        let name = format!("leaf{}", i);
        runtime
            .service(name.clone(), Vec::<&str>::new(), move |_| async move { Ok(i) })
            .unwrap();
        leaves.push(name);
    }
    runtime
        .service("root", leaves, |services| async move { Ok(services.len()) })
        .unwrap();
    runtime
}

fn bench_chain_resolution(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("chain_resolution");

    for length in [1, 10, 50].iter() {
        let runtime = chain_runtime(*length, false);
        let root = format!("n{}", length - 1);
        group.bench_with_input(BenchmarkId::from_parameter(length), length, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let services = runtime.run([root.as_str(), SHUTDOWN]).await.unwrap();
                    let handle = services.get::<ShutdownHandle>(SHUTDOWN).unwrap();
                    handle.shutdown().await.unwrap();
                    black_box(services.len())
                })
            });
        });
    }

    group.finish();
}

fn bench_wide_resolution(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("wide_resolution");

    for width in [10, 100].iter() {
        let runtime = wide_runtime(*width);
        group.bench_with_input(BenchmarkId::from_parameter(width), width, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let services = runtime.run(["root", SHUTDOWN]).await.unwrap();
                    let handle = services.get::<ShutdownHandle>(SHUTDOWN).unwrap();
                    handle.shutdown().await.unwrap();
                    black_box(*services.get::<usize>("root").unwrap())
                })
            });
        });
    }

    group.finish();
}

/// 单例已存活时的复用开销
fn bench_singleton_reuse(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let runtime = chain_runtime(20, true);
    // 保持一个筒仓存活，后续筒仓只复用单例
    let _holder = rt.block_on(runtime.run(["n19"])).unwrap();

    c.bench_function("singleton_reuse", |b| {
        b.iter(|| {
            rt.block_on(async {
                let services = runtime.run(["n19", SHUTDOWN]).await.unwrap();
                let handle = services.get::<ShutdownHandle>(SHUTDOWN).unwrap();
                handle.shutdown().await.unwrap();
                black_box(services.len())
            })
        });
    });
}

fn bench_plan(c: &mut Criterion) {
    let runtime = chain_runtime(50, false);
    c.bench_function("plan_chain_50", |b| {
        b.iter(|| black_box(runtime.plan(["n49"]).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_chain_resolution,
    bench_wide_resolution,
    bench_singleton_reuse,
    bench_plan
);

criterion_main!(benches);
