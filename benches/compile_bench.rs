//! Performance benchmarks for workflow compilation
//!
//! Measures the full pipeline on wide trees (many sibling steps) and deep
//! trees (nested groups), since the optimizer sweeps the whole list per round.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use testflow::{Compiler, ContainerConfig, Stage};

fn wide_tree(width: usize) -> Stage {
    let children = (0..width)
        .map(|i| {
            let image = if i % 3 == 0 { "alpine:3.20" } else { "node:20" };
            let step = Stage::container(
                format!("step{i}"),
                ContainerConfig::with_image(image).command(["sh", "-c", "true"]),
            );
            if i % 5 == 0 {
                step.optional()
            } else {
                step
            }
        })
        .collect();
    Stage::group("root", children)
}

fn deep_tree(depth: usize) -> Stage {
    (0..depth).rev().fold(
        Stage::container("leaf", ContainerConfig::with_image("alpine:3.20")),
        |inner, level| {
            Stage::group(
                format!("level{level}"),
                vec![
                    Stage::container(format!("pre{level}"), ContainerConfig::default().command(["true"])),
                    inner,
                ],
            )
        },
    )
}

fn bench_wide_trees(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_wide");
    let compiler = Compiler::default();

    for width in &[10, 50, 200] {
        let tree = wide_tree(*width);
        group.bench_with_input(BenchmarkId::new("compile", width), &tree, |b, tree| {
            b.iter(|| black_box(compiler.compile(black_box(tree)).unwrap()));
        });
    }
    group.finish();
}

fn bench_deep_trees(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_deep");
    let compiler = Compiler::default();

    for depth in &[5, 20, 50] {
        let tree = deep_tree(*depth);
        group.bench_with_input(BenchmarkId::new("plan", depth), &tree, |b, tree| {
            b.iter(|| black_box(compiler.plan(black_box(tree)).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_wide_trees, bench_deep_trees);
criterion_main!(benches);
