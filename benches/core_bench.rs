//! Benchmarks for siteform core operations.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use siteform::core::parser::{self, LoadedConfig};
use siteform::core::state::new_state;
use siteform::core::types::Attributes;
use siteform::core::{planner, resolver};
use siteform::tripwire::hasher;

/// A stack of `sites` independent bucket → cdn → record chains under one zone.
fn stack_yaml(sites: usize) -> String {
    let mut yaml = String::from(
        "version: \"1.0\"\nname: bench\nresources:\n  zone:\n    type: dns_zone\n    attributes: { name: example.com }\n",
    );
    for i in 0..sites {
        yaml.push_str(&format!(
            "  bucket-{i}:\n    type: bucket\n    attributes: {{ bucket: site-{i}.example.com }}\n\
             \x20 cdn-{i}:\n    type: cdn_distribution\n    attributes: {{ origin_domain_name: \"${{bucket-{i}.bucket_regional_domain_name}}\" }}\n\
             \x20 www-{i}:\n    type: dns_record\n    attributes: {{ zone_id: \"${{zone.zone_id}}\", name: site-{i}, record_type: A, alias_target: \"${{cdn-{i}.domain_name}}\" }}\n"
        ));
    }
    yaml
}

fn bench_hash_attributes(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_attributes");
    for n in [4, 16, 64] {
        let mut attrs = Attributes::new();
        for i in 0..n {
            attrs.insert(format!("key_{i}"), json!({ "value": i, "tags": ["a", "b"] }));
        }
        group.bench_with_input(BenchmarkId::from_parameter(n), &attrs, |b, attrs| {
            b.iter(|| black_box(hasher::hash_attributes(black_box(attrs))));
        });
    }
    group.finish();
}

fn bench_topological_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("topological_order");
    for n in [10, 100, 1000] {
        let nodes: Vec<(String, Vec<String>)> = (0..n)
            .map(|i| {
                let deps = if i == 0 {
                    vec![]
                } else {
                    vec![format!("r{}", i / 2)]
                };
                (format!("r{i}"), deps)
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &nodes, |b, nodes| {
            b.iter(|| black_box(resolver::topological_order(black_box(nodes)).unwrap()));
        });
    }
    group.finish();
}

fn bench_load_config(c: &mut Criterion) {
    let yaml = stack_yaml(20);
    c.bench_function("load_config_61_resources", |b| {
        b.iter(|| {
            let config = parser::parse_config(black_box(&yaml)).unwrap();
            black_box(LoadedConfig::load(config).unwrap());
        });
    });
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_empty_state");
    for sites in [5, 50] {
        let loaded = LoadedConfig::load(parser::parse_config(&stack_yaml(sites)).unwrap()).unwrap();
        let state = new_state();
        group.bench_with_input(BenchmarkId::from_parameter(sites), &loaded, |b, loaded| {
            b.iter(|| black_box(planner::plan(&loaded.config, &loaded.order, &state).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_hash_attributes,
    bench_topological_order,
    bench_load_config,
    bench_plan
);
criterion_main!(benches);
