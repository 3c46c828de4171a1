//! Benchmarks for grouping and sequence packing.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rlpack_core::{GroupingConfig, PackingConfig};
use rlpack_data::{PromptGroup, PromptGrouper, SequencePacker, TokenizedResult};

/// `prompts` groups of `siblings` completions with a 64-token prompt each.
fn make_groups(prompts: usize, siblings: usize) -> Vec<PromptGroup> {
    (0..prompts)
        .map(|p| {
            let prompt: Vec<u32> = (0..64).map(|t| (p * 64 + t) as u32).collect();
            let completions = (0..siblings)
                .map(|s| {
                    let completion_len = 32 + (p * 7 + s * 13) % 96;
                    let mut ids = prompt.clone();
                    ids.extend((0..completion_len).map(|t| (100_000 + s * 1_000 + t) as u32));
                    let mut mask = vec![false; prompt.len()];
                    mask.resize(ids.len(), true);
                    TokenizedResult::new(ids, mask).with_advantage(s as f64 - 0.5)
                })
                .collect();
            PromptGroup::new(completions)
        })
        .collect()
}

fn bench_pack_seq_len(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack");
    let results = PromptGrouper::new(GroupingConfig::default(), Some(0))
        .group_all(make_groups(64, 8))
        .unwrap();

    for seq_len in [512, 2048, 8192] {
        group.bench_with_input(BenchmarkId::new("seq_len", seq_len), &seq_len, |b, &seq_len| {
            let config = PackingConfig::with_seq_len(seq_len).with_seed(0);
            b.iter(|| {
                let mut packer = SequencePacker::new(config.clone());
                black_box(packer.pack(black_box(&results)).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("group");

    for siblings in [4, 16] {
        let groups = make_groups(64, siblings);
        group.bench_with_input(BenchmarkId::new("siblings", siblings), &siblings, |b, _| {
            b.iter(|| {
                let mut grouper = PromptGrouper::new(GroupingConfig::default(), Some(0));
                black_box(grouper.group_all(groups.clone()).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pack_seq_len, bench_group);
criterion_main!(benches);
