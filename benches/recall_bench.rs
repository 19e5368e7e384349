use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use factgraph::atoms::types::MemoryState;
use factgraph::engine::recall::fusion::reciprocal_rank_fusion;
use factgraph::engine::recall::reranking::MmrReranker;
use factgraph::{HydratedMemory, RankedCandidate, SearchResult};
use std::hint::black_box;

// =============================================================================
// Rank fusion
// =============================================================================

/// Two 50-deep arms overlapping by half, fused to top 10.
fn bench_rrf(c: &mut Criterion) {
    let mut group = c.benchmark_group("rrf");
    for depth in [50usize, 200, 1000] {
        let text: Vec<String> = (0..depth).map(|i| format!("m{i}")).collect();
        let vector: Vec<String> = (depth / 2..depth + depth / 2).rev().map(|i| format!("m{i}")).collect();
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| black_box(reciprocal_rank_fusion(&text, &vector, 60.0, 10)))
        });
    }
    group.finish();
}

// =============================================================================
// MMR
// =============================================================================

fn candidate(i: usize) -> SearchResult {
    let now = Utc::now();
    let id = format!("m{i}");
    SearchResult {
        memory: HydratedMemory {
            id: id.clone(),
            user_id: "bench".into(),
            content: format!(
                "memory {} about topic {} with shared words rust async tokio sqlite and more",
                i,
                i % 7
            ),
            created_at: now,
            valid_at: now,
            state: MemoryState::Active,
            categories: vec![],
            tags: vec![],
            app_name: None,
        },
        ranking: RankedCandidate { id, text_rank: Some(i + 1), vector_rank: None, score: 1.0 / (61 + i) as f64 },
        rerank_score: None,
    }
}

fn bench_mmr(c: &mut Criterion) {
    let mmr = MmrReranker::default();
    let mut group = c.benchmark_group("mmr");
    for n in [10usize, 50, 100] {
        let candidates: Vec<SearchResult> = (0..n).map(candidate).collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| black_box(mmr.rerank(candidates.clone(), 10)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_rrf, bench_mmr);
criterion_main!(benches);
