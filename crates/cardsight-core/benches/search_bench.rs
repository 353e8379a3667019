use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cardsight_core::{
    CardRecord, EmbeddingCatalog, IndexStrategy, NormalizedEmbeddings, PqConfig, QuantBits,
    SimilaritySearch, VectorIndex,
};

const CARDS: usize = 2_000;
const DIM: usize = 512;

fn synthetic_records() -> Vec<CardRecord> {
    let mut state = 0x9e37_79b9_7f4a_7c15_u64;
    (0..CARDS)
        .map(|i| {
            let embedding = (0..DIM)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    (state >> 40) as f32 / (1u64 << 24) as f32 - 0.5
                })
                .collect();
            CardRecord::new(i as i64, format!("card-{i}")).with_embedding(embedding)
        })
        .collect()
}

fn bench_search(c: &mut Criterion) {
    let embeddings = NormalizedEmbeddings::collect(synthetic_records(), DIM).unwrap();
    let catalog = EmbeddingCatalog::from_embeddings(&embeddings, QuantBits::Eight).unwrap();
    let query = embeddings.vectors()[..DIM].to_vec();

    let strategies = [
        ("exact", IndexStrategy::Exact),
        ("manual", IndexStrategy::Manual),
        (
            "pq_m64_8bit",
            IndexStrategy::ProductQuantized(PqConfig::new().with_iterations(5)),
        ),
    ];

    for (name, strategy) in &strategies {
        let index = VectorIndex::build(strategy, &catalog, &embeddings).unwrap();
        c.bench_function(&format!("search_top1_{name}"), |b| {
            b.iter(|| index.search(black_box(&query), 1).unwrap());
        });
    }

    c.bench_function("quantize_catalog_8bit", |b| {
        b.iter(|| EmbeddingCatalog::from_embeddings(black_box(&embeddings), QuantBits::Eight).unwrap());
    });
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
