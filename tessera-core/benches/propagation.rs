use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tessera_core::{Computed, Graph};

criterion_main!(benches);
criterion_group!(benches, criterion_benchmark);

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("chain_write_read 100", |b| b.iter(|| chain_write_read_n(100, 100)));
    c.bench_function("fan_out_write_read 1000", |b| {
        b.iter(|| fan_out_write_read_n(1000, 10))
    });
    c.bench_function("cached_read 100000", |b| b.iter(|| cached_read_n(100000)));
}

/// A chain of `depth` cells over one source, written and read `repeat` times.
fn chain_write_read_n(depth: usize, repeat: usize) {
    let graph = Graph::new();
    let source = graph.source(0_usize);
    let mut last = graph.computed(move |r| Ok(r.get(&source)? + 1));
    for _ in 1..depth {
        let prev = last;
        last = graph.computed(move |r| Ok(r.get(&prev)? + 1));
    }

    for i in 0..repeat {
        graph.write(&source, i).unwrap();
        black_box(graph.get(&last).unwrap());
    }
}

/// `sinks` cells reading one source; every write invalidates all of them.
fn fan_out_write_read_n(sinks: usize, repeat: usize) {
    let graph = Graph::new();
    let source = graph.source(0_usize);
    let cells: Vec<Computed<usize>> = (0..sinks)
        .map(|k| graph.computed(move |r| Ok(r.get(&source)? * k)))
        .collect();

    for i in 0..repeat {
        graph.write(&source, i).unwrap();
        let mut sum = 0;
        for cell in &cells {
            sum += graph.get(cell).unwrap();
        }
        black_box(sum);
    }
}

fn cached_read_n(n: usize) {
    let graph = Graph::new();
    let source = graph.source(21_usize);
    let doubled = graph.computed(move |r| Ok(r.get(&source)? * 2));

    for _ in 0..n {
        black_box(graph.get(&doubled).unwrap());
    }
}
