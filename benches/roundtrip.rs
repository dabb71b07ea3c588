use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use cast::{Backend, CancelToken, Coder, Config};

fn sample_csv(rows: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..rows {
        out.extend_from_slice(
            format!("{i},device{},{}.{:03},status_ok\n", i % 64, i / 7, i % 1000).as_bytes(),
        );
    }
    out
}

fn bench_compress(c: &mut Criterion) {
    let mut group = c.benchmark_group("compress");
    for &rows in &[1_000usize, 10_000, 100_000] {
        let input = sample_csv(rows);
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &input, |b, input| {
            let cfg = Config::default();
            b.iter(|| {
                let mut out = Vec::new();
                cast::compress_stream(
                    black_box(&input[..]),
                    &mut out,
                    input.len() as u64,
                    &cfg,
                    &CancelToken::new(),
                )
                .expect("compress");
                out
            });
        });
    }
    group.finish();
}

fn bench_restore(c: &mut Criterion) {
    let mut group = c.benchmark_group("restore_block");
    for &rows in &[1_000usize, 10_000] {
        let input = sample_csv(rows);
        let cfg = Config::default();
        let (sealed, _) = cast::block::build_block(&input, &cfg, None).expect("build");
        let coder = Coder::new(Backend::NativeLzma2, cfg.dict_size, 1);
        let compressed = coder.encode(&sealed.bytes, 0).expect("encode");
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(rows),
            &compressed,
            |b, compressed| {
                b.iter(|| {
                    let block = coder.decode(black_box(compressed), 0).expect("decode");
                    let mut out = Vec::with_capacity(input.len());
                    cast::restore::restore_block(&block, &mut out, None, 0, 0).expect("restore");
                    out
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_compress, bench_restore);
criterion_main!(benches);
