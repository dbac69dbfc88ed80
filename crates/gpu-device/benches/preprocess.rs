use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gpu_device::{preprocess_interleaved, Normalization};

fn bench_preprocess(c: &mut Criterion) {
    let (src_w, src_h) = (640usize, 480usize);
    let src: Vec<u8> = (0..src_w * src_h * 3).map(|i| (i % 251) as u8).collect();
    let mut dst = vec![0.0f32; 3 * 224 * 224];
    let norm = Normalization::imagenet();

    c.bench_function("preprocess_640x480_to_224x224", |b| {
        b.iter(|| {
            preprocess_interleaved(
                black_box(&src),
                src_w,
                src_h,
                src_w * 3,
                &mut dst,
                224,
                224,
                &norm,
            )
        })
    });
}

criterion_group!(benches, bench_preprocess);
criterion_main!(benches);
