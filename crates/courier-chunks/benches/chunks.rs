use courier_chunks::{digest, join, split, ChunkSize};

fn make_data(size: usize) -> Vec<u8> {
    // Semi-realistic data: repeating pattern with some entropy
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [65536, 1048576, 10485760])]
fn split_fixed(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    let chunk_size = ChunkSize::new(64 * 1024).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| split(divan::black_box(&data), chunk_size).len());
}

#[divan::bench(args = [65536, 1048576, 10485760])]
fn join_fixed(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    let chunks: Vec<(u64, Vec<u8>)> = split(&data, ChunkSize::new(64 * 1024).unwrap())
        .into_iter()
        .map(|c| (c.index, c.data.to_vec()))
        .collect();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| join(divan::black_box(chunks.clone())).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn sha256_digest(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| digest(divan::black_box(&data)));
}

fn main() {
    divan::main();
}
