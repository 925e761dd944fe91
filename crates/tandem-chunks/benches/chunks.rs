use tandem_chunks::{chunk_data, compress_frame, decompress_frame, hash_bytes, ChunkSizes};

fn make_data(size: usize) -> Vec<u8> {
    // Semi-realistic data: repeating pattern with some entropy
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn make_batch(changes: usize) -> Vec<u8> {
    (0..changes)
        .map(|i| {
            format!(
                r#"{{"id":"actor-{}:{i}","entity":"session-{}","op":{{"type":"seq_insert","field":"messages"}}}}"#,
                i % 3,
                i % 17
            )
        })
        .collect::<Vec<_>>()
        .join(",")
        .into_bytes()
}

#[divan::bench(args = [65536, 1048576, 10485760])]
fn fastcdc_small(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| chunk_data(divan::black_box(&data), ChunkSizes::SMALL));
}

#[divan::bench(args = [1048576, 10485760])]
fn fastcdc_media(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| chunk_data(divan::black_box(&data), ChunkSizes::MEDIA));
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn blake3_hash(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| hash_bytes(divan::black_box(&data)));
}

#[divan::bench(args = [16, 256, 4096])]
fn batch_compress(bencher: divan::Bencher, changes: usize) {
    let batch = make_batch(changes);
    bencher
        .counter(divan::counter::BytesCount::new(batch.len()))
        .bench(|| compress_frame(divan::black_box(&batch)).unwrap());
}

#[divan::bench(args = [16, 256, 4096])]
fn batch_decompress(bencher: divan::Bencher, changes: usize) {
    let packed = compress_frame(&make_batch(changes)).unwrap();
    bencher.bench(|| decompress_frame(divan::black_box(&packed)).unwrap());
}

fn main() {
    divan::main();
}
