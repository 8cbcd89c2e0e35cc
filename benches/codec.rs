use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use half::f16;

use inference_session::codec::{decode, encode, encode_request, split_frame, Frame};
use inference_session::types::{
    ChatChunk, ChatRequest, ChunkChoice, ChunkDelta, Message, PrefixCache, Request,
};

fn chunk(content: &str) -> ChatChunk {
    ChatChunk {
        id: "chatcmpl-bench".to_string(),
        created: 1_700_000_000,
        model: "qwen".to_string(),
        system_fingerprint: "fp_bench".to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: None,
                content: Some(content.to_string()),
            },
            finish_reason: None,
        }],
        usage: None,
        metric: None,
    }
}

fn cache(layers: usize, tokens: usize, width: usize) -> PrefixCache {
    let layer: Vec<f16> = (0..tokens * width)
        .map(|i| f16::from_f32((i % 1024) as f32))
        .collect();
    PrefixCache {
        k_cache: vec![layer.clone(); layers],
        v_cache: vec![layer; layers],
        token_ids: (0..tokens as i32).collect(),
    }
}

fn bench_request(c: &mut Criterion) {
    let request = Request::Chat(
        ChatRequest::user("Summarize the following document in three sentences.")
            .with_message(Message::system("You are a concise assistant.")),
    );
    c.bench_function("encode_chat_request", |b| {
        b.iter(|| encode_request(black_box(&request), true).unwrap())
    });
}

fn bench_chunks(c: &mut Criterion) {
    let frame = encode(&Frame::ResponseChunk(chunk(" token"))).unwrap();
    c.bench_function("decode_chunk", |b| b.iter(|| decode(black_box(&frame)).unwrap()));

    // A burst of chunks arriving in one read
    let mut burst = BytesMut::new();
    for _ in 0..256 {
        burst.extend_from_slice(&frame);
    }
    c.bench_function("split_256_chunks", |b| {
        b.iter(|| {
            let mut buf = burst.clone();
            let mut frames = 0;
            while let Some(frame) = split_frame(&mut buf, 1 << 20).unwrap() {
                black_box(decode(&frame).unwrap());
                frames += 1;
            }
            frames
        })
    });
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("prefix_cache");
    for tokens in [64usize, 512] {
        let frame = Frame::CacheLoadRequest(cache(8, tokens, 128));
        let encoded = encode(&frame).unwrap();
        group.bench_with_input(BenchmarkId::new("encode", tokens), &frame, |b, frame| {
            b.iter(|| encode(black_box(frame)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode", tokens), &encoded, |b, bytes| {
            b.iter(|| decode(black_box(bytes)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_request, bench_chunks, bench_cache);
criterion_main!(benches);
