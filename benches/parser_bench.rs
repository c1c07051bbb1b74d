use std::env;
use std::hint::black_box;
use std::time::Instant;

use zprt::buffer_pool::BufferPool;
use zprt::crc32c::crc32c;
use zprt::frame::FrameHeader;
use zprt::parser::FrameParser;

const POOL_COUNT: u16 = 4096;
const POOL_BUF_SIZE: u32 = 4096;
const MTU: usize = 1500;
const PAYLOAD_LEN: usize = 1400;
const CHUNK_LEN: usize = 1448; // typical TCP segment
const DEFAULT_ITERATIONS: usize = 100_000;

fn main() {
    let iterations: usize = env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_ITERATIONS);

    let mut pool = BufferPool::new(0, POOL_COUNT, POOL_BUF_SIZE, 0).expect("pool");
    let mut parser = FrameParser::new(&pool, MTU);

    // One wire frame, replayed every iteration.
    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| i as u8).collect();
    let mut header = FrameHeader::new();
    header.set_size(payload.len() as u32);
    header.set_crc(crc32c(&payload));
    let mut wire = header.bytes().to_vec();
    wire.extend_from_slice(&payload);

    let mut next_bid: u16 = 0;
    let mut frames: u64 = 0;

    eprintln!("Parsing {} frames ({} byte payloads)...", iterations, PAYLOAD_LEN);
    let start = Instant::now();

    for _ in 0..iterations {
        for chunk in wire.chunks(CHUNK_LEN) {
            let bid = next_bid;
            next_bid = (next_bid + 1) % POOL_COUNT;
            unsafe {
                std::ptr::copy_nonoverlapping(chunk.as_ptr(), pool.bid_ptr(bid), chunk.len());
            }
            parser.push_chunk(&mut pool, bid, chunk.len()).expect("parse");
        }
        while let Some(id) = parser.next_ready() {
            black_box(parser.frame(id).expect("ready frame").payload_len());
            parser.release_frame(&mut pool, id);
            frames += 1;
        }
    }

    let elapsed = start.elapsed();
    let per_frame = elapsed.as_nanos() as f64 / frames as f64;
    let throughput = frames as f64 * (PAYLOAD_LEN + 16) as f64 / elapsed.as_secs_f64() / 1e9;
    eprintln!(
        "{} frames in {:?} ({:.0} ns/frame, {:.2} GB/s)",
        frames, elapsed, per_frame, throughput
    );
}
