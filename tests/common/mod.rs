#![allow(dead_code)]

use zprt::buffer_pool::BufferPool;
use zprt::crc32c::crc32c;
use zprt::frame::FrameHeader;

/// Deterministic xorshift64 generator so stream shapes are reproducible.
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    /// Uniform-ish value in `[lo, hi]`.
    pub fn range(&mut self, lo: usize, hi: usize) -> usize {
        lo + (self.next() as usize) % (hi - lo + 1)
    }
}

/// Envelope plus payload, ready for the wire.
pub fn wire_frame(payload: &[u8]) -> Vec<u8> {
    let mut header = FrameHeader::new();
    header.set_size(payload.len() as u32);
    header.set_crc(crc32c(payload));
    let mut out = header.bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Place `bytes` at the start of buffer `bid`, as a kernel receive would.
pub fn load_chunk(pool: &BufferPool, bid: u16, bytes: &[u8]) {
    assert!(bytes.len() <= pool.buf_size() as usize);
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), pool.bid_ptr(bid), bytes.len());
    }
}
