//! Streaming frame parser for the peer-to-TUN direction.
//!
//! Input is the peer byte stream delivered as buffer-select chunks, each
//! backed by a pool bid. Output is an ordered sequence of frames, each a
//! zero-copy list of `(bid, offset, len)` segments into the pool. The parser
//! pins every bid a frame references and hands bids back to the pool in
//! arrival order once the last reference drops, which keeps the kernel's
//! free list contiguous.
//!
//! Frames failing the payload checksum are dropped and parsing resumes at
//! the next frame boundary. A bad magic or an out-of-range size means the
//! stream is desynchronized beyond repair; the tunnel tears the connection
//! down.

use std::collections::{HashMap, VecDeque};

use crate::buffer_pool::BufferPool;
use crate::crc32c;
use crate::frame::FrameHeader;
use crate::metrics;

/// Unrecoverable parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The envelope magic did not match; frame boundaries are lost.
    Desynchronized,
    /// The envelope announced a payload larger than the tunnel MTU.
    Oversize,
    /// Internal bookkeeping contradiction (e.g. a bid outside the pool).
    InvariantViolation,
}

/// A contiguous byte range inside one pool buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub bid: u16,
    pub offset: usize,
    pub len: usize,
}

/// One reassembled frame: ordered segments whose concatenation is exactly
/// the payload of one envelope. Holds bid references until released.
pub struct Frame {
    id: u64,
    segments: Vec<Segment>,
    payload_len: usize,
}

impl Frame {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Scatter-gather list for a vectored TUN write. The caller must keep
    /// the frame unreleased (bids pinned) while the iovecs are in flight.
    pub fn iovecs(&self, pool: &BufferPool) -> Vec<libc::iovec> {
        self.segments
            .iter()
            .map(|seg| libc::iovec {
                // SAFETY: released-to-pool bids never appear in a live frame.
                iov_base: unsafe { pool.bid_ptr(seg.bid).add(seg.offset) } as *mut libc::c_void,
                iov_len: seg.len,
            })
            .collect()
    }

    /// Contiguous copy of the payload, for tests and diagnostics.
    pub fn copy_payload(&self, pool: &BufferPool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload_len);
        for seg in &self.segments {
            // SAFETY: as in iovecs; the frame pins its bids.
            out.extend_from_slice(unsafe {
                std::slice::from_raw_parts(pool.bid_ptr(seg.bid).add(seg.offset), seg.len)
            });
        }
        out
    }
}

struct Chunk {
    bid: u16,
    offset: usize,
    len: usize,
}

enum State {
    ReadingHeader,
    ReadingPayload,
}

pub struct FrameParser {
    state: State,
    header: FrameHeader,
    read_progress: usize,
    builder: Vec<Segment>,
    max_frame_size: usize,
    next_frame_id: u64,
    input: VecDeque<Chunk>,
    ready: VecDeque<u64>,
    frames: HashMap<u64, Frame>,
    pending_return: VecDeque<u16>,
    refcount: Vec<u32>,
}

impl FrameParser {
    /// `pool` fixes the bid universe; `max_frame_size` caps the announced
    /// payload length (the tunnel passes its MTU).
    pub fn new(pool: &BufferPool, max_frame_size: usize) -> Self {
        Self {
            state: State::ReadingHeader,
            header: FrameHeader::new(),
            read_progress: 0,
            builder: Vec::new(),
            max_frame_size,
            next_frame_id: 0,
            input: VecDeque::new(),
            ready: VecDeque::new(),
            frames: HashMap::new(),
            pending_return: VecDeque::new(),
            refcount: vec![0; pool.count() as usize],
        }
    }

    /// Append the first `len` bytes of buffer `bid` to the input and drive
    /// the state machine as far as the buffered bytes allow. Completed
    /// frames land on the ready queue.
    pub fn push_chunk(
        &mut self,
        pool: &mut BufferPool,
        bid: u16,
        len: usize,
    ) -> Result<(), ParseError> {
        if bid as usize >= self.refcount.len() {
            return Err(ParseError::InvariantViolation);
        }
        if len == 0 {
            return Ok(());
        }

        self.input.push_back(Chunk {
            bid,
            offset: 0,
            len,
        });
        self.drive(pool)?;
        self.reclaim(pool);
        Ok(())
    }

    /// Pop the id of the next completed frame, in arrival order.
    pub fn next_ready(&mut self) -> Option<u64> {
        self.ready.pop_front()
    }

    /// Look up a ready-but-unreleased frame.
    pub fn frame(&self, id: u64) -> Option<&Frame> {
        self.frames.get(&id)
    }

    /// Drop the parser's references on the frame's bids, then hand every
    /// reclaimable bid at the front of the return FIFO back to the pool.
    pub fn release_frame(&mut self, pool: &mut BufferPool, id: u64) {
        let Some(frame) = self.frames.remove(&id) else {
            return;
        };

        for seg in &frame.segments {
            let refcount = &mut self.refcount[seg.bid as usize];
            debug_assert!(*refcount > 0);
            *refcount = refcount.saturating_sub(1);
        }

        self.reclaim(pool);
    }

    fn drive(&mut self, pool: &mut BufferPool) -> Result<(), ParseError> {
        loop {
            match self.state {
                State::ReadingHeader => {
                    while self.read_progress < FrameHeader::WIRE_SIZE {
                        let Some(chunk) = self.input.front_mut() else {
                            break;
                        };

                        let need = FrameHeader::WIRE_SIZE - self.read_progress;
                        let take = need.min(chunk.len);

                        // SAFETY: the kernel handed us this bid in a
                        // completion; the bytes are ours until returned.
                        let src = unsafe {
                            std::slice::from_raw_parts(pool.bid_ptr(chunk.bid).add(chunk.offset), take)
                        };
                        self.header.bytes_mut()[self.read_progress..self.read_progress + take]
                            .copy_from_slice(src);

                        chunk.offset += take;
                        chunk.len -= take;
                        self.read_progress += take;

                        if chunk.len == 0 {
                            // Header bytes carry no live reference; queue the
                            // bid for return right away.
                            let done = chunk.bid;
                            self.input.pop_front();
                            self.pending_return.push_back(done);
                        }
                    }

                    if self.read_progress < FrameHeader::WIRE_SIZE {
                        return Ok(());
                    }

                    if self.header.magic() != FrameHeader::MAGIC {
                        return Err(ParseError::Desynchronized);
                    }
                    let size = self.header.size() as usize;
                    if size == 0 {
                        return Err(ParseError::Desynchronized);
                    }
                    if size > self.max_frame_size {
                        return Err(ParseError::Oversize);
                    }

                    self.builder.clear();
                    self.state = State::ReadingPayload;
                    self.read_progress = 0;
                }

                State::ReadingPayload => {
                    let want = self.header.size() as usize;

                    while self.read_progress < want {
                        let Some(chunk) = self.input.front_mut() else {
                            break;
                        };

                        let take = (want - self.read_progress).min(chunk.len);
                        self.builder.push(Segment {
                            bid: chunk.bid,
                            offset: chunk.offset,
                            len: take,
                        });
                        self.refcount[chunk.bid as usize] += 1;

                        chunk.offset += take;
                        chunk.len -= take;
                        self.read_progress += take;

                        if chunk.len == 0 {
                            let done = chunk.bid;
                            self.input.pop_front();
                            self.pending_return.push_back(done);
                        }
                    }

                    if self.read_progress < want {
                        return Ok(());
                    }

                    if self.segments_crc(pool) != self.header.crc() {
                        // Corrupt payload: drop it and resume at the next
                        // frame boundary.
                        metrics::inc_crc_dropped();
                        for seg in self.builder.drain(..) {
                            self.refcount[seg.bid as usize] -= 1;
                        }
                    } else {
                        let id = self.next_frame_id;
                        self.next_frame_id += 1;
                        self.frames.insert(
                            id,
                            Frame {
                                id,
                                segments: std::mem::take(&mut self.builder),
                                payload_len: want,
                            },
                        );
                        self.ready.push_back(id);
                    }

                    self.state = State::ReadingHeader;
                    self.read_progress = 0;
                }
            }
        }
    }

    fn segments_crc(&self, pool: &BufferPool) -> u32 {
        let mut crc = crc32c::crc32c_begin();
        for seg in &self.builder {
            // SAFETY: builder bids are pinned (refcounted), not yet returned.
            let bytes = unsafe {
                std::slice::from_raw_parts(pool.bid_ptr(seg.bid).add(seg.offset), seg.len)
            };
            crc = crc32c::crc32c_update(crc, bytes);
        }
        crc32c::crc32c_finish(crc)
    }

    /// Return FIFO discipline: only the front bid may leave, and only once
    /// its refcount is zero. A pinned bid blocks everything behind it.
    fn reclaim(&mut self, pool: &mut BufferPool) {
        while let Some(&bid) = self.pending_return.front() {
            if self.refcount[bid as usize] != 0 {
                break;
            }
            pool.return_buffer(bid);
            self.pending_return.pop_front();
        }
    }

    /// Bids queued for return but still blocked or uncommitted.
    pub fn pending_return_len(&self) -> usize {
        self.pending_return.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc32c::crc32c;

    const MTU: usize = 1500;

    fn make_pool() -> BufferPool {
        BufferPool::new(0, 64, 2048, 0).unwrap()
    }

    fn load(pool: &BufferPool, bid: u16, bytes: &[u8]) {
        assert!(bytes.len() <= pool.buf_size() as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), pool.bid_ptr(bid), bytes.len());
        }
    }

    fn wire_frame(payload: &[u8]) -> Vec<u8> {
        let mut header = FrameHeader::new();
        header.set_size(payload.len() as u32);
        header.set_crc(crc32c(payload));
        let mut out = header.bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn header_then_payload_in_two_chunks() {
        let mut pool = make_pool();
        let mut parser = FrameParser::new(&pool, MTU);
        let wire = wire_frame(b"zportal");
        let base = pool.published_tail();

        load(&pool, 0, &wire[..16]);
        parser.push_chunk(&mut pool, 0, 16).unwrap();
        assert!(parser.next_ready().is_none());
        // A chunk fully consumed by the header carries no reference and is
        // reclaimed without waiting for any release.
        assert_eq!(pool.published_tail(), base.wrapping_add(1));

        load(&pool, 1, &wire[16..]);
        parser.push_chunk(&mut pool, 1, 7).unwrap();

        let id = parser.next_ready().unwrap();
        let frame = parser.frame(id).unwrap();
        assert_eq!(frame.payload_len(), 7);
        assert_eq!(frame.copy_payload(&pool), b"zportal");

        parser.release_frame(&mut pool, id);
        // The payload bid comes home with the release.
        assert_eq!(pool.published_tail(), base.wrapping_add(2));
        assert_eq!(parser.pending_return_len(), 0);
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut pool = make_pool();
        let mut parser = FrameParser::new(&pool, MTU);

        let mut wire = wire_frame(b"zportal");
        wire.extend_from_slice(&wire_frame(b"abc"));
        assert_eq!(wire.len(), 42);

        load(&pool, 3, &wire);
        parser.push_chunk(&mut pool, 3, 42).unwrap();

        let first = parser.next_ready().unwrap();
        let second = parser.next_ready().unwrap();
        assert!(parser.next_ready().is_none());
        assert_eq!(parser.frame(first).unwrap().copy_payload(&pool), b"zportal");
        assert_eq!(parser.frame(second).unwrap().copy_payload(&pool), b"abc");

        // One bid backs both frames; it returns only after both release.
        let base = pool.published_tail();
        parser.release_frame(&mut pool, first);
        assert_eq!(pool.published_tail(), base);
        parser.release_frame(&mut pool, second);
        assert_eq!(pool.published_tail(), base.wrapping_add(1));
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let mut pool = make_pool();
        let mut parser = FrameParser::new(&pool, MTU);
        let wire = wire_frame(b"zportal");
        let base = pool.published_tail();

        for (i, &byte) in wire.iter().enumerate() {
            let bid = i as u16;
            load(&pool, bid, &[byte]);
            parser.push_chunk(&mut pool, bid, 1).unwrap();
        }

        let id = parser.next_ready().unwrap();
        assert!(parser.next_ready().is_none());
        assert_eq!(parser.frame(id).unwrap().copy_payload(&pool), b"zportal");

        parser.release_frame(&mut pool, id);
        // All 23 single-byte chunks returned exactly once.
        assert_eq!(pool.published_tail(), base.wrapping_add(23));
        assert_eq!(parser.pending_return_len(), 0);
    }

    #[test]
    fn crc_mismatch_drops_frame_and_resyncs() {
        let mut pool = make_pool();
        let mut parser = FrameParser::new(&pool, MTU);

        let mut header = FrameHeader::new();
        header.set_size(7);
        header.set_crc(0);
        let mut wire = header.bytes().to_vec();
        wire.extend_from_slice(b"zportal");

        let base = pool.published_tail();
        load(&pool, 0, &wire);
        parser.push_chunk(&mut pool, 0, wire.len()).unwrap();
        assert!(parser.next_ready().is_none());
        // The dropped frame's bid is reclaimed without any release call.
        assert_eq!(pool.published_tail(), base.wrapping_add(1));

        // The stream stays usable from the next boundary on.
        let good = wire_frame(b"abc");
        load(&pool, 1, &good);
        parser.push_chunk(&mut pool, 1, good.len()).unwrap();
        let id = parser.next_ready().unwrap();
        assert_eq!(parser.frame(id).unwrap().copy_payload(&pool), b"abc");
    }

    #[test]
    fn bad_magic_is_desynchronized() {
        let mut pool = make_pool();
        let mut parser = FrameParser::new(&pool, MTU);

        load(&pool, 0, &[0u8; 16]);
        assert_eq!(
            parser.push_chunk(&mut pool, 0, 16),
            Err(ParseError::Desynchronized)
        );
    }

    #[test]
    fn zero_size_is_desynchronized() {
        let mut pool = make_pool();
        let mut parser = FrameParser::new(&pool, MTU);

        let header = FrameHeader::new();
        load(&pool, 0, header.bytes());
        assert_eq!(
            parser.push_chunk(&mut pool, 0, 16),
            Err(ParseError::Desynchronized)
        );
    }

    #[test]
    fn oversize_announcement_is_fatal() {
        let mut pool = make_pool();
        let mut parser = FrameParser::new(&pool, MTU);

        let mut header = FrameHeader::new();
        header.set_size(MTU as u32 + 1);
        load(&pool, 0, header.bytes());
        assert_eq!(
            parser.push_chunk(&mut pool, 0, 16),
            Err(ParseError::Oversize)
        );
    }

    #[test]
    fn shared_bid_blocks_fifo_until_both_frames_release() {
        let mut pool = make_pool();
        let mut parser = FrameParser::new(&pool, MTU);

        // bid 0: [frame A complete | frame B header + payload head]
        // bid 1: [frame B payload tail]
        let frame_a = wire_frame(b"aaaa");
        let frame_b = wire_frame(b"bbbbbbbb");
        let mut first = frame_a.clone();
        first.extend_from_slice(&frame_b[..20]);
        let second = &frame_b[20..];

        load(&pool, 0, &first);
        parser.push_chunk(&mut pool, 0, first.len()).unwrap();
        load(&pool, 1, second);
        parser.push_chunk(&mut pool, 1, second.len()).unwrap();

        let a = parser.next_ready().unwrap();
        let b = parser.next_ready().unwrap();
        assert_eq!(parser.frame(a).unwrap().copy_payload(&pool), b"aaaa");
        assert_eq!(parser.frame(b).unwrap().copy_payload(&pool), b"bbbbbbbb");

        let base = pool.published_tail();
        // Releasing B first cannot return anything: bid 0 (front of the
        // FIFO) is still pinned by frame A, and bid 1 waits behind it.
        parser.release_frame(&mut pool, b);
        assert_eq!(pool.published_tail(), base);
        assert_eq!(parser.pending_return_len(), 2);

        parser.release_frame(&mut pool, a);
        assert_eq!(pool.published_tail(), base.wrapping_add(2));
        assert_eq!(parser.pending_return_len(), 0);
    }

    #[test]
    fn frames_are_emitted_in_stream_order() {
        let mut pool = make_pool();
        let mut parser = FrameParser::new(&pool, MTU);

        let mut wire = Vec::new();
        let payloads: [&[u8]; 3] = [b"one", b"second payload", b"33333"];
        for p in payloads {
            wire.extend_from_slice(&wire_frame(p));
        }

        // Deliver in three uneven chunks.
        let cuts = [0, 10, 29, wire.len()];
        for (i, pair) in cuts.windows(2).enumerate() {
            load(&pool, i as u16, &wire[pair[0]..pair[1]]);
            parser
                .push_chunk(&mut pool, i as u16, pair[1] - pair[0])
                .unwrap();
        }

        for expected in payloads {
            let id = parser.next_ready().unwrap();
            assert_eq!(parser.frame(id).unwrap().copy_payload(&pool), expected);
            parser.release_frame(&mut pool, id);
        }
        assert!(parser.next_ready().is_none());
        assert_eq!(parser.pending_return_len(), 0);
    }

    #[test]
    fn release_of_unknown_id_is_a_no_op() {
        let mut pool = make_pool();
        let mut parser = FrameParser::new(&pool, MTU);
        parser.release_frame(&mut pool, 42);
    }

    #[test]
    fn bid_outside_pool_is_an_invariant_violation() {
        let mut pool = make_pool();
        let mut parser = FrameParser::new(&pool, MTU);
        assert_eq!(
            parser.push_chunk(&mut pool, 64, 1),
            Err(ParseError::InvariantViolation)
        );
    }
}
