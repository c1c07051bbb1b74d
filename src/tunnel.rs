//! Per-connection dispatch loop.
//!
//! One worker owns the ring, both buffer pools, the parser and the send
//! queue, blocks in `wait_completion` and processes one completion at a
//! time; no locks anywhere on the hot path. Both directions run through the
//! same ring:
//!
//! - peer → TUN: buffer-select receives feed the parser; each completed
//!   frame becomes one vectored write of its segments to the TUN fd, and
//!   the frame is released (buffers reclaimed) when that write completes.
//! - TUN → peer: buffer-select reads of single packets are framed into the
//!   send queue; at most one sendmsg is in flight, short sends resubmit the
//!   remaining tail.
//!
//! Backpressure needs no code on the receive side: while slow TUN writes
//! pin pool buffers, the kernel runs out of buffers to select, receive
//! completions stop, and TCP flow control pushes back on the peer.

use std::collections::VecDeque;
use std::os::fd::AsRawFd;

use io_uring::{opcode, squeue, types::Fd};
use slab::Slab;
use socket2::Socket;

use crate::buffer_pool::{BufferPool, PoolError};
use crate::config::{
    PEER_POOL_BUF_SIZE, PEER_POOL_COUNT, RETURN_BATCH, TUN_POOL_BUF_SIZE, TUN_POOL_COUNT,
};
use crate::frame::OutFrame;
use crate::metrics;
use crate::operation::{OpKind, decode_user_data, encode_user_data};
use crate::parser::{FrameParser, ParseError};
use crate::ring::{Completion, Ring, RingError};
use crate::tun::TunDevice;

#[derive(Debug)]
pub enum TunnelError {
    Ring(RingError),
    Pool(PoolError),
    Parse(ParseError),
    /// The TUN device accepted only part of a packet. Per the device
    /// contract a write takes the whole packet or fails, so this is an
    /// invariant violation, not a retry case.
    ShortTunWrite { expected: usize, written: usize },
    Io { errno: i32 },
}

impl From<RingError> for TunnelError {
    fn from(err: RingError) -> Self {
        TunnelError::Ring(err)
    }
}

impl From<PoolError> for TunnelError {
    fn from(err: PoolError) -> Self {
        TunnelError::Pool(err)
    }
}

/// One in-flight vectored write to the TUN fd. The slab key rides in the
/// tag's 16-bit bid slot and resolves back to the 64-bit frame id; the
/// iovec storage must stay put until the completion arrives.
struct WriteOp {
    frame_id: u64,
    iov: Vec<libc::iovec>,
    len: usize,
}

pub struct Tunnel<'a> {
    // The ring is declared (and therefore dropped) first: tearing down the
    // queues ends the kernel's interest in pool storage and in-flight
    // pointers before anything else is freed.
    ring: Ring,
    peer_pool: BufferPool,
    tun_pool: BufferPool,
    parser: FrameParser,
    tun: &'a TunDevice,
    peer: Socket,
    recv_multishot: bool,
    send_queue: VecDeque<Box<OutFrame>>,
    send_inflight: bool,
    tun_writes: Slab<WriteOp>,
    inflight: usize,
    closing: bool,
    recv_armed: bool,
    recv_stalled: bool,
    read_armed: bool,
    fatal: Option<TunnelError>,
}

// SAFETY: queued frames and in-flight write descriptors hold raw pointers
// only into pools owned by this same value; the tunnel is moved to its
// worker thread before any operation starts and is never shared.
unsafe impl Send for Tunnel<'_> {}

impl<'a> Tunnel<'a> {
    /// Take ownership of the ring and a connected peer socket; the TUN
    /// device outlives the connection (the reconnect loop reuses it). The
    /// peer is switched to non-blocking; buffer-select I/O never surfaces
    /// EAGAIN through the ring.
    pub fn new(mut ring: Ring, tun: &'a TunDevice, peer: Socket) -> Result<Self, TunnelError> {
        peer.set_nonblocking(true)
            .map_err(|e| TunnelError::Io {
                errno: e.raw_os_error().unwrap_or(libc::EIO),
            })?;

        let peer_pool = ring.create_buffer_pool(PEER_POOL_COUNT, PEER_POOL_BUF_SIZE, RETURN_BATCH)?;
        let tun_pool = ring.create_buffer_pool(
            TUN_POOL_COUNT,
            TUN_POOL_BUF_SIZE.max(tun.mtu()),
            RETURN_BATCH,
        )?;
        let parser = FrameParser::new(&peer_pool, tun.mtu() as usize);
        let recv_multishot = ring.supports(opcode::RecvMulti::CODE);

        Ok(Self {
            ring,
            peer_pool,
            tun_pool,
            parser,
            tun,
            peer,
            recv_multishot,
            send_queue: VecDeque::new(),
            send_inflight: false,
            tun_writes: Slab::new(),
            inflight: 0,
            closing: false,
            recv_armed: false,
            recv_stalled: false,
            read_armed: false,
            fatal: None,
        })
    }

    /// Drive the connection until EOF, a fatal error, or cancellation
    /// drains the last in-flight operation. Spawned on a worker thread by
    /// the binary.
    pub fn run(mut self) -> Result<(), TunnelError> {
        self.arm_recv()?;
        self.arm_tun_read()?;
        self.ring.submit()?;

        while !(self.closing && self.inflight == 0) {
            let completion = self.ring.wait_completion()?;
            self.dispatch(completion)?;
        }

        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn dispatch(&mut self, c: Completion) -> Result<(), TunnelError> {
        match decode_user_data(c.user_data()) {
            (OpKind::Recv, _) => self.on_recv(c),
            (OpKind::Write, key) => self.on_tun_write(c, key),
            (OpKind::Read, _) => self.on_tun_read(c),
            (OpKind::Send, _) => self.on_send(c),
            (OpKind::None, _) => {
                // Cancel helper completions; nothing to do beyond accounting.
                self.inflight -= 1;
                Ok(())
            }
        }
    }

    // ---- peer → TUN ----

    fn on_recv(&mut self, c: Completion) -> Result<(), TunnelError> {
        let terminal = !(self.recv_multishot && c.more());
        if terminal {
            self.inflight -= 1;
            self.recv_armed = false;
        }

        if self.closing {
            if let Some(bid) = c.buffer_id() {
                self.peer_pool.return_buffer(bid);
            }
            return Ok(());
        }

        let result = c.result();
        if result == 0 {
            // Peer closed the connection: graceful teardown.
            return self.initiate_close(None);
        }
        if result < 0 {
            let errno = -result;
            if errno == libc::ENOBUFS {
                metrics::inc_recv_stall();
                // Batched returns may be sitting uncommitted; publishing
                // them can refill the pool without waiting on a release.
                let before = self.peer_pool.published_tail();
                self.peer_pool.flush_returns();
                if self.peer_pool.published_tail() != before {
                    return self.arm_recv();
                }
                // Pool drained by slow TUN writes; rearm once buffers
                // come home with the next frame release.
                self.recv_stalled = true;
                return Ok(());
            }
            eprintln!("recv error (errno {errno})");
            if self.recv_multishot && !c.more() {
                // The multishot run ended on a transient error; it only
                // needs resubmitting.
                return self.arm_recv();
            }
            // Single-shot failure, or an error while the multishot op is
            // still armed: fatal.
            return self.initiate_close(Some(TunnelError::Io { errno }));
        }

        let Some(bid) = c.buffer_id() else {
            return self.initiate_close(Some(TunnelError::Parse(ParseError::InvariantViolation)));
        };

        if let Err(err) = self.parser.push_chunk(&mut self.peer_pool, bid, result as usize) {
            return self.initiate_close(Some(TunnelError::Parse(err)));
        }
        self.submit_ready_frames()?;

        if terminal && !self.recv_stalled {
            self.arm_recv()?;
        }
        Ok(())
    }

    /// One vectored TUN write per frame the parser has ready.
    fn submit_ready_frames(&mut self) -> Result<(), TunnelError> {
        while let Some(id) = self.parser.next_ready() {
            let Some(frame) = self.parser.frame(id) else {
                return self.initiate_close(Some(TunnelError::Parse(
                    ParseError::InvariantViolation,
                )));
            };
            let iov = frame.iovecs(&self.peer_pool);
            let len = frame.payload_len();
            metrics::inc_rx_frame(len as u64);

            let entry = self.tun_writes.vacant_entry();
            let key = entry.key();
            if key > u16::MAX as usize {
                return self.initiate_close(Some(TunnelError::Parse(
                    ParseError::InvariantViolation,
                )));
            }
            let op = entry.insert(WriteOp {
                frame_id: id,
                iov,
                len,
            });

            let sqe = opcode::Writev::new(
                Fd(self.tun.fd()),
                op.iov.as_ptr(),
                op.iov.len() as u32,
            )
            .build()
            .user_data(encode_user_data(OpKind::Write, key as u16));
            self.ring.push(&sqe)?;
            self.inflight += 1;
        }
        Ok(())
    }

    fn on_tun_write(&mut self, c: Completion, key: u16) -> Result<(), TunnelError> {
        self.inflight -= 1;

        let Some(op) = self.tun_writes.try_remove(key as usize) else {
            return self.initiate_close(Some(TunnelError::Parse(ParseError::InvariantViolation)));
        };
        // Buffers come home no matter how the write went.
        self.parser.release_frame(&mut self.peer_pool, op.frame_id);

        if self.closing {
            return Ok(());
        }

        let result = c.result();
        if result < 0 {
            return self.initiate_close(Some(TunnelError::Io { errno: -result }));
        }
        if result as usize != op.len {
            return self.initiate_close(Some(TunnelError::ShortTunWrite {
                expected: op.len,
                written: result as usize,
            }));
        }

        if self.recv_stalled {
            self.recv_stalled = false;
            self.peer_pool.flush_returns();
            self.arm_recv()?;
        }
        Ok(())
    }

    // ---- TUN → peer ----

    fn on_tun_read(&mut self, c: Completion) -> Result<(), TunnelError> {
        self.inflight -= 1;
        self.read_armed = false;

        if self.closing {
            if let Some(bid) = c.buffer_id() {
                self.tun_pool.return_buffer(bid);
            }
            return Ok(());
        }

        let result = c.result();
        if result == 0 {
            // The device went away under us.
            return self.initiate_close(None);
        }
        if result < 0 {
            let errno = -result;
            if errno == libc::ENOBUFS {
                // Single-shot reads return their bid within the same
                // dispatch, so the pool refills immediately.
                return self.arm_tun_read();
            }
            return self.initiate_close(Some(TunnelError::Io { errno }));
        }

        let Some(bid) = c.buffer_id() else {
            return self.initiate_close(Some(TunnelError::Parse(ParseError::InvariantViolation)));
        };

        let len = result as usize;
        // SAFETY: the completion hands us ownership of bid until returned.
        let payload =
            unsafe { std::slice::from_raw_parts(self.tun_pool.bid_ptr(bid), len) }.to_vec();
        self.tun_pool.return_buffer(bid);
        metrics::inc_tx_frame(len as u64);

        self.send_queue.push_back(OutFrame::new(payload));
        self.arm_tun_read()?;
        self.kick_send()
    }

    fn on_send(&mut self, c: Completion) -> Result<(), TunnelError> {
        self.inflight -= 1;
        self.send_inflight = false;

        if self.closing {
            return Ok(());
        }

        let result = c.result();
        if result == 0 {
            return self.initiate_close(None);
        }
        if result < 0 {
            let errno = -result;
            return match errno {
                libc::EPIPE | libc::ECONNRESET => self.initiate_close(None),
                _ => self.initiate_close(Some(TunnelError::Io { errno })),
            };
        }

        let Some(frame) = self.send_queue.front_mut() else {
            return self.initiate_close(Some(TunnelError::Parse(ParseError::InvariantViolation)));
        };
        frame.advance(result as usize);

        if frame.is_complete() {
            self.send_queue.pop_front();
            self.kick_send()
        } else {
            // TCP took part of the frame; resubmit from the cursor.
            metrics::inc_partial_send();
            self.submit_send()
        }
    }

    /// Start a send unless one is already in flight or there is nothing
    /// queued. Keeps the single-in-flight-send invariant.
    fn kick_send(&mut self) -> Result<(), TunnelError> {
        if self.send_inflight || self.send_queue.is_empty() {
            return Ok(());
        }
        self.submit_send()
    }

    fn submit_send(&mut self) -> Result<(), TunnelError> {
        let Some(frame) = self.send_queue.front_mut() else {
            return Ok(());
        };
        let msg = frame.msghdr_ptr();

        let sqe = opcode::SendMsg::new(Fd(self.peer.as_raw_fd()), msg)
            .flags(libc::MSG_NOSIGNAL as u32)
            .build()
            .user_data(encode_user_data(OpKind::Send, 0));
        self.ring.push(&sqe)?;
        self.send_inflight = true;
        self.inflight += 1;
        Ok(())
    }

    // ---- arming and teardown ----

    fn arm_recv(&mut self) -> Result<(), TunnelError> {
        if self.recv_armed {
            return Ok(());
        }
        let fd = Fd(self.peer.as_raw_fd());
        let entry = if self.recv_multishot {
            opcode::RecvMulti::new(fd, self.peer_pool.bgid()).build()
        } else {
            opcode::Recv::new(fd, std::ptr::null_mut(), 0)
                .buf_group(self.peer_pool.bgid())
                .build()
                .flags(squeue::Flags::BUFFER_SELECT)
        };
        self.ring
            .push(&entry.user_data(encode_user_data(OpKind::Recv, 0)))?;
        self.recv_armed = true;
        self.inflight += 1;
        Ok(())
    }

    fn arm_tun_read(&mut self) -> Result<(), TunnelError> {
        if self.read_armed {
            return Ok(());
        }
        // Null buffer + buf_group: the kernel picks a slot from the TUN
        // pool. Offset -1 uses the fd's implicit position (character
        // device).
        let sqe = opcode::Read::new(
            Fd(self.tun.fd()),
            std::ptr::null_mut(),
            self.tun_pool.buf_size(),
        )
        .offset(u64::MAX)
        .buf_group(self.tun_pool.bgid())
        .build()
        .flags(squeue::Flags::BUFFER_SELECT)
        .user_data(encode_user_data(OpKind::Read, 0));
        self.ring.push(&sqe)?;
        self.read_armed = true;
        self.inflight += 1;
        Ok(())
    }

    /// Flip into drain mode: remember the first fatal error (if any) and
    /// cancel whatever is still armed so the completion stream runs dry.
    fn initiate_close(&mut self, err: Option<TunnelError>) -> Result<(), TunnelError> {
        if let Some(err) = err {
            if self.fatal.is_none() {
                self.fatal = Some(err);
            }
        }
        if self.closing {
            return Ok(());
        }
        self.closing = true;

        if self.recv_armed {
            let sqe = opcode::AsyncCancel::new(encode_user_data(OpKind::Recv, 0))
                .build()
                .user_data(encode_user_data(OpKind::None, 0));
            self.ring.push(&sqe)?;
            self.inflight += 1;
        }
        if self.read_armed {
            let sqe = opcode::AsyncCancel::new(encode_user_data(OpKind::Read, 0))
                .build()
                .user_data(encode_user_data(OpKind::None, 0));
            self.ring.push(&sqe)?;
            self.inflight += 1;
        }
        if self.send_inflight {
            // A send can sit forever against a dead peer's closed window.
            let sqe = opcode::AsyncCancel::new(encode_user_data(OpKind::Send, 0))
                .build()
                .user_data(encode_user_data(OpKind::None, 0));
            self.ring.push(&sqe)?;
            self.inflight += 1;
        }
        Ok(())
    }
}
