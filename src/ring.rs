//! Thin wrapper around `io_uring` that centralises submission helpers,
//! completion copy-out, and buffer-pool registration.
//!
//! Completions are copied into immutable [`Completion`] values before the
//! kernel slot is acknowledged, so callers never hold a borrow of the
//! completion queue while submitting.

use std::io;

use io_uring::{cqueue, squeue};

use crate::buffer_pool::{BufferPool, PoolError};

#[derive(Debug, Clone, Copy)]
pub enum RingError {
    /// The kernel refused to set up the queues.
    SetupFailed { errno: i32 },
    /// No submission slot available; submit reserved entries and retry.
    QueueFull,
    /// Waiting for a completion failed with something other than EINTR.
    WaitFailed { errno: i32 },
    /// Any other ring syscall failure.
    Io { errno: i32 },
}

fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// One completed operation, copied out of the completion queue.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    user_data: u64,
    result: i32,
    flags: u32,
}

impl Completion {
    fn new(user_data: u64, result: i32, flags: u32) -> Self {
        Self {
            user_data,
            result,
            flags,
        }
    }

    /// The 64-bit tag set at submission.
    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// Non-negative byte count (or zero for EOF), negated errno on failure.
    pub fn result(&self) -> i32 {
        self.result
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// The buffer the kernel picked, when buffer-select was used.
    pub fn buffer_id(&self) -> Option<u16> {
        cqueue::buffer_select(self.flags)
    }

    /// True while a multishot operation remains armed after this completion.
    pub fn more(&self) -> bool {
        cqueue::more(self.flags)
    }
}

pub struct Ring {
    inner: io_uring::IoUring,
    next_bgid: u16,
}

impl Ring {
    /// Set up submission/completion queues of at least `entries` depth.
    pub fn open(entries: u32) -> Result<Self, RingError> {
        let inner = io_uring::IoUring::new(entries)
            .map_err(|e| RingError::SetupFailed { errno: errno_of(&e) })?;
        Ok(Self {
            inner,
            next_bgid: 0,
        })
    }

    /// Reserve and write one SQE. Fails with `QueueFull` when no slot is
    /// available; the caller must submit reserved slots before retrying.
    ///
    /// # Safety contract
    /// Buffers named by `entry` must stay valid until its completion.
    pub fn try_push(&mut self, entry: &squeue::Entry) -> Result<(), RingError> {
        // SAFETY: deferred to the caller per the documented contract.
        unsafe { self.inner.submission().push(entry) }.map_err(|_| RingError::QueueFull)
    }

    /// Push an SQE, flushing the submission queue to the kernel when full.
    pub fn push(&mut self, entry: &squeue::Entry) -> Result<(), RingError> {
        loop {
            match self.try_push(entry) {
                Ok(()) => return Ok(()),
                Err(RingError::QueueFull) => {
                    self.submit()?;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Publish all reserved slots to the kernel.
    pub fn submit(&mut self) -> Result<usize, RingError> {
        self.inner
            .submit()
            .map_err(|e| RingError::Io { errno: errno_of(&e) })
    }

    /// Block until one completion is available, copy it out and acknowledge
    /// it. Transparently retries signal-delivery wakeups.
    pub fn wait_completion(&mut self) -> Result<Completion, RingError> {
        loop {
            match self.inner.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(RingError::WaitFailed { errno: errno_of(&e) }),
            }

            if let Some(cqe) = self.inner.completion().next() {
                return Ok(Completion::new(cqe.user_data(), cqe.result(), cqe.flags()));
            }
        }
    }

    /// Allocate a buffer pool and register it with this ring under the next
    /// free buffer group id.
    pub fn create_buffer_pool(
        &mut self,
        count: u16,
        size: u32,
        return_batch: u16,
    ) -> Result<BufferPool, PoolError> {
        let pool = BufferPool::new(self.next_bgid, count, size, return_batch)?;

        // SAFETY: the buf ring region is page-aligned, holds `count` entries,
        // and outlives the registration (owners drop the Ring first).
        unsafe {
            self.inner
                .submitter()
                .register_buf_ring(pool.ring_addr(), pool.count(), pool.bgid())
        }
        .map_err(|e| PoolError::RegisterFailed { errno: errno_of(&e) })?;

        self.next_bgid += 1;
        Ok(pool)
    }

    /// True when the kernel supports the given opcode (see `opcode::*::CODE`).
    pub fn supports(&self, opcode: u8) -> bool {
        let mut probe = io_uring::Probe::new();
        if self.inner.submitter().register_probe(&mut probe).is_err() {
            return false;
        }
        probe.is_supported(opcode)
    }

    #[cfg(test)]
    pub(crate) fn test_completion(user_data: u64, result: i32, flags: u32) -> Completion {
        Completion::new(user_data, result, flags)
    }
}
