//! Library crate for zprt: submission ring, buffer pools, frame envelope,
//! CRC32C, the stream parser and the per-connection tunnel loop.
//!
//! The **binary** (`main.rs`) owns the outer layer: CLI, signals, TUN
//! plumbing, the proxy chain and the reconnect loop. Only `ring` and
//! `tunnel` talk to the kernel; the parser, pools, framing and checksum
//! code are driven by plain byte buffers, so the test suite runs without a
//! live io_uring instance.

pub mod buffer_pool;
pub mod config;
pub mod crc32c;
pub mod frame;
pub mod metrics;
pub mod operation;
pub mod parser;
pub mod ring;
pub mod transport;
pub mod tun;
pub mod tunnel;
