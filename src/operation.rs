//! Per-submission user_data encoding.
//!
//! Every SQE carries a 64-bit tag that comes back verbatim on its CQE:
//! byte 0 is the operation kind, bytes 1-2 are a little-endian buffer id
//! (or slab key, for TUN writes), bytes 3-7 are reserved. Encoding is
//! allocation-free; the in-flight set exists only as user_data on the ring.

/// Operation kind carried in byte 0 of the tag. `None` marks a tag that was
/// never set (or a helper op such as a cancel) and is ignored by dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    None = 0,
    Recv = 1,
    Send = 2,
    Read = 3,
    Write = 4,
}

impl OpKind {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => OpKind::Recv,
            2 => OpKind::Send,
            3 => OpKind::Read,
            4 => OpKind::Write,
            _ => OpKind::None,
        }
    }
}

/// Pack an operation kind and buffer id into SQE user_data.
pub fn encode_user_data(kind: OpKind, bid: u16) -> u64 {
    (kind as u64) | (bid as u64) << 8
}

/// Unpack CQE user_data. Bits above bit 23 are reserved and ignored.
pub fn decode_user_data(user_data: u64) -> (OpKind, u16) {
    (
        OpKind::from_u8(user_data as u8),
        (user_data >> 8) as u16,
    )
}
