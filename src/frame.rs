//! On-wire frame envelope and outbound frame assembly.
//!
//! Every tunneled IP packet is prefixed by a 16-byte envelope: magic, flags,
//! payload size and a CRC32C of the payload, all big-endian u32.

use crate::crc32c;

/// The 16-byte envelope at the head of every frame.
#[derive(Clone)]
pub struct FrameHeader {
    data: [u8; FrameHeader::WIRE_SIZE],
}

impl FrameHeader {
    pub const MAGIC: u32 = 0x5A50_5254;
    pub const WIRE_SIZE: usize = 16;

    /// A zeroed envelope with the magic stamped in.
    pub fn new() -> Self {
        let mut header = Self {
            data: [0u8; Self::WIRE_SIZE],
        };
        header.clean();
        header
    }

    /// Zero all fields and restore the magic.
    pub fn clean(&mut self) {
        self.data.fill(0);
        self.set_u32(0, Self::MAGIC);
    }

    pub fn magic(&self) -> u32 {
        self.get_u32(0)
    }

    pub fn flags(&self) -> u32 {
        self.get_u32(4)
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.set_u32(4, flags);
    }

    pub fn size(&self) -> u32 {
        self.get_u32(8)
    }

    pub fn set_size(&mut self, size: u32) {
        self.set_u32(8, size);
    }

    pub fn crc(&self) -> u32 {
        self.get_u32(12)
    }

    pub fn set_crc(&mut self, crc: u32) {
        self.set_u32(12, crc);
    }

    pub fn bytes(&self) -> &[u8; Self::WIRE_SIZE] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; Self::WIRE_SIZE] {
        &mut self.data
    }

    fn get_u32(&self, offset: usize) -> u32 {
        u32::from_be_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    fn set_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// An outbound frame built from one TUN read, queued until the peer socket
/// accepts it. Owns the envelope and a copy of the payload, and carries a
/// cursor so a short send resubmits only the unsent tail.
///
/// The iovec/msghdr passed to the kernel point into this struct; callers keep
/// it boxed so the pointers survive queue reallocation while the send is in
/// flight.
pub struct OutFrame {
    header: FrameHeader,
    payload: Vec<u8>,
    sent: usize,
    iov: [libc::iovec; 2],
    msg: libc::msghdr,
}

impl OutFrame {
    pub fn new(payload: Vec<u8>) -> Box<Self> {
        let mut header = FrameHeader::new();
        header.set_size(payload.len() as u32);
        header.set_crc(crc32c::crc32c(&payload));

        Box::new(Self {
            header,
            payload,
            sent: 0,
            // SAFETY: all-zero iovec/msghdr are valid values; both are fully
            // rewritten by msghdr_ptr before the kernel sees them.
            iov: unsafe { std::mem::zeroed() },
            msg: unsafe { std::mem::zeroed() },
        })
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Envelope plus payload.
    pub fn total_len(&self) -> usize {
        FrameHeader::WIRE_SIZE + self.payload.len()
    }

    pub fn remaining(&self) -> usize {
        self.total_len() - self.sent
    }

    pub fn is_complete(&self) -> bool {
        self.sent == self.total_len()
    }

    /// Record `n` bytes accepted by the peer socket.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.sent += n;
    }

    /// Rebuild the scatter-gather list from the current cursor and return a
    /// pointer to the msghdr for sendmsg submission. The cursor may sit
    /// inside the envelope after a short send.
    pub fn msghdr_ptr(&mut self) -> *const libc::msghdr {
        let iovlen = if self.sent < FrameHeader::WIRE_SIZE {
            self.iov[0] = libc::iovec {
                iov_base: self.header.bytes()[self.sent..].as_ptr() as *mut libc::c_void,
                iov_len: FrameHeader::WIRE_SIZE - self.sent,
            };
            self.iov[1] = libc::iovec {
                iov_base: self.payload.as_ptr() as *mut libc::c_void,
                iov_len: self.payload.len(),
            };
            2
        } else {
            let offset = self.sent - FrameHeader::WIRE_SIZE;
            self.iov[0] = libc::iovec {
                iov_base: self.payload[offset..].as_ptr() as *mut libc::c_void,
                iov_len: self.payload.len() - offset,
            };
            1
        };

        self.msg.msg_iov = self.iov.as_mut_ptr();
        self.msg.msg_iovlen = iovlen as _;
        &self.msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gathered(frame: &mut OutFrame) -> Vec<u8> {
        let msg = frame.msghdr_ptr();
        let mut out = Vec::new();
        unsafe {
            let iov = std::slice::from_raw_parts((*msg).msg_iov, (*msg).msg_iovlen as usize);
            for v in iov {
                out.extend_from_slice(std::slice::from_raw_parts(
                    v.iov_base as *const u8,
                    v.iov_len,
                ));
            }
        }
        out
    }

    #[test]
    fn header_round_trip() {
        let mut header = FrameHeader::new();
        for (flags, size, crc) in [
            (0u32, 0u32, 0u32),
            (1, 7, 0xA9D0_8DF5),
            (u32::MAX, u32::MAX, u32::MAX),
            (0xDEAD_BEEF, 1500, 0x1234_5678),
        ] {
            header.set_flags(flags);
            header.set_size(size);
            header.set_crc(crc);
            assert_eq!(header.flags(), flags);
            assert_eq!(header.size(), size);
            assert_eq!(header.crc(), crc);
            assert_eq!(header.magic(), FrameHeader::MAGIC);
            assert_eq!(&header.bytes()[..4], &[0x5A, 0x50, 0x52, 0x54]);
        }
    }

    #[test]
    fn clean_resets_fields_and_keeps_magic() {
        let mut header = FrameHeader::new();
        header.set_flags(3);
        header.set_size(100);
        header.set_crc(0xFFFF_FFFF);
        header.clean();
        assert_eq!(header.magic(), FrameHeader::MAGIC);
        assert_eq!(header.flags(), 0);
        assert_eq!(header.size(), 0);
        assert_eq!(header.crc(), 0);
    }

    #[test]
    fn out_frame_wire_bytes() {
        let mut frame = OutFrame::new(b"zportal".to_vec());
        assert_eq!(frame.total_len(), 23);
        assert_eq!(frame.header().size(), 7);
        assert_eq!(frame.header().flags(), 0);
        assert_eq!(frame.header().crc(), 0xA9D0_8DF5);

        let wire = gathered(&mut frame);
        assert_eq!(
            &wire[..16],
            &[
                0x5A, 0x50, 0x52, 0x54, 0, 0, 0, 0, 0, 0, 0, 7, 0xA9, 0xD0, 0x8D, 0xF5
            ]
        );
        assert_eq!(&wire[16..], b"zportal");
    }

    #[test]
    fn short_send_cursor_inside_header() {
        let mut frame = OutFrame::new(b"abc".to_vec());
        let full = gathered(&mut frame);
        frame.advance(5);
        assert!(!frame.is_complete());
        assert_eq!(frame.remaining(), 14);
        assert_eq!(gathered(&mut frame), &full[5..]);
    }

    #[test]
    fn short_send_cursor_inside_payload() {
        let mut frame = OutFrame::new(b"abcdef".to_vec());
        let full = gathered(&mut frame);
        frame.advance(16 + 2);
        assert_eq!(gathered(&mut frame), &full[18..]);
        frame.advance(frame.remaining());
        assert!(frame.is_complete());
    }
}
