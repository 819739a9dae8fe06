use byteorder::{ByteOrder, LittleEndian};

use crate::nand::Page;

/// Number of bytes used by the journal header at the start of every
/// metadata page. The cookie follows immediately after.
pub(crate) const HEADER_SIZE: usize = 16;

// A metadata page carries this marker only once it has been fully
// programmed, so a missing marker doubles as an incomplete-group signal.
const MAGIC: &[u8; 3] = b"Dha";

/// Global journal state checkpointed at the trailing page of every group.
///
/// On-flash layout (all integers little-endian):
///
/// ```text
/// bytes  0..3   magic "Dha"
/// byte   3      epoch
/// bytes  4..8   tail page number
/// bytes  8..12  bad blocks before the current head
/// bytes 12..16  bad block estimate for the previous pass
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub epoch: u8,
    pub tail: Page,
    pub bb_current: u32,
    pub bb_last: u32,
}

impl Header {
    /// Decode the header from the leading bytes of a metadata page.
    /// Returns None unless the magic marker is present.
    pub fn decode(buf: &[u8]) -> Option<Header> {
        if &buf[..3] != MAGIC {
            return None;
        }

        Some(Header {
            epoch: buf[3],
            tail: LittleEndian::read_u32(&buf[4..8]),
            bb_current: LittleEndian::read_u32(&buf[8..12]),
            bb_last: LittleEndian::read_u32(&buf[12..16]),
        })
    }

    /// Encode the header over the leading bytes of a metadata page.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[..3].copy_from_slice(MAGIC);
        buf[3] = self.epoch;
        LittleEndian::write_u32(&mut buf[4..8], self.tail);
        LittleEndian::write_u32(&mut buf[8..12], self.bb_current);
        LittleEndian::write_u32(&mut buf[12..16], self.bb_last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encoding_decoding() {
        let header = Header {
            epoch: 7,
            tail: 0x0056_ab1f,
            bb_current: 3,
            bb_last: 0xaa55_8920,
        };

        let mut buf = [0xffu8; HEADER_SIZE];
        header.encode(&mut buf);

        let decoded = Header::decode(&buf).expect("failed to decode header");
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_layout() {
        let header = Header {
            epoch: 1,
            tail: 0x0403_0201,
            bb_current: 2,
            bb_last: 0x0100_0000,
        };

        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);

        assert_eq!(
            buf,
            [
                b'D', b'h', b'a', 1, // magic + epoch
                0x01, 0x02, 0x03, 0x04, // tail, little-endian
                0x02, 0x00, 0x00, 0x00, // bb_current
                0x00, 0x00, 0x00, 0x01, // bb_last
            ]
        );
    }

    #[test]
    fn test_header_decoding_without_magic() {
        // An erased page reads as all 0xff and must not decode.
        let erased = [0xffu8; HEADER_SIZE];
        assert_eq!(Header::decode(&erased), None);

        let mut buf = [0xffu8; HEADER_SIZE];
        Header {
            epoch: 0,
            tail: 0,
            bb_current: 0,
            bb_last: 0,
        }
        .encode(&mut buf);
        buf[1] = b'x';
        assert_eq!(Header::decode(&buf), None);
    }
}
