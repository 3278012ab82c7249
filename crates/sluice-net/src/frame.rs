use thiserror::Error;

/// Bytes in the fixed wire header.
pub const HEADER_LEN: usize = 8;
/// Upper bound on `total_len`, header included. Anything larger is a
/// framing violation and is discarded without closing the connection.
pub const MAX_FRAME_LEN: usize = 30_000;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("total_len {0} smaller than the {HEADER_LEN}-byte header")]
    Undersize(u16),
    #[error("total_len {0} exceeds the {MAX_FRAME_LEN}-byte frame limit")]
    Oversize(usize),
}

/// Fixed-size wire header.
///
/// Every frame on the wire is `[header | body]`. `total_len` counts the
/// header itself, so `total_len == HEADER_LEN` is a valid, body-less frame.
/// All fields travel in network byte order. `msg_code` and `crc32` are
/// application-defined; the framing layer only validates `total_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub total_len: u16,
    pub msg_code: u16,
    pub crc32: u32,
}

impl FrameHeader {
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let total_len = u16::from_be_bytes([buf[0], buf[1]]);
        if (total_len as usize) < HEADER_LEN {
            return Err(FrameError::Undersize(total_len));
        }
        if (total_len as usize) > MAX_FRAME_LEN {
            return Err(FrameError::Oversize(total_len as usize));
        }
        Ok(Self {
            total_len,
            msg_code: u16::from_be_bytes([buf[2], buf[3]]),
            crc32: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    pub fn encode_into(&self, buf: &mut [u8; HEADER_LEN]) {
        buf[0..2].copy_from_slice(&self.total_len.to_be_bytes());
        buf[2..4].copy_from_slice(&self.msg_code.to_be_bytes());
        buf[4..8].copy_from_slice(&self.crc32.to_be_bytes());
    }

    pub fn body_len(&self) -> usize {
        self.total_len as usize - HEADER_LEN
    }
}

/// Builds a complete wire frame around `body`.
pub fn encode_frame(msg_code: u16, crc32: u32, body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let total = HEADER_LEN + body.len();
    if total > MAX_FRAME_LEN {
        return Err(FrameError::Oversize(total));
    }
    let header = FrameHeader { total_len: total as u16, msg_code, crc32 };
    let mut frame = vec![0_u8; HEADER_LEN];
    header.encode_into((&mut frame[..HEADER_LEN]).try_into().unwrap());
    frame.extend_from_slice(body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = encode_frame(7, 0xdead_beef, b"hello").unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 5);

        let header = FrameHeader::decode(frame[..HEADER_LEN].try_into().unwrap()).unwrap();
        assert_eq!(header.total_len as usize, frame.len());
        assert_eq!(header.msg_code, 7);
        assert_eq!(header.crc32, 0xdead_beef);
        assert_eq!(header.body_len(), 5);
        assert_eq!(&frame[HEADER_LEN..], b"hello");
    }

    #[test]
    fn header_only_frame_is_valid() {
        let frame = encode_frame(1, 0, b"").unwrap();
        assert_eq!(frame.len(), HEADER_LEN);
        let header = FrameHeader::decode(frame[..HEADER_LEN].try_into().unwrap()).unwrap();
        assert_eq!(header.body_len(), 0);
    }

    #[test]
    fn undersize_total_len_is_rejected() {
        let mut buf = [0_u8; HEADER_LEN];
        buf[..2].copy_from_slice(&3_u16.to_be_bytes());
        assert_eq!(FrameHeader::decode(&buf), Err(FrameError::Undersize(3)));
    }

    #[test]
    fn oversize_total_len_is_rejected() {
        let too_big = (MAX_FRAME_LEN + 1) as u16;
        let mut buf = [0_u8; HEADER_LEN];
        buf[..2].copy_from_slice(&too_big.to_be_bytes());
        assert_eq!(FrameHeader::decode(&buf), Err(FrameError::Oversize(MAX_FRAME_LEN + 1)));
    }

    #[test]
    fn oversize_body_is_rejected_at_encode() {
        let body = vec![0_u8; MAX_FRAME_LEN];
        assert!(encode_frame(0, 0, &body).is_err());
    }
}
