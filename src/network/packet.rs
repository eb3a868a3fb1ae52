//! Datagram framing
//!
//! A datagram is a fixed transport header (RTP by default) followed by
//! exactly one packet of little-endian s16 PCM. Only the length and the
//! RTP sequence number are looked at; nothing is reordered.

use bytes::{BufMut, BytesMut};

/// Dynamic RTP payload type used by the test sender
pub const RTP_PAYLOAD_TYPE: u8 = 127;

const RTP_VERSION: u8 = 2;

/// Splits datagrams into header and PCM payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    pub header_bytes: usize,
    pub payload_bytes: usize,
}

impl Framing {
    pub fn new(header_bytes: usize, payload_bytes: usize) -> Self {
        Self {
            header_bytes,
            payload_bytes,
        }
    }

    /// Exact size of a valid datagram
    pub fn datagram_bytes(&self) -> usize {
        self.header_bytes + self.payload_bytes
    }

    /// PCM payload, or `None` unless the datagram has exactly the expected size
    pub fn payload<'a>(&self, datagram: &'a [u8]) -> Option<&'a [u8]> {
        if datagram.len() != self.datagram_bytes() {
            return None;
        }
        Some(&datagram[self.header_bytes..])
    }

    /// RTP sequence number, when the header is an RTP header
    pub fn sequence(&self, datagram: &[u8]) -> Option<u16> {
        if self.header_bytes < RtpHeader::LEN || datagram.len() < RtpHeader::LEN {
            return None;
        }
        RtpHeader::parse(datagram).map(|h| h.sequence)
    }
}

/// Fixed 12-byte RTP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub const LEN: usize = 12;

    pub fn parse(data: &[u8]) -> Option<Self> {
        let header: &[u8; Self::LEN] = data.get(..Self::LEN)?.try_into().ok()?;
        if header[0] >> 6 != RTP_VERSION {
            return None;
        }
        Some(Self {
            payload_type: header[1] & 0x7f,
            sequence: u16::from_be_bytes([header[2], header[3]]),
            timestamp: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
            ssrc: u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8(self.payload_type & 0x7f);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }
}

/// Build a datagram: RTP header followed by little-endian samples
pub fn encode_datagram(header: &RtpHeader, samples: &[i16]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(RtpHeader::LEN + samples.len() * 2);
    header.write(&mut buf);
    for &sample in samples {
        buf.put_i16_le(sample);
    }
    buf
}

/// Counts packets missing from the RTP sequence
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u16>,
}

impl SequenceTracker {
    /// Record a sequence number, returning how many packets were skipped
    /// since the previous one. Backwards jumps (sender restart, reordering)
    /// resynchronise without counting.
    pub fn observe(&mut self, sequence: u16) -> u64 {
        let gap = match self.last {
            Some(last) => {
                let delta = sequence.wrapping_sub(last);
                if delta == 0 || delta >= 0x8000 {
                    0
                } else {
                    (delta - 1) as u64
                }
            }
            None => 0,
        };
        self.last = Some(sequence);
        gap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_requires_exact_size() {
        let framing = Framing::new(12, 8);
        assert!(framing.payload(&[0u8; 20]).is_some());
        assert!(framing.payload(&[0u8; 19]).is_none());
        assert!(framing.payload(&[0u8; 21]).is_none());
        assert_eq!(framing.payload(&[1u8; 20]).unwrap().len(), 8);
    }

    #[test]
    fn test_datagram_layout() {
        let header = RtpHeader {
            payload_type: RTP_PAYLOAD_TYPE,
            sequence: 0xbeef,
            timestamp: 960,
            ssrc: 7,
        };
        let datagram = encode_datagram(&header, &[1, -2]);

        assert_eq!(datagram.len(), 16);
        assert_eq!(&datagram[12..], &[0x01, 0x00, 0xfe, 0xff]);
        assert_eq!(RtpHeader::parse(&datagram), Some(header));

        let framing = Framing::new(12, 4);
        assert_eq!(framing.sequence(&datagram), Some(0xbeef));
        assert_eq!(Framing::new(0, 16).sequence(&datagram), None);
    }

    #[test]
    fn test_sequence_gaps() {
        let mut tracker = SequenceTracker::default();
        assert_eq!(tracker.observe(10), 0);
        assert_eq!(tracker.observe(11), 0);
        assert_eq!(tracker.observe(14), 2);
        assert_eq!(tracker.observe(3), 0);
        assert_eq!(tracker.observe(u16::MAX), 0);
        tracker.observe(u16::MAX - 1);
        assert_eq!(tracker.observe(1), 2);
    }
}
