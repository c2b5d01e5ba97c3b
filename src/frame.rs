//! Frame codec for the ScientISST Sense wire protocol.
//!
//! Pure functions only: packet sizing from the active channel set, CRC-4
//! verification, and the bit-unpacking of 12-bit and 24-bit channel samples.
//! All I/O, including the byte-shift resynchronisation loop that these
//! functions feed, lives in [`crate::sense`].

use crate::errors::{Result, SenseError};

// ============================================================================
// Channel and API identifiers
// ============================================================================

/// One of the eight analog input channels of the Sense board.
///
/// `Ai1..Ai6` are the internal 12-bit channels (IDs 1..6); `Ax1`/`Ax2` are
/// the external 24-bit channels (IDs 7, 8). The discriminant is the on-wire
/// channel ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    Ai1 = 1,
    Ai2 = 2,
    Ai3 = 3,
    Ai4 = 4,
    Ai5 = 5,
    Ai6 = 6,
    Ax1 = 7,
    Ax2 = 8,
}

impl Channel {
    /// All channels in ID order. This is the set enabled when `start` is
    /// given an empty channel list.
    pub const ALL: [Channel; 8] = [
        Channel::Ai1,
        Channel::Ai2,
        Channel::Ai3,
        Channel::Ai4,
        Channel::Ai5,
        Channel::Ai6,
        Channel::Ax1,
        Channel::Ax2,
    ];

    /// Parse a 1-based channel ID.
    pub fn from_id(id: u8) -> Result<Self> {
        Self::ALL
            .get(id.wrapping_sub(1) as usize)
            .copied()
            .ok_or_else(|| {
                SenseError::InvalidParameter(format!("channel {id} outside 1..=8"))
            })
    }

    /// The 1-based on-wire channel ID.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Whether this is one of the external 24-bit channels (AX1/AX2).
    pub fn is_external(self) -> bool {
        matches!(self, Channel::Ax1 | Channel::Ax2)
    }

    /// Zero-based slot in [`Frame::analog`].
    pub(crate) fn slot(self) -> usize {
        self.id() as usize - 1
    }
}

/// Command-and-response dialect spoken by the device.
///
/// The wire code (1..3) is what the API-switch command carries. Only
/// [`ApiMode::Scientisst`] frames are decodable by this driver; the other
/// two modes are advertised by the firmware but rejected here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ApiMode {
    /// Legacy 1-byte-frame dialect. Power-on default of the device.
    #[default]
    Bitalino = 1,
    Scientisst = 2,
    Json = 3,
}

impl ApiMode {
    /// Wire code used by the API-switch command.
    pub fn code(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Decoded frames
// ============================================================================

/// A single decoded sample point across all active channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 4-bit sequence counter (0..15, wraps). Detects dropped frames.
    pub seq: u8,
    /// One slot per channel ID. Slots 0..5 hold 12-bit values (0..4095),
    /// slots 6..7 hold 24-bit values (0..16_777_215). A slot whose channel
    /// was not requested is `None`.
    pub analog: [Option<u32>; 8],
    /// State of I1, I2, O1, O2 at sample time.
    pub digital: [bool; 4],
}

impl Frame {
    /// The decoded value of `ch`, if it was part of the acquisition.
    pub fn value(&self, ch: Channel) -> Option<u32> {
        self.analog[ch.slot()]
    }
}

// ============================================================================
// Packet sizing and CRC
// ============================================================================

/// CRC-4 lookup table (polynomial 0x3).
const CRC4_TABLE: [u8; 16] = [0, 3, 6, 5, 12, 15, 10, 9, 11, 8, 13, 14, 7, 4, 1, 2];

/// On-wire packet size in bytes for the given mode and active channel set.
///
/// For SCIENTISST mode this is 3 bytes per external channel, 12 bits per
/// internal channel, one I/O byte and one seq+CRC byte. When the internal
/// count is odd, 4 bits of the last internal channel piggy-back into the
/// I/O byte, hence the `- 4` in that branch.
pub fn packet_size(mode: ApiMode, channels: &[Channel]) -> Result<usize> {
    if mode != ApiMode::Scientisst {
        return Err(SenseError::NotSupported(format!(
            "frame format of API mode {mode:?}"
        )));
    }
    let n_extern = channels.iter().filter(|ch| ch.is_external()).count();
    let n_intern = channels.len() - n_extern;
    let intern_bytes = if n_intern % 2 == 0 {
        n_intern * 12 / 8
    } else {
        (n_intern * 12 - 4) / 8
    };
    Ok(3 * n_extern + intern_bytes + 2)
}

/// Verify the CRC-4 carried in the low nibble of the last packet byte.
///
/// Every byte except the last is folded nibble-by-nibble; of the last byte
/// only the high (sequence) nibble is folded.
pub fn check_crc4(packet: &[u8]) -> bool {
    let Some((&last, body)) = packet.split_last() else {
        return false;
    };
    let mut crc = 0u8;
    for &b in body {
        crc = CRC4_TABLE[crc as usize] ^ (b >> 4);
        crc = CRC4_TABLE[crc as usize] ^ (b & 0x0F);
    }
    crc = CRC4_TABLE[crc as usize] ^ (last >> 4);
    crc = CRC4_TABLE[crc as usize];
    crc == last & 0x0F
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode one CRC-valid packet into a [`Frame`].
///
/// `channels` must be the active set in the order the caller requested it at
/// `start` time; the payload is walked in reverse request order, matching the
/// on-wire ordering from the device. Two consecutive 12-bit samples interlock
/// over three bytes, tracked by the `mid_frame` flag.
pub fn decode_frame(mode: ApiMode, packet: &[u8], channels: &[Channel]) -> Result<Frame> {
    if mode != ApiMode::Scientisst {
        return Err(SenseError::NotSupported(format!(
            "frame format of API mode {mode:?}"
        )));
    }
    let last = packet[packet.len() - 1];
    let io_byte = packet[packet.len() - 2];

    let seq = last >> 4;
    let mut digital = [false; 4];
    for (i, line) in digital.iter_mut().enumerate() {
        *line = io_byte & (0x80 >> i) != 0;
    }

    let mut analog: [Option<u32>; 8] = [None; 8];
    let mut byte_it = 0usize;
    let mut mid_frame = false;
    for &ch in channels.iter().rev() {
        let value = if ch.is_external() {
            let v = packet[byte_it] as u32
                | (packet[byte_it + 1] as u32) << 8
                | (packet[byte_it + 2] as u32) << 16;
            byte_it += 3;
            v
        } else {
            let v = packet[byte_it] as u16 | (packet[byte_it + 1] as u16) << 8;
            if mid_frame {
                byte_it += 2;
                mid_frame = false;
                (v >> 4) as u32
            } else {
                byte_it += 1;
                mid_frame = true;
                (v & 0x0FFF) as u32
            }
        };
        analog[ch.slot()] = Some(value);
    }

    Ok(Frame {
        seq,
        analog,
        digital,
    })
}

#[cfg(test)]
pub(crate) mod testpack {
    //! Packet construction for tests: the exact inverse of the decode walk.

    use super::*;

    /// Final CRC-4 value for a packet whose last low nibble is zero.
    pub fn crc4_of(packet: &[u8]) -> u8 {
        let (&last, body) = packet.split_last().unwrap();
        let mut crc = 0u8;
        for &b in body {
            crc = CRC4_TABLE[crc as usize] ^ (b >> 4);
            crc = CRC4_TABLE[crc as usize] ^ (b & 0x0F);
        }
        crc = CRC4_TABLE[crc as usize] ^ (last >> 4);
        CRC4_TABLE[crc as usize]
    }

    /// Build a valid on-wire packet for `channels` (request order, externals
    /// last so the reversed walk matches the device's AX-first packing).
    pub fn encode_frame(
        channels: &[Channel],
        analog: &[Option<u32>; 8],
        digital: [bool; 4],
        seq: u8,
    ) -> Vec<u8> {
        let size = packet_size(ApiMode::Scientisst, channels).unwrap();
        let mut p = vec![0u8; size];
        let mut byte_it = 0usize;
        let mut mid_frame = false;
        for &ch in channels.iter().rev() {
            let v = analog[ch.slot()].expect("value for every requested channel");
            if ch.is_external() {
                p[byte_it] |= (v & 0xFF) as u8;
                p[byte_it + 1] |= (v >> 8 & 0xFF) as u8;
                p[byte_it + 2] |= (v >> 16 & 0xFF) as u8;
                byte_it += 3;
            } else if mid_frame {
                p[byte_it] |= ((v & 0x0F) << 4) as u8;
                p[byte_it + 1] |= (v >> 4 & 0xFF) as u8;
                byte_it += 2;
                mid_frame = false;
            } else {
                p[byte_it] |= (v & 0xFF) as u8;
                p[byte_it + 1] |= (v >> 8 & 0x0F) as u8;
                byte_it += 1;
                mid_frame = true;
            }
        }
        let io = size - 2;
        for (i, &line) in digital.iter().enumerate() {
            if line {
                p[io] |= 0x80 >> i;
            }
        }
        p[size - 1] = seq << 4;
        let crc = crc4_of(&p);
        p[size - 1] |= crc;
        p
    }
}

#[cfg(test)]
mod tests {
    use super::testpack::{crc4_of, encode_frame};
    use super::*;

    fn chans(ids: &[u8]) -> Vec<Channel> {
        ids.iter().map(|&id| Channel::from_id(id).unwrap()).collect()
    }

    #[test]
    fn channel_ids_round_trip() {
        for id in 1..=8 {
            assert_eq!(Channel::from_id(id).unwrap().id(), id);
        }
        assert!(Channel::from_id(0).is_err());
        assert!(Channel::from_id(9).is_err());
        assert!(Channel::Ax1.is_external());
        assert!(Channel::Ax2.is_external());
        assert!(!Channel::Ai6.is_external());
    }

    #[test]
    fn packet_sizes_match_channel_sets() {
        let cases: [(&[u8], usize); 6] = [
            (&[1], 3),
            (&[1, 2], 5),
            (&[7], 5),
            (&[7, 8], 8),
            (&[1, 2, 3, 4, 5, 6], 11),
            (&[1, 2, 3, 4, 5, 6, 7, 8], 17),
        ];
        for (ids, expected) in cases {
            let set = chans(ids);
            assert_eq!(
                packet_size(ApiMode::Scientisst, &set).unwrap(),
                expected,
                "channel set {ids:?}"
            );
        }
    }

    #[test]
    fn packet_size_rejects_unsupported_modes() {
        let set = chans(&[1]);
        assert!(matches!(
            packet_size(ApiMode::Bitalino, &set),
            Err(SenseError::NotSupported(_))
        ));
        assert!(matches!(
            packet_size(ApiMode::Json, &set),
            Err(SenseError::NotSupported(_))
        ));
    }

    #[test]
    fn crc4_accepts_valid_and_rejects_corrupt_nibble() {
        let set = chans(&[1, 2]);
        let mut analog = [None; 8];
        analog[0] = Some(0xABC);
        analog[1] = Some(0x123);
        let packet = encode_frame(&set, &analog, [false; 4], 9);
        assert!(check_crc4(&packet));

        // Any single-nibble corruption of the CRC must be caught.
        let mut bad = packet.clone();
        let n = bad.len();
        for nibble in 0..16u8 {
            if nibble == packet[n - 1] & 0x0F {
                continue;
            }
            bad[n - 1] = packet[n - 1] & 0xF0 | nibble;
            assert!(!check_crc4(&bad), "nibble {nibble:#x} accepted");
        }
    }

    #[test]
    fn crc4_of_empty_packet_is_invalid() {
        assert!(!check_crc4(&[]));
    }

    #[test]
    fn decode_single_internal_channel() {
        // AI1 = 42, I1 high, seq 5. Payload 0x2A with the high nibble of the
        // sample in the low nibble of the I/O byte (here zero).
        let set = chans(&[1]);
        let crc = crc4_of(&[0x2A, 0x80, 0x50]);
        let packet = [0x2A, 0x80, 0x50 | crc];
        assert!(check_crc4(&packet));

        let frame = decode_frame(ApiMode::Scientisst, &packet, &set).unwrap();
        assert_eq!(frame.seq, 5);
        assert_eq!(frame.analog[0], Some(42));
        assert_eq!(frame.digital, [true, false, false, false]);
        assert_eq!(&frame.analog[1..], &[None; 7]);
    }

    #[test]
    fn decode_interlocked_internal_pair() {
        // Two 12-bit samples pack into three payload bytes.
        let set = chans(&[1, 2]);
        let mut analog = [None; 8];
        analog[0] = Some(0xABC);
        analog[1] = Some(0xDEF);
        let packet = encode_frame(&set, &analog, [false, true, false, true], 15);
        assert_eq!(packet.len(), 5);

        let frame = decode_frame(ApiMode::Scientisst, &packet, &set).unwrap();
        assert_eq!(frame.seq, 15);
        assert_eq!(frame.analog[0], Some(0xABC));
        assert_eq!(frame.analog[1], Some(0xDEF));
        assert_eq!(frame.digital, [false, true, false, true]);
    }

    #[test]
    fn decode_external_channels() {
        let set = chans(&[7, 8]);
        let mut analog = [None; 8];
        analog[6] = Some(0xAB_CDEF);
        analog[7] = Some(0x12_3456);
        let packet = encode_frame(&set, &analog, [true; 4], 3);
        assert_eq!(packet.len(), 8);

        let frame = decode_frame(ApiMode::Scientisst, &packet, &set).unwrap();
        assert_eq!(frame.value(Channel::Ax1), Some(0xAB_CDEF));
        assert_eq!(frame.value(Channel::Ax2), Some(0x12_3456));
        assert_eq!(frame.digital, [true; 4]);
        assert_eq!(frame.seq, 3);
    }

    #[test]
    fn decode_mixed_set_round_trips() {
        // Caller order AI2, AI5, AX1: the reversed walk reads AX1 first,
        // matching the AX-first wire packing.
        let set = chans(&[2, 5, 7]);
        let mut analog = [None; 8];
        analog[1] = Some(4095);
        analog[4] = Some(0);
        analog[6] = Some(16_777_215);
        let digital = [true, false, true, false];
        let packet = encode_frame(&set, &analog, digital, 11);
        assert!(check_crc4(&packet));

        let frame = decode_frame(ApiMode::Scientisst, &packet, &set).unwrap();
        assert_eq!(frame.analog, analog);
        assert_eq!(frame.digital, digital);
        assert_eq!(frame.seq, 11);
    }

    #[test]
    fn decode_full_channel_set_round_trips() {
        let set = Channel::ALL.to_vec();
        let mut analog = [None; 8];
        for (slot, v) in analog.iter_mut().zip([7u32, 99, 512, 4000, 1, 2345, 0, 0]) {
            *slot = Some(v);
        }
        analog[6] = Some(0x80_0001);
        analog[7] = Some(0x7F_FFFE);
        let packet = encode_frame(&set, &analog, [false; 4], 0);
        assert_eq!(packet.len(), 17);

        let frame = decode_frame(ApiMode::Scientisst, &packet, &set).unwrap();
        assert_eq!(frame.analog, analog);
    }

    #[test]
    fn decode_rejects_unsupported_modes() {
        let set = chans(&[1]);
        let packet = [0x2A, 0x80, 0x55];
        for mode in [ApiMode::Bitalino, ApiMode::Json] {
            assert!(matches!(
                decode_frame(mode, &packet, &set),
                Err(SenseError::NotSupported(_))
            ));
        }
    }
}
